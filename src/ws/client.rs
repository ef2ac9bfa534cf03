use crate::auth::PmxAuth;
use crate::env::{PmxEnvironment, WS_PATH};
use crate::error::PmxError;
use crate::ws::session::{SeqCheck, SubscriptionTable, WsSessionState};
use crate::ws::types::{WsChannel, WsCommandMsg, WsEnvelope, WsEvent, WsUpdate};

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Bytes;
use tokio_tungstenite::tungstenite::Error as WsTransportError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tracing::{debug, warn};

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Consecutive sequence gaps on one channel before a resubscribe is deemed
/// ineffective and the whole connection is recycled.
const MAX_GAP_STRIKES: u32 = 3;

/// Build the upgrade request, signing it when credentials are supplied.
///
/// WS signing covers `timestamp + "GET" + WS_PATH`; the same `access-*`
/// headers used for REST ride on the HTTP upgrade.
fn client_request(
    env: &PmxEnvironment,
    auth: Option<&PmxAuth>,
) -> Result<Request<()>, PmxError> {
    let mut req: Request<()> = env
        .ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| PmxError::Ws(e.to_string()))?;

    if let Some(auth) = auth {
        let headers = auth.build_headers("GET", WS_PATH)?;
        let header_value = |v: &str| {
            HeaderValue::from_str(v).map_err(|e| PmxError::Header(e.to_string()))
        };
        req.headers_mut()
            .insert("access-key", header_value(&headers.key)?);
        req.headers_mut()
            .insert("access-timestamp", header_value(&headers.timestamp_ms)?);
        req.headers_mut()
            .insert("access-signature", header_value(&headers.signature)?);
    }

    Ok(req)
}

async fn open_transport(
    env: &PmxEnvironment,
    auth: Option<&PmxAuth>,
    connect_timeout: Duration,
) -> Result<WsStream, PmxError> {
    let req = client_request(env, auth)?;
    let (stream, _resp) = time::timeout(connect_timeout, connect_async(req))
        .await
        .map_err(|_| PmxError::Timeout(connect_timeout))?
        .map_err(|e| match e {
            WsTransportError::Io(io) => PmxError::Connect(io.to_string()),
            other => PmxError::Ws(other.to_string()),
        })?;
    Ok(stream)
}

/// Thin connection wrapper: one socket, manual reads, no background task.
///
/// Subscriptions are fire-and-forget here; acks, sequence numbers, and
/// reconnects are the caller's problem. Most code wants [`PmxWsClient`]
/// instead; this type exists for tooling that needs to see every raw frame.
pub struct PmxWsLowLevelClient {
    write: futures::stream::SplitSink<WsStream, Message>,
    read: futures::stream::SplitStream<WsStream>,
    next_id: u64,
    authenticated: bool,
}

impl PmxWsLowLevelClient {
    /// Connect without auth (public channels only).
    pub async fn connect(env: PmxEnvironment) -> Result<Self, PmxError> {
        Self::open(env, None).await
    }

    /// Connect with signed upgrade headers so private channels are allowed.
    pub async fn connect_authenticated(
        env: PmxEnvironment,
        auth: PmxAuth,
    ) -> Result<Self, PmxError> {
        Self::open(env, Some(auth)).await
    }

    async fn open(env: PmxEnvironment, auth: Option<PmxAuth>) -> Result<Self, PmxError> {
        let authenticated = auth.is_some();
        let stream =
            open_transport(&env, auth.as_ref(), WsReaderConfig::default().connect_timeout)
                .await?;
        let (write, read) = stream.split();
        Ok(Self {
            write,
            read,
            next_id: 1,
            authenticated,
        })
    }

    /// Subscribe to channels; pass `market_tickers` to scope the channels
    /// that require it (e.g. `orderbook_delta`). Returns the command id the
    /// server will echo in its `subscribed` acks.
    pub async fn subscribe(
        &mut self,
        channels: Vec<WsChannel>,
        market_tickers: Vec<String>,
    ) -> Result<u64, PmxError> {
        if !self.authenticated && channels.iter().any(|c| c.is_private()) {
            return Err(PmxError::AuthRequired("private channel subscription"));
        }
        self.send_command("subscribe", channels, market_tickers).await
    }

    /// Unsubscribe from channels. Returns the command id.
    pub async fn unsubscribe(
        &mut self,
        channels: Vec<WsChannel>,
        market_tickers: Vec<String>,
    ) -> Result<u64, PmxError> {
        self.send_command("unsubscribe", channels, market_tickers).await
    }

    async fn send_command(
        &mut self,
        cmd: &'static str,
        channels: Vec<WsChannel>,
        market_tickers: Vec<String>,
    ) -> Result<u64, PmxError> {
        let id = self.next_id;
        self.next_id += 1;

        let msg = WsCommandMsg {
            id,
            cmd,
            channels: channels.iter().map(|c| c.as_str().to_string()).collect(),
            market_tickers,
        };
        let text = serde_json::to_string(&msg)?;
        self.write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| PmxError::Ws(e.to_string()))?;
        Ok(id)
    }

    /// Read the next JSON envelope, answering pings along the way.
    pub async fn next_envelope(&mut self) -> Result<WsEnvelope, PmxError> {
        while let Some(msg) = self.read.next().await {
            let msg = msg.map_err(|e| PmxError::Ws(e.to_string()))?;
            match msg {
                Message::Text(s) => return Ok(serde_json::from_str::<WsEnvelope>(&s)?),
                Message::Binary(b) => {
                    let s = String::from_utf8(b.to_vec())
                        .map_err(|e| PmxError::Ws(e.to_string()))?;
                    return Ok(serde_json::from_str::<WsEnvelope>(&s)?);
                }
                Message::Ping(payload) => {
                    self.write
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| PmxError::Ws(e.to_string()))?;
                }
                Message::Pong(_) => {}
                Message::Close(_) => return Err(PmxError::Ws("websocket closed".to_string())),
                _ => {}
            }
        }
        Err(PmxError::Ws("websocket stream ended".to_string()))
    }

    /// Initiate a close handshake and drop the connection.
    pub async fn close(&mut self) -> Result<(), PmxError> {
        self.write
            .send(Message::Close(None))
            .await
            .map_err(|e| PmxError::Ws(e.to_string()))
    }
}

/// Reconnect policy for the managed client.
#[derive(Debug, Clone)]
pub struct WsReconnectConfig {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor in `[0, 1]`; each delay is scaled by a random value in
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
    /// Replay active subscriptions after a successful reconnect.
    pub resubscribe: bool,
}

impl Default for WsReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            resubscribe: true,
        }
    }
}

impl WsReconnectConfig {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        let factor = 1.0 - self.jitter + 2.0 * self.jitter * rand::random::<f64>();
        capped.mul_f64(factor.max(0.0))
    }
}

/// Timeouts and heartbeat cadence for the reader task.
#[derive(Debug, Clone)]
pub struct WsReaderConfig {
    pub connect_timeout: Duration,
    /// How long `subscribe`/`unsubscribe` wait for the server ack.
    pub ack_timeout: Duration,
    pub ping_interval: Duration,
    /// No traffic at all for this long is treated as a dead connection.
    pub idle_timeout: Duration,
    /// How long a graceful close waits for the peer's close frame.
    pub close_grace: Duration,
    /// Upper bound on [`PmxWsClient::disconnect`].
    pub disconnect_timeout: Duration,
}

impl Default for WsReaderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            close_grace: Duration::from_secs(2),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

enum WsCommand {
    Subscribe {
        channels: Vec<WsChannel>,
        market_tickers: Vec<String>,
        reply: oneshot::Sender<Result<u64, PmxError>>,
    },
    Unsubscribe {
        channels: Vec<WsChannel>,
        market_tickers: Vec<String>,
        reply: oneshot::Sender<Result<u64, PmxError>>,
    },
    Close,
}

/// A command awaiting its acks: the server sends one ack per channel, all
/// echoing the command id.
struct PendingAck {
    remaining: usize,
    reply: Option<oneshot::Sender<Result<u64, PmxError>>>,
}

struct WsDriver {
    env: PmxEnvironment,
    auth: Option<PmxAuth>,
    reconnect: WsReconnectConfig,
    reader: WsReaderConfig,
    stream: WsStream,
    subs: SubscriptionTable,
    pending: HashMap<u64, PendingAck>,
    next_id: u64,
    cmd_rx: mpsc::Receiver<WsCommand>,
    event_tx: mpsc::Sender<WsEvent>,
    state_tx: watch::Sender<WsSessionState>,
    last_traffic: Instant,
}

impl WsDriver {
    async fn run(mut self) {
        let mut ping = time::interval_at(
            Instant::now() + self.reader.ping_interval,
            self.reader.ping_interval,
        );
        ping.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            let idle_deadline = self.last_traffic + self.reader.idle_timeout;
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(WsCommand::Subscribe { channels, market_tickers, reply }) => {
                        if !self.handle_subscribe(channels, market_tickers, reply).await
                            && !self.recover("send failed").await
                        {
                            return;
                        }
                    }
                    Some(WsCommand::Unsubscribe { channels, market_tickers, reply }) => {
                        if !self.handle_unsubscribe(channels, market_tickers, reply).await
                            && !self.recover("send failed").await
                        {
                            return;
                        }
                    }
                    // All handles dropped counts as a close request.
                    Some(WsCommand::Close) | None => {
                        self.graceful_close().await;
                        self.finish("closed by caller");
                        return;
                    }
                },
                frame = self.stream.next() => {
                    let reason = match frame {
                        Some(Ok(msg)) => {
                            self.last_traffic = Instant::now();
                            match self.handle_frame(msg).await {
                                Ok(()) => continue,
                                Err(reason) => reason,
                            }
                        }
                        Some(Err(e)) => format!("transport error: {e}"),
                        None => "stream ended".to_string(),
                    };
                    if !self.recover(&reason).await {
                        return;
                    }
                    ping.reset();
                }
                _ = ping.tick() => {
                    if self.stream.send(Message::Ping(Bytes::new())).await.is_err() {
                        if !self.recover("ping failed").await {
                            return;
                        }
                        ping.reset();
                    }
                }
                _ = time::sleep_until(idle_deadline) => {
                    if !self.recover("idle timeout").await {
                        return;
                    }
                    ping.reset();
                }
            }
        }
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn set_state(&self, state: WsSessionState) {
        self.state_tx.send_replace(state);
    }

    /// Lifecycle and data events alike go out non-blocking so a stalled
    /// consumer can never wedge the driver (or a pending disconnect).
    fn emit(&self, event: WsEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.event_tx.try_send(event) {
            warn!("event buffer full, dropping event");
        }
    }

    async fn send_text(&mut self, text: String) -> bool {
        self.stream.send(Message::Text(text.into())).await.is_ok()
    }

    /// Returns `false` when the transport needs recovery.
    async fn handle_subscribe(
        &mut self,
        channels: Vec<WsChannel>,
        market_tickers: Vec<String>,
        reply: oneshot::Sender<Result<u64, PmxError>>,
    ) -> bool {
        // Channels already covered are idempotent no-ops.
        let channels: Vec<WsChannel> = channels
            .into_iter()
            .filter(|c| !self.subs.covers(c.as_str(), &market_tickers))
            .collect();
        let id = self.take_id();
        if channels.is_empty() {
            let _ = reply.send(Ok(id));
            return true;
        }
        let msg = WsCommandMsg {
            id,
            cmd: "subscribe",
            channels: channels.iter().map(|c| c.as_str().to_string()).collect(),
            market_tickers: market_tickers.clone(),
        };
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return true;
            }
        };
        if !self.send_text(text).await {
            let _ = reply.send(Err(PmxError::Ws("connection lost".into())));
            return false;
        }
        for channel in &channels {
            self.subs.record(channel.as_str(), &market_tickers);
        }
        self.pending.insert(
            id,
            PendingAck {
                remaining: channels.len(),
                reply: Some(reply),
            },
        );
        true
    }

    async fn handle_unsubscribe(
        &mut self,
        channels: Vec<WsChannel>,
        market_tickers: Vec<String>,
        reply: oneshot::Sender<Result<u64, PmxError>>,
    ) -> bool {
        let id = self.take_id();
        let msg = WsCommandMsg {
            id,
            cmd: "unsubscribe",
            channels: channels.iter().map(|c| c.as_str().to_string()).collect(),
            market_tickers: market_tickers.clone(),
        };
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return true;
            }
        };
        if !self.send_text(text).await {
            let _ = reply.send(Err(PmxError::Ws("connection lost".into())));
            return false;
        }
        for channel in &channels {
            self.subs.remove(channel.as_str(), &market_tickers);
        }
        self.pending.insert(
            id,
            PendingAck {
                remaining: channels.len(),
                reply: Some(reply),
            },
        );
        true
    }

    /// `Err(reason)` means the connection needs recovery (close frame, a
    /// failed pong reply, or an unrecoverable sequence gap).
    async fn handle_frame(&mut self, msg: Message) -> Result<(), String> {
        match msg {
            Message::Text(s) => self.handle_text(&s).await,
            Message::Binary(b) => match String::from_utf8(b.to_vec()) {
                Ok(s) => self.handle_text(&s).await,
                Err(e) => {
                    warn!(error = %e, "non-utf8 binary frame dropped");
                    Ok(())
                }
            },
            Message::Ping(payload) => self
                .stream
                .send(Message::Pong(payload))
                .await
                .map_err(|e| format!("pong send failed: {e}")),
            Message::Close(_) => Err("server closed the connection".to_string()),
            _ => Ok(()),
        }
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), String> {
        let envelope: WsEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, bytes = text.len(), "unparseable frame dropped");
                return Ok(());
            }
        };

        match envelope.msg_type.as_str() {
            "subscribed" | "unsubscribed" => {
                if let Some(id) = envelope.id {
                    self.ack(id, None);
                }
                self.set_state(WsSessionState::Subscribed);
                Ok(())
            }
            "error" => {
                let message = envelope
                    .data
                    .as_ref()
                    .and_then(|d| d.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unspecified server error")
                    .to_string();
                match envelope.id {
                    Some(id) => self.ack(id, Some(PmxError::Ws(message))),
                    None => warn!(%message, "server error frame"),
                }
                Ok(())
            }
            _ => self.handle_update(envelope).await,
        }
    }

    /// Resolve one per-channel ack for a pending command.
    fn ack(&mut self, id: u64, error: Option<PmxError>) {
        let Some(pending) = self.pending.get_mut(&id) else {
            // Acks for driver-initiated resubscribes land here.
            debug!(id, "ack for untracked command");
            return;
        };
        if let Some(error) = error {
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(error));
            }
            self.pending.remove(&id);
            return;
        }
        pending.remaining = pending.remaining.saturating_sub(1);
        if pending.remaining == 0 {
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Ok(id));
            }
            self.pending.remove(&id);
        }
    }

    async fn handle_update(&mut self, envelope: WsEnvelope) -> Result<(), String> {
        let channel = envelope
            .channel
            .clone()
            .unwrap_or_else(|| envelope.msg_type.clone());

        if let Some(seq) = envelope.seq
            && let SeqCheck::Gap { expected, got } = self.subs.observe(&channel, seq)
        {
            // Several gaps in a row means resubscribing is not fixing the
            // stream; fall back to a full reconnect.
            if self.subs.gap_strikes(&channel) >= MAX_GAP_STRIKES {
                let err = PmxError::SequenceGap {
                    channel,
                    expected,
                    got,
                };
                return Err(format!("channel kept gapping after resubscribes: {err}"));
            }
            warn!(%channel, expected, got, "sequence gap, resubscribing channel");
            // The gapped frame is dropped; the resubscribe brings a fresh
            // snapshot. Other channels keep flowing untouched.
            self.resubscribe_channel(&channel).await;
            return Ok(());
        }

        let data = match envelope.decode_data() {
            Ok(data) => data,
            Err(e) => {
                warn!(%channel, error = %e, "undecodable payload dropped");
                return Ok(());
            }
        };
        self.emit(WsEvent::Update(WsUpdate {
            channel,
            seq: envelope.seq,
            data,
        }));
        Ok(())
    }

    async fn resubscribe_channel(&mut self, channel: &str) {
        self.subs.reset_seq(channel);
        let id = self.take_id();
        let msg = WsCommandMsg {
            id,
            cmd: "subscribe",
            channels: vec![channel.to_string()],
            market_tickers: self.subs.tickers(channel),
        };
        match serde_json::to_string(&msg) {
            Ok(text) => {
                // A failed send surfaces as a read error on the next loop
                // iteration and goes through normal recovery.
                let _ = self.send_text(text).await;
            }
            Err(e) => warn!(channel, error = %e, "resubscribe encode failed"),
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        for (_, mut pending) in self.pending.drain() {
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(PmxError::Ws(reason.to_string())));
            }
        }
    }

    /// Reconnect with capped, jittered backoff and replay subscriptions.
    /// Returns `false` when the driver is done (closed, or retries spent).
    async fn recover(&mut self, reason: &str) -> bool {
        warn!(reason, "connection lost, reconnecting");
        self.fail_pending(reason);
        self.set_state(WsSessionState::Reconnecting);
        self.subs.clear_seqs();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Some(max) = self.reconnect.max_retries
                && attempt > max
            {
                self.finish(&format!("reconnect attempts exhausted after: {reason}"));
                return false;
            }
            self.emit(WsEvent::Reconnecting { attempt });

            // Backoff stays responsive to close requests; other commands
            // cannot be served yet and are refused.
            let sleep = time::sleep(self.reconnect.delay_for(attempt));
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(WsCommand::Close) | None => {
                            self.finish("closed by caller");
                            return false;
                        }
                        Some(
                            WsCommand::Subscribe { reply, .. }
                            | WsCommand::Unsubscribe { reply, .. },
                        ) => {
                            let _ = reply.send(Err(PmxError::Ws(
                                "not connected, reconnect in progress".into(),
                            )));
                        }
                    },
                }
            }

            match open_transport(&self.env, self.auth.as_ref(), self.reader.connect_timeout)
                .await
            {
                Ok(stream) => {
                    self.stream = stream;
                    self.set_state(WsSessionState::Authenticated);
                    self.emit(WsEvent::Reconnected { attempt });
                    if self.reconnect.resubscribe && !self.subs.is_empty() {
                        if !self.resubscribe_all().await {
                            warn!(attempt, "resubscribe failed, retrying connection");
                            continue;
                        }
                        self.set_state(WsSessionState::Subscribed);
                    }
                    self.last_traffic = Instant::now();
                    return true;
                }
                Err(e) => warn!(attempt, error = %e, "reconnect failed"),
            }
        }
    }

    async fn resubscribe_all(&mut self) -> bool {
        for (channel, tickers) in self.subs.active() {
            let id = self.take_id();
            let msg = WsCommandMsg {
                id,
                cmd: "subscribe",
                channels: vec![channel],
                market_tickers: tickers,
            };
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "resubscribe encode failed");
                    continue;
                }
            };
            if !self.send_text(text).await {
                return false;
            }
        }
        true
    }

    async fn graceful_close(&mut self) {
        self.set_state(WsSessionState::Closing);
        if self.stream.send(Message::Close(None)).await.is_err() {
            return;
        }
        // Drain until the peer echoes the close or the grace period ends.
        let _ = time::timeout(self.reader.close_grace, async {
            while let Some(Ok(msg)) = self.stream.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        })
        .await;
    }

    fn finish(&mut self, reason: &str) {
        self.fail_pending(reason);
        self.set_state(WsSessionState::Disconnected);
        self.emit(WsEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

/// Managed streaming client: background reader task, heartbeats, automatic
/// reconnect and resubscription, per-channel sequence checking.
///
/// Subscribe, then pull [`WsEvent`]s from [`next_event`](Self::next_event).
/// A sequence gap on one channel triggers a resubscribe of that channel
/// alone; a dead transport triggers a full reconnect with subscription
/// replay. Both are internal; the caller just keeps reading events.
///
/// For fan-out across tasks, [`controller`](Self::controller) hands out a
/// cloneable handle that can subscribe and disconnect from anywhere.
pub struct PmxWsClient {
    cmd_tx: mpsc::Sender<WsCommand>,
    event_rx: mpsc::Receiver<WsEvent>,
    state_rx: watch::Receiver<WsSessionState>,
    ack_timeout: Duration,
    disconnect_timeout: Duration,
    authenticated: bool,
}

impl PmxWsClient {
    /// Connect without auth (public channels only).
    pub async fn connect(env: PmxEnvironment) -> Result<Self, PmxError> {
        Self::connect_with(
            env,
            None,
            WsReconnectConfig::default(),
            WsReaderConfig::default(),
        )
        .await
    }

    /// Connect with signed upgrade headers so private channels are allowed.
    pub async fn connect_authenticated(
        env: PmxEnvironment,
        auth: PmxAuth,
    ) -> Result<Self, PmxError> {
        Self::connect_with(
            env,
            Some(auth),
            WsReconnectConfig::default(),
            WsReaderConfig::default(),
        )
        .await
    }

    /// Connect with explicit reconnect and reader policies.
    ///
    /// The initial connection happens here, so a bad host or refused
    /// signature fails this call rather than a background task.
    pub async fn connect_with(
        env: PmxEnvironment,
        auth: Option<PmxAuth>,
        reconnect: WsReconnectConfig,
        reader: WsReaderConfig,
    ) -> Result<Self, PmxError> {
        let authenticated = auth.is_some();
        let (state_tx, state_rx) = watch::channel(WsSessionState::Connecting);

        let stream = open_transport(&env, auth.as_ref(), reader.connect_timeout).await?;
        state_tx.send_replace(WsSessionState::Authenticated);

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(256);
        let ack_timeout = reader.ack_timeout;
        let disconnect_timeout = reader.disconnect_timeout;

        let driver = WsDriver {
            env,
            auth,
            reconnect,
            reader,
            stream,
            subs: SubscriptionTable::default(),
            pending: HashMap::new(),
            next_id: 1,
            cmd_rx,
            event_tx,
            state_tx,
            last_traffic: Instant::now(),
        };
        tokio::spawn(driver.run());

        Ok(Self {
            cmd_tx,
            event_rx,
            state_rx,
            ack_timeout,
            disconnect_timeout,
            authenticated,
        })
    }

    /// Subscribe and wait for the server ack (bounded by the ack timeout).
    /// Returns the command id.
    pub async fn subscribe(
        &self,
        channels: Vec<WsChannel>,
        market_tickers: Vec<String>,
    ) -> Result<u64, PmxError> {
        if !self.authenticated && channels.iter().any(|c| c.is_private()) {
            return Err(PmxError::AuthRequired("private channel subscription"));
        }
        request_ack(&self.cmd_tx, self.ack_timeout, |reply| WsCommand::Subscribe {
            channels,
            market_tickers,
            reply,
        })
        .await
    }

    /// Unsubscribe and wait for the server ack.
    pub async fn unsubscribe(
        &self,
        channels: Vec<WsChannel>,
        market_tickers: Vec<String>,
    ) -> Result<u64, PmxError> {
        request_ack(&self.cmd_tx, self.ack_timeout, |reply| WsCommand::Unsubscribe {
            channels,
            market_tickers,
            reply,
        })
        .await
    }

    /// Next update or lifecycle event; `None` once the session is fully
    /// closed and drained.
    pub async fn next_event(&mut self) -> Option<WsEvent> {
        self.event_rx.recv().await
    }

    /// Current session state.
    pub fn state(&self) -> WsSessionState {
        *self.state_rx.borrow()
    }

    /// Close the session and wait (bounded) until it reports
    /// [`WsSessionState::Disconnected`]. Safe to call from any task via
    /// [`controller`](Self::controller), including while another task is
    /// blocked in [`next_event`](Self::next_event).
    pub async fn disconnect(&self) -> Result<(), PmxError> {
        request_close(
            &self.cmd_tx,
            self.state_rx.clone(),
            self.disconnect_timeout,
        )
        .await
    }

    /// Cloneable handle for subscribing or disconnecting from other tasks.
    pub fn controller(&self) -> PmxWsController {
        PmxWsController {
            cmd_tx: self.cmd_tx.clone(),
            state_rx: self.state_rx.clone(),
            ack_timeout: self.ack_timeout,
            disconnect_timeout: self.disconnect_timeout,
            authenticated: self.authenticated,
        }
    }
}

/// Cross-task handle to a [`PmxWsClient`] session. Carries everything except
/// the event stream, which stays with the owning client.
#[derive(Clone)]
pub struct PmxWsController {
    cmd_tx: mpsc::Sender<WsCommand>,
    state_rx: watch::Receiver<WsSessionState>,
    ack_timeout: Duration,
    disconnect_timeout: Duration,
    authenticated: bool,
}

impl PmxWsController {
    pub async fn subscribe(
        &self,
        channels: Vec<WsChannel>,
        market_tickers: Vec<String>,
    ) -> Result<u64, PmxError> {
        if !self.authenticated && channels.iter().any(|c| c.is_private()) {
            return Err(PmxError::AuthRequired("private channel subscription"));
        }
        request_ack(&self.cmd_tx, self.ack_timeout, |reply| WsCommand::Subscribe {
            channels,
            market_tickers,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(
        &self,
        channels: Vec<WsChannel>,
        market_tickers: Vec<String>,
    ) -> Result<u64, PmxError> {
        request_ack(&self.cmd_tx, self.ack_timeout, |reply| WsCommand::Unsubscribe {
            channels,
            market_tickers,
            reply,
        })
        .await
    }

    pub fn state(&self) -> WsSessionState {
        *self.state_rx.borrow()
    }

    pub async fn disconnect(&self) -> Result<(), PmxError> {
        request_close(
            &self.cmd_tx,
            self.state_rx.clone(),
            self.disconnect_timeout,
        )
        .await
    }
}

async fn request_ack(
    cmd_tx: &mpsc::Sender<WsCommand>,
    ack_timeout: Duration,
    make: impl FnOnce(oneshot::Sender<Result<u64, PmxError>>) -> WsCommand,
) -> Result<u64, PmxError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    cmd_tx
        .send(make(reply_tx))
        .await
        .map_err(|_| PmxError::Ws("session closed".into()))?;
    match time::timeout(ack_timeout, reply_rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(PmxError::Ws("session closed before ack".into())),
        Err(_) => Err(PmxError::Timeout(ack_timeout)),
    }
}

async fn request_close(
    cmd_tx: &mpsc::Sender<WsCommand>,
    mut state_rx: watch::Receiver<WsSessionState>,
    disconnect_timeout: Duration,
) -> Result<(), PmxError> {
    // A send error means the driver is already gone, which is fine.
    let _ = cmd_tx.send(WsCommand::Close).await;
    let wait = async {
        while *state_rx.borrow_and_update() != WsSessionState::Disconnected {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    };
    time::timeout(disconnect_timeout, wait)
        .await
        .map_err(|_| PmxError::Timeout(disconnect_timeout))
}
