mod common;

use futures::{SinkExt, StreamExt};
use pmx::{
    PmxError, PmxWsClient, WsChannel, WsEvent, WsReaderConfig, WsReconnectConfig, WsSessionState,
    WsUpdate,
};
use serde_json::json;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

type ServerWs = WebSocketStream<TcpStream>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.expect("accept");
    tokio_tungstenite::accept_async(stream).await.expect("ws handshake")
}

/// Next text frame from the client, decoded as JSON. Skips pings.
async fn read_json(ws: &mut ServerWs) -> serde_json::Value {
    while let Some(msg) = ws.next().await {
        if let Message::Text(text) = msg.expect("server read") {
            return serde_json::from_str(&text).expect("client sent json");
        }
    }
    panic!("connection closed while waiting for a client command");
}

async fn send_json(ws: &mut ServerWs, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("server send");
}

/// Keep the connection open until the client closes it.
async fn drain(mut ws: ServerWs) {
    while let Some(Ok(_)) = ws.next().await {}
}

fn ticker_update(seq: u64, price: i64) -> serde_json::Value {
    json!({
        "type": "ticker",
        "channel": "ticker",
        "seq": seq,
        "data": {"market_ticker": "CPI-24DEC-T3.0", "price": price}
    })
}

fn trade_update(seq: u64) -> serde_json::Value {
    json!({
        "type": "trade",
        "channel": "trade",
        "seq": seq,
        "data": {"market_ticker": "CPI-24DEC-T3.0", "count": 1}
    })
}

async fn next_update(client: &mut PmxWsClient) -> WsUpdate {
    loop {
        match timeout(EVENT_TIMEOUT, client.next_event())
            .await
            .expect("timed out waiting for event")
        {
            Some(WsEvent::Update(update)) => return update,
            Some(_) => {}
            None => panic!("event stream ended"),
        }
    }
}

fn fast_reconnect() -> WsReconnectConfig {
    WsReconnectConfig {
        max_retries: Some(10),
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: 0.0,
        resubscribe: true,
    }
}

#[tokio::test]
async fn subscribe_acks_then_delivers_updates() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let env = common::ws_env(listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let cmd = read_json(&mut ws).await;
        assert_eq!(cmd["cmd"], "subscribe");
        assert_eq!(cmd["channels"], json!(["ticker"]));
        let id = cmd["id"].as_u64().unwrap();
        send_json(&mut ws, json!({"type": "subscribed", "id": id, "channel": "ticker"})).await;
        send_json(&mut ws, ticker_update(1, 42)).await;
        send_json(&mut ws, ticker_update(2, 43)).await;
        drain(ws).await;
    });

    let mut client = PmxWsClient::connect(env).await.unwrap();
    let id = client.subscribe(vec![WsChannel::Ticker], vec![]).await.unwrap();
    assert_eq!(id, 1);
    assert_eq!(client.state(), WsSessionState::Subscribed);

    let first = next_update(&mut client).await;
    assert_eq!(first.channel, "ticker");
    assert_eq!(first.seq, Some(1));
    let second = next_update(&mut client).await;
    assert_eq!(second.seq, Some(2));

    client.disconnect().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn sequence_gap_resubscribes_only_the_gapped_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let env = common::ws_env(listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let cmd = read_json(&mut ws).await;
        let id = cmd["id"].as_u64().unwrap();
        send_json(&mut ws, json!({"type": "subscribed", "id": id, "channel": "ticker"})).await;
        send_json(&mut ws, json!({"type": "subscribed", "id": id, "channel": "trade"})).await;

        send_json(&mut ws, ticker_update(10, 42)).await;
        send_json(&mut ws, trade_update(1)).await;
        // Skip ticker seq 11..=14: the client must drop this frame and
        // resubscribe only the ticker channel.
        send_json(&mut ws, ticker_update(15, 50)).await;

        let resub = read_json(&mut ws).await;
        assert_eq!(resub["cmd"], "subscribe");
        assert_eq!(resub["channels"], json!(["ticker"]));
        let resub_id = resub["id"].as_u64().unwrap();
        send_json(
            &mut ws,
            json!({"type": "subscribed", "id": resub_id, "channel": "ticker"}),
        )
        .await;

        // Trade keeps its old counter; ticker restarts from a snapshot.
        send_json(&mut ws, trade_update(2)).await;
        send_json(&mut ws, ticker_update(7, 51)).await;
        drain(ws).await;
    });

    let mut client = PmxWsClient::connect(env).await.unwrap();
    client
        .subscribe(vec![WsChannel::Ticker, WsChannel::Trade], vec![])
        .await
        .unwrap();

    let a = next_update(&mut client).await;
    assert_eq!((a.channel.as_str(), a.seq), ("ticker", Some(10)));
    let b = next_update(&mut client).await;
    assert_eq!((b.channel.as_str(), b.seq), ("trade", Some(1)));
    // The gapped ticker frame (seq 15) never arrives.
    let c = next_update(&mut client).await;
    assert_eq!((c.channel.as_str(), c.seq), ("trade", Some(2)));
    let d = next_update(&mut client).await;
    assert_eq!((d.channel.as_str(), d.seq), ("ticker", Some(7)));

    client.disconnect().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn reconnects_and_resubscribes_after_transport_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let env = common::ws_env(listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let cmd = read_json(&mut ws).await;
        assert_eq!(cmd["channels"], json!(["ticker", "trade"]));
        let id = cmd["id"].as_u64().unwrap();
        send_json(&mut ws, json!({"type": "subscribed", "id": id, "channel": "ticker"})).await;
        send_json(&mut ws, json!({"type": "subscribed", "id": id, "channel": "trade"})).await;
        send_json(&mut ws, ticker_update(1, 42)).await;
        drop(ws); // hard drop, no close handshake

        // Every active channel comes back as its own subscribe command.
        let mut ws = accept(&listener).await;
        let mut resubscribed = Vec::new();
        for _ in 0..2 {
            let resub = read_json(&mut ws).await;
            assert_eq!(resub["cmd"], "subscribe");
            let channels = resub["channels"].as_array().unwrap();
            assert_eq!(channels.len(), 1);
            resubscribed.push(channels[0].as_str().unwrap().to_string());
        }
        resubscribed.sort();
        assert_eq!(resubscribed, ["ticker", "trade"]);
        send_json(&mut ws, ticker_update(100, 50)).await;
        send_json(&mut ws, trade_update(200)).await;
        drain(ws).await;
    });

    let mut client =
        PmxWsClient::connect_with(env, None, fast_reconnect(), WsReaderConfig::default())
            .await
            .unwrap();
    client
        .subscribe(vec![WsChannel::Ticker, WsChannel::Trade], vec![])
        .await
        .unwrap();

    let first = next_update(&mut client).await;
    assert_eq!(first.seq, Some(1));

    // Watch the reconnect happen, then data resumes on both channels with
    // fresh baselines.
    let mut saw_reconnected = false;
    let resumed = loop {
        match timeout(EVENT_TIMEOUT, client.next_event())
            .await
            .expect("timed out waiting for reconnect")
        {
            Some(WsEvent::Reconnected { .. }) => saw_reconnected = true,
            Some(WsEvent::Update(update)) => break update,
            Some(_) => {}
            None => panic!("event stream ended"),
        }
    };
    assert!(saw_reconnected);
    assert_eq!((resumed.channel.as_str(), resumed.seq), ("ticker", Some(100)));
    let after = next_update(&mut client).await;
    assert_eq!((after.channel.as_str(), after.seq), ("trade", Some(200)));

    client.disconnect().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn private_channels_require_credentials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let env = common::ws_env(listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let ws = accept(&listener).await;
        drain(ws).await;
    });

    let client = PmxWsClient::connect(env).await.unwrap();
    let err = client.subscribe(vec![WsChannel::Fill], vec![]).await.unwrap_err();
    assert!(matches!(err, PmxError::AuthRequired(_)));

    client.disconnect().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn disconnect_from_another_task_is_bounded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let env = common::ws_env(listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let ws = accept(&listener).await;
        drain(ws).await;
    });

    let mut client = PmxWsClient::connect(env).await.unwrap();
    let controller = client.controller();

    let closer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.disconnect().await
    });

    // The reader is parked in next_event with no traffic; the cross-task
    // disconnect must still unblock it promptly.
    let event = timeout(EVENT_TIMEOUT, async {
        loop {
            match client.next_event().await {
                Some(WsEvent::Disconnected { reason }) => break Some(reason),
                Some(_) => {}
                None => break None,
            }
        }
    })
    .await
    .expect("disconnect did not unblock the reader");
    assert_eq!(event.as_deref(), Some("closed by caller"));

    closer.await.unwrap().unwrap();
    assert_eq!(client.state(), WsSessionState::Disconnected);
    server.await.unwrap();
}
