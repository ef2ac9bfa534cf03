use crate::rest::types::OrderbookLevel;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Streaming channels offered by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsChannel {
    // Public
    Ticker,
    Trade,

    // Private (auth required)
    OrderbookDelta,
    Fill,
    MarketPositions,
}

impl WsChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            WsChannel::Ticker => "ticker",
            WsChannel::Trade => "trade",
            WsChannel::OrderbookDelta => "orderbook_delta",
            WsChannel::Fill => "fill",
            WsChannel::MarketPositions => "market_positions",
        }
    }

    pub fn is_private(self) -> bool {
        matches!(
            self,
            WsChannel::OrderbookDelta | WsChannel::Fill | WsChannel::MarketPositions
        )
    }
}

impl fmt::Display for WsChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for WsChannel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Outbound command frame: `{"id", "cmd", "channels", "market_tickers"}`.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct WsCommandMsg {
    pub id: u64,
    pub cmd: &'static str, // "subscribe" | "unsubscribe"
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub market_tickers: Vec<String>,
}

/// Inbound message envelope: `{"type", "id"?, "channel"?, "seq"?, "data"?}`.
///
/// Acks (`subscribed`/`unsubscribed`) echo the command `id`; data messages
/// carry `channel` and a per-channel `seq`.
#[derive(Debug, Clone, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl WsEnvelope {
    /// Decode the payload according to the envelope's `type`.
    pub fn decode_data(&self) -> Result<WsData, serde_json::Error> {
        let data = self.data.clone().unwrap_or_default();
        Ok(match self.msg_type.as_str() {
            "ticker" => WsData::Ticker(serde_json::from_value(data)?),
            "trade" => WsData::Trade(serde_json::from_value(data)?),
            "orderbook_snapshot" => WsData::OrderbookSnapshot(serde_json::from_value(data)?),
            "orderbook_delta" => WsData::OrderbookDelta(serde_json::from_value(data)?),
            "fill" => WsData::Fill(serde_json::from_value(data)?),
            other => WsData::Other {
                msg_type: other.to_string(),
                data,
            },
        })
    }
}

/// Ticker channel payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WsTicker {
    pub market_ticker: String,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub yes_bid: Option<i64>,
    #[serde(default)]
    pub yes_ask: Option<i64>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub ts: Option<i64>,
}

/// Trade channel payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WsTrade {
    pub market_ticker: String,
    #[serde(default)]
    pub yes_price: Option<i64>,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub taker_side: Option<String>,
    #[serde(default)]
    pub ts: Option<i64>,
}

/// Full book sent on (re)subscription to `orderbook_delta`.
#[derive(Debug, Clone, Deserialize)]
pub struct WsOrderbookSnapshot {
    pub market_ticker: String,
    #[serde(default)]
    pub yes: Vec<OrderbookLevel>,
    #[serde(default)]
    pub no: Vec<OrderbookLevel>,
}

/// Incremental book change.
#[derive(Debug, Clone, Deserialize)]
pub struct WsOrderbookDelta {
    pub market_ticker: String,
    pub price: i64,
    pub delta: i64,
    pub side: String,
}

/// Fill channel payload (private).
#[derive(Debug, Clone, Deserialize)]
pub struct WsFill {
    pub order_id: String,
    pub market_ticker: String,
    pub side: String,
    pub action: String,
    pub count: i64,
    #[serde(default)]
    pub yes_price: Option<i64>,
    #[serde(default)]
    pub no_price: Option<i64>,
    #[serde(default)]
    pub is_taker: Option<bool>,
    #[serde(default)]
    pub ts: Option<i64>,
}

/// Decoded data payload, tagged by the envelope's `type`.
#[derive(Debug, Clone)]
pub enum WsData {
    Ticker(WsTicker),
    Trade(WsTrade),
    OrderbookSnapshot(WsOrderbookSnapshot),
    OrderbookDelta(WsOrderbookDelta),
    Fill(WsFill),
    /// Message types this crate has no typed wrapper for.
    Other { msg_type: String, data: Value },
}

/// One delivered channel update.
#[derive(Debug, Clone)]
pub struct WsUpdate {
    pub channel: String,
    pub seq: Option<u64>,
    pub data: WsData,
}

/// Everything the managed client reports to the caller.
///
/// Data arrives as [`WsEvent::Update`]; connection lifecycle changes are
/// reported so callers can observe reconnects, but no caller action is
/// needed — resubscription is automatic.
#[derive(Debug, Clone)]
pub enum WsEvent {
    Update(WsUpdate),
    Reconnecting { attempt: u32 },
    Reconnected { attempt: u32 },
    Disconnected { reason: String },
}
