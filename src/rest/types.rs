use crate::error::PmxError;
use crate::types::{
    ExtraFields, MarketStatus, deserialize_null_as_empty_vec, serialize_csv_opt,
};

use serde::{Deserialize, Serialize};

/// --- Portfolio ---

/// Account balance in cents.
#[derive(Debug, Clone, Deserialize)]
pub struct Balance {
    pub balance: i64,
    #[serde(default, flatten)]
    pub extra: ExtraFields,
}

/// --- Series ---

#[derive(Debug, Clone, Deserialize)]
pub struct Series {
    pub ticker: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_as_empty_vec")]
    pub tags: Vec<String>,
    #[serde(default, flatten)]
    pub extra: ExtraFields,
}

/// GET /series query params
#[derive(Debug, Clone, Default, Serialize)]
pub struct GetSeriesListParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetSeriesListResponse {
    #[serde(default, deserialize_with = "deserialize_null_as_empty_vec")]
    pub series: Vec<Series>,
}

/// --- Events ---

#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub event_ticker: String,
    #[serde(default)]
    pub series_ticker: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub sub_title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub mutually_exclusive: Option<bool>,
    #[serde(default)]
    pub close_ts: Option<i64>,
    #[serde(default)]
    pub markets: Option<Vec<Market>>,
    #[serde(default, flatten)]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct GetEventParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_nested_markets: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetEventResponse {
    pub event: Event,
    /// Populated when `with_nested_markets` is requested.
    #[serde(default, deserialize_with = "deserialize_null_as_empty_vec")]
    pub markets: Vec<Market>,
}

/// --- Markets ---

#[derive(Debug, Clone, Deserialize)]
pub struct Market {
    pub ticker: String,
    #[serde(default)]
    pub event_ticker: Option<String>,
    #[serde(default)]
    pub series_ticker: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Prices in cents, 1..=99.
    #[serde(default)]
    pub yes_bid: Option<i64>,
    #[serde(default)]
    pub yes_ask: Option<i64>,
    #[serde(default)]
    pub no_bid: Option<i64>,
    #[serde(default)]
    pub no_ask: Option<i64>,
    #[serde(default)]
    pub last_price: Option<i64>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub volume_24h: Option<i64>,
    #[serde(default)]
    pub open_interest: Option<i64>,
    #[serde(default)]
    pub open_ts: Option<i64>,
    #[serde(default)]
    pub close_ts: Option<i64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, flatten)]
    pub extra: ExtraFields,
}

/// GET /markets query params. Only fields with a present value are sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GetMarketsParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>, // default 100, max 1000
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_ticker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_ticker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_close_ts: Option<i64>, // seconds since epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_close_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MarketStatus>,
    /// Market tickers, serialized comma-separated.
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_csv_opt"
    )]
    pub tickers: Option<Vec<String>>,
}

impl GetMarketsParams {
    pub fn validate(&self) -> Result<(), PmxError> {
        if let Some(limit) = self.limit
            && (limit == 0 || limit > 1000)
        {
            return Err(PmxError::InvalidParams(
                "GET /markets: limit must be 1..=1000".to_string(),
            ));
        }
        if let Some(min) = self.min_close_ts
            && let Some(max) = self.max_close_ts
            && min > max
        {
            return Err(PmxError::InvalidParams(
                "GET /markets: min_close_ts must not exceed max_close_ts".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetMarketsResponse {
    #[serde(default, deserialize_with = "deserialize_null_as_empty_vec")]
    pub markets: Vec<Market>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetMarketResponse {
    pub market: Market,
}

/// --- Orderbook ---

/// One price level: price in cents and resting quantity.
///
/// The wire format is a bare `[price, quantity]` pair per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "(i64, i64)")]
pub struct OrderbookLevel {
    pub price_cents: i64,
    pub quantity: i64,
}

impl From<(i64, i64)> for OrderbookLevel {
    fn from((price_cents, quantity): (i64, i64)) -> Self {
        Self {
            price_cents,
            quantity,
        }
    }
}

/// Per-side ordered price levels for one market.
#[derive(Debug, Clone, Deserialize)]
pub struct Orderbook {
    #[serde(default, deserialize_with = "deserialize_null_as_empty_vec")]
    pub yes: Vec<OrderbookLevel>,
    #[serde(default, deserialize_with = "deserialize_null_as_empty_vec")]
    pub no: Vec<OrderbookLevel>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct GetOrderbookParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetOrderbookResponse {
    pub orderbook: Orderbook,
}
