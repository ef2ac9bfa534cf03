//! # pmx
//!
//! Async Rust client for the PMX prediction-market exchange API.
//!
//! ## Features
//!
//! - **RSA-PSS authentication** — per-request signing for private endpoints
//! - **REST reliability controls** — retry/backoff with `429 Retry-After` support
//! - **Managed WebSocket** — auto reconnect, resubscription, per-channel sequence checks
//! - **Pagination helpers** — page-level iteration via [`CursorPager`]
//! - **Transport builder** — timeout/connect-timeout/headers/user-agent/custom client
//!
//! ## Quick Start: REST
//!
//! ```no_run
//! use std::time::Duration;
//! use pmx::{GetMarketsParams, PmxEnvironment, PmxRestClient, RetryConfig};
//!
//! # async fn run() -> Result<(), pmx::PmxError> {
//! let client = PmxRestClient::builder(PmxEnvironment::demo())
//!     .with_retry_config(RetryConfig {
//!         max_retries: 4,
//!         base_delay: Duration::from_millis(200),
//!         max_delay: Duration::from_secs(2),
//!     })
//!     .build()?;
//!
//! let resp = client.get_markets(GetMarketsParams::default()).await?;
//! for market in resp.markets {
//!     println!("{}", market.ticker);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Quick Start: WebSocket
//!
//! ```no_run
//! use pmx::{PmxAuth, PmxEnvironment, PmxWsClient, WsChannel, WsData, WsEvent};
//!
//! # async fn run() -> Result<(), pmx::PmxError> {
//! let auth = PmxAuth::from_pem_file(
//!     std::env::var("PMX_KEY_ID").unwrap(),
//!     std::env::var("PMX_PRIVATE_KEY_PATH").unwrap(),
//! )?;
//!
//! let mut ws = PmxWsClient::connect_authenticated(PmxEnvironment::demo(), auth).await?;
//! ws.subscribe(vec![WsChannel::Ticker, WsChannel::Fill], vec![]).await?;
//!
//! while let Some(event) = ws.next_event().await {
//!     match event {
//!         WsEvent::Update(update) => {
//!             if let WsData::Ticker(t) = update.data {
//!                 println!("{} last={:?}", t.market_ticker, t.price);
//!             }
//!         }
//!         WsEvent::Reconnected { attempt } => println!("reconnected (attempt {attempt})"),
//!         WsEvent::Disconnected { reason } => {
//!             println!("closed: {reason}");
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Authentication
//!
//! Private endpoints (balance, fills, private channels) require RSA-PSS
//! signing. Load your key with [`PmxAuth::from_pem_file`] or
//! [`PmxAuth::from_pem_str`]:
//!
//! ```no_run
//! # use pmx::{PmxAuth, PmxError};
//! # fn run() -> Result<(), PmxError> {
//! // From a .key file on disk
//! let auth = PmxAuth::from_pem_file("your-key-id", "/path/to/private.key")?;
//!
//! // Or from PEM content directly (supports PKCS#8 and PKCS#1)
//! let pem = std::fs::read_to_string("/path/to/private.key").unwrap();
//! let auth = PmxAuth::from_pem_str("your-key-id", &pem)?;
//! # Ok(())
//! # }
//! ```
//!
//! Public endpoints work without credentials; when credentials are attached
//! every request is signed, which lets the exchange apply the key's rate
//! limit tier uniformly.
//!
//! ## Pagination
//!
//! ```no_run
//! # use pmx::{GetMarketsParams, PmxEnvironment, PmxRestClient};
//! # async fn run() -> Result<(), pmx::PmxError> {
//! # let client = PmxRestClient::new(PmxEnvironment::demo());
//! let mut pager = client.markets_pager(GetMarketsParams::default());
//! while let Some(page) = pager.next_page().await? {
//!     for market in page {
//!         println!("{}", market.ticker);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## WebSocket Reconnection
//!
//! [`PmxWsClient`] reconnects automatically with capped, jittered backoff
//! and replays active subscriptions. Configure via [`WsReconnectConfig`]:
//!
//! | Field | Default | Description |
//! |---|---|---|
//! | `max_retries` | `None` (unlimited) | Maximum reconnection attempts |
//! | `base_delay` | 250 ms | First backoff delay |
//! | `max_delay` | 30 s | Upper bound on backoff |
//! | `jitter` | 0.2 | Random jitter factor |
//! | `resubscribe` | `true` | Replay active subscriptions on reconnect |
//!
//! Each channel's `seq` numbers are checked as updates arrive; a gap drops
//! the frame and resubscribes that channel alone, so a fresh snapshot
//! follows without disturbing other channels.

pub mod auth;
pub mod env;
pub mod error;
pub mod rest;
pub mod types;
pub mod ws;

// Primary clients
pub use auth::{PmxAuth, PmxAuthHeaders};
pub use env::{PmxEnvironment, REST_PREFIX, WS_PATH};
pub use error::PmxError;
pub use rest::{
    CursorPager, PmxRestClient, PmxRestClientBuilder, RateLimitConfig, RetryConfig,
};
pub use ws::{
    PmxWsClient, PmxWsController, PmxWsLowLevelClient, WsReaderConfig, WsReconnectConfig,
    WsSessionState,
};

// Flat type re-exports
pub use rest::types::*;
pub use types::*;
pub use ws::types::*;
