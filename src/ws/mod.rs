pub mod client;
pub mod session;
pub mod types;

pub use client::{
    PmxWsClient, PmxWsController, PmxWsLowLevelClient, WsReaderConfig, WsReconnectConfig,
};
pub use session::WsSessionState;
