#![allow(dead_code)]

use pmx::{PmxAuth, PmxEnvironment};
use rsa::RsaPrivateKey;
use std::time::Duration;
use wiremock::MockServer;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// 1024-bit keys are weak but generate quickly; test-only.
pub const TEST_KEY_BITS: usize = 1024;

pub fn test_private_key() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand::thread_rng(), TEST_KEY_BITS).expect("generate test key")
}

pub fn test_auth() -> PmxAuth {
    PmxAuth::new("test-key-id", test_private_key())
}

/// Environment pointing REST traffic at a wiremock server.
pub fn mock_env(server: &MockServer) -> PmxEnvironment {
    PmxEnvironment::custom(&server.uri(), "ws://127.0.0.1:1/trade-api/ws/v2")
        .expect("mock server uri parses")
}

/// Environment pointing WebSocket traffic at a local listener.
pub fn ws_env(addr: std::net::SocketAddr) -> PmxEnvironment {
    PmxEnvironment::custom("http://127.0.0.1:1", format!("ws://{addr}/trade-api/ws/v2"))
        .expect("local ws uri parses")
}
