use url::Url;

/// Path prefix shared by every REST endpoint, e.g. `/trade-api/v2/markets`.
pub const REST_PREFIX: &str = "/trade-api/v2";

/// Upgrade path for the streaming connection. This exact string is what gets
/// signed for the WebSocket handshake.
pub const WS_PATH: &str = "/trade-api/ws/v2";

/// Deployment target: REST origin plus WebSocket URL.
///
/// Pick one of the stock environments or point at your own with
/// [`PmxEnvironment::custom`] (the test suites use `custom` against local
/// mock servers). Adding another deployment is one more constructor call;
/// nothing in the signer or clients changes.
#[derive(Debug, Clone)]
pub struct PmxEnvironment {
    /// Scheme + host only; endpoint paths (including [`REST_PREFIX`]) are
    /// joined onto this.
    pub rest_origin: Url,
    /// Full WebSocket URL including [`WS_PATH`].
    pub ws_url: String,
}

impl PmxEnvironment {
    /// Demo exchange: paper money, same API surface as production.
    pub fn demo() -> Self {
        Self {
            rest_origin: Url::parse("https://demo-api.pmx.market")
                .expect("static demo URL parses"),
            ws_url: format!("wss://demo-api.pmx.market{WS_PATH}"),
        }
    }

    /// Production exchange.
    pub fn prod() -> Self {
        Self {
            rest_origin: Url::parse("https://api.pmx.market").expect("static prod URL parses"),
            ws_url: format!("wss://api.pmx.market{WS_PATH}"),
        }
    }

    /// Arbitrary deployment (local sandbox, mock server).
    pub fn custom(rest_origin: &str, ws_url: impl Into<String>) -> Result<Self, url::ParseError> {
        Ok(Self {
            rest_origin: Url::parse(rest_origin)?,
            ws_url: ws_url.into(),
        })
    }
}
