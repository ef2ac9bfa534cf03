use crate::types::ErrorResponse;

use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// All failure modes surfaced by the REST and WebSocket clients.
///
/// Retryability is a property of the kind, not of the call site: transient
/// kinds ([`RateLimited`](Self::RateLimited), [`Server`](Self::Server),
/// [`Connect`](Self::Connect), [`Timeout`](Self::Timeout)) are retried
/// internally with bounded backoff; everything else is surfaced after a
/// single attempt.
#[derive(Debug, Error)]
pub enum PmxError {
    /// Key loading or RSA-PSS signing failed. Fatal: no request can be
    /// issued without a signature, and retrying cannot help.
    #[error("signing failed: {0}")]
    Signing(String),

    /// An authenticated operation was invoked on a client built without
    /// credentials.
    #[error("authentication required for {0}")]
    AuthRequired(&'static str),

    /// The exchange rejected the key, signature, or timestamp (401/403).
    /// Never retried: a bad signature stays bad, and burning the timestamp
    /// window on retries cannot succeed.
    #[error("authentication rejected ({status}): {}", summarize(api_error))]
    Auth {
        status: StatusCode,
        api_error: Option<ErrorResponse>,
    },

    /// 404 for the requested resource.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// 429. Retried with backoff, honoring a `Retry-After` hint when the
    /// server provides one; surfaced once retries are exhausted.
    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// 5xx. Retried a bounded number of times, then surfaced.
    #[error("server error ({status}): {}", summarize(api_error))]
    Server {
        status: StatusCode,
        api_error: Option<ErrorResponse>,
    },

    /// Any other 4xx: the request itself was malformed. Caller error,
    /// surfaced immediately.
    #[error("request rejected ({status}): {}", summarize(api_error))]
    Validation {
        status: StatusCode,
        api_error: Option<ErrorResponse>,
    },

    /// Client-side parameter validation failed before any request was sent.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// A 2xx body did not match the expected shape. Never silently
    /// defaulted; names the offending endpoint.
    #[error("decoding response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    /// TCP/TLS level connection failure (refused, reset, DNS).
    #[error("connection failed: {0}")]
    Connect(String),

    /// An explicit deadline elapsed (connect, subscription ack, request).
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A signed value could not be encoded as an HTTP header.
    #[error("header value: {0}")]
    Header(String),

    /// WebSocket transport or protocol failure.
    #[error("websocket: {0}")]
    Ws(String),

    /// A streaming channel skipped or repeated a sequence number. Handled
    /// internally by resubscribing the affected channel; only surfaced if
    /// resubscription itself keeps failing.
    #[error("sequence gap on channel {channel}: expected {expected}, got {got}")]
    SequenceGap {
        channel: String,
        expected: u64,
        got: u64,
    },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PmxError {
    /// Whether the failure is transient and worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            PmxError::RateLimited { .. }
            | PmxError::Server { .. }
            | PmxError::Connect(_)
            | PmxError::Timeout(_) => true,
            PmxError::Transport(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

fn summarize(api_error: &Option<ErrorResponse>) -> String {
    match api_error {
        Some(e) => {
            let code = e.code.as_deref().unwrap_or("unknown");
            let message = e.message.as_deref().unwrap_or("");
            format!("{code}: {message}")
        }
        None => "no error body".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_kind() {
        assert!(
            PmxError::RateLimited {
                retry_after: None
            }
            .is_retryable()
        );
        assert!(
            PmxError::Server {
                status: StatusCode::BAD_GATEWAY,
                api_error: None
            }
            .is_retryable()
        );
        assert!(PmxError::Connect("refused".into()).is_retryable());
        assert!(PmxError::Timeout(Duration::from_secs(5)).is_retryable());

        assert!(
            !PmxError::Auth {
                status: StatusCode::UNAUTHORIZED,
                api_error: None
            }
            .is_retryable()
        );
        assert!(
            !PmxError::NotFound {
                path: "/markets/NOPE".into()
            }
            .is_retryable()
        );
        assert!(!PmxError::Signing("bad key".into()).is_retryable());
    }
}
