use crate::rest::types::*;
use crate::types::ErrorResponse;
use crate::{PmxAuth, PmxEnvironment, PmxError, REST_PREFIX};

use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tracing::debug;
use url::Url;

/// Minimum spacing between outbound requests.
///
/// The exchange throttles per key; local pacing keeps a burst of calls from
/// turning into a string of 429s. Set `rps` to `0` to disable.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Maximum requests per second (0 = unlimited).
    pub rps: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { rps: 20 }
    }
}

/// Retry policy for transient REST failures.
///
/// Applies only to error kinds that report [`PmxError::is_retryable`]:
/// rate limiting, 5xx responses, and transport-level connect/timeout
/// failures. Authentication and caller errors are surfaced after a single
/// attempt.
///
/// Backoff is exponential with full jitter: each delay is drawn uniformly
/// from zero up to `min(max_delay, base_delay * 2^retry)`. A server-provided
/// `Retry-After` hint overrides the computed delay.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Backoff cap for the first retry.
    pub base_delay: Duration,
    /// Upper bound on any backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    fn backoff_delay(&self, retry_number: u32) -> Duration {
        let exp = 2f64.powi(retry_number.saturating_sub(1) as i32);
        let mut cap = self.base_delay.mul_f64(exp);
        if cap > self.max_delay {
            cap = self.max_delay;
        }
        cap.mul_f64(rand::random::<f64>())
    }
}

fn parse_error_body(bytes: &[u8]) -> Option<ErrorResponse> {
    #[derive(serde::Deserialize)]
    struct WrappedErrorBody {
        error: ErrorResponse,
    }

    let normalize = |error: ErrorResponse| {
        if error.code.is_some()
            || error.message.is_some()
            || error.details.is_some()
            || error.service.is_some()
        {
            Some(error)
        } else {
            None
        }
    };
    serde_json::from_slice::<WrappedErrorBody>(bytes)
        .ok()
        .and_then(|wrapped| normalize(wrapped.error))
        .or_else(|| {
            serde_json::from_slice::<ErrorResponse>(bytes)
                .ok()
                .and_then(normalize)
        })
}

fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    bytes: &[u8],
    path: &str,
) -> PmxError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PmxError::Auth {
            status,
            api_error: parse_error_body(bytes),
        },
        StatusCode::NOT_FOUND => PmxError::NotFound {
            path: path.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => PmxError::RateLimited {
            retry_after: retry_after_delay(headers),
        },
        s if s.is_server_error() => PmxError::Server {
            status,
            api_error: parse_error_body(bytes),
        },
        _ => PmxError::Validation {
            status,
            api_error: parse_error_body(bytes),
        },
    }
}

fn retry_after_delay(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let text = value.to_str().ok()?.trim();

    if let Ok(seconds) = text.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let ts = httpdate::parse_http_date(text).ok()?;
    let delta = ts.duration_since(SystemTime::now()).ok()?;
    Some(delta)
}

#[derive(Debug)]
struct RateLimiter {
    next_slot: Mutex<Instant>,
    interval: Duration,
}

impl RateLimiter {
    fn new(config: RateLimitConfig) -> Self {
        let interval = if config.rps == 0 {
            Duration::from_secs(0)
        } else {
            Duration::from_secs_f64(1.0 / config.rps as f64)
        };
        Self {
            next_slot: Mutex::new(Instant::now() - interval),
            interval,
        }
    }

    async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }

        let mut last = self.next_slot.lock().await;
        let now = Instant::now();
        let scheduled = if *last + self.interval > now {
            *last + self.interval
        } else {
            now
        };
        *last = scheduled;
        drop(last);

        if scheduled > now {
            sleep(scheduled - now).await;
        }
    }
}

/// Manual page-by-page cursor pagination.
///
/// # Example
/// ```no_run
/// # use pmx::{PmxEnvironment, PmxRestClient, GetMarketsParams};
/// # async fn example() -> Result<(), pmx::PmxError> {
/// let client = PmxRestClient::new(PmxEnvironment::demo());
/// let mut pager = client.markets_pager(GetMarketsParams::default());
///
/// while let Some(markets) = pager.next_page().await? {
///     println!("got {} markets", markets.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct CursorPager<T> {
    cursor: Option<String>,
    done: bool,
    fetch: Box<
        dyn FnMut(
                Option<String>,
            ) -> BoxFuture<'static, Result<(Vec<T>, Option<String>), PmxError>>
            + Send,
    >,
}

impl<T> CursorPager<T> {
    pub fn new<F>(cursor: Option<String>, fetch: F) -> Self
    where
        F: FnMut(
                Option<String>,
            ) -> BoxFuture<'static, Result<(Vec<T>, Option<String>), PmxError>>
            + Send
            + 'static,
    {
        Self {
            cursor: cursor.filter(|c| !c.is_empty()),
            done: false,
            fetch: Box::new(fetch),
        }
    }

    /// Fetch the next page. `Ok(None)` once pagination is complete.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>, PmxError> {
        if self.done {
            return Ok(None);
        }

        let (items, next) = (self.fetch)(self.cursor.clone()).await?;
        self.cursor = next.filter(|c| !c.is_empty());
        if self.cursor.is_none() {
            self.done = true;
        }

        Ok(Some(items))
    }

    /// Cursor for the next fetch; useful for checkpointing.
    pub fn current_cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Builder for [`PmxRestClient`] with transport and retry customization.
#[derive(Debug, Clone)]
pub struct PmxRestClientBuilder {
    env: PmxEnvironment,
    auth: Option<PmxAuth>,
    rate_limit_config: RateLimitConfig,
    retry_config: RetryConfig,
    timeout: Duration,
    connect_timeout: Option<Duration>,
    user_agent: Option<String>,
    default_headers: Option<HeaderMap>,
    http_client: Option<Client>,
}

impl PmxRestClientBuilder {
    fn new(env: PmxEnvironment) -> Self {
        Self {
            env,
            auth: None,
            rate_limit_config: RateLimitConfig::default(),
            retry_config: RetryConfig::default(),
            timeout: Duration::from_secs(30),
            connect_timeout: None,
            user_agent: None,
            default_headers: None,
            http_client: None,
        }
    }

    pub fn with_auth(mut self, auth: PmxAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_rate_limit_config(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit_config = config;
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Whole-request timeout, 30s unless overridden.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = Some(headers);
        self
    }

    /// Supply a preconfigured `reqwest::Client`; transport options set on
    /// this builder are ignored in that case.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn build(self) -> Result<PmxRestClient, PmxError> {
        let http = if let Some(client) = self.http_client {
            client
        } else {
            let mut builder = Client::builder().timeout(self.timeout);
            if let Some(timeout) = self.connect_timeout {
                builder = builder.connect_timeout(timeout);
            }
            if let Some(user_agent) = self.user_agent {
                builder = builder.user_agent(user_agent);
            }
            if let Some(headers) = self.default_headers {
                builder = builder.default_headers(headers);
            }
            builder.build()?
        };

        Ok(PmxRestClient {
            http,
            rest_origin: self.env.rest_origin,
            auth: self.auth,
            rate_limiter: Arc::new(RateLimiter::new(self.rate_limit_config)),
            retry_config: self.retry_config,
            timeout: self.timeout,
        })
    }
}

/// Async HTTP client for the exchange REST API.
///
/// One underlying connection pool is reused across calls; the client itself
/// is otherwise stateless and safe to share between tasks, since every call
/// recomputes its own timestamp and signature.
///
/// # Construction
///
/// ```no_run
/// use pmx::{PmxAuth, PmxEnvironment, PmxRestClient};
///
/// # fn run() -> Result<(), pmx::PmxError> {
/// let client = PmxRestClient::new(PmxEnvironment::demo())
///     .with_auth(PmxAuth::from_pem_file("key-id", "private.key")?);
/// # Ok(())
/// # }
/// ```
///
/// Calling an authenticated endpoint without
/// [`with_auth`](Self::with_auth) returns [`PmxError::AuthRequired`].
#[derive(Debug, Clone)]
pub struct PmxRestClient {
    http: Client,
    rest_origin: Url,
    auth: Option<PmxAuth>,
    rate_limiter: Arc<RateLimiter>,
    retry_config: RetryConfig,
    timeout: Duration,
}

impl PmxRestClient {
    /// Start a configurable client builder.
    pub fn builder(env: PmxEnvironment) -> PmxRestClientBuilder {
        PmxRestClientBuilder::new(env)
    }

    /// Create a client for the given environment with default transport,
    /// retry, and pacing settings. The client starts unauthenticated.
    pub fn new(env: PmxEnvironment) -> Self {
        Self::builder(env)
            .build()
            .expect("default rest client builder should not fail")
    }

    /// Attach credentials so authenticated endpoints can be called.
    pub fn with_auth(mut self, auth: PmxAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Override retry policy.
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Override request pacing.
    pub fn with_rate_limit_config(mut self, config: RateLimitConfig) -> Self {
        self.rate_limiter = Arc::new(RateLimiter::new(config));
        self
    }

    fn full_path(endpoint_path: &str) -> String {
        // endpoint_path must begin with "/", e.g. "/markets"
        format!("{REST_PREFIX}{endpoint_path}")
    }

    fn build_url(&self, full_path: &str) -> Result<Url, PmxError> {
        Ok(self.rest_origin.join(full_path)?)
    }

    fn insert_auth_headers(
        headers: &mut HeaderMap,
        auth: &PmxAuth,
        path_without_query: &str,
    ) -> Result<(), PmxError> {
        let h = auth.build_headers("GET", path_without_query)?;

        headers.insert(
            HeaderName::from_static("access-key"),
            HeaderValue::from_str(&h.key).map_err(|e| PmxError::Header(e.to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("access-timestamp"),
            HeaderValue::from_str(&h.timestamp_ms).map_err(|e| PmxError::Header(e.to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("access-signature"),
            HeaderValue::from_str(&h.signature).map_err(|e| PmxError::Header(e.to_string()))?,
        );

        Ok(())
    }

    fn classify_transport(&self, err: reqwest::Error) -> PmxError {
        if err.is_timeout() {
            PmxError::Timeout(self.timeout)
        } else if err.is_connect() {
            PmxError::Connect(err.to_string())
        } else {
            PmxError::Transport(err)
        }
    }

    async fn send<Q, T>(
        &self,
        full_path: &str,
        query: Option<&Q>,
        require_auth: bool,
    ) -> Result<T, PmxError>
    where
        Q: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.build_url(full_path)?;
        let auth = if require_auth {
            Some(
                self.auth
                    .as_ref()
                    .ok_or(PmxError::AuthRequired("REST endpoint"))?,
            )
        } else {
            self.auth.as_ref()
        };

        let mut retry_number: u32 = 0;

        loop {
            let mut headers = HeaderMap::new();
            if let Some(auth) = auth {
                // Sign the path without query parameters.
                Self::insert_auth_headers(&mut headers, auth, full_path)?;
            }

            self.rate_limiter.wait().await;

            let mut req = self.http.get(url.clone()).headers(headers);
            if let Some(q) = query {
                req = req.query(q);
            }

            let err = match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let resp_headers = resp.headers().clone();
                    let bytes = resp.bytes().await.map_err(|e| self.classify_transport(e))?;

                    if status.is_success() {
                        let body = if bytes.is_empty() { b"{}" } else { bytes.as_ref() };
                        return serde_json::from_slice::<T>(body).map_err(|source| {
                            PmxError::Decode {
                                endpoint: full_path.to_string(),
                                source,
                            }
                        });
                    }

                    classify_status(status, &resp_headers, &bytes, full_path)
                }
                Err(err) => self.classify_transport(err),
            };

            if retry_number < self.retry_config.max_retries && err.is_retryable() {
                retry_number += 1;
                let delay = match &err {
                    PmxError::RateLimited {
                        retry_after: Some(hint),
                    } => *hint,
                    _ => self.retry_config.backoff_delay(retry_number),
                };
                debug!(
                    path = full_path,
                    retry = retry_number,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying transient failure"
                );
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                continue;
            }

            return Err(err);
        }
    }

    // -----------------------------------------------
    // Portfolio (authenticated)
    // -----------------------------------------------

    /// Get the account balance in cents.
    ///
    /// **Requires auth.**
    pub async fn get_balance(&self) -> Result<Balance, PmxError> {
        let path = Self::full_path("/portfolio/balance");
        self.send(&path, Option::<&()>::None, true).await
    }

    // -----------------------------------------------
    // Series
    // -----------------------------------------------

    /// List series, optionally filtered by category or tags.
    pub async fn get_series_list(
        &self,
        params: GetSeriesListParams,
    ) -> Result<GetSeriesListResponse, PmxError> {
        let path = Self::full_path("/series");
        self.send(&path, Some(&params), false).await
    }

    // -----------------------------------------------
    // Markets
    // -----------------------------------------------

    /// List markets with optional filters. Supports cursor pagination.
    pub async fn get_markets(
        &self,
        params: GetMarketsParams,
    ) -> Result<GetMarketsResponse, PmxError> {
        params.validate()?;
        let path = Self::full_path("/markets");
        self.send(&path, Some(&params), false).await
    }

    /// Get a single market by ticker.
    pub async fn get_market(&self, market_ticker: &str) -> Result<GetMarketResponse, PmxError> {
        let path = Self::full_path(&format!("/markets/{market_ticker}"));
        self.send(&path, Option::<&()>::None, false).await
    }

    /// Get the order book for a market, optionally limited to `depth`
    /// levels per side.
    pub async fn get_orderbook(
        &self,
        market_ticker: &str,
        depth: Option<u32>,
    ) -> Result<GetOrderbookResponse, PmxError> {
        let path = Self::full_path(&format!("/markets/{market_ticker}/orderbook"));
        let params = GetOrderbookParams { depth };
        self.send(&path, Some(&params), false).await
    }

    // -----------------------------------------------
    // Events
    // -----------------------------------------------

    /// Get a single event by ticker, optionally including its nested
    /// markets.
    pub async fn get_event(
        &self,
        event_ticker: &str,
        with_nested_markets: Option<bool>,
    ) -> Result<GetEventResponse, PmxError> {
        let path = Self::full_path(&format!("/events/{event_ticker}"));
        let params = GetEventParams {
            with_nested_markets,
        };
        self.send(&path, Some(&params), false).await
    }

    // -----------------------------------------------
    // Generic escape hatch
    // -----------------------------------------------

    /// Issue a GET against an arbitrary endpoint path (relative to the
    /// versioned API prefix) and decode the JSON body into `T`.
    ///
    /// The request is signed whenever credentials are attached. Use
    /// `serde_json::Value` for `T` to inspect endpoints this crate has no
    /// typed wrapper for.
    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint_path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, PmxError> {
        let path = Self::full_path(endpoint_path);
        if query.is_empty() {
            self.send(&path, Option::<&()>::None, false).await
        } else {
            self.send(&path, Some(&query), false).await
        }
    }

    // -----------------------------------------------
    // Pagination helpers
    // -----------------------------------------------

    /// Page through `/markets` with the given filters.
    pub fn markets_pager(&self, params: GetMarketsParams) -> CursorPager<Market> {
        let client = self.clone();
        let initial_cursor = params.cursor.clone();
        CursorPager::new(initial_cursor, move |cursor| {
            let client = client.clone();
            let mut params = params.clone();
            Box::pin(async move {
                params.cursor = cursor;
                let resp = client.get_markets(params).await?;
                Ok((resp.markets, resp.cursor))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_and_jittered() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        };
        for retry in 1..=8 {
            let delay = config.backoff_delay(retry);
            // Full jitter: anywhere from zero up to the capped exponential.
            assert!(delay <= Duration::from_secs(2), "retry {retry}: {delay:?}");
        }
    }

    #[test]
    fn retry_after_parses_delta_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after_delay(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        let headers = HeaderMap::new();
        let body = br#"{"error": {"code": "unauthorized", "message": "bad signature"}}"#;

        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, &headers, body, "/x"),
            PmxError::Auth { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &headers, body, "/x"),
            PmxError::Auth { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, &headers, b"", "/markets/NOPE"),
            PmxError::NotFound { path } if path == "/markets/NOPE"
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, b"", "/x"),
            PmxError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &headers, b"", "/x"),
            PmxError::Server { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, &headers, body, "/x"),
            PmxError::Validation { .. }
        ));
    }

    #[test]
    fn error_body_parses_wrapped_and_bare_shapes() {
        let wrapped = br#"{"error": {"code": "missing_parameters", "message": "limit"}}"#;
        let parsed = parse_error_body(wrapped).unwrap();
        assert_eq!(parsed.code.as_deref(), Some("missing_parameters"));

        let bare = br#"{"code": "internal", "message": "boom"}"#;
        let parsed = parse_error_body(bare).unwrap();
        assert_eq!(parsed.code.as_deref(), Some("internal"));

        assert!(parse_error_body(b"not json").is_none());
        assert!(parse_error_body(b"{}").is_none());
    }
}
