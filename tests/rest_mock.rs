mod common;

use pmx::{PmxError, PmxRestClient, RateLimitConfig, RetryConfig};
use std::time::Duration;
use tokio_test::assert_ok;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Retry policy with negligible delays so retry tests run fast.
fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

async fn client_for(server: &MockServer) -> PmxRestClient {
    PmxRestClient::builder(common::mock_env(server))
        .with_retry_config(fast_retry())
        .with_rate_limit_config(RateLimitConfig { rps: 0 })
        .build()
        .unwrap()
}

#[tokio::test]
async fn balance_request_is_signed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/portfolio/balance"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"balance": 123456})),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).await.with_auth(common::test_auth());
    let balance = assert_ok!(client.get_balance().await);
    assert_eq!(balance.balance, 123456);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let headers = &requests[0].headers;
    assert_eq!(
        headers.get("access-key").and_then(|v| v.to_str().ok()),
        Some("test-key-id")
    );
    assert!(headers.contains_key("access-timestamp"));
    assert!(headers.contains_key("access-signature"));
}

#[tokio::test]
async fn balance_without_credentials_fails_before_sending() {
    let server = MockServer::start().await;
    let client = client_for(&server).await;

    let err = client.get_balance().await.unwrap_err();
    assert!(matches!(err, PmxError::AuthRequired(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn markets_query_carries_filters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets"))
        .and(query_param("limit", "5"))
        .and(query_param("status", "open"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"markets": [], "cursor": null})),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let params = pmx::GetMarketsParams {
        limit: Some(5),
        status: Some(pmx::MarketStatus::Open),
        ..Default::default()
    };
    let resp = assert_ok!(client.get_markets(params).await);
    assert!(resp.markets.is_empty());
}

#[tokio::test]
async fn invalid_limit_fails_before_sending() {
    let server = MockServer::start().await;
    let client = client_for(&server).await;

    let params = pmx::GetMarketsParams {
        limit: Some(5000),
        ..Default::default()
    };
    let err = client.get_markets(params).await.unwrap_err();
    assert!(matches!(err, PmxError::InvalidParams(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn rate_limited_request_is_retried() {
    let server = MockServer::start().await;
    // First response is a 429 with a hint; mounted first so it wins once.
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets/CPI-24DEC-T3.0"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets/CPI-24DEC-T3.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "market": {"ticker": "CPI-24DEC-T3.0", "yes_bid": 42}
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let resp = client.get_market("CPI-24DEC-T3.0").await.unwrap();
    assert_eq!(resp.market.ticker, "CPI-24DEC-T3.0");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets"))
        .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
            "error": {"code": "unavailable", "message": "maintenance"}
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client
        .get_markets(pmx::GetMarketsParams::default())
        .await
        .unwrap_err();
    match err {
        PmxError::Server { status, api_error } => {
            assert_eq!(status.as_u16(), 503);
            assert_eq!(api_error.unwrap().code.as_deref(), Some("unavailable"));
        }
        other => panic!("expected server error, got {other}"),
    }
    // Initial attempt plus max_retries.
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn auth_rejection_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/portfolio/balance"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "code": "invalid_signature", "message": "signature verification failed"
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await.with_auth(common::test_auth());
    let err = client.get_balance().await.unwrap_err();
    match err {
        PmxError::Auth { status, api_error } => {
            assert_eq!(status.as_u16(), 401);
            assert_eq!(api_error.unwrap().code.as_deref(), Some("invalid_signature"));
        }
        other => panic!("expected auth error, got {other}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn missing_resource_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets/NOPE"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client.get_market("NOPE").await.unwrap_err();
    match err {
        PmxError::NotFound { path } => assert!(path.ends_with("/markets/NOPE")),
        other => panic!("expected not found, got {other}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_success_body_names_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets/CPI-24DEC-T3.0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"market": "oops"}"#))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client.get_market("CPI-24DEC-T3.0").await.unwrap_err();
    match err {
        PmxError::Decode { endpoint, .. } => assert!(endpoint.contains("/markets/CPI-24DEC-T3.0")),
        other => panic!("expected decode error, got {other}"),
    }
}

#[tokio::test]
async fn orderbook_depth_is_passed_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets/CPI-24DEC-T3.0/orderbook"))
        .and(query_param("depth", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "orderbook": {"yes": [[42, 100]], "no": [[57, 80]]}
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let resp = assert_ok!(client.get_orderbook("CPI-24DEC-T3.0", Some(3)).await);
    assert_eq!(resp.orderbook.yes[0].price_cents, 42);
    assert_eq!(resp.orderbook.no[0].quantity, 80);
}

#[tokio::test]
async fn generic_get_decodes_untyped_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/exchange/status"))
        .and(query_param("verbose", "true"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"exchange_active": true})),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let value: serde_json::Value = client
        .get("/exchange/status", &[("verbose", "true")])
        .await
        .unwrap();
    assert_eq!(value.get("exchange_active"), Some(&serde_json::json!(true)));
}

#[tokio::test]
async fn pager_follows_cursors_to_the_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets"))
        .and(query_param("cursor", "page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "markets": [{"ticker": "B-2"}], "cursor": null
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "markets": [{"ticker": "A-1"}], "cursor": "page2"
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let mut pager = client.markets_pager(pmx::GetMarketsParams::default());

    let first = pager.next_page().await.unwrap().unwrap();
    assert_eq!(first[0].ticker, "A-1");
    let second = pager.next_page().await.unwrap().unwrap();
    assert_eq!(second[0].ticker, "B-2");
    assert!(pager.next_page().await.unwrap().is_none());
    assert!(pager.is_done());
}
