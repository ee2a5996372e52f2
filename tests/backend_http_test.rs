use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use huginn::HuginnError;
use huginn::backend::{Backend, BackendConfig, BreakerConfig, HttpBackend};

const API_KEY: &str = "test-key-123";
const ACCOUNT: i64 = 42;

async fn backend_against(server: &MockServer) -> HttpBackend {
    HttpBackend::new(BackendConfig::new(API_KEY).endpoint(server.uri())).unwrap()
}

#[tokio::test]
async fn querylang_parses_rows_and_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("Api-Key", API_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "actor": { "account": { "nrql": {
                "results": [{"count": 1000}],
                "metadata": { "eventTypes": ["Transaction"] },
            } } } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_against(&server).await;
    let cancel = CancellationToken::new();
    let result = backend
        .querylang(
            &cancel,
            "SELECT count(*) FROM Transaction",
            ACCOUNT,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.scalar_f64("count"), Some(1000.0));
    assert_eq!(result.metadata["eventTypes"][0], "Transaction");
}

#[tokio::test]
async fn statement_rides_the_graphql_variables() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "variables": { "accountId": ACCOUNT, "statement": "SELECT 1 FROM t" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "actor": { "account": { "nrql": { "results": [] } } } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_against(&server).await;
    let cancel = CancellationToken::new();
    backend
        .querylang(&cancel, "SELECT 1 FROM t", ACCOUNT, Duration::from_secs(10))
        .await
        .unwrap();
}

#[tokio::test]
async fn unauthorized_maps_to_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let backend = backend_against(&server).await;
    let cancel = CancellationToken::new();
    let err = backend
        .querylang(&cancel, "SELECT 1 FROM t", ACCOUNT, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, HuginnError::Unauthorized(_)));
    // Message must not leak the key.
    assert!(!err.to_string().contains(API_KEY));
}

#[tokio::test]
async fn rate_limit_carries_retry_after_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
        .mount(&server)
        .await;

    let backend = backend_against(&server).await;
    let cancel = CancellationToken::new();
    let err = backend
        .querylang(&cancel, "SELECT 1 FROM t", ACCOUNT, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
}

#[tokio::test]
async fn graphql_error_array_maps_to_invalid_input() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{"message": "unknown event type Bogus"}]
        })))
        .mount(&server)
        .await;

    let backend = backend_against(&server).await;
    let cancel = CancellationToken::new();
    let err = backend
        .querylang(&cancel, "SELECT 1 FROM Bogus", ACCOUNT, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, HuginnError::InvalidInput { .. }));
}

#[tokio::test]
async fn breaker_opens_after_consecutive_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut config = BackendConfig::new(API_KEY).endpoint(server.uri());
    config.breaker = BreakerConfig {
        failure_threshold: 2,
        cooldown: Duration::from_secs(60),
    };
    let backend = HttpBackend::new(config).unwrap();
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let err = backend
            .querylang(&cancel, "SELECT 1 FROM t", ACCOUNT, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HuginnError::BackendUnavailable(_)));
    }

    // Third call fails fast without reaching the server.
    let before = server.received_requests().await.unwrap().len();
    let err = backend
        .querylang(&cancel, "SELECT 1 FROM t", ACCOUNT, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, HuginnError::BackendUnavailable(_)));
    assert_eq!(server.received_requests().await.unwrap().len(), before);
    assert_eq!(backend.breaker_states()["querylang"], "open");
}

#[tokio::test]
async fn account_info_is_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "actor": { "account": { "id": ACCOUNT, "name": "prod" } } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_against(&server).await;
    let cancel = CancellationToken::new();
    let first = backend.account_info(&cancel, ACCOUNT).await.unwrap();
    let second = backend.account_info(&cancel, ACCOUNT).await.unwrap();
    assert_eq!(first.name, "prod");
    assert_eq!(second.name, "prod");
    // expect(1) on the mock verifies the second call never hit the wire.
}

#[tokio::test]
async fn cancellation_aborts_a_slow_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(5))
                .set_body_json(json!({"data": {}})),
        )
        .mount(&server)
        .await;

    let backend = std::sync::Arc::new(backend_against(&server).await);
    let cancel = CancellationToken::new();
    let task = {
        let backend = backend.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            backend
                .querylang(&cancel, "SELECT 1 FROM t", ACCOUNT, Duration::from_secs(30))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_millis(100), task)
        .await
        .expect("cancellation was not observed within 100ms")
        .unwrap();
    assert!(matches!(result, Err(HuginnError::Cancelled)));
}
