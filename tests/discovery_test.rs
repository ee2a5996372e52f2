mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{ACCOUNT, MockBackend};
use huginn::discovery::{DiscoveryConfig, DiscoveryEngine};
use huginn::state::{StateConfig, StateManager};
use huginn::types::{DiscoveryKind, DiscoveryScope, ProfileDepth, SchemaFilter};

fn engine(backend: Arc<MockBackend>) -> (DiscoveryEngine, Arc<StateManager>) {
    let state = Arc::new(StateManager::in_memory(StateConfig::default()));
    let engine = DiscoveryEngine::new(
        backend,
        state.cache().clone(),
        DiscoveryConfig::default(),
    )
    .unwrap();
    (engine, state)
}

fn scope() -> DiscoveryScope {
    DiscoveryScope::event_type(ACCOUNT, "Transaction")
}

#[tokio::test]
async fn service_identifier_found_with_high_confidence() {
    // 990 of 1000 Transaction records carry appName.
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend);
    let cancel = CancellationToken::new();

    let result = engine
        .ensure(&cancel, DiscoveryKind::ServiceIdentifier, &scope())
        .await
        .unwrap();

    assert_eq!(result.value["field"], "appName");
    assert!(result.confidence >= 0.95, "confidence {}", result.confidence);
    assert!(result.coverage >= 0.95, "coverage {}", result.coverage);
    assert!(!result.assumptions.is_empty());
}

#[tokio::test]
async fn ensure_is_cached_within_ttl() {
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend.clone());
    let cancel = CancellationToken::new();

    let first = engine
        .ensure(&cancel, DiscoveryKind::ServiceIdentifier, &scope())
        .await
        .unwrap();
    let calls_after_first = backend.calls();
    assert!(calls_after_first > 0);

    let second = engine
        .ensure(&cancel, DiscoveryKind::ServiceIdentifier, &scope())
        .await
        .unwrap();
    assert_eq!(backend.calls(), calls_after_first, "second ensure hit the backend");
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn invalidate_forces_fresh_chain() {
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend.clone());
    let cancel = CancellationToken::new();

    engine
        .ensure(&cancel, DiscoveryKind::ServiceIdentifier, &scope())
        .await
        .unwrap();
    let calls_after_first = backend.calls();

    engine
        .invalidate(DiscoveryKind::ServiceIdentifier, &scope())
        .await
        .unwrap();
    engine
        .ensure(&cancel, DiscoveryKind::ServiceIdentifier, &scope())
        .await
        .unwrap();
    assert!(backend.calls() > calls_after_first, "chain did not re-run");
}

#[tokio::test]
async fn concurrent_ensures_share_one_chain() {
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend.clone());
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            engine
                .ensure(&cancel, DiscoveryKind::ServiceIdentifier, &scope())
                .await
                .unwrap()
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().id);
    }

    // All callers observed the same execution.
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    // One chain's worth of probes, not eight.
    let calls = backend.calls();
    assert!(calls <= 4, "expected one chain execution, saw {calls} backend calls");
}

#[tokio::test]
async fn exhausted_chain_returns_zero_confidence_not_error() {
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend);
    let cancel = CancellationToken::new();

    // EmptyType has no records, so every probe comes up dry.
    let result = engine
        .ensure(
            &cancel,
            DiscoveryKind::ServiceIdentifier,
            &DiscoveryScope::event_type(ACCOUNT, "EmptyType"),
        )
        .await
        .unwrap();
    assert_eq!(result.confidence, 0.0);
    assert!(!result.assumptions.is_empty());
}

#[tokio::test]
async fn cancelled_ensure_publishes_nothing() {
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = engine
        .ensure(&cancel, DiscoveryKind::ServiceIdentifier, &scope())
        .await;
    assert!(matches!(outcome, Err(huginn::HuginnError::Cancelled)));

    // Nothing was published: a later ensure runs the chain for real.
    let fresh = CancellationToken::new();
    engine
        .ensure(&fresh, DiscoveryKind::ServiceIdentifier, &scope())
        .await
        .unwrap();
    assert!(backend.calls() > 0);
}

#[tokio::test]
async fn error_indicator_prefers_boolean_error() {
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend);
    let cancel = CancellationToken::new();

    let result = engine
        .ensure(&cancel, DiscoveryKind::ErrorIndicator, &scope())
        .await
        .unwrap();
    assert_eq!(result.value["condition"], "error IS true");
    assert!(result.confidence >= 0.7);
}

#[tokio::test]
async fn list_schemas_returns_catalog() {
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend);
    let cancel = CancellationToken::new();

    let listing = engine
        .list_schemas(&cancel, ACCOUNT, &SchemaFilter::default())
        .await
        .unwrap();
    let names: Vec<_> = listing.schemas.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"Transaction"));
    assert!(names.contains(&"TransactionError"));
    assert!(listing.guidance.is_none());
}

#[tokio::test]
async fn list_schemas_filter_can_produce_guidance() {
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend);
    let cancel = CancellationToken::new();

    let listing = engine
        .list_schemas(
            &cancel,
            ACCOUNT,
            &SchemaFilter {
                pattern: Some("NoSuchThing*".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(listing.schemas.is_empty());
    assert!(listing.guidance.is_some());
}

#[tokio::test]
async fn profile_schema_enriches_attributes() {
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend);
    let cancel = CancellationToken::new();

    let schema = engine
        .profile_schema(&cancel, ACCOUNT, "Transaction", ProfileDepth::Standard)
        .await
        .unwrap();
    assert_eq!(schema.record_count, 1000);
    let app_name = schema.attribute("appName").expect("appName profiled");
    assert!(app_name.null_ratio < 0.1);
    assert!(!app_name.sample_values.is_empty());
}

#[tokio::test]
async fn assess_quality_scores_all_dimensions() {
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend);
    let cancel = CancellationToken::new();

    let report = engine
        .assess_quality(&cancel, ACCOUNT, "Transaction")
        .await
        .unwrap();
    for score in [
        report.completeness,
        report.consistency,
        report.timeliness,
        report.uniqueness,
        report.validity,
        report.overall,
    ] {
        assert!((0.0..=1.0).contains(&score), "score {score} out of range");
    }
}

#[tokio::test]
async fn health_reports_cache_counters() {
    let backend = Arc::new(MockBackend::default());
    let (engine, _state) = engine(backend);
    let cancel = CancellationToken::new();

    let _ = engine
        .ensure(&cancel, DiscoveryKind::ServiceIdentifier, &scope())
        .await
        .unwrap();
    let health = engine.health();
    assert!(health.healthy);
    assert_eq!(health.chains_in_flight, 0);
    assert!(health.cache.hits + health.cache.misses > 0);
}

#[tokio::test]
async fn expired_discovery_reruns_chain() {
    let backend = Arc::new(MockBackend::default());
    let state = Arc::new(StateManager::in_memory(StateConfig::default()));
    let engine = DiscoveryEngine::new(
        backend.clone(),
        state.cache().clone(),
        DiscoveryConfig::default(),
    )
    .unwrap();
    let cancel = CancellationToken::new();

    let first = engine
        .ensure(&cancel, DiscoveryKind::ServiceIdentifier, &scope())
        .await
        .unwrap();
    // Records carry their ttl; a stale computed_at must not be served.
    assert!(first.ttl() >= Duration::from_secs(3600));
}
