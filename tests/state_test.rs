use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use huginn::HuginnError;
use huginn::state::{CacheKey, CacheStore, MemoryStore, SessionStore, StateConfig, StateManager};

#[tokio::test]
async fn counters_hold_under_concurrency() {
    let store = Arc::new(MemoryStore::new(16, 1 << 20));
    for n in 0..8u32 {
        store
            .set(
                &CacheKey::tool("t", &json!({ "n": n })),
                json!(n),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..8u32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..100u32 {
                // Half the keys exist, half never will.
                let n = (worker + i) % 16;
                let _ = CacheStore::get(&*store, &CacheKey::tool("t", &json!({ "n": n })))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = store.stats();
    assert_eq!(stats.hits + stats.misses, 800);
    assert!(stats.memory_used <= 1 << 20);
}

#[tokio::test]
async fn memory_bound_holds_under_pressure() {
    let store = Arc::new(MemoryStore::new(4, 4096));
    for n in 0..200u32 {
        store
            .set(
                &CacheKey::tool("t", &json!({ "n": n })),
                json!("v".repeat(64)),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(store.stats().memory_used <= 4096, "bound exceeded at {n}");
    }
    assert!(store.stats().evictions > 0);
}

#[tokio::test]
async fn expired_session_returns_not_found_then_new_one_is_created() {
    let manager = StateManager::with_stores(
        Arc::new(MemoryStore::new(4, 1 << 20)),
        Arc::new(MemoryStore::new(4, 1 << 20)),
        StateConfig {
            session_ttl: Duration::from_millis(10),
            ..Default::default()
        },
    );

    let session = manager.create_session(Some("debug".into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = manager.touch_session(&session.id).await.unwrap_err();
    assert!(matches!(err, HuginnError::NotFound(_)));

    // Same id requested again: a fresh session is created on demand.
    let (fresh, created) = manager
        .session_or_create(Some(&session.id), None)
        .await
        .unwrap();
    assert!(created);
    assert_ne!(fresh.id, session.id);
}

#[tokio::test]
async fn live_session_is_touched_not_replaced() {
    let manager = StateManager::with_stores(
        Arc::new(MemoryStore::new(4, 1 << 20)),
        Arc::new(MemoryStore::new(4, 1 << 20)),
        StateConfig::default(),
    );
    let session = manager.create_session(None).await.unwrap();
    let (same, created) = manager
        .session_or_create(Some(&session.id), None)
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(same.id, session.id);
}

#[tokio::test]
async fn sweeper_removes_idle_sessions() {
    let store = Arc::new(MemoryStore::new(4, 1 << 20));
    let manager = StateManager::with_stores(
        store.clone(),
        store.clone(),
        StateConfig {
            session_ttl: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(20),
            ..Default::default()
        },
    );
    let session = manager.create_session(None).await.unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let sweeper = manager.spawn_sweeper(cancel.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let _ = sweeper.await;

    assert!(
        SessionStore::get(store.as_ref(), &session.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn cache_writes_are_last_writer_wins_per_key() {
    let store = Arc::new(MemoryStore::new(16, 1 << 20));
    let key = CacheKey::tool("t", &json!({"k": 1}));

    let mut handles = Vec::new();
    for n in 0..16u32 {
        let store = store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store.set(&key, json!(n), Duration::from_secs(60)).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Whatever won, the slot holds exactly one coherent value.
    let value = CacheStore::get(&*store, &key).await.unwrap().unwrap();
    assert!(value.as_u64().unwrap() < 16);
    assert_eq!(store.stats().entries, 1);
}
