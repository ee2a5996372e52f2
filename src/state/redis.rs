//! Networked store on redis.
//!
//! Keys use the wire format `<prefix>:<namespace>:<hash>`; values are
//! serde_json documents, stable across process restarts. Expiry is
//! delegated to redis TTLs, so the sweeper is a no-op here. Each command
//! gets a small bounded retry, since a blip on the cache path should not
//! fail a tool call that could fall through to the backend instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value;
use tracing::warn;

use super::{CacheKey, CacheStats, CacheStore, SessionStore};
use crate::types::Session;
use crate::{HuginnError, Result};

const COMMAND_RETRIES: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Redis-backed [`CacheStore`] + [`SessionStore`].
pub struct RedisStore {
    manager: ConnectionManager,
    prefix: String,
    session_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisStore {
    /// Connect and verify the server answers.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| HuginnError::Configuration(format!("redis url: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| HuginnError::BackendUnavailable(format!("redis connect: {e}")))?;
        Ok(Self {
            manager,
            prefix: prefix.to_string(),
            session_ttl: Duration::from_secs(30 * 60),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    fn session_key(&self, id: &str) -> String {
        CacheKey::session(id).wire_key(&self.prefix)
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        self.retrying(|| {
            let mut conn = self.manager.clone();
            let key = key.to_string();
            async move { conn.get::<_, Option<String>>(key).await }
        })
        .await
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.retrying(|| {
            let mut conn = self.manager.clone();
            let key = key.to_string();
            let value = value.clone();
            async move {
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                    .await
            }
        })
        .await
    }

    async fn del_raw(&self, key: &str) -> Result<()> {
        self.retrying(|| {
            let mut conn = self.manager.clone();
            let key = key.to_string();
            async move { conn.del::<_, ()>(key).await }
        })
        .await
    }

    async fn retrying<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let mut last = None;
        for attempt in 0..=COMMAND_RETRIES {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(attempt, error = %e, "redis command failed");
                    last = Some(e);
                    if attempt < COMMAND_RETRIES {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(HuginnError::BackendUnavailable(format!(
            "redis: {}",
            last.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        let raw = self.get_raw(&key.wire_key(&self.prefix)).await?;
        match raw {
            Some(s) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(serde_json::from_str(&s)?))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &CacheKey, value: Value, ttl: Duration) -> Result<()> {
        self.set_raw(&key.wire_key(&self.prefix), value.to_string(), ttl)
            .await
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.del_raw(&key.wire_key(&self.prefix)).await
    }

    fn stats(&self) -> CacheStats {
        // Memory accounting lives server-side; only the counters huginn
        // observed locally are reported.
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn create(&self, session: Session) -> Result<()> {
        let payload = serde_json::to_string(&session)
            .map_err(|e| HuginnError::Internal(format!("serialize session: {e}")))?;
        self.set_raw(&self.session_key(&session.id), payload, self.session_ttl)
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        match self.get_raw(&self.session_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, session: Session) -> Result<()> {
        // Same write path: update refreshes the redis TTL, which is the
        // inactivity clock for networked sessions.
        self.create(session).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.del_raw(&self.session_key(id)).await
    }

    async fn sweep(&self, _ttl: Duration) -> Result<usize> {
        // Redis expires sessions by TTL on its own.
        Ok(0)
    }
}
