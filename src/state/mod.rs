//! Session and cache state management.
//!
//! The state manager exclusively owns all mutable shared state. Two
//! logical stores sit behind one pair of traits: [`CacheStore`] for
//! discovery/tool-result caching (LRU + TTL + byte budget) and
//! [`SessionStore`] for conversational sessions. Backends: the sharded
//! [`MemoryStore`] (default) and, behind the `redis-cache` feature, a
//! networked [`RedisStore`](redis::RedisStore) with a serialization format
//! stable across restarts.

pub mod memory;
#[cfg(feature = "redis-cache")]
pub mod redis;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{DiscoveryKind, DiscoveryScope, Session};
use crate::{HuginnError, Result};

pub use memory::MemoryStore;

/// Key namespace, part of the wire key format for networked backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Session,
    Cache,
    Discovery,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Cache => "cache",
            Self::Discovery => "discovery",
        }
    }
}

/// A canonical cache key: namespace plus a stable digest of the key struct.
///
/// The digest is sha-256 over a canonicalised rendering (object keys
/// sorted), so the same logical key hashes identically across processes —
/// a requirement for the networked backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: Namespace,
    hash: String,
}

impl CacheKey {
    /// Key for a cacheable tool result: tool name + canonicalised params.
    pub fn tool(name: &str, params: &Value) -> Self {
        Self {
            namespace: Namespace::Cache,
            hash: digest(&format!("{name}\u{1f}{}", canonical_json(params))),
        }
    }

    /// Key for a discovery slot: kind + scope.
    pub fn discovery(kind: DiscoveryKind, scope: &DiscoveryScope) -> Self {
        let scope_json = serde_json::to_value(scope).unwrap_or(Value::Null);
        Self {
            namespace: Namespace::Discovery,
            hash: digest(&format!("{}\u{1f}{}", kind.as_str(), canonical_json(&scope_json))),
        }
    }

    /// Key for a session record.
    pub fn session(id: &str) -> Self {
        Self {
            namespace: Namespace::Session,
            hash: digest(id),
        }
    }

    /// Process-local key form.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.namespace.as_str(), self.hash)
    }

    /// Networked key form: `<prefix>:<namespace>:<hash>`.
    pub fn wire_key(&self, prefix: &str) -> String {
        format!("{}:{}:{}", prefix, self.namespace.as_str(), self.hash)
    }
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let out = hasher.finalize();
    out[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Render JSON with object keys sorted at every level, so logically equal
/// params hash equally regardless of caller field order.
pub(crate) fn canonical_json(value: &Value) -> String {
    fn canonicalise(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<_, _> =
                    map.iter().map(|(k, v)| (k.clone(), canonicalise(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalise).collect()),
            other => other.clone(),
        }
    }
    canonicalise(value).to_string()
}

/// Cache counters. At any quiescent moment `hits + misses` equals the
/// number of `get` calls since startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_used: usize,
    pub entries: usize,
}

/// Value cache: get/set/invalidate with LRU + TTL + byte-budget semantics.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>>;
    async fn set(&self, key: &CacheKey, value: Value, ttl: Duration) -> Result<()>;
    async fn invalidate(&self, key: &CacheKey) -> Result<()>;
    fn stats(&self) -> CacheStats;
}

/// Session records with inactivity expiry.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Session>>;
    async fn update(&self, session: Session) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    /// Remove sessions idle longer than `ttl`; returns how many went.
    async fn sweep(&self, ttl: Duration) -> Result<usize>;
}

/// State manager configuration.
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Shard count for the in-process store. Default: 16.
    pub shards: usize,
    /// Total byte budget for cached values. Default: 64 MiB.
    pub max_bytes: usize,
    /// Session inactivity TTL. Default: 30 minutes.
    pub session_ttl: Duration,
    /// Expiry sweeper cadence. Default: 60s.
    pub sweep_interval: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            max_bytes: 64 * 1024 * 1024,
            session_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// The process-wide owner of mutable shared state.
///
/// Constructed by the supervisor and passed explicitly; no ambient access.
pub struct StateManager {
    cache: Arc<dyn CacheStore>,
    sessions: Arc<dyn SessionStore>,
    session_ttl: Duration,
    sweep_interval: Duration,
}

impl StateManager {
    /// Build on the in-process sharded store.
    pub fn in_memory(config: StateConfig) -> Self {
        let store = Arc::new(MemoryStore::new(config.shards, config.max_bytes));
        Self {
            cache: store.clone(),
            sessions: store,
            session_ttl: config.session_ttl,
            sweep_interval: config.sweep_interval,
        }
    }

    /// Build on a networked redis backend.
    #[cfg(feature = "redis-cache")]
    pub async fn networked(url: &str, prefix: &str, config: StateConfig) -> Result<Self> {
        let store = Arc::new(
            redis::RedisStore::connect(url, prefix)
                .await?
                .session_ttl(config.session_ttl),
        );
        Ok(Self {
            cache: store.clone(),
            sessions: store,
            session_ttl: config.session_ttl,
            sweep_interval: config.sweep_interval,
        })
    }

    /// Build from explicit store implementations (tests, custom backends).
    pub fn with_stores(
        cache: Arc<dyn CacheStore>,
        sessions: Arc<dyn SessionStore>,
        config: StateConfig,
    ) -> Self {
        Self {
            cache,
            sessions,
            session_ttl: config.session_ttl,
            sweep_interval: config.sweep_interval,
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Fetch a live session, refreshing its inactivity clock.
    ///
    /// An expired or unknown id is `not-found`; callers create a fresh
    /// session on demand.
    pub async fn touch_session(&self, id: &str) -> Result<Session> {
        let mut session = self
            .sessions
            .get(id)
            .await?
            .ok_or_else(|| HuginnError::NotFound(format!("session {id}")))?;
        if session.is_expired(self.session_ttl, Utc::now()) {
            self.sessions.delete(id).await?;
            return Err(HuginnError::NotFound(format!("session {id}")));
        }
        session.touch();
        self.sessions.update(session.clone()).await?;
        Ok(session)
    }

    /// Create a new session with a random id.
    pub async fn create_session(&self, goal: Option<String>) -> Result<Session> {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let session = Session::new(id, goal);
        self.sessions.create(session.clone()).await?;
        Ok(session)
    }

    /// Resolve a session reference: a live id is touched, a dead or absent
    /// one yields a fresh session. Returns the session and whether it was
    /// newly created.
    pub async fn session_or_create(
        &self,
        id: Option<&str>,
        goal: Option<String>,
    ) -> Result<(Session, bool)> {
        if let Some(id) = id {
            match self.touch_session(id).await {
                Ok(session) => return Ok((session, false)),
                Err(HuginnError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok((self.create_session(goal).await?, true))
    }

    /// Spawn the session expiry sweeper. Runs until `cancel` fires.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let sessions = self.sessions.clone();
        let ttl = self.session_ttl;
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match sessions.sweep(ttl).await {
                            Ok(0) => {}
                            Ok(n) => debug!(swept = n, "expired sessions removed"),
                            Err(e) => debug!(error = %e, "session sweep failed"),
                        }
                    }
                }
            }
        })
    }
}
