//! In-process sharded store.
//!
//! Sixteen-way sharded by default: each shard owns a plain `HashMap` under
//! its own `std::sync::Mutex`, never held across an await. Values carry a
//! size estimate; inserts evict least-recently-used entries from the target
//! shard until the shard is back under its slice of the byte budget, so the
//! total never exceeds the configured bound. Entries too large for one
//! shard's budget are not cached at all.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::trace;

use super::{CacheKey, CacheStats, CacheStore, SessionStore};
use crate::telemetry;
use crate::types::Session;
use crate::Result;

struct Entry {
    value: Value,
    size: usize,
    inserted_at: Instant,
    ttl: Duration,
    last_access: Instant,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, Entry>,
    used: usize,
}

impl Shard {
    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.used -= entry.size;
        Some(entry)
    }

    /// Evict LRU entries until `used + incoming <= budget`.
    fn make_room(&mut self, incoming: usize, budget: usize) -> u64 {
        let mut evicted = 0;
        while self.used + incoming > budget && !self.entries.is_empty() {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    self.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

/// Sharded in-memory [`CacheStore`] + [`SessionStore`].
pub struct MemoryStore {
    shards: Vec<Mutex<Shard>>,
    shard_budget: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    memory_used: AtomicUsize,
    // Sessions sit behind their own lock, acquired only after any shard
    // lock is released (fixed cache-shard → session order).
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new(shards: usize, max_bytes: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shard_budget: max_bytes / shards,
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            memory_used: AtomicUsize::new(0),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn shard_for(&self, storage_key: &str) -> &Mutex<Shard> {
        use std::hash::{DefaultHasher, Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        storage_key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn miss(&self) -> Option<Value> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
        None
    }
}

/// Size estimate for accounting: serialized length plus key overhead.
fn estimate_size(key: &str, value: &Value) -> usize {
    key.len() + value.to_string().len()
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        enum Lookup {
            Hit(Value),
            Expired,
            Absent,
        }

        let storage_key = key.storage_key();
        let mut shard = self.shard_for(&storage_key).lock().expect("shard poisoned");
        let now = Instant::now();
        let lookup = match shard.entries.get_mut(&storage_key) {
            Some(entry) if !entry.expired(now) => {
                entry.last_access = now;
                Lookup::Hit(entry.value.clone())
            }
            Some(_) => Lookup::Expired,
            None => Lookup::Absent,
        };
        match lookup {
            Lookup::Hit(value) => {
                drop(shard);
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
                Ok(Some(value))
            }
            Lookup::Expired => {
                let entry = shard.remove(&storage_key).expect("entry vanished");
                drop(shard);
                self.memory_used.fetch_sub(entry.size, Ordering::Relaxed);
                Ok(self.miss())
            }
            Lookup::Absent => {
                drop(shard);
                Ok(self.miss())
            }
        }
    }

    async fn set(&self, key: &CacheKey, value: Value, ttl: Duration) -> Result<()> {
        let storage_key = key.storage_key();
        let size = estimate_size(&storage_key, &value);
        if size > self.shard_budget {
            trace!(size, budget = self.shard_budget, "value too large to cache");
            return Ok(());
        }
        let mut shard = self.shard_for(&storage_key).lock().expect("shard poisoned");
        let used_before = shard.used;
        shard.remove(&storage_key);
        let evicted = shard.make_room(size, self.shard_budget);
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL).increment(evicted);
        }
        let now = Instant::now();
        shard.entries.insert(
            storage_key,
            Entry {
                value,
                size,
                inserted_at: now,
                ttl,
                last_access: now,
            },
        );
        shard.used += size;
        let used_after = shard.used;
        drop(shard);
        if used_after >= used_before {
            self.memory_used
                .fetch_add(used_after - used_before, Ordering::Relaxed);
        } else {
            self.memory_used
                .fetch_sub(used_before - used_after, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let storage_key = key.storage_key();
        let mut shard = self.shard_for(&storage_key).lock().expect("shard poisoned");
        if let Some(entry) = shard.remove(&storage_key) {
            drop(shard);
            self.memory_used.fetch_sub(entry.size, Ordering::Relaxed);
        }
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let entries = self
            .shards
            .iter()
            .map(|s| s.lock().expect("shard poisoned").entries.len())
            .sum();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            memory_used: self.memory_used.load(Ordering::Relaxed),
            entries,
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: Session) -> Result<()> {
        self.sessions
            .lock()
            .expect("sessions poisoned")
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.lock().expect("sessions poisoned").get(id).cloned())
    }

    async fn update(&self, session: Session) -> Result<()> {
        self.sessions
            .lock()
            .expect("sessions poisoned")
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.lock().expect("sessions poisoned").remove(id);
        Ok(())
    }

    async fn sweep(&self, ttl: Duration) -> Result<usize> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("sessions poisoned");
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(ttl, now));
        Ok(before - sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(n: u32) -> CacheKey {
        CacheKey::tool("t", &json!({ "n": n }))
    }

    #[tokio::test]
    async fn hits_plus_misses_equals_gets() {
        let store = MemoryStore::new(4, 1 << 20);
        store
            .set(&key(1), json!("v"), Duration::from_secs(60))
            .await
            .unwrap();
        for n in 0..10u32 {
            let _ = CacheStore::get(&store, &key(n % 2)).await.unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.hits + stats.misses, 10);
        assert_eq!(stats.hits, 5);
    }

    #[tokio::test]
    async fn ttl_expiry_counts_as_miss() {
        let store = MemoryStore::new(4, 1 << 20);
        store
            .set(&key(1), json!("v"), Duration::from_millis(0))
            .await
            .unwrap();
        assert!(CacheStore::get(&store, &key(1)).await.unwrap().is_none());
        assert_eq!(store.stats().misses, 1);
        assert_eq!(store.stats().entries, 0);
    }

    #[tokio::test]
    async fn byte_budget_evicts_lru() {
        // One shard so the budget applies to every key.
        let store = MemoryStore::new(1, 300);
        let big = json!("x".repeat(80));
        store.set(&key(1), big.clone(), Duration::from_secs(60)).await.unwrap();
        store.set(&key(2), big.clone(), Duration::from_secs(60)).await.unwrap();
        // Touch key 1 so key 2 is the LRU victim.
        let _ = CacheStore::get(&store, &key(1)).await.unwrap();
        store.set(&key(3), big.clone(), Duration::from_secs(60)).await.unwrap();

        assert!(store.stats().memory_used <= 300);
        assert!(CacheStore::get(&store, &key(1)).await.unwrap().is_some());
        assert!(CacheStore::get(&store, &key(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_value_is_not_cached() {
        let store = MemoryStore::new(1, 64);
        store
            .set(&key(1), json!("y".repeat(500)), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.stats().entries, 0);
        assert_eq!(store.stats().memory_used, 0);
    }

    #[tokio::test]
    async fn invalidate_removes_and_frees() {
        let store = MemoryStore::new(4, 1 << 20);
        store.set(&key(1), json!("v"), Duration::from_secs(60)).await.unwrap();
        assert!(store.stats().memory_used > 0);
        store.invalidate(&key(1)).await.unwrap();
        assert_eq!(store.stats().memory_used, 0);
        assert!(CacheStore::get(&store, &key(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_crud_and_sweep() {
        let store = MemoryStore::new(1, 1 << 20);
        let mut s = Session::new("s1", Some("debug checkout".into()));
        store.create(s.clone()).await.unwrap();
        assert!(SessionStore::get(&store, "s1").await.unwrap().is_some());

        s.last_access = Utc::now() - chrono::Duration::seconds(3600);
        store.update(s).await.unwrap();
        let swept = store.sweep(Duration::from_secs(60)).await.unwrap();
        assert_eq!(swept, 1);
        assert!(SessionStore::get(&store, "s1").await.unwrap().is_none());
    }
}
