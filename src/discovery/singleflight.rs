//! Single-flight coalescing for discovery chains.
//!
//! Concurrent callers asking for the same (kind, scope) share one chain
//! execution: the first caller becomes the leader and runs the future, the
//! rest subscribe to a broadcast of the outcome. If the leader is cancelled
//! mid-flight, its guard drops the in-flight entry, surviving waiters see
//! the channel close, and one of them takes over as the new leader — a
//! cancelled execution never publishes anything.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::broadcast;

/// Coalesces concurrent executions by key.
pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, broadcast::Sender<V>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().expect("singleflight poisoned").len()
    }

    /// Run `make()` for `key`, or wait for the execution already running.
    ///
    /// `make` may be invoked more than once across callers (when a leader
    /// is cancelled and a waiter takes over), but at most one invocation is
    /// ever in flight per key.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> V
    where
        F: Fn() -> Fut,
        Fut: Future<Output = V>,
    {
        loop {
            let role = {
                let mut inflight = self.inflight.lock().expect("singleflight poisoned");
                match inflight.get(&key) {
                    Some(tx) => Role::Waiter(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        inflight.insert(key.clone(), tx.clone());
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let guard = Guard {
                        flight: self,
                        key: key.clone(),
                    };
                    let value = make().await;
                    // Waiters may all have gone away; a send error is fine.
                    let _ = tx.send(value.clone());
                    drop(guard);
                    return value;
                }
                Role::Waiter(mut rx) => match rx.recv().await {
                    Ok(value) => return value,
                    // Leader cancelled before broadcasting: take over.
                    Err(_) => continue,
                },
            }
        }
    }
}

enum Role<V> {
    Leader(broadcast::Sender<V>),
    Waiter(broadcast::Receiver<V>),
}

/// Removes the in-flight entry when the leader finishes or is dropped
/// mid-execution (cancellation).
struct Guard<'a, K: Eq + Hash + Clone, V> {
    flight: &'a SingleFlight<K, V>,
    key: K,
}

impl<K: Eq + Hash + Clone, V> Drop for Guard<'_, K, V> {
    fn drop(&mut self) {
        self.flight
            .inflight
            .lock()
            .expect("singleflight poisoned")
            .remove(&self.key);
    }
}
