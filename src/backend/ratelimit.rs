//! Token-bucket rate limiting keyed by (account, operation class).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::OpClass;
use crate::{HuginnError, Result};

/// Rate-limit tuning, applied per (account, operation-class) bucket.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity (burst size). Default: 20.
    pub capacity: f64,
    /// Sustained requests per second. Default: 5.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20.0,
            refill_per_sec: 5.0,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, config: &RateLimitConfig) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_sec).min(config.capacity);
        self.last_refill = Instant::now();
    }
}

/// Token buckets keyed by (account, operation class).
///
/// `try_acquire` never blocks: callers get either a token or a
/// `rate-limited` error carrying the wait needed for the next token, which
/// the retry layer can honour as a `retry_after` hint.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<(i64, OpClass), Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token from the (account, class) bucket.
    pub fn try_acquire(&self, account: i64, class: OpClass) -> Result<()> {
        let mut buckets = self.buckets.lock().expect("ratelimit lock poisoned");
        let bucket = buckets
            .entry((account, class))
            .or_insert_with(|| Bucket::full(self.config.capacity));
        bucket.refill(&self.config);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let wait = Duration::from_secs_f64(deficit / self.config.refill_per_sec.max(1e-9));
            Err(HuginnError::RateLimited {
                retry_after: Some(wait),
            })
        }
    }
}
