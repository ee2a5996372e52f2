//! Per-endpoint circuit breaker.
//!
//! Closed → Open after a run of consecutive infrastructure failures;
//! Open → HalfOpen after a cool-down; a successful half-open probe closes
//! the circuit, a failed one reopens it. Only `backend-unavailable` and
//! timeout outcomes count as failures — caller errors (bad query, auth)
//! say nothing about endpoint health.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::telemetry;
use crate::{HuginnError, Result};

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker. Default: 5.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing. Default: 30s.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// A circuit breaker for one endpoint / operation class.
///
/// Interior-mutable and cheap to share; the lock is held only for state
/// transitions, never across I/O.
#[derive(Debug)]
pub struct CircuitBreaker {
    operation: &'static str,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(operation: &'static str, config: BreakerConfig) -> Self {
        Self {
            operation,
            config,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Check whether a call may proceed.
    ///
    /// Open circuits fail fast with `backend-unavailable`; an elapsed
    /// cool-down transitions to HalfOpen and lets one probe through.
    pub fn check(&self) -> Result<()> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match &*state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { since } => {
                if since.elapsed() >= self.config.cooldown {
                    info!(operation = self.operation, "circuit half-open, probing");
                    *state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(HuginnError::BackendUnavailable(format!(
                        "circuit open for {}",
                        self.operation
                    )))
                }
            }
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match &*state {
            State::HalfOpen => {
                info!(operation = self.operation, "circuit closed after probe");
                *state = State::Closed {
                    consecutive_failures: 0,
                };
            }
            State::Closed { .. } => {
                *state = State::Closed {
                    consecutive_failures: 0,
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Record an infrastructure failure.
    pub fn on_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        operation = self.operation,
                        failures = *consecutive_failures,
                        "circuit tripped"
                    );
                    metrics::counter!(telemetry::BREAKER_TRIPS_TOTAL,
                        "operation" => self.operation,
                    )
                    .increment(1);
                    *state = State::Open {
                        since: Instant::now(),
                    };
                }
            }
            State::HalfOpen => {
                warn!(operation = self.operation, "probe failed, circuit reopened");
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Whether the outcome of a call counts against endpoint health.
    pub fn counts_as_failure(err: &HuginnError) -> bool {
        matches!(
            err,
            HuginnError::BackendUnavailable(_) | HuginnError::Timeout(_)
        )
    }

    /// Current state name, for health reporting.
    pub fn state_name(&self) -> &'static str {
        match *self.state.lock().expect("breaker lock poisoned") {
            State::Closed { .. } => "closed",
            State::Open { .. } => "open",
            State::HalfOpen => "half-open",
        }
    }
}
