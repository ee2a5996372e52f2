//! Backend adapter: typed access to the observability backend.
//!
//! Everything the rest of the crate knows about the backend goes through
//! the [`Backend`] trait — a GraphQL call, a query-language call, and an
//! account-metadata lookup, all cancellable. [`HttpBackend`] is the real
//! implementation; [`RetryingBackend`] decorates any implementation with
//! retry-on-transient semantics.

pub mod breaker;
pub mod http;
pub mod ratelimit;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use http::{BackendConfig, HttpBackend, Region};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use retry::{RetryConfig, RetryingBackend};

/// Default per-call timeout when the caller does not pass one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard ceiling on any backend call, whatever the caller asked for.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// Operation class, used as a rate-limit key component and metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Graphql,
    QueryLang,
    Account,
}

impl OpClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Graphql => "graphql",
            Self::QueryLang => "querylang",
            Self::Account => "account",
        }
    }
}

/// Rows returned by a query-language call.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// Result rows, each a JSON object.
    pub rows: Vec<Value>,
    /// Backend-reported metadata (facets, time window), when present.
    pub metadata: Value,
    /// Wall-clock time the backend spent.
    pub elapsed: Duration,
}

impl ResultSet {
    /// Convenience for single-aggregate probes: the named field of the
    /// first row, if any.
    pub fn scalar(&self, field: &str) -> Option<&Value> {
        self.rows.first().and_then(|row| row.get(field))
    }

    /// The named field of the first row as f64, tolerating integer rows.
    pub fn scalar_f64(&self, field: &str) -> Option<f64> {
        self.scalar(field).and_then(Value::as_f64)
    }
}

/// Account metadata.
#[derive(Debug, Clone)]
pub struct AccountMeta {
    pub id: i64,
    pub name: String,
    pub region: String,
}

/// The narrow interface the rest of huginn has to the backend.
///
/// Every call carries a request-scoped [`CancellationToken`]; an
/// implementation must observe cancellation at its suspension points.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Implementation name, used in logs and metrics.
    fn name(&self) -> &str;

    /// Execute a raw GraphQL query.
    async fn graphql(&self, cancel: &CancellationToken, query: &str, vars: Value) -> Result<Value>;

    /// Execute a query-language statement against one account.
    async fn querylang(
        &self,
        cancel: &CancellationToken,
        statement: &str,
        account: i64,
        timeout: Duration,
    ) -> Result<ResultSet>;

    /// Fetch account metadata.
    async fn account_info(&self, cancel: &CancellationToken, account: i64) -> Result<AccountMeta>;
}
