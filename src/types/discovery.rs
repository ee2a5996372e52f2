//! Discovery results — the central record of the engine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// What a discovery chain establishes about a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryKind {
    /// Which attribute identifies a service (e.g. `appName`).
    ServiceIdentifier,
    /// Which condition marks a record as an error.
    ErrorIndicator,
    /// Which numeric attributes / metric tables carry dimensional data.
    Dimensional,
    /// What instrumentation feeds the tenant.
    Source,
    /// The shapes of dashboard widgets in the tenant.
    WidgetShape,
    /// Which event types exist, with record-count estimates.
    EventTypeCatalog,
    /// The attribute profile of one event type.
    AttributeProfile,
}

impl DiscoveryKind {
    /// Stable kebab-case name, used in cache keys and wire payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceIdentifier => "service-identifier",
            Self::ErrorIndicator => "error-indicator",
            Self::Dimensional => "dimensional",
            Self::Source => "source",
            Self::WidgetShape => "widget-shape",
            Self::EventTypeCatalog => "event-type-catalog",
            Self::AttributeProfile => "attribute-profile",
        }
    }

    /// Default time-to-live for cached results of this kind.
    ///
    /// Error indicators churn with deploys, so they expire fast;
    /// instrumentation sources are near-static.
    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::ServiceIdentifier => Duration::from_secs(4 * 3600),
            Self::ErrorIndicator => Duration::from_secs(30 * 60),
            Self::Dimensional => Duration::from_secs(2 * 3600),
            Self::Source => Duration::from_secs(24 * 3600),
            Self::WidgetShape => Duration::from_secs(6 * 3600),
            Self::EventTypeCatalog => Duration::from_secs(3600),
            Self::AttributeProfile => Duration::from_secs(3600),
        }
    }
}

impl std::fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a discovery is about: the tenant, and optionally one event type
/// and a time window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryScope {
    /// Tenant (account) identifier.
    pub account: i64,
    /// Event type the discovery is scoped to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Lookback window in minutes, if the chain sampled a bounded range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_minutes: Option<u32>,
}

impl DiscoveryScope {
    pub fn account(account: i64) -> Self {
        Self {
            account,
            event_type: None,
            since_minutes: None,
        }
    }

    pub fn event_type(account: i64, event_type: impl Into<String>) -> Self {
        Self {
            account,
            event_type: Some(event_type.into()),
            since_minutes: None,
        }
    }
}

/// A published discovery.
///
/// Immutable after publication: refresh produces a new record and the cache
/// slot is swapped atomically. `confidence` and `coverage` are clamped to
/// [0, 1] at construction; `assumptions` is always present, possibly empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Stable identifier: digest of (kind, scope). Two results for the same
    /// slot share an id, which is how callers detect a shared execution.
    pub id: String,
    pub kind: DiscoveryKind,
    pub scope: DiscoveryScope,
    /// Kind-specific payload, e.g. `{"field": "appName", "event_type": "Transaction"}`
    /// for a service identifier.
    pub value: Value,
    /// Subjective probability the discovered fact is correct.
    pub confidence: f64,
    /// Fraction of inspected data supporting the conclusion.
    pub coverage: f64,
    /// Ordered caveats accumulated by the probes that ran.
    pub assumptions: Vec<String>,
    /// Wall-clock timestamp of the underlying data sample.
    pub freshness: DateTime<Utc>,
    /// When the chain finished.
    pub computed_at: DateTime<Utc>,
    /// Cache eviction policy for this record, in seconds.
    pub ttl_secs: u64,
}

impl DiscoveryResult {
    /// Build a result, clamping `confidence` and `coverage` into [0, 1].
    pub fn new(
        kind: DiscoveryKind,
        scope: DiscoveryScope,
        value: Value,
        confidence: f64,
        coverage: f64,
        assumptions: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: slot_id(kind, &scope),
            kind,
            scope,
            value,
            confidence: confidence.clamp(0.0, 1.0),
            coverage: coverage.clamp(0.0, 1.0),
            assumptions,
            freshness: now,
            computed_at: now,
            ttl_secs: kind.default_ttl().as_secs(),
        }
    }

    /// The zero-confidence result a chain returns when every probe came up
    /// empty. Never an error: low confidence is a value.
    pub fn exhausted(kind: DiscoveryKind, scope: DiscoveryScope, assumptions: Vec<String>) -> Self {
        debug_assert!(!assumptions.is_empty());
        Self::new(kind, scope, Value::Null, 0.0, 0.0, assumptions)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs();
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Whether the record is still within its ttl at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.computed_at);
        age.num_seconds() >= 0 && (age.num_seconds() as u64) < self.ttl_secs
    }

    /// Compact summary attached to tool responses (`discoveries_used`).
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "kind": self.kind.as_str(),
            "confidence": self.confidence,
            "coverage": self.coverage,
        })
    }
}

/// Stable digest identifying a (kind, scope) cache slot.
pub(crate) fn slot_id(kind: DiscoveryKind, scope: &DiscoveryScope) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(scope.account.to_le_bytes());
    if let Some(ref et) = scope.event_type {
        hasher.update(et.as_bytes());
    }
    if let Some(m) = scope.since_minutes {
        hasher.update(m.to_le_bytes());
    }
    let digest = hasher.finalize();
    // 16 hex chars is plenty for a per-tenant slot id.
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Caller hints steering [`discover`](crate::discovery::DiscoveryEngine::discover).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryHints {
    /// Free-text keywords matched against event-type and attribute names.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Event types to rank first.
    #[serde(default)]
    pub preferred_event_types: Vec<String>,
    /// What the caller is trying to do ("find slow checkouts").
    #[serde(default)]
    pub purpose: Option<String>,
    /// Upper bound on returned schemas.
    #[serde(default)]
    pub max_schemas: Option<usize>,
}
