//! Event-type schemas and attribute profiles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::quality::QualityReport;

/// How deep a profiling pass goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileDepth {
    /// Attribute names and types only (one keyset probe).
    Basic,
    /// Adds null ratios, cardinality, and sample values.
    #[default]
    Standard,
    /// Adds pattern detection and a quality report.
    Full,
}

impl ProfileDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Full => "full",
        }
    }

    /// Sample size used when inspecting attribute values.
    pub fn sample_size(&self) -> usize {
        match self {
            Self::Basic => 0,
            Self::Standard => 100,
            Self::Full => 500,
        }
    }
}

/// Storage type of an attribute as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Numeric,
    Boolean,
    Timestamp,
    Object,
    Array,
}

/// What an attribute *means*, inferred from its name and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    /// Identifies an entity (service, host, trace).
    Identifier,
    /// A duration, usually seconds or milliseconds.
    Duration,
    /// A status or response code.
    Code,
    /// A URL or URI.
    Url,
    /// Free-form message text.
    Message,
    #[default]
    General,
}

/// One attribute of an event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub data_type: AttributeType,
    #[serde(default)]
    pub semantic: SemanticType,
    /// Fraction of sampled records where the attribute was null/absent.
    pub null_ratio: f64,
    /// Distinct values / sampled records. 1.0 means every value unique.
    pub cardinality_ratio: f64,
    /// Up to a handful of observed values.
    #[serde(default)]
    pub sample_values: Vec<Value>,
    /// Detected value patterns (e.g. "uuid", "http-status").
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Attribute {
    /// A bare attribute as produced by a basic (names-only) profile.
    pub fn named(name: impl Into<String>, data_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            data_type,
            semantic: SemanticType::General,
            null_ratio: 0.0,
            cardinality_ratio: 0.0,
            sample_values: Vec::new(),
            patterns: Vec::new(),
        }
    }

    /// Whether this attribute plausibly identifies an entity: identifier
    /// semantics with enough distinct values to split a tenant, but not so
    /// many that it is a per-record id.
    pub fn looks_like_entity_id(&self) -> bool {
        self.semantic == SemanticType::Identifier
            && self.cardinality_ratio > 0.0
            && self.cardinality_ratio < 0.5
            && self.null_ratio < 0.5
    }
}

/// Ingest-volume estimate for one event type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeProfile {
    /// Estimated records per hour over the sampled window.
    pub records_per_hour: f64,
    /// Window the estimate was computed over, in minutes.
    pub window_minutes: u32,
}

/// Snapshot of one event type. Owned by the Discovery Engine; never mutated
/// in place — re-profiling produces a new snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Event type name (e.g. "Transaction").
    pub name: String,
    /// Record-count estimate over the profiling window.
    pub record_count: u64,
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub volume: VolumeProfile,
    /// Present when profiled at `Full` depth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
    /// Schema-level patterns (e.g. "http", "database").
    #[serde(default)]
    pub patterns: Vec<String>,
    pub depth: ProfileDepth,
    pub profiled_at: DateTime<Utc>,
}

impl Schema {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Filter for [`list_schemas`](crate::discovery::DiscoveryEngine::list_schemas).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaFilter {
    /// Case-insensitive substring or `*`-glob on the event-type name.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Drop event types with fewer records than this.
    #[serde(default)]
    pub min_record_count: u64,
    /// Upper bound on returned entries.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_max_results() -> usize {
    50
}

impl Default for SchemaFilter {
    fn default() -> Self {
        Self {
            pattern: None,
            min_record_count: 0,
            max_results: default_max_results(),
        }
    }
}

impl SchemaFilter {
    /// Whether an event-type name passes the pattern (if any).
    pub fn matches(&self, name: &str) -> bool {
        match self.pattern.as_deref() {
            None | Some("") | Some("*") => true,
            Some(p) => {
                let lower = name.to_lowercase();
                let p = p.to_lowercase();
                if let Some(prefix) = p.strip_suffix('*') {
                    lower.starts_with(prefix)
                } else if let Some(suffix) = p.strip_prefix('*') {
                    lower.ends_with(suffix)
                } else {
                    lower.contains(&p)
                }
            }
        }
    }
}

/// `list_schemas` output: entries plus guidance when the tenant is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaList {
    pub schemas: Vec<Schema>,
    /// Non-empty when `schemas` is empty: what the caller should try next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}
