//! Adaptive query builder.
//!
//! Composes query-language statements from a closed set of intents and the
//! facts discovery established. The builder never guesses a field name: a
//! placeholder it cannot resolve from a [`DiscoveryResult`] either comes
//! back as `NeedsDiscovery` (missing or weak prerequisite) or fails closed
//! (programmer error). Every produced statement passes the
//! [`Validator`](crate::validator::Validator) before it leaves this module.

use serde_json::Value;

use crate::types::{DiscoveryKind, DiscoveryResult};
use crate::validator::{CanonicalQuery, Validator};
use crate::{HuginnError, Result};

/// The closed set of query intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    ErrorRate,
    LatencyP50,
    LatencyP95,
    LatencyP99,
    Throughput,
    Apdex,
    TopN,
    Baseline,
    AnomalyCandidates,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorRate => "error_rate",
            Self::LatencyP50 => "latency_p50",
            Self::LatencyP95 => "latency_p95",
            Self::LatencyP99 => "latency_p99",
            Self::Throughput => "throughput",
            Self::Apdex => "apdex",
            Self::TopN => "top_n",
            Self::Baseline => "baseline",
            Self::AnomalyCandidates => "anomaly_candidates",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "error_rate" => Self::ErrorRate,
            "latency_p50" => Self::LatencyP50,
            "latency_p95" => Self::LatencyP95,
            "latency_p99" => Self::LatencyP99,
            "throughput" => Self::Throughput,
            "apdex" => Self::Apdex,
            "top_n" => Self::TopN,
            "baseline" => Self::Baseline,
            "anomaly_candidates" => Self::AnomalyCandidates,
            _ => return None,
        })
    }

    /// Every intent name, for parameter enums and docs.
    pub const ALL: &'static [&'static str] = &[
        "error_rate",
        "latency_p50",
        "latency_p95",
        "latency_p99",
        "throughput",
        "apdex",
        "top_n",
        "baseline",
        "anomaly_candidates",
    ];

    /// Which discoveries the intent consumes.
    pub fn prerequisites(&self) -> &'static [DiscoveryKind] {
        match self {
            Self::ErrorRate | Self::AnomalyCandidates => {
                &[DiscoveryKind::ServiceIdentifier, DiscoveryKind::ErrorIndicator]
            }
            Self::LatencyP50 | Self::LatencyP95 | Self::LatencyP99 | Self::Apdex => {
                &[DiscoveryKind::ServiceIdentifier, DiscoveryKind::Dimensional]
            }
            Self::Throughput | Self::TopN | Self::Baseline => {
                &[DiscoveryKind::ServiceIdentifier]
            }
        }
    }

    fn template(&self) -> &'static str {
        match self {
            Self::ErrorRate => {
                "SELECT percentage(count(*), WHERE ${error_condition}) FROM ${event_type} \
                 WHERE ${service_field} = '${service_value}' SINCE ${window} minutes ago"
            }
            Self::LatencyP50 => {
                "SELECT percentile(${duration_field}, 50) FROM ${event_type} \
                 WHERE ${service_field} = '${service_value}' SINCE ${window} minutes ago"
            }
            Self::LatencyP95 => {
                "SELECT percentile(${duration_field}, 95) FROM ${event_type} \
                 WHERE ${service_field} = '${service_value}' SINCE ${window} minutes ago"
            }
            Self::LatencyP99 => {
                "SELECT percentile(${duration_field}, 99) FROM ${event_type} \
                 WHERE ${service_field} = '${service_value}' SINCE ${window} minutes ago"
            }
            Self::Throughput => {
                "SELECT rate(count(*), 1 minute) FROM ${event_type} \
                 WHERE ${service_field} = '${service_value}' SINCE ${window} minutes ago"
            }
            Self::Apdex => {
                "SELECT apdex(${duration_field}, t: 0.5) FROM ${event_type} \
                 WHERE ${service_field} = '${service_value}' SINCE ${window} minutes ago"
            }
            Self::TopN => {
                "SELECT count(*) FROM ${event_type} WHERE ${facet_field} IS NOT NULL \
                 FACET ${facet_field} SINCE ${window} minutes ago LIMIT ${top_n}"
            }
            Self::Baseline => {
                "SELECT count(*) FROM ${event_type} \
                 WHERE ${service_field} = '${service_value}' SINCE ${window} minutes ago \
                 COMPARE WITH ${window} minutes ago"
            }
            Self::AnomalyCandidates => {
                "SELECT count(*) FROM ${event_type} WHERE ${error_condition} \
                 FACET ${service_field} SINCE ${window} minutes ago LIMIT ${top_n}"
            }
        }
    }

    fn needs_selector(&self) -> bool {
        !matches!(self, Self::TopN | Self::AnomalyCandidates)
    }
}

/// What the query is about.
#[derive(Debug, Clone, Default)]
pub struct QueryScope {
    /// Event type override; otherwise the discovered one is used.
    pub event_type: Option<String>,
    /// Selector value for the discovered service field (e.g. a service
    /// name). Required by most intents.
    pub selector: Option<String>,
    /// Dimension for `top_n`; must be a discovered attribute. Defaults to
    /// the service field.
    pub facet: Option<String>,
    /// Lookback window in minutes. Default: 60.
    pub window_minutes: u32,
    /// Row cap for faceted intents. Default: 10.
    pub top_n: usize,
}

impl QueryScope {
    pub fn service(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            ..Self::default()
        }
    }

    fn window(&self) -> u32 {
        if self.window_minutes == 0 { 60 } else { self.window_minutes }
    }

    fn limit(&self) -> usize {
        if self.top_n == 0 { 10 } else { self.top_n }
    }
}

/// Read-only view over the discoveries a build may use.
pub struct Discoveries<'a>(pub &'a [DiscoveryResult]);

impl Discoveries<'_> {
    fn get(&self, kind: DiscoveryKind) -> Option<&DiscoveryResult> {
        self.0.iter().find(|d| d.kind == kind)
    }
}

/// Build outcome: a validated statement, or the prerequisites to satisfy
/// first.
#[derive(Debug)]
pub enum BuildOutcome {
    Built {
        query: CanonicalQuery,
        /// Discoveries the statement was composed from.
        used: Vec<String>,
    },
    NeedsDiscovery {
        missing: Vec<String>,
    },
}

/// The adaptive query builder. Stateless; shares the process-wide
/// validator limits.
#[derive(Default)]
pub struct QueryBuilder {
    validator: Validator,
}

impl QueryBuilder {
    pub fn new(validator: Validator) -> Self {
        Self { validator }
    }

    /// Compose a statement for `intent` over `scope`.
    ///
    /// Discoveries below `min_confidence` count as missing, so the caller
    /// can discover first and retry.
    pub fn build(
        &self,
        intent: QueryIntent,
        scope: &QueryScope,
        discoveries: &Discoveries<'_>,
        min_confidence: f64,
    ) -> Result<BuildOutcome> {
        let mut missing = Vec::new();
        for kind in intent.prerequisites() {
            match discoveries.get(*kind) {
                Some(d) if d.confidence >= min_confidence => {}
                _ => missing.push(kind.as_str().to_string()),
            }
        }
        if !missing.is_empty() {
            return Ok(BuildOutcome::NeedsDiscovery { missing });
        }

        let service = discoveries
            .get(DiscoveryKind::ServiceIdentifier)
            .expect("prerequisite checked above");
        let service_field = value_str(&service.value, "field").ok_or_else(|| {
            HuginnError::Internal("service-identifier discovery has no field".into())
        })?;

        if intent.needs_selector() && scope.selector.is_none() {
            return Err(HuginnError::invalid_param(
                "arguments.selector",
                format!("intent {} requires a selector value", intent.as_str()),
            ));
        }

        let event_type = scope
            .event_type
            .clone()
            .or_else(|| value_str(&service.value, "event_type").map(str::to_string))
            .unwrap_or_else(|| "Transaction".to_string());

        let mut statement = intent.template().to_string();
        let mut used: Vec<String> = vec![service.id.clone()];

        substitute(&mut statement, "service_field", &quote_field(service_field));
        substitute(&mut statement, "event_type", &event_type);
        substitute(&mut statement, "window", &scope.window().to_string());
        substitute(&mut statement, "top_n", &scope.limit().to_string());
        if let Some(ref selector) = scope.selector {
            substitute(&mut statement, "service_value", &escape_literal(selector));
        }

        if let Some(errors) = discoveries.get(DiscoveryKind::ErrorIndicator) {
            if let Some(condition) = value_str(&errors.value, "condition") {
                substitute(&mut statement, "error_condition", condition);
                if intent
                    .prerequisites()
                    .contains(&DiscoveryKind::ErrorIndicator)
                {
                    used.push(errors.id.clone());
                }
            }
        }

        if let Some(dimensional) = discoveries.get(DiscoveryKind::Dimensional) {
            if let Some(duration) = pick_duration_field(&dimensional.value) {
                substitute(&mut statement, "duration_field", &quote_field(&duration));
                if intent.prerequisites().contains(&DiscoveryKind::Dimensional) {
                    used.push(dimensional.id.clone());
                }
            }
        }

        if intent == QueryIntent::TopN {
            let facet = match scope.facet {
                Some(ref facet) => {
                    // A custom facet must be a discovered attribute.
                    let known = discoveries
                        .get(DiscoveryKind::AttributeProfile)
                        .map(|profile| attribute_known(&profile.value, facet))
                        .unwrap_or(false);
                    if !known {
                        return Ok(BuildOutcome::NeedsDiscovery {
                            missing: vec![DiscoveryKind::AttributeProfile.as_str().to_string()],
                        });
                    }
                    facet.clone()
                }
                None => service_field.to_string(),
            };
            substitute(&mut statement, "facet_field", &quote_field(&facet));
        }

        // Fail closed: an unresolved placeholder is a programmer error,
        // never a query we send anyway.
        if let Some(start) = statement.find("${") {
            let tail: String = statement[start..].chars().take(32).collect();
            return Err(HuginnError::Internal(format!(
                "unresolved placeholder in built query: {tail}"
            )));
        }

        let query = self.validator.validate(&statement)?;
        Ok(BuildOutcome::Built { query, used })
    }
}

fn substitute(statement: &mut String, name: &str, value: &str) {
    let needle = format!("${{{name}}}");
    if statement.contains(&needle) {
        *statement = statement.replace(&needle, value);
    }
}

fn value_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Single quotes double in the query dialect's string literals.
fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// Dotted field names need backticks.
fn quote_field(field: &str) -> String {
    if field.contains('.') {
        format!("`{field}`")
    } else {
        field.to_string()
    }
}

/// Pick a latency-like attribute from a dimensional discovery.
fn pick_duration_field(value: &Value) -> Option<String> {
    let attrs = value.get("numeric_attributes").and_then(Value::as_array)?;
    let names: Vec<&str> = attrs.iter().filter_map(Value::as_str).collect();
    names
        .iter()
        .find(|n| n.to_lowercase().contains("duration"))
        .or_else(|| names.iter().find(|n| n.to_lowercase().contains("latency")))
        .or_else(|| names.first())
        .map(|n| n.to_string())
}

fn attribute_known(profile_value: &Value, name: &str) -> bool {
    profile_value
        .get("attributes")
        .and_then(Value::as_array)
        .map(|attrs| {
            attrs
                .iter()
                .any(|a| a.get("name").and_then(Value::as_str) == Some(name))
        })
        .unwrap_or(false)
}
