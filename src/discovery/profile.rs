//! Event-type profiling: attribute discovery, enrichment, semantics.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::probes::Prober;
use crate::types::{
    Attribute, AttributeType, ProfileDepth, QualityWeights, Schema, SemanticType, VolumeProfile,
};
use crate::Result;

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("uuid regex")
});

/// Attribute names that identify services across common instrumentation.
pub(crate) const SERVICE_FIELD_CANDIDATES: &[&str] = &["appName", "service.name", "applicationName"];

/// Profile one event type at the requested depth.
pub(crate) async fn profile_event_type(
    prober: &Prober<'_>,
    cancel: &CancellationToken,
    event_type: &str,
    depth: ProfileDepth,
    identifier_re: &Regex,
    quality_weights: Option<&QualityWeights>,
) -> Result<Schema> {
    let mut attributes = prober.keyset(cancel, event_type).await?;
    let total = prober.count(cancel, event_type, None).await?;

    let volume = VolumeProfile {
        records_per_hour: if prober.window == 0 {
            0.0
        } else {
            total * 60.0 / prober.window as f64
        },
        window_minutes: prober.window,
    };

    let mut samples = Vec::new();
    if depth != ProfileDepth::Basic && total > 0.0 {
        samples = prober
            .sample(cancel, event_type, depth.sample_size())
            .await?;
        for attribute in &mut attributes {
            enrich(attribute, &samples, identifier_re);
        }
    }

    let quality = match (depth, quality_weights) {
        (ProfileDepth::Full, Some(weights)) => Some(
            super::quality::score(prober, cancel, event_type, &attributes, &samples, weights)
                .await?,
        ),
        _ => None,
    };

    Ok(Schema {
        name: event_type.to_string(),
        record_count: total as u64,
        patterns: schema_patterns(&attributes),
        attributes,
        volume,
        quality,
        depth,
        profiled_at: Utc::now(),
    })
}

/// Fill null ratio, cardinality, samples, semantics, and value patterns
/// from sampled records.
fn enrich(attribute: &mut Attribute, samples: &[Value], identifier_re: &Regex) {
    let values: Vec<&Value> = samples
        .iter()
        .filter_map(|row| row.get(&attribute.name))
        .filter(|v| !v.is_null())
        .collect();

    if !samples.is_empty() {
        attribute.null_ratio = 1.0 - values.len() as f64 / samples.len() as f64;
    }
    if !values.is_empty() {
        let distinct: BTreeSet<String> = values.iter().map(|v| v.to_string()).collect();
        attribute.cardinality_ratio = distinct.len() as f64 / values.len() as f64;
        attribute.sample_values = distinct
            .iter()
            .take(5)
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect();
        attribute.patterns = detect_patterns(&values);
    }
    attribute.semantic = infer_semantic(&attribute.name, attribute.data_type, identifier_re);
}

/// Name-driven semantic classification.
pub(crate) fn infer_semantic(
    name: &str,
    data_type: AttributeType,
    identifier_re: &Regex,
) -> SemanticType {
    let lower = name.to_lowercase();
    if SERVICE_FIELD_CANDIDATES.contains(&name)
        || lower.ends_with("id")
        || lower.ends_with("guid")
        || lower == "hostname"
        || lower == "host"
        || identifier_re.is_match(name)
    {
        return SemanticType::Identifier;
    }
    if data_type == AttributeType::Numeric
        && (lower.contains("duration") || lower.contains("latency") || lower.ends_with("time"))
    {
        return SemanticType::Duration;
    }
    if lower.contains("status") || lower.ends_with("code") {
        return SemanticType::Code;
    }
    if lower.contains("url") || lower.contains("uri") {
        return SemanticType::Url;
    }
    if lower.contains("message") {
        return SemanticType::Message;
    }
    SemanticType::General
}

/// Value-shape patterns over a sampled column.
fn detect_patterns(values: &[&Value]) -> Vec<String> {
    let mut patterns = Vec::new();
    let strings: Vec<&str> = values.iter().filter_map(|v| v.as_str()).collect();
    if !strings.is_empty() {
        if strings.iter().all(|s| UUID_RE.is_match(s)) {
            patterns.push("uuid".to_string());
        }
        if strings
            .iter()
            .all(|s| s.starts_with("http://") || s.starts_with("https://"))
        {
            patterns.push("url".to_string());
        }
    }
    let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
    if !numbers.is_empty() && numbers.len() == values.len() {
        if numbers.iter().all(|n| (100.0..=599.0).contains(n) && n.fract() == 0.0) {
            patterns.push("http-status".to_string());
        }
        if numbers.iter().all(|n| *n > 1e12 && *n < 1e13) {
            patterns.push("epoch-millis".to_string());
        }
    }
    patterns
}

/// Schema-level tags from attribute names.
fn schema_patterns(attributes: &[Attribute]) -> Vec<String> {
    let mut patterns = Vec::new();
    let has = |prefix: &str| attributes.iter().any(|a| a.name.starts_with(prefix));
    if has("http.") || attributes.iter().any(|a| a.name == "httpResponseCode") {
        patterns.push("http".to_string());
    }
    if has("db.") || has("database") {
        patterns.push("database".to_string());
    }
    if has("trace.") || attributes.iter().any(|a| a.name == "traceId") {
        patterns.push("distributed-tracing".to_string());
    }
    if has("error.") || attributes.iter().any(|a| a.name == "error") {
        patterns.push("errors".to_string());
    }
    patterns
}
