//! Five-dimension quality scoring.

use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::probes::Prober;
use crate::types::{
    Attribute, IssueSeverity, QualityIssue, QualityReport, QualityWeights, SemanticType,
};
use crate::Result;

/// Score one event type from its enriched attributes and sample rows.
///
/// Dimensions: completeness (non-null density), consistency (stable value
/// types per attribute), timeliness (freshness of the latest record),
/// uniqueness (absence of fully duplicated records), validity (values
/// conforming to their semantic type). Weights come from configuration.
pub(crate) async fn score(
    prober: &Prober<'_>,
    cancel: &CancellationToken,
    event_type: &str,
    attributes: &[Attribute],
    samples: &[Value],
    weights: &QualityWeights,
) -> Result<QualityReport> {
    let mut issues = Vec::new();

    // Completeness: average non-null density, flagging sparse attributes.
    let completeness = if attributes.is_empty() {
        0.0
    } else {
        let sparse: Vec<_> = attributes
            .iter()
            .filter(|a| a.null_ratio > 0.5)
            .map(|a| a.name.clone())
            .collect();
        if !sparse.is_empty() {
            issues.push(QualityIssue {
                severity: IssueSeverity::Warning,
                description: format!("{} attribute(s) are null on most records", sparse.len()),
                attributes: sparse,
            });
        }
        1.0 - attributes.iter().map(|a| a.null_ratio).sum::<f64>() / attributes.len() as f64
    };

    // Consistency: every attribute's sampled values share one JSON type.
    let consistency = if samples.is_empty() {
        1.0
    } else {
        let mut stable = 0usize;
        let mut checked = 0usize;
        let mut mixed = Vec::new();
        for attribute in attributes {
            let kinds: BTreeSet<&str> = samples
                .iter()
                .filter_map(|row| row.get(&attribute.name))
                .filter(|v| !v.is_null())
                .map(json_kind)
                .collect();
            if kinds.is_empty() {
                continue;
            }
            checked += 1;
            if kinds.len() == 1 {
                stable += 1;
            } else {
                mixed.push(attribute.name.clone());
            }
        }
        if !mixed.is_empty() {
            issues.push(QualityIssue {
                severity: IssueSeverity::Warning,
                description: "attributes with mixed value types".to_string(),
                attributes: mixed,
            });
        }
        if checked == 0 {
            1.0
        } else {
            stable as f64 / checked as f64
        }
    };

    // Timeliness: how stale is the newest record relative to the window.
    let timeliness = match prober.latest_timestamp(cancel, event_type).await? {
        Some(epoch_ms) => {
            let lag_minutes = (Utc::now().timestamp_millis() as f64 - epoch_ms) / 60_000.0;
            if lag_minutes > prober.window as f64 {
                issues.push(QualityIssue {
                    severity: IssueSeverity::Error,
                    description: format!(
                        "newest record is {lag_minutes:.0} minutes old, beyond the sampled window"
                    ),
                    attributes: vec!["timestamp".to_string()],
                });
            }
            (1.0 - lag_minutes / prober.window.max(1) as f64).clamp(0.0, 1.0)
        }
        None => {
            issues.push(QualityIssue {
                severity: IssueSeverity::Info,
                description: "no timestamp attribute; timeliness is an estimate".to_string(),
                attributes: Vec::new(),
            });
            0.5
        }
    };

    // Uniqueness: fully duplicated sample rows suggest double ingestion.
    let uniqueness = if samples.len() < 2 {
        1.0
    } else {
        let distinct: BTreeSet<String> = samples.iter().map(|row| row.to_string()).collect();
        let ratio = distinct.len() as f64 / samples.len() as f64;
        if ratio < 0.9 {
            issues.push(QualityIssue {
                severity: IssueSeverity::Warning,
                description: format!(
                    "{:.0}% of sampled records are exact duplicates",
                    (1.0 - ratio) * 100.0
                ),
                attributes: Vec::new(),
            });
        }
        ratio
    };

    // Validity: semantic conformance of sampled values.
    let validity = {
        let mut conforming = 0usize;
        let mut checked = 0usize;
        let mut offenders = Vec::new();
        for attribute in attributes {
            let expectation: Option<fn(&Value) -> bool> = match attribute.semantic {
                SemanticType::Duration => Some(|v| v.as_f64().is_none_or(|n| n >= 0.0)),
                SemanticType::Code => {
                    Some(|v| v.as_f64().is_none_or(|n| (0.0..=599.0).contains(&n)))
                }
                _ => None,
            };
            let Some(check) = expectation else { continue };
            let values: Vec<&Value> = samples
                .iter()
                .filter_map(|row| row.get(&attribute.name))
                .filter(|v| !v.is_null())
                .collect();
            if values.is_empty() {
                continue;
            }
            checked += values.len();
            let ok = values.iter().filter(|v| check(v)).count();
            conforming += ok;
            if ok < values.len() {
                offenders.push(attribute.name.clone());
            }
        }
        if !offenders.is_empty() {
            issues.push(QualityIssue {
                severity: IssueSeverity::Error,
                description: "values outside their semantic range".to_string(),
                attributes: offenders,
            });
        }
        if checked == 0 {
            1.0
        } else {
            conforming as f64 / checked as f64
        }
    };

    Ok(QualityReport::score(
        completeness,
        consistency,
        timeliness,
        uniqueness,
        validity,
        weights,
        issues,
    ))
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
