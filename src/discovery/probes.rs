//! Canonical probe queries against the backend.
//!
//! Every discovery chain speaks to the backend through this helper, so the
//! statement shapes (and the tolerated response shapes) live in one place.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, DEFAULT_TIMEOUT};
use crate::types::{Attribute, AttributeType};
use crate::{HuginnError, Result};

/// Issues probe queries for one account over one lookback window.
pub(crate) struct Prober<'a> {
    pub backend: &'a dyn Backend,
    pub account: i64,
    /// Lookback window in minutes.
    pub window: u32,
}

impl Prober<'_> {
    fn since(&self) -> String {
        format!("SINCE {} minutes ago", self.window)
    }

    /// `SELECT count(*) FROM <event_type> [WHERE <cond>]`.
    pub async fn count(
        &self,
        cancel: &CancellationToken,
        event_type: &str,
        condition: Option<&str>,
    ) -> Result<f64> {
        let filter = condition
            .map(|c| format!(" WHERE {c}"))
            .unwrap_or_default();
        let statement = format!(
            "SELECT count(*) FROM {event_type}{filter} {}",
            self.since()
        );
        let rows = self
            .backend
            .querylang(cancel, &statement, self.account, DEFAULT_TIMEOUT)
            .await?;
        Ok(rows.scalar_f64("count").unwrap_or(0.0))
    }

    /// `SELECT keyset() FROM <event_type>` — attribute names and types.
    ///
    /// Tolerates two response shapes: one row per attribute
    /// (`{"key": ..., "type": ...}`) or a single row of typed arrays
    /// (`stringKeys`, `numericKeys`, `booleanKeys`, `allKeys`).
    pub async fn keyset(
        &self,
        cancel: &CancellationToken,
        event_type: &str,
    ) -> Result<Vec<Attribute>> {
        let statement = format!("SELECT keyset() FROM {event_type} {}", self.since());
        let result = self
            .backend
            .querylang(cancel, &statement, self.account, DEFAULT_TIMEOUT)
            .await?;

        let mut attributes = Vec::new();
        for row in &result.rows {
            if let (Some(key), Some(kind)) = (
                row.get("key").and_then(Value::as_str),
                row.get("type").and_then(Value::as_str),
            ) {
                attributes.push(Attribute::named(key, parse_type(kind)));
                continue;
            }
            for (field, kind) in [
                ("stringKeys", AttributeType::String),
                ("numericKeys", AttributeType::Numeric),
                ("booleanKeys", AttributeType::Boolean),
            ] {
                if let Some(keys) = row.get(field).and_then(Value::as_array) {
                    for key in keys.iter().filter_map(Value::as_str) {
                        attributes.push(Attribute::named(key, kind));
                    }
                }
            }
        }
        attributes.sort_by(|a, b| a.name.cmp(&b.name));
        attributes.dedup_by(|a, b| a.name == b.name);
        Ok(attributes)
    }

    /// `SELECT * FROM <event_type> LIMIT <n>` — raw sample records.
    pub async fn sample(
        &self,
        cancel: &CancellationToken,
        event_type: &str,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let statement = format!(
            "SELECT * FROM {event_type} {} LIMIT {limit}",
            self.since()
        );
        let result = self
            .backend
            .querylang(cancel, &statement, self.account, DEFAULT_TIMEOUT)
            .await?;
        Ok(result.rows)
    }

    /// `SELECT count(*) FROM <event_type> FACET <field>` — top values.
    pub async fn facet_values(
        &self,
        cancel: &CancellationToken,
        event_type: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let statement = format!(
            "SELECT count(*) FROM {event_type} FACET `{field}` {} LIMIT {limit}",
            self.since()
        );
        let result = self
            .backend
            .querylang(cancel, &statement, self.account, DEFAULT_TIMEOUT)
            .await?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| {
                let value = row
                    .get(field)
                    .or_else(|| row.get("facet"))
                    .map(render_facet)?;
                let count = row.get("count").and_then(Value::as_f64)?;
                Some((value, count))
            })
            .collect())
    }

    /// `SELECT latest(timestamp) FROM <event_type>` — epoch millis.
    pub async fn latest_timestamp(
        &self,
        cancel: &CancellationToken,
        event_type: &str,
    ) -> Result<Option<f64>> {
        let statement = format!(
            "SELECT latest(timestamp) FROM {event_type} {}",
            self.since()
        );
        let result = self
            .backend
            .querylang(cancel, &statement, self.account, DEFAULT_TIMEOUT)
            .await?;
        Ok(result
            .scalar_f64("latest.timestamp")
            .or_else(|| result.scalar_f64("latest")))
    }

    /// `SHOW EVENT TYPES` — names of event types with data.
    pub async fn event_types(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let statement = format!("SHOW EVENT TYPES {}", self.since());
        let result = self
            .backend
            .querylang(cancel, &statement, self.account, DEFAULT_TIMEOUT)
            .await?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| {
                row.get("eventType")
                    .or_else(|| row.get("eventTypes"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect())
    }
}

fn parse_type(s: &str) -> AttributeType {
    match s.to_ascii_lowercase().as_str() {
        "numeric" | "number" | "float" | "integer" => AttributeType::Numeric,
        "boolean" | "bool" => AttributeType::Boolean,
        "timestamp" => AttributeType::Timestamp,
        "object" => AttributeType::Object,
        "array" => AttributeType::Array,
        _ => AttributeType::String,
    }
}

fn render_facet(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Whether a probe failure should abort the chain (transport-level) or
/// just move it on to the next probe (query-shape problems).
pub(crate) fn is_fatal(err: &HuginnError) -> bool {
    matches!(
        err,
        HuginnError::BackendUnavailable(_)
            | HuginnError::RateLimited { .. }
            | HuginnError::Timeout(_)
            | HuginnError::Unauthorized(_)
            | HuginnError::Cancelled
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_parsing_defaults_to_string() {
        assert_eq!(parse_type("numeric"), AttributeType::Numeric);
        assert_eq!(parse_type("boolean"), AttributeType::Boolean);
        assert_eq!(parse_type("mystery"), AttributeType::String);
    }

    #[test]
    fn fatal_classification() {
        assert!(is_fatal(&HuginnError::BackendUnavailable("x".into())));
        assert!(is_fatal(&HuginnError::Cancelled));
        assert!(!is_fatal(&HuginnError::invalid_input("no such attribute")));
        assert!(!is_fatal(&HuginnError::NotFound("x".into())));
    }
}
