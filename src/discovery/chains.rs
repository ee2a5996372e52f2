//! Discovery chains: ordered probes per kind.
//!
//! A chain runs its probes in order and stops at the first one whose
//! confidence clears the configured minimum. Sub-threshold findings are
//! kept as the running best, so a chain that never clears the bar still
//! returns its best guess with an honest confidence. A chain that finds
//! nothing at all returns a zero-confidence result with assumptions —
//! never an error. Only transport-level backend failures abort a chain.

use regex::Regex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::probes::{Prober, is_fatal};
use super::profile::{SERVICE_FIELD_CANDIDATES, profile_event_type};
use super::DiscoveryConfig;
use crate::backend::Backend;
use crate::types::{
    AttributeType, DiscoveryKind, DiscoveryResult, DiscoveryScope, ProfileDepth,
};
use crate::{HuginnError, Result};

/// Everything a chain needs.
pub(crate) struct ChainCtx<'a> {
    pub backend: &'a dyn Backend,
    pub config: &'a DiscoveryConfig,
    pub identifier_re: &'a Regex,
}

impl<'a> ChainCtx<'a> {
    fn prober(&self, account: i64) -> Prober<'a> {
        Prober {
            backend: self.backend,
            account,
            window: self.config.window_minutes,
        }
    }
}

/// A probe's finding, before it is promoted to a [`DiscoveryResult`].
struct Finding {
    value: Value,
    confidence: f64,
    coverage: f64,
}

/// Run the chain for `kind` over `scope`.
pub(crate) async fn run(
    ctx: &ChainCtx<'_>,
    cancel: &CancellationToken,
    kind: DiscoveryKind,
    scope: &DiscoveryScope,
) -> Result<DiscoveryResult> {
    let mut chain = Chain {
        ctx,
        cancel,
        kind,
        scope,
        assumptions: Vec::new(),
        best: None,
    };
    match kind {
        DiscoveryKind::ServiceIdentifier => chain.service_identifier().await,
        DiscoveryKind::ErrorIndicator => chain.error_indicator().await,
        DiscoveryKind::Dimensional => chain.dimensional().await,
        DiscoveryKind::Source => chain.source().await,
        DiscoveryKind::WidgetShape => chain.widget_shape().await,
        DiscoveryKind::EventTypeCatalog => chain.event_type_catalog().await,
        DiscoveryKind::AttributeProfile => chain.attribute_profile().await,
    }
}

struct Chain<'a, 'b> {
    ctx: &'a ChainCtx<'b>,
    cancel: &'a CancellationToken,
    kind: DiscoveryKind,
    scope: &'a DiscoveryScope,
    assumptions: Vec<String>,
    best: Option<Finding>,
}

impl Chain<'_, '_> {
    fn assume(&mut self, note: impl Into<String>) {
        self.assumptions.push(note.into());
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(HuginnError::Cancelled);
        }
        Ok(())
    }

    /// Promote a probe finding. Returns true when the chain can stop.
    fn accept(&mut self, finding: Finding) -> bool {
        let good_enough = finding.confidence >= self.ctx.config.min_confidence;
        let better = self
            .best
            .as_ref()
            .map(|b| finding.confidence > b.confidence)
            .unwrap_or(true);
        if better {
            self.best = Some(finding);
        }
        good_enough
    }

    /// Soften a probe error: fatal errors abort, the rest become an
    /// assumption and the chain moves on.
    fn soften<T>(&mut self, probe: &str, outcome: Result<T>) -> Result<Option<T>> {
        match outcome {
            Ok(v) => Ok(Some(v)),
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                self.assume(format!("probe '{probe}' failed: {e}"));
                Ok(None)
            }
        }
    }

    fn finish(self) -> DiscoveryResult {
        let mut assumptions = self.assumptions;
        match self.best {
            Some(finding) => DiscoveryResult::new(
                self.kind,
                self.scope.clone(),
                finding.value,
                finding.confidence,
                finding.coverage,
                assumptions,
            ),
            None => {
                if assumptions.is_empty() {
                    assumptions.push("all probes exhausted without evidence".to_string());
                }
                DiscoveryResult::exhausted(self.kind, self.scope.clone(), assumptions)
            }
        }
    }

    /// The event type this chain inspects, defaulting to `Transaction`.
    fn event_type(&mut self) -> String {
        match self.scope.event_type.clone() {
            Some(et) => et,
            None => {
                self.assume("scope named no event type; assumed Transaction");
                "Transaction".to_string()
            }
        }
    }

    // ----- service-identifier -------------------------------------------

    async fn service_identifier(mut self) -> Result<DiscoveryResult> {
        let et = self.event_type();
        let prober = self.ctx.prober(self.scope.account);

        let total = match self.soften(
            "total-count",
            prober.count(self.cancel, &et, None).await,
        )? {
            Some(t) if t > 0.0 => t,
            _ => {
                self.assume(format!("no {et} records in the sampled window"));
                return Ok(self.finish());
            }
        };

        // Probe 1: well-known service attribute names.
        for candidate in SERVICE_FIELD_CANDIDATES {
            self.checkpoint()?;
            let condition = format!("`{candidate}` IS NOT NULL");
            let present = self
                .soften(
                    "named-field",
                    prober.count(self.cancel, &et, Some(&condition)).await,
                )?
                .unwrap_or(0.0);
            if present > 0.0 {
                let coverage = (present / total).clamp(0.0, 1.0);
                self.assume(format!(
                    "{candidate} present on {:.1}% of {et} records",
                    coverage * 100.0
                ));
                if self.accept(Finding {
                    value: json!({ "field": candidate, "event_type": et }),
                    confidence: coverage,
                    coverage,
                }) {
                    return Ok(self.finish());
                }
            }
        }

        // Probe 2: identifier-typed attributes with entity-like cardinality.
        self.checkpoint()?;
        let profiled = self.soften(
            "identifier-scan",
            profile_event_type(
                &prober,
                self.cancel,
                &et,
                ProfileDepth::Standard,
                self.ctx.identifier_re,
                None,
            )
            .await,
        )?;
        if let Some(schema) = profiled {
            let mut candidates: Vec<_> = schema
                .attributes
                .iter()
                .filter(|a| a.looks_like_entity_id() && self.ctx.identifier_re.is_match(&a.name))
                .collect();
            candidates.sort_by(|a, b| {
                a.null_ratio
                    .partial_cmp(&b.null_ratio)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            if let Some(attr) = candidates.first() {
                let coverage = 1.0 - attr.null_ratio;
                self.assume(format!(
                    "no well-known service field; {} matched the identifier pattern",
                    attr.name
                ));
                if self.accept(Finding {
                    value: json!({ "field": attr.name, "event_type": et }),
                    confidence: 0.75 * coverage,
                    coverage,
                }) {
                    return Ok(self.finish());
                }
            }

            // Probe 3: natural clustering over low-cardinality strings.
            self.checkpoint()?;
            let clustered = schema
                .attributes
                .iter()
                .filter(|a| {
                    a.data_type == AttributeType::String
                        && a.cardinality_ratio > 0.0
                        && a.cardinality_ratio < 0.2
                        && a.null_ratio < 0.3
                })
                .min_by(|a, b| {
                    a.cardinality_ratio
                        .partial_cmp(&b.cardinality_ratio)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            if let Some(attr) = clustered {
                let coverage = 1.0 - attr.null_ratio;
                self.assume(format!(
                    "fell back to value clustering; {} partitions the data",
                    attr.name
                ));
                self.accept(Finding {
                    value: json!({ "field": attr.name, "event_type": et }),
                    confidence: 0.4 * coverage,
                    coverage,
                });
            }
        }

        Ok(self.finish())
    }

    // ----- error-indicator ----------------------------------------------

    async fn error_indicator(mut self) -> Result<DiscoveryResult> {
        let et = self.event_type();
        let prober = self.ctx.prober(self.scope.account);

        let total = match self.soften(
            "total-count",
            prober.count(self.cancel, &et, None).await,
        )? {
            Some(t) if t > 0.0 => t,
            _ => {
                self.assume(format!("no {et} records in the sampled window"));
                return Ok(self.finish());
            }
        };

        // Probe 1: boolean `error` attribute.
        self.checkpoint()?;
        let present = self
            .soften(
                "boolean-error",
                prober
                    .count(self.cancel, &et, Some("error IS NOT NULL"))
                    .await,
            )?
            .unwrap_or(0.0);
        if present > 0.0 {
            let coverage = (present / total).clamp(0.0, 1.0);
            let erroring = self
                .soften(
                    "boolean-error-rate",
                    prober.count(self.cancel, &et, Some("error IS true")).await,
                )?
                .unwrap_or(0.0);
            self.assume(format!(
                "boolean error attribute set on {:.1}% of records",
                coverage * 100.0
            ));
            if self.accept(Finding {
                value: json!({
                    "condition": "error IS true",
                    "field": "error",
                    "observed_error_rate": erroring / total,
                }),
                confidence: 0.9 * coverage.max(0.5),
                coverage,
            }) {
                return Ok(self.finish());
            }
        }

        // Probe 2: error classes and failing status codes.
        for (field, condition, confidence) in [
            ("error.class", "`error.class` IS NOT NULL", 0.8),
            ("httpResponseCode", "httpResponseCode >= 400", 0.75),
            ("http.statusCode", "`http.statusCode` >= 400", 0.75),
            ("grpcStatusCode", "grpcStatusCode != 0", 0.7),
        ] {
            self.checkpoint()?;
            let hits = self
                .soften(
                    "class-fields",
                    prober.count(self.cancel, &et, Some(condition)).await,
                )?
                .unwrap_or(0.0);
            if hits > 0.0 {
                let attr_coverage = self
                    .soften(
                        "class-field-coverage",
                        prober
                            .count(self.cancel, &et, Some(&format!("`{field}` IS NOT NULL")))
                            .await,
                    )?
                    .unwrap_or(0.0)
                    / total;
                self.assume(format!("classified errors via {field}"));
                if self.accept(Finding {
                    value: json!({ "condition": condition, "field": field }),
                    confidence,
                    coverage: attr_coverage.clamp(0.0, 1.0),
                }) {
                    return Ok(self.finish());
                }
            }
        }

        // Probe 3: log-level field.
        self.checkpoint()?;
        let leveled = self
            .soften(
                "log-level",
                prober
                    .count(self.cancel, &et, Some("level IN ('error', 'ERROR', 'fatal')"))
                    .await,
            )?
            .unwrap_or(0.0);
        if leveled > 0.0 {
            self.assume("fell back to log-level severity");
            if self.accept(Finding {
                value: json!({
                    "condition": "level IN ('error', 'ERROR', 'fatal')",
                    "field": "level",
                }),
                confidence: 0.6,
                coverage: (leveled / total).clamp(0.0, 1.0),
            }) {
                return Ok(self.finish());
            }
        }

        // Probe 4: message text matching.
        self.checkpoint()?;
        let matched = self
            .soften(
                "message-pattern",
                prober
                    .count(self.cancel, &et, Some("message LIKE '%error%'"))
                    .await,
            )?
            .unwrap_or(0.0);
        if matched > 0.0 {
            self.assume("error detection is a message substring match; expect noise");
            if self.accept(Finding {
                value: json!({ "condition": "message LIKE '%error%'", "field": "message" }),
                confidence: 0.4,
                coverage: (matched / total).clamp(0.0, 1.0),
            }) {
                return Ok(self.finish());
            }
        }

        // Probe 5: retry/exception counters as anomaly proxies.
        self.checkpoint()?;
        if let Some(attributes) =
            self.soften("counter-scan", prober.keyset(self.cancel, &et).await)?
        {
            let counter = attributes.iter().find(|a| {
                a.data_type == AttributeType::Numeric
                    && (a.name.to_lowercase().contains("retry")
                        || a.name.to_lowercase().contains("exception"))
            });
            if let Some(attr) = counter {
                self.assume(format!(
                    "no direct error signal; thresholding on counter {}",
                    attr.name
                ));
                self.accept(Finding {
                    value: json!({
                        "condition": format!("`{}` > 0", attr.name),
                        "field": attr.name,
                    }),
                    confidence: 0.3,
                    coverage: 0.5,
                });
            }
        }

        Ok(self.finish())
    }

    // ----- dimensional ---------------------------------------------------

    async fn dimensional(mut self) -> Result<DiscoveryResult> {
        let prober = self.ctx.prober(self.scope.account);

        // Probe 1: the dimensional-metric catalog.
        self.checkpoint()?;
        let metrics = self
            .soften(
                "metric-catalog",
                prober
                    .facet_values(self.cancel, "Metric", "metricName", 100)
                    .await,
            )?
            .unwrap_or_default();
        if !metrics.is_empty() {
            self.assume(format!(
                "metric catalog sampled over the last {} minutes",
                self.ctx.config.window_minutes
            ));
            if self.accept(Finding {
                value: json!({
                    "metric_event": "Metric",
                    "metrics": metrics.iter().map(|(name, _)| name).collect::<Vec<_>>(),
                }),
                confidence: 0.9,
                coverage: 1.0,
            }) {
                return Ok(self.finish());
            }
        }

        // Probe 2: numeric event attributes.
        let et = self.event_type();
        self.checkpoint()?;
        if let Some(schema) = self.soften(
            "numeric-attributes",
            profile_event_type(
                &prober,
                self.cancel,
                &et,
                ProfileDepth::Standard,
                self.ctx.identifier_re,
                None,
            )
            .await,
        )? {
            let numerics: Vec<_> = schema
                .attributes
                .iter()
                .filter(|a| a.data_type == AttributeType::Numeric)
                .collect();
            if !numerics.is_empty() {
                let coverage = 1.0
                    - numerics.iter().map(|a| a.null_ratio).sum::<f64>()
                        / numerics.len() as f64;
                self.assume(format!(
                    "no metric tables; using numeric attributes of {et}"
                ));
                if self.accept(Finding {
                    value: json!({
                        "metric_event": et,
                        "numeric_attributes": numerics.iter().map(|a| &a.name).collect::<Vec<_>>(),
                    }),
                    confidence: 0.7,
                    coverage: coverage.clamp(0.0, 1.0),
                }) {
                    return Ok(self.finish());
                }
            }

            // Probe 3: histogram-shaped attributes.
            let histograms: Vec<_> = schema
                .attributes
                .iter()
                .filter(|a| {
                    a.data_type == AttributeType::Object
                        || a.name.to_lowercase().contains("histogram")
                })
                .collect();
            if !histograms.is_empty() {
                self.assume("only histogram-typed attributes found");
                self.accept(Finding {
                    value: json!({
                        "metric_event": et,
                        "histogram_attributes":
                            histograms.iter().map(|a| &a.name).collect::<Vec<_>>(),
                    }),
                    confidence: 0.5,
                    coverage: 0.5,
                });
            }
        }

        Ok(self.finish())
    }

    // ----- source --------------------------------------------------------

    async fn source(mut self) -> Result<DiscoveryResult> {
        let prober = self.ctx.prober(self.scope.account);

        // Probe 1: ingest-usage metadata.
        self.checkpoint()?;
        let usage = self
            .soften(
                "ingest-usage",
                prober
                    .facet_values(self.cancel, "NrConsumption", "usageMetric", 25)
                    .await,
            )?
            .unwrap_or_default();
        if !usage.is_empty() {
            if self.accept(Finding {
                value: json!({
                    "via": "ingest-usage",
                    "sources": usage.iter().map(|(name, _)| name).collect::<Vec<_>>(),
                }),
                confidence: 0.85,
                coverage: 1.0,
            }) {
                return Ok(self.finish());
            }
        }

        let et = self.event_type();

        // Probe 2: instrumentation.provider attribute.
        self.checkpoint()?;
        let providers = self
            .soften(
                "instrumentation-provider",
                prober
                    .facet_values(self.cancel, &et, "instrumentation.provider", 25)
                    .await,
            )?
            .unwrap_or_default();
        if !providers.is_empty() {
            self.assume(format!("providers read from {et} attributes"));
            if self.accept(Finding {
                value: json!({
                    "via": "instrumentation.provider",
                    "sources": providers.iter().map(|(name, _)| name).collect::<Vec<_>>(),
                }),
                confidence: 0.75,
                coverage: 1.0,
            }) {
                return Ok(self.finish());
            }
        }

        // Probe 3: agent names.
        self.checkpoint()?;
        let agents = self
            .soften(
                "agent-name",
                prober.facet_values(self.cancel, &et, "agentName", 25).await,
            )?
            .unwrap_or_default();
        if !agents.is_empty() {
            self.assume("agent names used as a source proxy");
            if self.accept(Finding {
                value: json!({
                    "via": "agent-name",
                    "sources": agents.iter().map(|(name, _)| name).collect::<Vec<_>>(),
                }),
                confidence: 0.6,
                coverage: 1.0,
            }) {
                return Ok(self.finish());
            }
        }

        // Probe 4: custom tags.
        self.checkpoint()?;
        if let Some(attributes) =
            self.soften("custom-tags", prober.keyset(self.cancel, &et).await)?
        {
            let tags: Vec<_> = attributes
                .iter()
                .filter(|a| a.name.starts_with("tags."))
                .map(|a| a.name.clone())
                .collect();
            if !tags.is_empty() {
                self.assume("only custom tags hint at instrumentation sources");
                self.accept(Finding {
                    value: json!({ "via": "custom-tags", "sources": tags }),
                    confidence: 0.4,
                    coverage: 0.5,
                });
            }
        }

        Ok(self.finish())
    }

    // ----- widget-shape --------------------------------------------------

    async fn widget_shape(mut self) -> Result<DiscoveryResult> {
        self.checkpoint()?;
        let data = self
            .ctx
            .backend
            .graphql(
                self.cancel,
                DASHBOARDS_QUERY,
                json!({ "accountId": self.scope.account }),
            )
            .await;
        let Some(data) = self.soften("dashboard-list", data)? else {
            return Ok(self.finish());
        };

        let dashboards = data["actor"]["account"]["dashboards"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        if dashboards.is_empty() {
            self.assume("tenant has no dashboards");
            return Ok(self.finish());
        }

        let mut widgets = Vec::new();
        let mut total = 0usize;
        let mut classified = 0usize;
        for dashboard in &dashboards {
            let pages = dashboard["pages"].as_array().cloned().unwrap_or_default();
            for page in &pages {
                for widget in page["widgets"].as_array().cloned().unwrap_or_default() {
                    total += 1;
                    let raw = &widget["rawConfiguration"];
                    let kind = if raw.get("nrqlQueries").is_some_and(|q| !q.is_null()) {
                        "query-based"
                    } else if raw.is_object() {
                        "metric-based"
                    } else {
                        continue;
                    };
                    classified += 1;
                    widgets.push(json!({
                        "dashboard": dashboard["name"],
                        "title": widget["title"],
                        "visualization": widget["visualization"]["id"],
                        "kind": kind,
                    }));
                }
            }
        }

        if total == 0 {
            self.assume("dashboards exist but contain no widgets");
            return Ok(self.finish());
        }
        let ratio = classified as f64 / total as f64;
        if classified < total {
            self.assume(format!(
                "{} widget(s) had no parseable configuration",
                total - classified
            ));
        }
        self.accept(Finding {
            value: json!({ "widgets": widgets, "total": total }),
            confidence: ratio,
            coverage: ratio,
        });
        Ok(self.finish())
    }

    // ----- event-type-catalog -------------------------------------------

    async fn event_type_catalog(mut self) -> Result<DiscoveryResult> {
        let prober = self.ctx.prober(self.scope.account);

        self.checkpoint()?;
        let names = self
            .soften("show-event-types", prober.event_types(self.cancel).await)?
            .unwrap_or_default();
        if names.is_empty() {
            self.assume("tenant reports no event types in the window");
            return Ok(self.finish());
        }

        let limit = self.ctx.config.catalog_count_limit;
        let mut entries = Vec::new();
        for name in names.iter().take(limit) {
            self.checkpoint()?;
            let count = self
                .soften("catalog-count", prober.count(self.cancel, name, None).await)?
                .unwrap_or(0.0);
            entries.push(json!({ "name": name, "count": count as u64 }));
        }
        if names.len() > limit {
            self.assume(format!(
                "record counts fetched for the first {limit} of {} event types",
                names.len()
            ));
        }
        let coverage = (entries.len() as f64 / names.len() as f64).clamp(0.0, 1.0);
        self.accept(Finding {
            value: json!({ "event_types": entries }),
            confidence: 0.95,
            coverage,
        });
        Ok(self.finish())
    }

    // ----- attribute-profile --------------------------------------------

    async fn attribute_profile(mut self) -> Result<DiscoveryResult> {
        let et = self.event_type();
        let prober = self.ctx.prober(self.scope.account);

        self.checkpoint()?;
        let Some(schema) = self.soften(
            "profile",
            profile_event_type(
                &prober,
                self.cancel,
                &et,
                ProfileDepth::Standard,
                self.ctx.identifier_re,
                None,
            )
            .await,
        )?
        else {
            return Ok(self.finish());
        };

        if schema.attributes.is_empty() {
            self.assume(format!("{et} has no attributes in the window"));
            return Ok(self.finish());
        }
        let coverage = 1.0
            - schema.attributes.iter().map(|a| a.null_ratio).sum::<f64>()
                / schema.attributes.len() as f64;
        let value = serde_json::to_value(&schema)
            .map_err(|e| HuginnError::Internal(format!("serialize schema: {e}")))?;
        self.accept(Finding {
            value,
            confidence: 0.9,
            coverage: coverage.clamp(0.0, 1.0),
        });
        Ok(self.finish())
    }
}

/// Dashboard listing, including raw widget configuration.
const DASHBOARDS_QUERY: &str = "\
query ($accountId: Int!) {\
  actor { account(id: $accountId) { dashboards {\
    name pages { widgets { title visualization { id } rawConfiguration } }\
  } } }\
}";
