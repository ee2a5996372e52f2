//! Discovery engine.
//!
//! Everything huginn believes about a tenant comes from here: which event
//! types exist, what identifies a service, what marks an error, what the
//! dashboards look like. Findings are published to the discovery cache as
//! immutable [`DiscoveryResult`]s and refreshed by re-running the chain
//! when the ttl lapses. Concurrent demands for the same slot are coalesced
//! through a single-flight primitive, so one chain execution feeds every
//! waiter.

mod chains;
mod probes;
mod profile;
mod quality;
mod relationships;
mod singleflight;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::state::{CacheKey, CacheStats, CacheStore};
use crate::telemetry;
use crate::types::{
    DiscoveryHints, DiscoveryKind, DiscoveryResult, DiscoveryScope, ProfileDepth, QualityReport,
    QualityWeights, Relationship, Schema, SchemaFilter, SchemaList, VolumeProfile,
};
use crate::{HuginnError, Result};

pub use singleflight::SingleFlight;

/// Discovery engine tuning.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Minimum confidence at which a probe chain stops early. Default: 0.7.
    pub min_confidence: f64,
    /// Lookback window for probe queries, in minutes. Default: 60.
    pub window_minutes: u32,
    /// Pattern an attribute name must match to count as an identifier in
    /// the service-identifier chain.
    pub identifier_pattern: String,
    /// Edge cap per schema pair in relationship discovery. Default: 3.
    pub max_edges_per_pair: usize,
    /// How many event types get record counts in the catalog chain.
    pub catalog_count_limit: usize,
    /// Weights for the five quality dimensions.
    pub quality_weights: QualityWeights,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            window_minutes: 60,
            identifier_pattern: r"(?i)(^|[._])(id|guid|name)$".to_string(),
            max_edges_per_pair: 3,
            catalog_count_limit: 25,
            quality_weights: QualityWeights::default(),
        }
    }
}

/// Engine health snapshot.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub cache: CacheStats,
    pub chains_in_flight: usize,
}

impl HealthStatus {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "healthy": self.healthy,
            "chains_in_flight": self.chains_in_flight,
            "cache": {
                "hits": self.cache.hits,
                "misses": self.cache.misses,
                "evictions": self.cache.evictions,
                "memory_used": self.cache.memory_used,
                "entries": self.cache.entries,
            },
        })
    }
}

/// The discovery engine. One per process, shared via `Arc`.
pub struct DiscoveryEngine {
    backend: Arc<dyn Backend>,
    cache: Arc<dyn CacheStore>,
    config: DiscoveryConfig,
    identifier_re: Regex,
    flights: SingleFlight<String, Result<DiscoveryResult>>,
}

impl DiscoveryEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        cache: Arc<dyn CacheStore>,
        config: DiscoveryConfig,
    ) -> Result<Self> {
        let identifier_re = Regex::new(&config.identifier_pattern).map_err(|e| {
            HuginnError::Configuration(format!("identifier pattern: {e}"))
        })?;
        Ok(Self {
            backend,
            cache,
            config,
            identifier_re,
            flights: SingleFlight::new(),
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Ensure a discovery exists for (kind, scope): serve the cached result
    /// while it is fresh, otherwise run the chain — once, however many
    /// callers are waiting.
    ///
    /// Failure to discover is not an error: an exhausted chain yields a
    /// zero-confidence result. Only transport-level backend trouble (and
    /// cancellation) surfaces as `Err`.
    pub async fn ensure(
        &self,
        cancel: &CancellationToken,
        kind: DiscoveryKind,
        scope: &DiscoveryScope,
    ) -> Result<DiscoveryResult> {
        if cancel.is_cancelled() {
            return Err(HuginnError::Cancelled);
        }
        let key = CacheKey::discovery(kind, scope);
        if let Some(cached) = self.cache.get(&key).await? {
            if let Ok(result) = serde_json::from_value::<DiscoveryResult>(cached) {
                if result.is_fresh(Utc::now()) {
                    metrics::counter!(telemetry::DISCOVERY_HITS_TOTAL, "kind" => kind.as_str())
                        .increment(1);
                    return Ok(result);
                }
            }
        }

        let flight_key = key.storage_key();
        let run = self.flights.run(flight_key, || self.execute_chain(kind, scope, &key));
        tokio::select! {
            _ = cancel.cancelled() => Err(HuginnError::Cancelled),
            result = run => result,
        }
    }

    /// One chain execution plus atomic publication.
    async fn execute_chain(
        &self,
        kind: DiscoveryKind,
        scope: &DiscoveryScope,
        key: &CacheKey,
    ) -> Result<DiscoveryResult> {
        // Double-check under the flight: a straggler that lost the race
        // between its cache miss and the leader's publication becomes a
        // cache hit here instead of re-running the chain.
        if let Some(cached) = self.cache.get(key).await? {
            if let Ok(result) = serde_json::from_value::<DiscoveryResult>(cached) {
                if result.is_fresh(Utc::now()) {
                    return Ok(result);
                }
            }
        }
        metrics::counter!(telemetry::DISCOVERY_CHAINS_TOTAL, "kind" => kind.as_str()).increment(1);
        // The chain runs under its own token: cancelling one caller must
        // not poison the execution other waiters share. If every waiter is
        // gone the leader future is dropped and the guard cleans up.
        let chain_cancel = CancellationToken::new();
        let ctx = chains::ChainCtx {
            backend: self.backend.as_ref(),
            config: &self.config,
            identifier_re: &self.identifier_re,
        };
        let result = chains::run(&ctx, &chain_cancel, kind, scope).await?;

        debug!(
            kind = kind.as_str(),
            confidence = result.confidence,
            coverage = result.coverage,
            "chain finished"
        );
        let payload = serde_json::to_value(&result)
            .map_err(|e| HuginnError::Internal(format!("serialize discovery: {e}")))?;
        self.cache.set(key, payload, result.ttl()).await?;
        Ok(result)
    }

    /// Drop the cached result for (kind, scope); the next `ensure` runs a
    /// fresh chain.
    pub async fn invalidate(&self, kind: DiscoveryKind, scope: &DiscoveryScope) -> Result<()> {
        self.cache.invalidate(&CacheKey::discovery(kind, scope)).await
    }

    /// List event types, filtered. An empty tenant yields an empty list
    /// with guidance, not an error.
    pub async fn list_schemas(
        &self,
        cancel: &CancellationToken,
        account: i64,
        filter: &SchemaFilter,
    ) -> Result<SchemaList> {
        let catalog = self
            .ensure(cancel, DiscoveryKind::EventTypeCatalog, &DiscoveryScope::account(account))
            .await?;

        let mut schemas = Vec::new();
        if let Some(entries) = catalog.value.get("event_types").and_then(Value::as_array) {
            for entry in entries {
                let Some(name) = entry.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let count = entry.get("count").and_then(Value::as_u64).unwrap_or(0);
                if !filter.matches(name) || count < filter.min_record_count {
                    continue;
                }
                schemas.push(Schema {
                    name: name.to_string(),
                    record_count: count,
                    attributes: Vec::new(),
                    volume: VolumeProfile {
                        records_per_hour: count as f64 * 60.0
                            / self.config.window_minutes.max(1) as f64,
                        window_minutes: self.config.window_minutes,
                    },
                    quality: None,
                    patterns: Vec::new(),
                    depth: ProfileDepth::Basic,
                    profiled_at: Utc::now(),
                });
                if schemas.len() >= filter.max_results {
                    break;
                }
            }
        }

        let guidance = if schemas.is_empty() {
            Some(if catalog.confidence == 0.0 {
                "No event types were found in this account. Check that data is being \
                 reported and that the account id is correct."
                    .to_string()
            } else {
                "No event types matched the filter. Relax the pattern or lower \
                 min_record_count."
                    .to_string()
            })
        } else {
            None
        };

        Ok(SchemaList { schemas, guidance })
    }

    /// Profile one event type at the requested depth.
    pub async fn profile_schema(
        &self,
        cancel: &CancellationToken,
        account: i64,
        event_type: &str,
        depth: ProfileDepth,
    ) -> Result<Schema> {
        let prober = probes::Prober {
            backend: self.backend.as_ref(),
            account,
            window: self.config.window_minutes,
        };
        let weights = (depth == ProfileDepth::Full).then_some(&self.config.quality_weights);
        profile::profile_event_type(
            &prober,
            cancel,
            event_type,
            depth,
            &self.identifier_re,
            weights,
        )
        .await
    }

    /// Keyword-driven discovery: rank the catalog against the hints and
    /// profile the best candidates.
    pub async fn discover(
        &self,
        cancel: &CancellationToken,
        account: i64,
        hints: &DiscoveryHints,
    ) -> Result<Vec<Schema>> {
        let listing = self
            .list_schemas(cancel, account, &SchemaFilter::default())
            .await?;
        let max = hints.max_schemas.unwrap_or(5);

        let mut ranked: Vec<(i64, &Schema)> = listing
            .schemas
            .iter()
            .map(|schema| {
                let name = schema.name.to_lowercase();
                let mut score = 0i64;
                for preferred in &hints.preferred_event_types {
                    if schema.name.eq_ignore_ascii_case(preferred) {
                        score += 5;
                    }
                }
                for keyword in &hints.keywords {
                    if name.contains(&keyword.to_lowercase()) {
                        score += 2;
                    }
                }
                if let Some(ref purpose) = hints.purpose {
                    for word in purpose.split_whitespace() {
                        if word.len() > 3 && name.contains(&word.to_lowercase()) {
                            score += 1;
                        }
                    }
                }
                (score, schema)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.record_count.cmp(&a.1.record_count))
        });

        let mut out = Vec::new();
        for (_, candidate) in ranked.into_iter().take(max) {
            if cancel.is_cancelled() {
                return Err(HuginnError::Cancelled);
            }
            match self
                .profile_schema(cancel, account, &candidate.name, ProfileDepth::Standard)
                .await
            {
                Ok(schema) => out.push(schema),
                Err(e) if e.is_transient() => {
                    info!(event_type = %candidate.name, error = %e, "profile skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Discover pairwise relationships between profiled schemas.
    pub async fn find_relationships(
        &self,
        cancel: &CancellationToken,
        account: i64,
        schemas: &[Schema],
    ) -> Result<Vec<Relationship>> {
        let prober = probes::Prober {
            backend: self.backend.as_ref(),
            account,
            window: self.config.window_minutes,
        };
        relationships::find(&prober, cancel, schemas, self.config.max_edges_per_pair).await
    }

    /// Assess data quality for one event type.
    pub async fn assess_quality(
        &self,
        cancel: &CancellationToken,
        account: i64,
        event_type: &str,
    ) -> Result<QualityReport> {
        let schema = self
            .profile_schema(cancel, account, event_type, ProfileDepth::Full)
            .await?;
        schema
            .quality
            .ok_or_else(|| HuginnError::Internal("full profile produced no quality report".into()))
    }

    /// Engine health: cache counters plus in-flight chain count.
    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            cache: self.cache.stats(),
            chains_in_flight: self.flights.in_flight(),
        }
    }

    /// Default ttl a cached tool result should use, aligned to the
    /// shortest-lived discovery it may embed.
    pub fn response_cache_ttl(&self) -> Duration {
        DiscoveryKind::ErrorIndicator.default_ttl().min(Duration::from_secs(300))
    }
}
