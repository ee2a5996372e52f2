//! Telemetry metric name constants.
//!
//! Centralised metric names for huginn operations. Consumers install their
//! own `metrics` recorder (e.g. prometheus, statsd); without a recorder
//! installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `huginn_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `tool` — tool name (e.g. "query_nrdb", "list_schemas")
//! - `kind` — discovery kind (e.g. "service-identifier")
//! - `operation` — backend operation class ("graphql" | "querylang" | "account")
//! - `status` — outcome: "ok" or "error"

/// Total tool calls dispatched.
///
/// Labels: `tool`, `status` ("ok" | "error").
pub const TOOL_CALLS_TOTAL: &str = "huginn_tool_calls_total";

/// Tool call duration in seconds.
///
/// Labels: `tool`.
pub const TOOL_DURATION_SECONDS: &str = "huginn_tool_duration_seconds";

/// Total backend requests.
///
/// Labels: `operation`, `status` ("ok" | "error").
pub const BACKEND_REQUESTS_TOTAL: &str = "huginn_backend_requests_total";

/// Total retry attempts against the backend (not counting the initial request).
///
/// Labels: `operation`.
pub const BACKEND_RETRIES_TOTAL: &str = "huginn_backend_retries_total";

/// Total circuit-breaker trips.
///
/// Labels: `operation`.
pub const BREAKER_TRIPS_TOTAL: &str = "huginn_breaker_trips_total";

/// Total discovery chain executions (cache misses that ran probes).
///
/// Labels: `kind`.
pub const DISCOVERY_CHAINS_TOTAL: &str = "huginn_discovery_chains_total";

/// Total discovery cache hits.
///
/// Labels: `kind`.
pub const DISCOVERY_HITS_TOTAL: &str = "huginn_discovery_hits_total";

/// Total cache store hits.
pub const CACHE_HITS_TOTAL: &str = "huginn_cache_hits_total";

/// Total cache store misses.
pub const CACHE_MISSES_TOTAL: &str = "huginn_cache_misses_total";

/// Total cache evictions (LRU or byte-budget pressure).
pub const CACHE_EVICTIONS_TOTAL: &str = "huginn_cache_evictions_total";

/// Total handler panics recovered by the dispatcher.
pub const HANDLER_PANICS_TOTAL: &str = "huginn_handler_panics_total";

/// Total requests rejected because the bounded queue overflowed.
///
/// Labels: `tool`.
pub const QUEUE_OVERFLOWS_TOTAL: &str = "huginn_queue_overflows_total";

/// Total requests cancelled before completion.
pub const CANCELLED_TOTAL: &str = "huginn_cancelled_total";
