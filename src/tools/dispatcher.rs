//! Tool dispatch: validation, prerequisites, limits, panic isolation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::{Tool, ToolContext, ToolRegistry};
use crate::backend::Backend;
use crate::builder::QueryBuilder;
use crate::discovery::DiscoveryEngine;
use crate::state::{CacheKey, StateManager};
use crate::telemetry;
use crate::types::{DiscoveryResult, DiscoveryScope, Prerequisite};
use crate::validator::Validator;
use crate::{HuginnError, Result};

/// Dispatcher limits.
#[derive(Debug, Clone)]
pub struct DispatchLimits {
    /// Concurrent handler executions across all tools. Default: 16.
    pub global_concurrency: usize,
    /// Concurrent executions per tool. Default: 4.
    pub per_tool_concurrency: usize,
    /// Requests allowed to wait for a slot before overflow. Default: 32.
    pub queue_depth: usize,
    /// Handler deadline when the caller passes none. Default: 30s.
    pub default_timeout: Duration,
    /// Ceiling on caller-supplied deadlines. Default: 120s.
    pub timeout_ceiling: Duration,
    /// Confidence floor for declared prerequisites. Default: 0.7.
    pub min_confidence: f64,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            global_concurrency: 16,
            per_tool_concurrency: 4,
            queue_depth: 32,
            default_timeout: Duration::from_secs(30),
            timeout_ceiling: Duration::from_secs(120),
            min_confidence: 0.7,
        }
    }
}

/// One incoming tool call, as decoded by the protocol layer.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
    /// Account override; the configured default otherwise.
    pub account: Option<i64>,
    pub session_id: Option<String>,
    /// Caller deadline override, bounded by the ceiling.
    pub timeout: Option<Duration>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            account: None,
            session_id: None,
            timeout: None,
        }
    }
}

/// Metadata attached to every successful dispatch.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    /// Compact summaries of the discoveries the call rested on.
    pub discoveries_used: Vec<Value>,
    /// Whether the executed query was composed or rewritten from
    /// discoveries.
    pub query_adapted: bool,
    /// Lowest confidence among the inputs (1.0 when none were needed).
    pub min_confidence: f64,
}

impl ResponseMeta {
    pub fn to_json(&self) -> Value {
        json!({
            "discoveries_used": self.discoveries_used,
            "query_adapted": self.query_adapted,
            "min_confidence": self.min_confidence,
        })
    }
}

/// A dispatched result: body plus annotation.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub body: Value,
    pub meta: ResponseMeta,
    /// Served from the response cache.
    pub cached: bool,
}

/// Binds tool calls to prerequisites and handlers.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    engine: Arc<DiscoveryEngine>,
    state: Arc<StateManager>,
    backend: Arc<dyn Backend>,
    builder: Arc<QueryBuilder>,
    validator: Arc<Validator>,
    limits: DispatchLimits,
    default_account: i64,
    /// Admission: concurrency + queue permits. `try_acquire` failure means
    /// the bounded queue overflowed.
    admission: Arc<Semaphore>,
    /// Actual execution slots.
    global: Arc<Semaphore>,
    per_tool: HashMap<String, Arc<Semaphore>>,
    panics: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        engine: Arc<DiscoveryEngine>,
        state: Arc<StateManager>,
        backend: Arc<dyn Backend>,
        builder: Arc<QueryBuilder>,
        validator: Arc<Validator>,
        limits: DispatchLimits,
        default_account: i64,
    ) -> Self {
        let per_tool = registry
            .list()
            .map(|spec| {
                (
                    spec.name.clone(),
                    Arc::new(Semaphore::new(limits.per_tool_concurrency)),
                )
            })
            .collect();
        Self {
            admission: Arc::new(Semaphore::new(limits.global_concurrency + limits.queue_depth)),
            global: Arc::new(Semaphore::new(limits.global_concurrency)),
            per_tool,
            registry,
            engine,
            state,
            backend,
            builder,
            validator,
            limits,
            default_account,
            panics: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<DiscoveryEngine> {
        &self.engine
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// Handler panics recovered since startup.
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Dispatch one tool call.
    pub async fn dispatch(
        &self,
        call: ToolCall,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult> {
        let started = Instant::now();
        let outcome = self.dispatch_inner(call.clone(), cancel).await;

        let status = if outcome.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::TOOL_CALLS_TOTAL,
            "tool" => call.name.clone(), "status" => status)
        .increment(1);
        metrics::histogram!(telemetry::TOOL_DURATION_SECONDS, "tool" => call.name.clone())
            .record(started.elapsed().as_secs_f64());
        if matches!(outcome, Err(HuginnError::Cancelled)) {
            metrics::counter!(telemetry::CANCELLED_TOTAL).increment(1);
        }
        outcome
    }

    async fn dispatch_inner(
        &self,
        call: ToolCall,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult> {
        // 1. Lookup.
        let tool = self
            .registry
            .lookup(&call.name)
            .ok_or_else(|| HuginnError::NotFound(format!("tool {}", call.name)))?;

        // 2. The discover-first escape hatch rides outside the schema.
        let (arguments, discover_first) = split_discover_first(call.arguments);

        // 3. Validate parameters (defaults substituted).
        let args = tool.spec.params.validate(&arguments)?;

        let account = call.account.unwrap_or(self.default_account);

        // 4. Ensure declared prerequisites.
        let prerequisites = self
            .ensure_prerequisites(tool, &args, account, cancel, discover_first)
            .await?;

        // 5. Response cache.
        let cache_key = tool
            .spec
            .cacheable
            .then(|| CacheKey::tool(&tool.spec.name, &Value::Object(args.clone())));
        if let Some(ref key) = cache_key {
            if let Some(hit) = self.state.cache().get(key).await? {
                if let Some(result) = decode_cached(hit) {
                    return Ok(result);
                }
            }
        }

        // 6. Admission and concurrency slots.
        let _admission = self.admission.clone().try_acquire_owned().map_err(|_| {
            metrics::counter!(telemetry::QUEUE_OVERFLOWS_TOTAL, "tool" => call.name.clone())
                .increment(1);
            warn!(tool = %call.name, "bounded queue overflow");
            HuginnError::RateLimited { retry_after: None }
        })?;
        let per_tool = self
            .per_tool
            .get(&tool.spec.name)
            .cloned()
            .unwrap_or_else(|| Arc::new(Semaphore::new(self.limits.per_tool_concurrency)));
        let _tool_permit = tokio::select! {
            _ = cancel.cancelled() => return Err(HuginnError::Cancelled),
            permit = per_tool.acquire_owned() => {
                permit.map_err(|_| HuginnError::Internal("tool semaphore closed".into()))?
            }
        };
        let _global_permit = tokio::select! {
            _ = cancel.cancelled() => return Err(HuginnError::Cancelled),
            permit = self.global.clone().acquire_owned() => {
                permit.map_err(|_| HuginnError::Internal("global semaphore closed".into()))?
            }
        };

        // 7. Invoke, isolated, under a deadline.
        let timeout = call
            .timeout
            .unwrap_or(self.limits.default_timeout)
            .min(self.limits.timeout_ceiling);
        let min_confidence = prerequisites
            .iter()
            .map(|d| d.confidence)
            .fold(1.0_f64, f64::min);
        let ctx = ToolContext {
            engine: self.engine.clone(),
            state: self.state.clone(),
            backend: self.backend.clone(),
            builder: self.builder.clone(),
            validator: self.validator.clone(),
            account,
            session_id: call.session_id.clone(),
            cancel: cancel.child_token(),
            prerequisites: prerequisites.clone(),
            min_confidence: self.limits.min_confidence,
        };
        let handler = tool.handler.clone();
        let handler_cancel = ctx.cancel.clone();
        let task = tokio::spawn(async move { handler.handle(ctx, args).await });
        let abort_handle = task.abort_handle();

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                handler_cancel.cancel();
                abort_handle.abort();
                return Err(HuginnError::Cancelled);
            }
            joined = tokio::time::timeout(timeout, task) => match joined {
                Err(_) => {
                    handler_cancel.cancel();
                    return Err(HuginnError::Timeout(timeout));
                }
                Ok(Ok(result)) => result?,
                Ok(Err(join_err)) if join_err.is_panic() => {
                    self.panics.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(telemetry::HANDLER_PANICS_TOTAL).increment(1);
                    error!(tool = %call.name, "tool handler panicked: {join_err}");
                    return Err(HuginnError::Internal(format!(
                        "tool {} failed internally",
                        call.name
                    )));
                }
                Ok(Err(_)) => return Err(HuginnError::Cancelled),
            },
        };

        // 8. Annotate.
        let meta = ResponseMeta {
            discoveries_used: prerequisites.iter().map(DiscoveryResult::summary).collect(),
            query_adapted: output.query_adapted,
            min_confidence,
        };
        let result = DispatchResult {
            body: output.body,
            meta,
            cached: false,
        };

        // 9. Publish to the response cache — never for cancelled calls
        // (we would not be here) and only for opted-in tools.
        if let Some(key) = cache_key {
            let payload = encode_cached(&result);
            let ttl = self.engine.response_cache_ttl();
            if let Err(e) = self.state.cache().set(&key, payload, ttl).await {
                warn!(error = %e, "response cache write failed");
            }
        }

        Ok(result)
    }

    async fn ensure_prerequisites(
        &self,
        tool: &Tool,
        args: &Map<String, Value>,
        account: i64,
        cancel: &CancellationToken,
        discover_first: bool,
    ) -> Result<Vec<DiscoveryResult>> {
        let mut results = Vec::new();
        let mut weak = Vec::new();
        for prerequisite in &tool.spec.prerequisites {
            let scope = resolve_scope(prerequisite, args, account);
            let result = self.engine.ensure(cancel, prerequisite.kind, &scope).await?;
            if result.confidence < self.limits.min_confidence {
                weak.push(prerequisite.describe());
            }
            results.push(result);
        }
        if !weak.is_empty() && discover_first {
            return Err(HuginnError::DiscoveryRequired { missing: weak });
        }
        Ok(results)
    }
}

/// Pull the reserved `discover_first` flag out of the arguments so tool
/// schemas stay closed. Defaults to true.
fn split_discover_first(arguments: Value) -> (Value, bool) {
    match arguments {
        Value::Object(mut map) => {
            let flag = map
                .remove("discover_first")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            (Value::Object(map), flag)
        }
        other => (other, true),
    }
}

/// Fill a prerequisite's scope template from the validated arguments.
/// `$name` references take the string value of that argument.
fn resolve_scope(
    prerequisite: &Prerequisite,
    args: &Map<String, Value>,
    account: i64,
) -> DiscoveryScope {
    let event_type = match prerequisite.event_type.as_deref() {
        Some(template) => match template.strip_prefix('$') {
            Some(param) => args.get(param).and_then(Value::as_str).map(str::to_string),
            None => Some(template.to_string()),
        },
        None => None,
    };
    DiscoveryScope {
        account,
        event_type,
        since_minutes: None,
    }
}

fn encode_cached(result: &DispatchResult) -> Value {
    json!({
        "body": result.body,
        "meta": result.meta.to_json(),
    })
}

fn decode_cached(value: Value) -> Option<DispatchResult> {
    let body = value.get("body")?.clone();
    let meta = value.get("meta")?;
    Some(DispatchResult {
        body,
        meta: ResponseMeta {
            discoveries_used: meta.get("discoveries_used")?.as_array()?.clone(),
            query_adapted: meta.get("query_adapted")?.as_bool()?,
            min_confidence: meta.get("min_confidence")?.as_f64()?,
        },
        cached: true,
    })
}
