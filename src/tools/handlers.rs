//! Built-in tool implementations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};

use super::{Tool, ToolContext, ToolHandler, ToolOutput};
use crate::backend::MAX_TIMEOUT;
use crate::builder::{BuildOutcome, Discoveries, QueryIntent, QueryScope};
use crate::types::{
    DiscoveryHints, DiscoveryKind, DiscoveryScope, ParamSchema, ParamSpec, ParamType,
    Prerequisite, ProfileDepth, QueryRecord, Schema, SchemaFilter, ToolSpec,
};
use crate::{HuginnError, Result};

/// The complete built-in tool table.
pub fn builtin_tools() -> Vec<Tool> {
    vec![
        query_nrdb(),
        list_schemas(),
        profile_schema(),
        discover_schemas(),
        find_relationships(),
        assess_quality(),
        build_query(),
        session_info(),
    ]
}

fn arg_str<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

fn arg_u64(args: &Map<String, Value>, name: &str) -> Option<u64> {
    args.get(name).and_then(Value::as_u64)
}

fn required_str<'a>(args: &'a Map<String, Value>, name: &str) -> Result<&'a str> {
    arg_str(args, name)
        .ok_or_else(|| HuginnError::Internal(format!("validated parameter {name} missing")))
}

/// Append a query-history entry to the bound session, if any.
async fn record_history(
    ctx: &ToolContext,
    query: &str,
    started: Instant,
    digest: String,
    error: Option<String>,
) {
    let Some(ref id) = ctx.session_id else { return };
    if let Ok(mut session) = ctx.state.touch_session(id).await {
        session.record_query(QueryRecord {
            query: query.to_string(),
            at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            result_digest: digest,
            error,
        });
        let _ = ctx.state.sessions().update(session).await;
    }
}

/// Stash profiled schemas in the session's arena.
async fn remember_schemas(ctx: &ToolContext, schemas: &[Schema]) {
    let Some(ref id) = ctx.session_id else { return };
    if let Ok(mut session) = ctx.state.touch_session(id).await {
        for schema in schemas {
            session.remember_schema(schema.clone());
        }
        let _ = ctx.state.sessions().update(session).await;
    }
}

// ---------------------------------------------------------------------------
// query_nrdb
// ---------------------------------------------------------------------------

struct QueryNrdb;

#[async_trait]
impl ToolHandler for QueryNrdb {
    async fn handle(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<ToolOutput> {
        let statement = required_str(&args, "query")?;
        let canonical = ctx.validator.validate(statement)?;
        let timeout = arg_u64(&args, "timeout_secs")
            .map(Duration::from_secs)
            .unwrap_or(crate::backend::DEFAULT_TIMEOUT)
            .min(MAX_TIMEOUT);

        let started = Instant::now();
        let outcome = ctx
            .backend
            .querylang(&ctx.cancel, canonical.as_str(), ctx.account, timeout)
            .await;

        match outcome {
            Ok(result) => {
                record_history(
                    &ctx,
                    canonical.as_str(),
                    started,
                    format!("rows={}", result.rows.len()),
                    None,
                )
                .await;
                Ok(ToolOutput::json(json!({
                    "rows": result.rows,
                    "row_count": result.rows.len(),
                    "metadata": result.metadata,
                    "elapsed_ms": result.elapsed.as_millis() as u64,
                })))
            }
            Err(e) => {
                record_history(&ctx, canonical.as_str(), started, String::new(), Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }
}

fn query_nrdb() -> Tool {
    Tool {
        spec: ToolSpec::new(
            "query_nrdb",
            "Run a read-only query-language statement against the account's telemetry store.",
        )
        .params(
            ParamSchema::new()
                .property(
                    "query",
                    ParamSpec::string("The query-language statement to execute").required(),
                )
                .property(
                    "timeout_secs",
                    ParamSpec::of(ParamType::Integer, "Per-query timeout in seconds (max 60)"),
                ),
        )
        .cacheable()
        .example(json!({"query": "SELECT count(*) FROM Transaction SINCE 1 hour ago"})),
        handler: Arc::new(QueryNrdb),
    }
}

// ---------------------------------------------------------------------------
// list_schemas
// ---------------------------------------------------------------------------

struct ListSchemas;

#[async_trait]
impl ToolHandler for ListSchemas {
    async fn handle(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<ToolOutput> {
        let filter = SchemaFilter {
            pattern: arg_str(&args, "pattern").map(str::to_string),
            min_record_count: arg_u64(&args, "min_record_count").unwrap_or(0),
            max_results: arg_u64(&args, "max_results").unwrap_or(50) as usize,
        };
        let listing = ctx
            .engine
            .list_schemas(&ctx.cancel, ctx.account, &filter)
            .await?;
        Ok(ToolOutput::json(serde_json::to_value(&listing)?))
    }
}

fn list_schemas() -> Tool {
    Tool {
        spec: ToolSpec::new(
            "list_schemas",
            "List event types present in the account, with record-count estimates.",
        )
        .params(
            ParamSchema::new()
                .property(
                    "pattern",
                    ParamSpec::string("Substring or *-glob filter on event type names"),
                )
                .property(
                    "min_record_count",
                    ParamSpec::of(ParamType::Integer, "Drop event types with fewer records")
                        .default_value(json!(0)),
                )
                .property(
                    "max_results",
                    ParamSpec::of(ParamType::Integer, "Upper bound on returned entries")
                        .default_value(json!(50)),
                ),
        )
        .cacheable()
        .example(json!({})),
        handler: Arc::new(ListSchemas),
    }
}

// ---------------------------------------------------------------------------
// profile_schema
// ---------------------------------------------------------------------------

struct ProfileSchema;

#[async_trait]
impl ToolHandler for ProfileSchema {
    async fn handle(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<ToolOutput> {
        let event_type = required_str(&args, "event_type")?;
        let depth = match arg_str(&args, "depth").unwrap_or("standard") {
            "basic" => ProfileDepth::Basic,
            "full" => ProfileDepth::Full,
            _ => ProfileDepth::Standard,
        };
        let schema = ctx
            .engine
            .profile_schema(&ctx.cancel, ctx.account, event_type, depth)
            .await?;
        remember_schemas(&ctx, std::slice::from_ref(&schema)).await;
        Ok(ToolOutput::json(serde_json::to_value(&schema)?))
    }
}

fn profile_schema() -> Tool {
    Tool {
        spec: ToolSpec::new(
            "profile_schema",
            "Profile one event type: attributes, types, semantics, and (at full depth) quality.",
        )
        .params(
            ParamSchema::new()
                .property(
                    "event_type",
                    ParamSpec::string("Event type to profile").required(),
                )
                .property(
                    "depth",
                    ParamSpec::string("Profiling depth")
                        .one_of(&["basic", "standard", "full"])
                        .default_value(json!("standard")),
                ),
        )
        .cacheable()
        .example(json!({"event_type": "Transaction", "depth": "standard"})),
        handler: Arc::new(ProfileSchema),
    }
}

// ---------------------------------------------------------------------------
// discover_schemas
// ---------------------------------------------------------------------------

struct DiscoverSchemas;

#[async_trait]
impl ToolHandler for DiscoverSchemas {
    async fn handle(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<ToolOutput> {
        let to_strings = |v: Option<&Value>| -> Vec<String> {
            v.and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let hints = DiscoveryHints {
            keywords: to_strings(args.get("keywords")),
            preferred_event_types: to_strings(args.get("preferred_event_types")),
            purpose: arg_str(&args, "purpose").map(str::to_string),
            max_schemas: arg_u64(&args, "max_schemas").map(|n| n as usize),
        };
        let schemas = ctx.engine.discover(&ctx.cancel, ctx.account, &hints).await?;
        remember_schemas(&ctx, &schemas).await;

        // Account context rides along; a metadata hiccup never fails the
        // discovery itself.
        let account = match ctx.backend.account_info(&ctx.cancel, ctx.account).await {
            Ok(meta) => json!({"id": meta.id, "name": meta.name, "region": meta.region}),
            Err(_) => json!({"id": ctx.account}),
        };

        let count = schemas.len();
        Ok(ToolOutput::json(json!({
            "account": account,
            "schemas": schemas,
            "count": count,
        })))
    }
}

fn discover_schemas() -> Tool {
    Tool {
        spec: ToolSpec::new(
            "discover_schemas",
            "Find and profile the event types most relevant to a goal, guided by keywords.",
        )
        .params(
            ParamSchema::new()
                .property(
                    "keywords",
                    ParamSpec::of(ParamType::Array, "Keywords matched against event type names"),
                )
                .property(
                    "preferred_event_types",
                    ParamSpec::of(ParamType::Array, "Event types to rank first"),
                )
                .property(
                    "purpose",
                    ParamSpec::string("What you are investigating, in a phrase"),
                )
                .property(
                    "max_schemas",
                    ParamSpec::of(ParamType::Integer, "Upper bound on profiled schemas")
                        .default_value(json!(5)),
                ),
        )
        .cacheable()
        .example(json!({"keywords": ["error", "transaction"], "purpose": "find slow checkouts"})),
        handler: Arc::new(DiscoverSchemas),
    }
}

// ---------------------------------------------------------------------------
// find_relationships
// ---------------------------------------------------------------------------

struct FindRelationships;

#[async_trait]
impl ToolHandler for FindRelationships {
    async fn handle(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<ToolOutput> {
        let names: Vec<String> = args
            .get("event_types")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if names.len() < 2 {
            return Err(HuginnError::invalid_param(
                "arguments.event_types",
                "need at least two event types",
            ));
        }

        // Reuse schemas the session already profiled; profile the rest.
        let mut known = std::collections::BTreeMap::new();
        if let Some(ref id) = ctx.session_id {
            if let Ok(session) = ctx.state.touch_session(id).await {
                known = session.schemas;
            }
        }
        let mut schemas = Vec::new();
        for name in &names {
            match known.remove(name) {
                Some(schema) => schemas.push(schema),
                None => {
                    schemas.push(
                        ctx.engine
                            .profile_schema(&ctx.cancel, ctx.account, name, ProfileDepth::Standard)
                            .await?,
                    );
                }
            }
        }
        remember_schemas(&ctx, &schemas).await;

        let relationships = ctx
            .engine
            .find_relationships(&ctx.cancel, ctx.account, &schemas)
            .await?;
        let count = relationships.len();
        Ok(ToolOutput::json(json!({
            "relationships": relationships,
            "count": count,
        })))
    }
}

fn find_relationships() -> Tool {
    Tool {
        spec: ToolSpec::new(
            "find_relationships",
            "Discover join, hierarchy, and temporal relationships between event types.",
        )
        .params(ParamSchema::new().property(
            "event_types",
            ParamSpec::of(ParamType::Array, "Event types to relate (two or more)").required(),
        ))
        .cacheable()
        .example(json!({"event_types": ["Transaction", "TransactionError"]})),
        handler: Arc::new(FindRelationships),
    }
}

// ---------------------------------------------------------------------------
// assess_quality
// ---------------------------------------------------------------------------

struct AssessQuality;

#[async_trait]
impl ToolHandler for AssessQuality {
    async fn handle(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<ToolOutput> {
        let event_type = required_str(&args, "event_type")?;
        let report = ctx
            .engine
            .assess_quality(&ctx.cancel, ctx.account, event_type)
            .await?;
        Ok(ToolOutput::json(serde_json::to_value(&report)?))
    }
}

fn assess_quality() -> Tool {
    Tool {
        spec: ToolSpec::new(
            "assess_quality",
            "Score an event type on completeness, consistency, timeliness, uniqueness, validity.",
        )
        .params(ParamSchema::new().property(
            "event_type",
            ParamSpec::string("Event type to assess").required(),
        ))
        .cacheable()
        .example(json!({"event_type": "Transaction"})),
        handler: Arc::new(AssessQuality),
    }
}

// ---------------------------------------------------------------------------
// build_query
// ---------------------------------------------------------------------------

struct BuildQuery;

#[async_trait]
impl ToolHandler for BuildQuery {
    async fn handle(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<ToolOutput> {
        let intent_name = required_str(&args, "intent")?;
        let intent = QueryIntent::parse(intent_name).ok_or_else(|| {
            HuginnError::invalid_param("arguments.intent", format!("unknown intent {intent_name}"))
        })?;
        let min_confidence = args
            .get("min_confidence")
            .and_then(Value::as_f64)
            .unwrap_or(ctx.min_confidence);

        let scope = QueryScope {
            event_type: arg_str(&args, "event_type").map(str::to_string),
            selector: arg_str(&args, "selector").map(str::to_string),
            facet: arg_str(&args, "facet").map(str::to_string),
            window_minutes: arg_u64(&args, "window_minutes").unwrap_or(0) as u32,
            top_n: arg_u64(&args, "top_n").unwrap_or(0) as usize,
        };

        // Ensure the intent's discoveries on top of the declared ones.
        let mut discoveries = ctx.prerequisites.clone();
        let discovery_scope = DiscoveryScope {
            account: ctx.account,
            event_type: scope.event_type.clone(),
            since_minutes: None,
        };
        for kind in intent.prerequisites() {
            if discoveries.iter().any(|d| d.kind == *kind) {
                continue;
            }
            discoveries.push(ctx.engine.ensure(&ctx.cancel, *kind, &discovery_scope).await?);
        }
        if scope.facet.is_some()
            && !discoveries
                .iter()
                .any(|d| d.kind == DiscoveryKind::AttributeProfile)
        {
            discoveries.push(
                ctx.engine
                    .ensure(&ctx.cancel, DiscoveryKind::AttributeProfile, &discovery_scope)
                    .await?,
            );
        }

        let outcome =
            ctx.builder
                .build(intent, &scope, &Discoveries(&discoveries), min_confidence)?;
        let (query, used) = match outcome {
            BuildOutcome::Built { query, used } => (query, used),
            BuildOutcome::NeedsDiscovery { missing } => {
                return Err(HuginnError::DiscoveryRequired { missing });
            }
        };

        if args.get("execute").and_then(Value::as_bool).unwrap_or(false) {
            let started = Instant::now();
            let result = ctx
                .backend
                .querylang(
                    &ctx.cancel,
                    query.as_str(),
                    ctx.account,
                    crate::backend::DEFAULT_TIMEOUT,
                )
                .await;
            match result {
                Ok(rows) => {
                    record_history(
                        &ctx,
                        query.as_str(),
                        started,
                        format!("rows={}", rows.rows.len()),
                        None,
                    )
                    .await;
                    return Ok(ToolOutput::adapted(json!({
                        "query": query.as_str(),
                        "intent": intent.as_str(),
                        "rows": rows.rows,
                        "row_count": rows.rows.len(),
                        "discoveries": used,
                    })));
                }
                Err(e) => {
                    record_history(&ctx, query.as_str(), started, String::new(), Some(e.to_string()))
                        .await;
                    return Err(e);
                }
            }
        }

        Ok(ToolOutput::adapted(json!({
            "query": query.as_str(),
            "intent": intent.as_str(),
            "discoveries": used,
        })))
    }
}

fn build_query() -> Tool {
    Tool {
        spec: ToolSpec::new(
            "build_query",
            "Compose a query from an intent and discovered fields; optionally execute it.",
        )
        .params(
            ParamSchema::new()
                .property(
                    "intent",
                    ParamSpec::string("What the query should measure")
                        .one_of(QueryIntent::ALL)
                        .required(),
                )
                .property(
                    "selector",
                    ParamSpec::string("Value of the discovered service field to filter on"),
                )
                .property("event_type", ParamSpec::string("Event type override"))
                .property(
                    "facet",
                    ParamSpec::string("Dimension for top_n; must be a discovered attribute"),
                )
                .property(
                    "window_minutes",
                    ParamSpec::of(ParamType::Integer, "Lookback window in minutes")
                        .default_value(json!(60)),
                )
                .property(
                    "top_n",
                    ParamSpec::of(ParamType::Integer, "Row cap for faceted intents")
                        .default_value(json!(10)),
                )
                .property(
                    "min_confidence",
                    ParamSpec::of(ParamType::Number, "Confidence floor for used discoveries"),
                )
                .property(
                    "execute",
                    ParamSpec::of(ParamType::Boolean, "Run the built query too")
                        .default_value(json!(false)),
                ),
        )
        .prerequisite(Prerequisite {
            kind: DiscoveryKind::ServiceIdentifier,
            event_type: Some("$event_type".to_string()),
        })
        .example(json!({"intent": "error_rate", "selector": "checkout-service"})),
        handler: Arc::new(BuildQuery),
    }
}

// ---------------------------------------------------------------------------
// session_info
// ---------------------------------------------------------------------------

struct SessionInfo;

#[async_trait]
impl ToolHandler for SessionInfo {
    async fn handle(&self, ctx: ToolContext, _args: Map<String, Value>) -> Result<ToolOutput> {
        let Some(ref id) = ctx.session_id else {
            return Ok(ToolOutput::json(json!({
                "session": Value::Null,
                "guidance": "no session bound to this call; pass a session id to keep \
                             discoveries and history across calls",
            })));
        };
        let session = ctx.state.touch_session(id).await?;
        Ok(ToolOutput::json(json!({
            "session": {
                "id": session.id,
                "goal": session.goal,
                "created_at": session.created_at,
                "last_access": session.last_access,
                "schemas": session.schemas.keys().collect::<Vec<_>>(),
                "history": session.history,
            },
        })))
    }
}

fn session_info() -> Tool {
    Tool {
        spec: ToolSpec::new(
            "session_info",
            "Show the bound session: goal, profiled schemas, bounded query history.",
        )
        .example(json!({})),
        handler: Arc::new(SessionInfo),
    }
}
