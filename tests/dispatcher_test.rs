mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use common::{MockBackend, harness, harness_with};
use huginn::tools::{
    DispatchLimits, Tool, ToolCall, ToolContext, ToolHandler, ToolOutput, ToolRegistry,
};
use huginn::types::{DiscoveryKind, ParamSchema, ParamSpec, Prerequisite, ToolSpec};
use huginn::{HuginnError, Result};

/// Tool that sleeps, counting starts and completions.
struct SlowTool {
    started: Arc<AtomicU32>,
    completed: Arc<AtomicU32>,
    delay: Duration,
}

#[async_trait]
impl ToolHandler for SlowTool {
    async fn handle(&self, ctx: ToolContext, _args: Map<String, Value>) -> Result<ToolOutput> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(HuginnError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::json(json!({"slept": true})))
    }
}

fn slow_tool(delay: Duration) -> (Tool, Arc<AtomicU32>, Arc<AtomicU32>) {
    let started = Arc::new(AtomicU32::new(0));
    let completed = Arc::new(AtomicU32::new(0));
    let tool = Tool {
        spec: ToolSpec::new("slow_tool", "sleeps for a while"),
        handler: Arc::new(SlowTool {
            started: started.clone(),
            completed: completed.clone(),
            delay,
        }),
    };
    (tool, started, completed)
}

struct PanickingTool;

#[async_trait]
impl ToolHandler for PanickingTool {
    async fn handle(&self, _ctx: ToolContext, _args: Map<String, Value>) -> Result<ToolOutput> {
        panic!("handler blew up");
    }
}

/// Tool with a prerequisite scoped to an empty event type, so the chain
/// always comes back with zero confidence.
struct NeedyTool;

#[async_trait]
impl ToolHandler for NeedyTool {
    async fn handle(&self, ctx: ToolContext, _args: Map<String, Value>) -> Result<ToolOutput> {
        Ok(ToolOutput::json(json!({
            "prerequisites_seen": ctx.prerequisites.len(),
        })))
    }
}

fn needy_tool() -> Tool {
    Tool {
        spec: ToolSpec::new("needy_tool", "requires a service identifier")
            .params(ParamSchema::new().property("why", ParamSpec::string("unused")))
            .prerequisite(Prerequisite::scoped(
                DiscoveryKind::ServiceIdentifier,
                "EmptyType",
            )),
        handler: Arc::new(NeedyTool),
    }
}

fn registry_with(extra: Vec<Tool>) -> ToolRegistry {
    let mut tools = huginn::tools::handlers::builtin_tools();
    tools.extend(extra);
    ToolRegistry::with_tools(tools)
}

#[tokio::test]
async fn unknown_tool_is_not_found() {
    let stack = harness(Arc::new(MockBackend::default()));
    let cancel = CancellationToken::new();
    let err = stack
        .dispatcher
        .dispatch(ToolCall::new("no_such_tool", json!({})), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, HuginnError::NotFound(_)));
    assert_eq!(err.jsonrpc_code(), -32601);
}

#[tokio::test]
async fn invalid_params_carry_the_field_path() {
    let stack = harness(Arc::new(MockBackend::default()));
    let cancel = CancellationToken::new();
    let err = stack
        .dispatcher
        .dispatch(ToolCall::new("query_nrdb", json!({"query": 5})), &cancel)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("arguments.query"));
    assert_eq!(err.jsonrpc_code(), -32602);
}

#[tokio::test]
async fn weak_prerequisite_yields_discovery_required() {
    let stack = harness_with(
        Arc::new(MockBackend::default()),
        registry_with(vec![needy_tool()]),
        DispatchLimits::default(),
    );
    let cancel = CancellationToken::new();
    let err = stack
        .dispatcher
        .dispatch(ToolCall::new("needy_tool", json!({})), &cancel)
        .await
        .unwrap_err();
    let HuginnError::DiscoveryRequired { missing } = err else {
        panic!("expected DiscoveryRequired, got {err:?}");
    };
    assert!(missing[0].contains("service-identifier"));
}

#[tokio::test]
async fn discover_first_false_bypasses_the_gate() {
    let stack = harness_with(
        Arc::new(MockBackend::default()),
        registry_with(vec![needy_tool()]),
        DispatchLimits::default(),
    );
    let cancel = CancellationToken::new();
    let result = stack
        .dispatcher
        .dispatch(
            ToolCall::new("needy_tool", json!({"discover_first": false})),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(result.body["prerequisites_seen"], 1);
    // The weak discovery still annotates the response.
    assert_eq!(result.meta.min_confidence, 0.0);
    assert_eq!(result.meta.discoveries_used.len(), 1);
}

#[tokio::test]
async fn handler_panic_is_contained() {
    let panicking = Tool {
        spec: ToolSpec::new("panicking_tool", "always panics"),
        handler: Arc::new(PanickingTool),
    };
    let stack = harness_with(
        Arc::new(MockBackend::default()),
        registry_with(vec![panicking]),
        DispatchLimits::default(),
    );
    let cancel = CancellationToken::new();

    let err = stack
        .dispatcher
        .dispatch(ToolCall::new("panicking_tool", json!({})), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, HuginnError::Internal(_)));
    assert_eq!(stack.dispatcher.panic_count(), 1);

    // The process survived; other tools still dispatch.
    let ok = stack
        .dispatcher
        .dispatch(
            ToolCall::new("query_nrdb", json!({"query": "SELECT count(*) FROM Transaction"})),
            &cancel,
        )
        .await;
    assert!(ok.is_ok());
}

#[tokio::test]
async fn queue_overflow_is_rate_limited() {
    let (tool, _started, _completed) = slow_tool(Duration::from_millis(500));
    let stack = harness_with(
        Arc::new(MockBackend::default()),
        registry_with(vec![tool]),
        DispatchLimits {
            global_concurrency: 1,
            queue_depth: 0,
            ..Default::default()
        },
    );
    let dispatcher = stack.dispatcher.clone();

    let first = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            dispatcher
                .dispatch(ToolCall::new("slow_tool", json!({})), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancel = CancellationToken::new();
    let err = dispatcher
        .dispatch(ToolCall::new("slow_tool", json!({})), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, HuginnError::RateLimited { .. }));

    assert!(first.await.unwrap().is_ok());
}

#[tokio::test]
async fn cancellation_reaches_the_handler_quickly() {
    let (tool, started, completed) = slow_tool(Duration::from_secs(30));
    let stack = harness_with(
        Arc::new(MockBackend::default()),
        registry_with(vec![tool]),
        DispatchLimits::default(),
    );
    let dispatcher = stack.dispatcher.clone();
    let cancel = CancellationToken::new();

    let task = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch(ToolCall::new("slow_tool", json!({})), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_millis(100), task)
        .await
        .expect("cancellation not observed within 100ms")
        .unwrap();
    assert!(matches!(result, Err(HuginnError::Cancelled)));
    assert_eq!(completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn timeout_converts_to_timeout_error() {
    let (tool, _started, completed) = slow_tool(Duration::from_secs(30));
    let stack = harness_with(
        Arc::new(MockBackend::default()),
        registry_with(vec![tool]),
        DispatchLimits::default(),
    );
    let cancel = CancellationToken::new();

    let mut call = ToolCall::new("slow_tool", json!({}));
    call.timeout = Some(Duration::from_millis(50));
    let err = stack.dispatcher.dispatch(call, &cancel).await.unwrap_err();
    assert!(matches!(err, HuginnError::Timeout(_)));
    assert_eq!(completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cacheable_results_come_back_cached() {
    let backend = Arc::new(MockBackend::default());
    let stack = harness(backend.clone());
    let cancel = CancellationToken::new();
    let call = ToolCall::new("list_schemas", json!({}));

    let first = stack.dispatcher.dispatch(call.clone(), &cancel).await.unwrap();
    assert!(!first.cached);
    let calls_after_first = backend.calls();

    let second = stack.dispatcher.dispatch(call, &cancel).await.unwrap();
    assert!(second.cached);
    assert_eq!(backend.calls(), calls_after_first);
    assert_eq!(second.body, first.body);
}

#[tokio::test]
async fn build_query_is_annotated_as_adapted() {
    let stack = harness(Arc::new(MockBackend::default()));
    let cancel = CancellationToken::new();

    let result = stack
        .dispatcher
        .dispatch(
            ToolCall::new(
                "build_query",
                json!({"intent": "throughput", "selector": "checkout"}),
            ),
            &cancel,
        )
        .await
        .unwrap();

    assert!(result.meta.query_adapted);
    assert!(result.meta.min_confidence >= 0.95);
    assert!(!result.meta.discoveries_used.is_empty());
    let query = result.body["query"].as_str().unwrap();
    assert!(query.contains("appName = 'checkout'"));
}

#[tokio::test]
async fn concurrent_identical_calls_share_prerequisite_chains() {
    let backend = Arc::new(MockBackend::default());
    let stack = harness(backend.clone());
    let dispatcher = stack.dispatcher.clone();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            dispatcher
                .dispatch(
                    ToolCall::new(
                        "build_query",
                        json!({"intent": "throughput", "selector": "checkout"}),
                    ),
                    &cancel,
                )
                .await
                .unwrap()
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap();
        ids.push(result.meta.discoveries_used[0]["id"].as_str().unwrap().to_string());
    }
    // Every response used the same discovery record.
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
}
