mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use common::{MockBackend, harness};
use huginn::protocol::{JsonRpcRequest, RequestId};

fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: Some(RequestId::Number(id)),
        method: method.to_string(),
        params: Some(params),
    }
}

fn notification(method: &str, params: Option<Value>) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: None,
        method: method.to_string(),
        params,
    }
}

#[tokio::test]
async fn initialize_reports_server_and_session() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    let response = connection
        .handle(request(
            1,
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "1.0"},
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.id, Some(RequestId::Number(1)));
    let result = response.result.unwrap();
    assert_eq!(result["serverInfo"]["name"], "huginn");
    assert!(result["sessionId"].is_string());
    assert_eq!(connection.session_id().unwrap(), result["sessionId"]);
}

#[tokio::test]
async fn tools_list_includes_query_nrdb_with_required_query() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    let response = connection
        .handle(request(2, "tools/list", json!({})))
        .await
        .unwrap();
    let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();

    let query_nrdb = tools
        .iter()
        .find(|t| t["name"] == "query_nrdb")
        .expect("query_nrdb registered");
    assert_eq!(query_nrdb["inputSchema"]["properties"]["query"]["type"], "string");
    assert!(
        query_nrdb["inputSchema"]["required"]
            .as_array()
            .unwrap()
            .contains(&json!("query"))
    );
}

#[tokio::test]
async fn injection_attempt_is_rejected_with_validation_code() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    let response = connection
        .handle(request(
            3,
            "tools/call",
            json!({
                "name": "query_nrdb",
                "arguments": {"query": "SELECT * FROM X; DROP TABLE Y; --"},
            }),
        ))
        .await
        .unwrap();

    let error = response.error.unwrap();
    assert_eq!(error.code, -40004);
    assert!(error.message.contains("multi-statement"));
}

#[tokio::test]
async fn tool_call_returns_content_and_meta() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    let response = connection
        .handle(request(
            4,
            "tools/call",
            json!({
                "name": "query_nrdb",
                "arguments": {"query": "SELECT count(*) FROM Transaction SINCE 1 hour ago"},
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.id, Some(RequestId::Number(4)));
    let result = response.result.unwrap();
    assert_eq!(result["content"][0]["type"], "text");
    let body: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(body["rows"][0]["count"], 1000.0);
    assert!(result["meta"]["min_confidence"].is_number());
    assert_eq!(result["meta"]["query_adapted"], false);
}

#[tokio::test]
async fn second_identical_call_is_a_fast_cache_hit() {
    let backend = Arc::new(MockBackend::default());
    let stack = harness(backend.clone());
    let connection = stack.protocol.connection();
    let params = json!({"name": "list_schemas", "arguments": {}});

    let first = connection
        .handle(request(5, "tools/call", params.clone()))
        .await
        .unwrap();
    assert_eq!(first.result.unwrap()["cached"], false);
    let calls_after_first = backend.calls();
    assert!(calls_after_first > 0);

    let started = Instant::now();
    let second = connection
        .handle(request(6, "tools/call", params))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(second.result.unwrap()["cached"], true);
    assert_eq!(backend.calls(), calls_after_first);
    assert!(elapsed < Duration::from_millis(20), "cache hit took {elapsed:?}");
}

#[tokio::test]
async fn notifications_never_get_responses() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    assert!(
        connection
            .handle(notification("notifications/initialized", None))
            .await
            .is_none()
    );
    // Unknown notification: still nothing.
    assert!(
        connection
            .handle(notification("something/else", None))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    let response = connection
        .handle(request(7, "tools/destroy", json!({})))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, -32601);
}

#[tokio::test]
async fn string_ids_are_echoed() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    let response = connection
        .handle(JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(RequestId::String("req-alpha".into())),
            method: "ping".to_string(),
            params: None,
        })
        .await
        .unwrap();
    assert_eq!(response.id, Some(RequestId::String("req-alpha".into())));
}

#[tokio::test]
async fn wrong_jsonrpc_version_is_invalid_request() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    let response = connection
        .handle(JsonRpcRequest {
            jsonrpc: "1.0".to_string(),
            id: Some(RequestId::Number(8)),
            method: "ping".to_string(),
            params: None,
        })
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, -32600);
}

#[tokio::test]
async fn parse_errors_surface_as_minus_32700() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    let response = connection.handle_raw("{not json").await.unwrap();
    assert_eq!(response.error.unwrap().code, -32700);
}

#[tokio::test]
async fn mcp_discover_exposes_prerequisites_and_examples() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    let response = connection
        .handle(request(9, "mcp.discover", json!({})))
        .await
        .unwrap();
    let result = response.result.unwrap();
    let tools = result["tools"].as_array().unwrap();

    let build_query = tools
        .iter()
        .find(|t| t["name"] == "build_query")
        .expect("build_query advertised");
    assert_eq!(build_query["readOnlyHint"], true);
    assert_eq!(
        build_query["prerequisites"][0]["kind"],
        "service-identifier"
    );
    let query_nrdb = tools.iter().find(|t| t["name"] == "query_nrdb").unwrap();
    assert!(!query_nrdb["examples"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn resources_round_trip() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    let listing = connection
        .handle(request(10, "resources/list", json!({})))
        .await
        .unwrap();
    let resources = listing.result.unwrap()["resources"].as_array().unwrap().clone();
    assert!(resources.iter().any(|r| r["uri"] == "huginn://health"));

    let read = connection
        .handle(request(11, "resources/read", json!({"uri": "huginn://health"})))
        .await
        .unwrap();
    let contents = read.result.unwrap()["contents"][0].clone();
    assert_eq!(contents["mimeType"], "application/json");
    let health: Value = serde_json::from_str(contents["text"].as_str().unwrap()).unwrap();
    assert_eq!(health["healthy"], true);

    let missing = connection
        .handle(request(12, "resources/read", json!({"uri": "huginn://nope"})))
        .await
        .unwrap();
    assert_eq!(missing.error.unwrap().code, -32601);
}

#[tokio::test]
async fn session_binds_across_calls_on_one_connection() {
    let stack = harness(Arc::new(MockBackend::default()));
    let connection = stack.protocol.connection();

    connection
        .handle(request(
            13,
            "initialize",
            json!({"clientInfo": {"name": "t", "version": "1"}, "goal": "hunt latency"}),
        ))
        .await
        .unwrap();

    let info = connection
        .handle(request(
            14,
            "tools/call",
            json!({"name": "session_info", "arguments": {}}),
        ))
        .await
        .unwrap();
    let body: Value = serde_json::from_str(
        info.result.unwrap()["content"][0]["text"].as_str().unwrap(),
    )
    .unwrap();
    assert_eq!(body["session"]["goal"], "hunt latency");
}
