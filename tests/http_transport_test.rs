mod common;

use std::sync::Arc;

use serde_json::{Value, json};

use common::{MockBackend, harness};
use huginn::transport::http::{HttpTransport, SESSION_HEADER};

/// Bind the router on an ephemeral port, returning its base URL.
async fn spawn_server() -> String {
    let stack = harness(Arc::new(MockBackend::default()));
    let app = HttpTransport::router(stack.protocol.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    drop(stack);
    format!("http://{addr}")
}

#[tokio::test]
async fn post_round_trip_with_session_header() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/mcp"))
        .json(&json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list",
        }))
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    let session = response
        .headers()
        .get(SESSION_HEADER)
        .expect("session header missing")
        .to_str()
        .unwrap()
        .to_string();
    assert!(!session.is_empty());

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], 1);
    assert!(
        body["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["name"] == "list_schemas")
    );
}

#[tokio::test]
async fn provided_session_id_is_echoed() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/mcp"))
        .header(SESSION_HEADER, "session-abc")
        .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
        .send()
        .await
        .unwrap();

    assert_eq!(
        response.headers().get(SESSION_HEADER).unwrap(),
        "session-abc"
    );
}

#[tokio::test]
async fn notifications_return_no_content() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/mcp"))
        .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn tool_errors_travel_as_jsonrpc_errors() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/mcp"))
        .json(&json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {
                "name": "query_nrdb",
                "arguments": {"query": "DROP TABLE users"},
            },
        }))
        .send()
        .await
        .unwrap();

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -40004);
    assert_eq!(body["id"], 3);
}

#[tokio::test]
async fn malformed_json_is_a_parse_error() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/mcp"))
        .header("content-type", "application/json")
        .body("{broken")
        .send()
        .await
        .unwrap();
    // axum rejects undecodable JSON before the handler runs.
    assert!(response.status().is_client_error());
}
