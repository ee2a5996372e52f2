mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use common::{MockBackend, harness, harness_with};
use huginn::protocol::JsonRpcResponse;
use huginn::tools::{DispatchLimits, Tool, ToolContext, ToolHandler, ToolOutput, ToolRegistry};
use huginn::transport::framed::{FramedTransport, read_frame, write_frame};
use huginn::types::ToolSpec;
use huginn::{HuginnError, Result};

async fn read_response<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> JsonRpcResponse {
    let raw = tokio::time::timeout(Duration::from_secs(2), read_frame(reader))
        .await
        .expect("response timed out")
        .unwrap()
        .expect("stream closed early");
    serde_json::from_str(&raw).expect("response was not JSON-RPC")
}

#[tokio::test]
async fn requests_and_responses_flow_over_frames() {
    let stack = harness(Arc::new(MockBackend::default()));
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let (mut client_read, mut client_write) = tokio::io::split(client);

    let shutdown = CancellationToken::new();
    let serve = tokio::spawn(FramedTransport::serve_stream(
        stack.protocol.clone(),
        server_read,
        server_write,
        shutdown.clone(),
    ));

    write_frame(
        &mut client_write,
        &json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"clientInfo": {"name": "t", "version": "0"}},
        })
        .to_string(),
    )
    .await
    .unwrap();
    let init = read_response(&mut client_read).await;
    assert!(init.result.unwrap()["serverInfo"]["name"] == "huginn");

    write_frame(
        &mut client_write,
        &json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}).to_string(),
    )
    .await
    .unwrap();
    let tools = read_response(&mut client_read).await;
    assert!(
        tools.result.unwrap()["tools"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["name"] == "query_nrdb")
    );

    // Notifications produce no frame; the next response is for id 3.
    write_frame(
        &mut client_write,
        &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string(),
    )
    .await
    .unwrap();
    write_frame(
        &mut client_write,
        &json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}).to_string(),
    )
    .await
    .unwrap();
    let pong = read_response(&mut client_read).await;
    assert_eq!(
        pong.id,
        Some(huginn::protocol::RequestId::Number(3))
    );

    drop(client_write);
    drop(client_read);
    tokio::time::timeout(Duration::from_secs(2), serve)
        .await
        .expect("serve did not end on EOF")
        .unwrap()
        .unwrap();
}

/// Sleeps a long time; completes only if cancellation never arrives.
struct HangingTool {
    started: Arc<std::sync::atomic::AtomicU32>,
    completed: Arc<std::sync::atomic::AtomicU32>,
}

#[async_trait]
impl ToolHandler for HangingTool {
    async fn handle(&self, ctx: ToolContext, _args: Map<String, Value>) -> Result<ToolOutput> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(HuginnError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::json(json!({"done": true})))
    }
}

#[tokio::test]
async fn closing_the_connection_cancels_in_flight_requests() {
    let started = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let completed = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let mut tools = huginn::tools::handlers::builtin_tools();
    tools.push(Tool {
        spec: ToolSpec::new("hanging_tool", "waits for cancellation"),
        handler: Arc::new(HangingTool {
            started: started.clone(),
            completed: completed.clone(),
        }),
    });
    let stack = harness_with(
        Arc::new(MockBackend::default()),
        ToolRegistry::with_tools(tools),
        DispatchLimits::default(),
    );

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let (client_read, mut client_write) = tokio::io::split(client);

    let shutdown = CancellationToken::new();
    let serve = tokio::spawn(FramedTransport::serve_stream(
        stack.protocol.clone(),
        server_read,
        server_write,
        shutdown.clone(),
    ));

    write_frame(
        &mut client_write,
        &json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": "hanging_tool", "arguments": {}},
        })
        .to_string(),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    // Close the connection: within the bounded interval the handler
    // observes cancellation and nothing completes.
    drop(client_write);
    drop(client_read);
    tokio::time::timeout(Duration::from_secs(1), serve)
        .await
        .expect("serve hung after close")
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shutdown_token_stops_the_transport() {
    let stack = harness(Arc::new(MockBackend::default()));
    let (client, server) = tokio::io::duplex(1024);
    let (server_read, server_write) = tokio::io::split(server);

    let shutdown = CancellationToken::new();
    let serve = tokio::spawn(FramedTransport::serve_stream(
        stack.protocol.clone(),
        server_read,
        server_write,
        shutdown.clone(),
    ));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), serve)
        .await
        .expect("serve ignored shutdown")
        .unwrap()
        .unwrap();
    drop(client);
}
