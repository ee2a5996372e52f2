//! Transport-agnostic protocol handling.
//!
//! A [`ProtocolHandler`] is shared by every transport; each live
//! connection gets a [`Connection`] holding its cancellation scope, its
//! in-flight request table (for the `cancel` notification), and its bound
//! session. Transports feed raw JSON in and write whatever comes back —
//! the semantics are identical across stdio, HTTP, and SSE.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    ContentBlock, JSONRPC_VERSION, JsonRpcError, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
    RequestId, ResourceContents, methods,
};
use crate::tools::{Dispatcher, ToolCall};
use crate::HuginnError;

/// Protocol-level configuration.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub server_name: String,
    pub server_version: String,
    /// Ceiling on caller-supplied `timeout_ms` overrides.
    pub timeout_ceiling: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            server_name: "huginn".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            timeout_ceiling: Duration::from_secs(120),
        }
    }
}

/// The shared protocol handler.
pub struct ProtocolHandler {
    dispatcher: Arc<Dispatcher>,
    config: ProtocolConfig,
    root: CancellationToken,
}

impl ProtocolHandler {
    pub fn new(dispatcher: Arc<Dispatcher>, config: ProtocolConfig, root: CancellationToken) -> Self {
        Self {
            dispatcher,
            config,
            root,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Open a connection scope. Dropping or closing it cancels every
    /// request still in flight on that connection.
    pub fn connection(self: &Arc<Self>) -> Connection {
        Connection {
            protocol: self.clone(),
            cancel: self.root.child_token(),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            session: Arc::new(Mutex::new(None)),
        }
    }
}

/// Per-connection protocol state.
#[derive(Clone)]
pub struct Connection {
    protocol: Arc<ProtocolHandler>,
    cancel: CancellationToken,
    inflight: Arc<Mutex<HashMap<RequestId, CancellationToken>>>,
    /// Session bound to this connection (from initialize or headers).
    session: Arc<Mutex<Option<String>>>,
}

impl Connection {
    /// The connection's cancellation scope (child of the server root).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bind a session id (HTTP transports feed `X-Session-ID` through
    /// here).
    pub fn bind_session(&self, id: impl Into<String>) {
        *self.session.lock().expect("session lock poisoned") = Some(id.into());
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.lock().expect("session lock poisoned").clone()
    }

    /// Close the connection: cancels all in-flight requests within the
    /// bounded cancellation interval.
    pub fn close(&self) {
        self.cancel.cancel();
        let inflight = self.inflight.lock().expect("inflight lock poisoned");
        for token in inflight.values() {
            token.cancel();
        }
    }

    /// Handle one raw JSON message. `None` means no response is written
    /// (notification, or a request cancelled mid-flight).
    pub async fn handle_raw(&self, raw: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(raw) {
            Ok(req) => req,
            Err(e) => {
                return Some(JsonRpcResponse::failure(None, JsonRpcError::parse_error(e)));
            }
        };
        self.handle(request).await
    }

    /// Handle one decoded request.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.jsonrpc != JSONRPC_VERSION {
            if request.is_notification() {
                return None;
            }
            return Some(JsonRpcResponse::failure(
                request.id,
                JsonRpcError::invalid_request(format!(
                    "unsupported JSON-RPC version: {}",
                    request.jsonrpc
                )),
            ));
        }

        debug!(method = %request.method, notification = request.is_notification(), "request");

        match request.method.as_str() {
            methods::INITIALIZE => self.initialize(request).await,
            methods::INITIALIZED => None,
            methods::TOOLS_LIST => self.tools_list(request),
            methods::TOOLS_CALL => self.tools_call(request).await,
            methods::RESOURCES_LIST => self.resources_list(request),
            methods::RESOURCES_READ => self.resources_read(request),
            methods::DISCOVER => self.discover(request),
            methods::CANCEL => {
                self.cancel_request(request.params.as_ref());
                None
            }
            methods::PING => {
                if request.is_notification() {
                    None
                } else {
                    Some(JsonRpcResponse::success(request.id, json!({})))
                }
            }
            other => {
                if request.is_notification() {
                    return None;
                }
                Some(JsonRpcResponse::failure(
                    request.id,
                    JsonRpcError::method_not_found(other),
                ))
            }
        }
    }

    async fn initialize(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let params = request.params.unwrap_or(Value::Null);
        if let Some(client) = params.get("clientInfo") {
            info!(
                client = %client.get("name").and_then(|v| v.as_str()).unwrap_or("unknown"),
                version = %client.get("version").and_then(|v| v.as_str()).unwrap_or(""),
                "initialize"
            );
        }

        // Bind or create the session for this connection.
        let requested = params
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.session_id());
        let goal = params
            .get("goal")
            .and_then(Value::as_str)
            .map(str::to_string);
        let state = self.protocol.dispatcher.state().clone();
        let session_id = match state.session_or_create(requested.as_deref(), goal).await {
            Ok((session, _created)) => {
                self.bind_session(&session.id);
                Some(session.id)
            }
            Err(e) => {
                debug!(error = %e, "session setup failed during initialize");
                None
            }
        };

        let result = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": {},
            },
            "serverInfo": {
                "name": self.protocol.config.server_name,
                "version": self.protocol.config.server_version,
            },
            "sessionId": session_id,
        });
        Some(JsonRpcResponse::success(request.id, result))
    }

    fn tools_list(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let tools: Vec<Value> = self
            .protocol
            .dispatcher
            .registry()
            .list()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "description": spec.description,
                    "inputSchema": spec.params.to_json_schema(),
                })
            })
            .collect();
        Some(JsonRpcResponse::success(request.id, json!({ "tools": tools })))
    }

    async fn tools_call(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let params = match request.params {
            Some(p) => p,
            None => {
                return Some(JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(-32602, "missing tools/call params"),
                ));
            }
        };
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::new(-32602, "tools/call params need a tool name"),
            ));
        };

        let call = ToolCall {
            name: name.to_string(),
            arguments: params.get("arguments").cloned().unwrap_or(Value::Null),
            account: params.get("accountId").and_then(Value::as_i64),
            session_id: params
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| self.session_id()),
            timeout: params
                .get("timeoutMs")
                .and_then(Value::as_u64)
                .map(Duration::from_millis)
                .map(|t| t.min(self.protocol.config.timeout_ceiling)),
        };

        // Track in-flight for the cancel notification.
        let token = self.cancel.child_token();
        if let Some(ref id) = id {
            self.inflight
                .lock()
                .expect("inflight lock poisoned")
                .insert(id.clone(), token.clone());
        }
        let outcome = self.protocol.dispatcher.dispatch(call, &token).await;
        if let Some(ref id) = id {
            self.inflight
                .lock()
                .expect("inflight lock poisoned")
                .remove(id);
        }

        match outcome {
            Ok(result) => {
                let text = serde_json::to_string(&result.body)
                    .unwrap_or_else(|_| "{}".to_string());
                let payload = json!({
                    "content": [ContentBlock::text(text)],
                    "meta": result.meta.to_json(),
                    "cached": result.cached,
                });
                Some(JsonRpcResponse::success(id, payload))
            }
            // Cancelled requests get a transport closure, not an error.
            Err(HuginnError::Cancelled) => None,
            Err(e) => Some(JsonRpcResponse::failure(id, JsonRpcError::from(&e))),
        }
    }

    fn resources_list(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let resources = json!({
            "resources": [
                {
                    "uri": "huginn://health",
                    "name": "Server health",
                    "mimeType": "application/json",
                },
                {
                    "uri": "huginn://tools",
                    "name": "Tool catalog with discovery prerequisites",
                    "mimeType": "application/json",
                },
            ],
        });
        Some(JsonRpcResponse::success(request.id, resources))
    }

    fn resources_read(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let uri = request
            .params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let body = match uri.as_str() {
            "huginn://health" => {
                let mut health = self.protocol.dispatcher.engine().health().to_json();
                health["handler_panics"] = json!(self.protocol.dispatcher.panic_count());
                health
            }
            "huginn://tools" => json!({
                "tools": self
                    .protocol
                    .dispatcher
                    .registry()
                    .list()
                    .map(|spec| spec.metadata())
                    .collect::<Vec<_>>(),
            }),
            _ => {
                return Some(JsonRpcResponse::failure(
                    request.id,
                    JsonRpcError::from(&HuginnError::NotFound(format!("resource {uri}"))),
                ));
            }
        };
        let contents = ResourceContents {
            uri,
            mime_type: "application/json".to_string(),
            text: body.to_string(),
        };
        Some(JsonRpcResponse::success(
            request.id,
            json!({ "contents": [contents] }),
        ))
    }

    fn discover(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let tools: Vec<Value> = self
            .protocol
            .dispatcher
            .registry()
            .list()
            .map(|spec| spec.metadata())
            .collect();
        Some(JsonRpcResponse::success(
            request.id,
            json!({
                "server": {
                    "name": self.protocol.config.server_name,
                    "version": self.protocol.config.server_version,
                    "protocolVersion": PROTOCOL_VERSION,
                },
                "tools": tools,
            }),
        ))
    }

    /// `cancel` notification: cancel one in-flight request by id.
    fn cancel_request(&self, params: Option<&Value>) {
        let Some(params) = params else { return };
        let id = match params.get("id") {
            Some(Value::Number(n)) => n.as_i64().map(RequestId::Number),
            Some(Value::String(s)) => Some(RequestId::String(s.clone())),
            _ => None,
        };
        let Some(id) = id else { return };
        let inflight = self.inflight.lock().expect("inflight lock poisoned");
        if let Some(token) = inflight.get(&id) {
            info!(?id, "request cancelled by client");
            token.cancel();
        }
    }
}
