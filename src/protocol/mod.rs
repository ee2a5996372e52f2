//! JSON-RPC 2.0 protocol types for the MCP surface.
//!
//! # Wire format
//!
//! Requests and responses are JSON-RPC 2.0 documents; how they are framed
//! (length prefix, HTTP body, SSE event) is the transport's business.
//!
//! ```json
//! { "jsonrpc": "2.0", "id": 1, "method": "tools/call",
//!   "params": { "name": "query_nrdb", "arguments": { "query": "..." } } }
//! ```
//!
//! Successful `tools/call` responses carry `result.content` (ordered typed
//! blocks) plus `result.meta` with `discoveries_used`, `query_adapted`,
//! and `min_confidence`.

mod handler;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::HuginnError;

pub use handler::{Connection, ProtocolConfig, ProtocolHandler};

/// JSON-RPC 2.0 version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision this server speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Request id: number or string, per JSON-RPC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

/// JSON-RPC request (or notification, when `id` is absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Parse error (-32700) for undecodable frames.
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(-32700, format!("invalid JSON: {detail}"))
    }

    /// Invalid request (-32600).
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(-32600, detail)
    }

    /// Method not found (-32601).
    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("unknown method: {method}"))
    }
}

impl From<&HuginnError> for JsonRpcError {
    /// Map a domain error to the wire: stable code, human message, and a
    /// `data` object carrying the machine-readable kind, optional field
    /// path, optional suggestion, and (for discovery-required) the missing
    /// prerequisites.
    fn from(err: &HuginnError) -> Self {
        let mut data = json!({ "kind": err.code_str() });
        if let Some(suggestion) = err.suggestion() {
            data["suggestion"] = json!(suggestion);
        }
        match err {
            HuginnError::InvalidInput {
                path: Some(path), ..
            } => {
                data["field"] = json!(path);
            }
            HuginnError::DiscoveryRequired { missing } => {
                data["missing_prerequisites"] = json!(missing);
            }
            HuginnError::ValidationFailed { reason, .. } => {
                data["reason"] = json!(reason);
            }
            HuginnError::RateLimited {
                retry_after: Some(after),
            } => {
                data["retry_after_ms"] = json!(after.as_millis() as u64);
            }
            _ => {}
        }
        Self {
            code: err.jsonrpc_code(),
            message: err.to_string(),
            data: Some(data),
        }
    }
}

/// One block of a tool result's `content` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Resource {
        resource: ResourceContents,
    },
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text { text: s.into() }
    }
}

/// Embedded resource payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    pub mime_type: String,
    pub text: String,
}

/// Registered protocol methods.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const DISCOVER: &str = "mcp.discover";
    pub const CANCEL: &str = "cancel";
    pub const PING: &str = "ping";
}
