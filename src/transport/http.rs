//! HTTP transport: one POST endpoint, one JSON document each way.
//!
//! Session affinity rides headers: `X-Session-ID` is echoed back, and a
//! request without one gets a fresh session (its goal taken from
//! `X-Session-Goal`). Client disconnects cancel the in-flight request via
//! a connection guard.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Transport;
use crate::protocol::{Connection, JsonRpcRequest, JsonRpcResponse, ProtocolHandler};
use crate::{HuginnError, Result};

pub const SESSION_HEADER: &str = "x-session-id";
pub const GOAL_HEADER: &str = "x-session-goal";

/// HTTP frontend bound to one address.
pub struct HttpTransport {
    addr: SocketAddr,
}

impl HttpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// The axum application, shared with the SSE transport's tests.
    pub fn router(protocol: Arc<ProtocolHandler>) -> axum::Router {
        axum::Router::new()
            .route("/mcp", post(rpc))
            .with_state(protocol)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn serve(
        self: Box<Self>,
        protocol: Arc<ProtocolHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| HuginnError::Configuration(format!("bind {}: {e}", self.addr)))?;
        info!(addr = %self.addr, "http transport ready");
        axum::serve(listener, Self::router(protocol))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| HuginnError::Internal(format!("http serve: {e}")))
    }
}

/// Cancels the connection scope if the request future is dropped before
/// completion (client went away); disarmed once a response exists.
struct CloseOnDrop(Option<Connection>);

impl CloseOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Some(connection) = self.0.take() {
            connection.close();
        }
    }
}

async fn rpc(
    State(protocol): State<Arc<ProtocolHandler>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let connection = protocol.connection();

    // Session affinity: bind the caller's session or mint one.
    let session_id = match header_str(&headers, SESSION_HEADER) {
        Some(id) => {
            connection.bind_session(id.clone());
            Some(id)
        }
        None => {
            let goal = header_str(&headers, GOAL_HEADER);
            match protocol
                .dispatcher()
                .state()
                .session_or_create(None, goal)
                .await
            {
                Ok((session, _)) => {
                    connection.bind_session(&session.id);
                    Some(session.id)
                }
                Err(_) => None,
            }
        }
    };

    let mut guard = CloseOnDrop(Some(connection.clone()));
    let reply = match serde_json::from_value::<JsonRpcRequest>(body) {
        Ok(request) => connection.handle(request).await,
        Err(e) => Some(JsonRpcResponse::failure(
            None,
            crate::protocol::JsonRpcError::parse_error(e),
        )),
    };
    guard.disarm();

    let mut response = match reply {
        Some(reply) => Json(reply).into_response(),
        // Notifications produce no body.
        None => StatusCode::NO_CONTENT.into_response(),
    };
    if let Some(id) = session_id {
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
    }
    response
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
