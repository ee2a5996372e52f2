//! Server-sent events transport.
//!
//! `GET /sse` opens the event stream: the first event names the POST
//! endpoint for this connection, every response arrives as a `message`
//! event, and keep-alive pings flow while the stream is idle. Dropping
//! the stream closes the connection and cancels its in-flight requests.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use futures_util::Stream;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Transport;
use crate::protocol::{Connection, ProtocolHandler};
use crate::{HuginnError, Result};

/// SSE frontend bound to one address.
pub struct SseTransport {
    addr: SocketAddr,
}

impl SseTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn router(protocol: Arc<ProtocolHandler>) -> axum::Router {
        let state = SseState {
            protocol,
            connections: Arc::new(Mutex::new(HashMap::new())),
        };
        axum::Router::new()
            .route("/sse", get(open_stream))
            .route("/messages", post(submit))
            .with_state(state)
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn serve(
        self: Box<Self>,
        protocol: Arc<ProtocolHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| HuginnError::Configuration(format!("bind {}: {e}", self.addr)))?;
        info!(addr = %self.addr, "sse transport ready");
        axum::serve(listener, Self::router(protocol))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| HuginnError::Internal(format!("sse serve: {e}")))
    }
}

#[derive(Clone)]
struct SseState {
    protocol: Arc<ProtocolHandler>,
    connections: Arc<Mutex<HashMap<String, SseConnection>>>,
}

#[derive(Clone)]
struct SseConnection {
    connection: Connection,
    tx: tokio::sync::mpsc::Sender<String>,
}

async fn open_stream(
    State(state): State<SseState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let id: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    let connection = state.protocol.connection();
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(64);

    state.connections.lock().expect("sse registry poisoned").insert(
        id.clone(),
        SseConnection {
            connection: connection.clone(),
            tx,
        },
    );
    info!(connection = %id, "sse stream opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?connection={id}"));
    let messages = ReceiverStream::new(rx)
        .map(|payload| Event::default().event("message").data(payload));
    let stream = GuardedStream {
        inner: Box::pin(tokio_stream::once(endpoint).chain(messages).map(Ok)),
        _guard: StreamGuard {
            id,
            connections: state.connections.clone(),
            connection,
        },
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

async fn submit(
    State(state): State<SseState>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let Some(id) = params.get("connection") else {
        return StatusCode::BAD_REQUEST;
    };
    let Some(sse) = state
        .connections
        .lock()
        .expect("sse registry poisoned")
        .get(id)
        .cloned()
    else {
        return StatusCode::NOT_FOUND;
    };

    tokio::spawn(async move {
        let raw = body.to_string();
        if let Some(response) = sse.connection.handle_raw(&raw).await {
            if let Ok(encoded) = serde_json::to_string(&response) {
                let _ = sse.tx.send(encoded).await;
            }
        }
    });
    StatusCode::ACCEPTED
}

/// Deregisters the stream and cancels its in-flight requests on drop.
struct StreamGuard {
    id: String,
    connections: Arc<Mutex<HashMap<String, SseConnection>>>,
    connection: Connection,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        debug!(connection = %self.id, "sse stream closed");
        self.connections
            .lock()
            .expect("sse registry poisoned")
            .remove(&self.id);
        self.connection.close();
    }
}

/// A stream that carries its cleanup guard.
struct GuardedStream<S> {
    inner: Pin<Box<S>>,
    _guard: StreamGuard,
}

impl<S: Stream> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
