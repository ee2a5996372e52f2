//! Transport frontends.
//!
//! Exactly one transport is active per process; all of them drive the same
//! [`ProtocolHandler`](crate::protocol::ProtocolHandler), so the protocol
//! semantics are identical and the transport layer merely frames messages.

pub mod framed;
pub mod http;
pub mod sse;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::protocol::ProtocolHandler;
use crate::{HuginnError, Result};

pub use framed::FramedTransport;
pub use http::HttpTransport;
pub use sse::SseTransport;

/// A transport frontend: frames messages in and out of one protocol
/// handler until shutdown.
#[async_trait]
pub trait Transport: Send {
    /// Serve until the transport's input ends or `shutdown` fires.
    /// Dropping out of this call must leave no request running: the
    /// implementation closes its connections, which cancels in-flight
    /// work.
    async fn serve(
        self: Box<Self>,
        protocol: Arc<ProtocolHandler>,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

/// Which transport the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Length-prefixed frames over stdin/stdout.
    #[default]
    Stdio,
    /// HTTP POST endpoint.
    Http,
    /// Server-sent events.
    Sse,
}

impl TransportKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" | "framed" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            "sse" => Ok(Self::Sse),
            other => Err(HuginnError::Configuration(format!(
                "unknown transport: {other} (expected stdio, http, or sse)"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }
}
