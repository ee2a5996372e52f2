//! Supervisor: singleton construction, lifecycle, graceful shutdown.
//!
//! The tool registry and the state manager are the only process-wide
//! singletons; the supervisor constructs them and passes them explicitly —
//! no ambient access anywhere. A root cancellation token fans out through
//! transports, connections, and requests; shutdown cancels it and drains.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{Backend, BackendConfig, HttpBackend, Region, RetryingBackend};
use crate::builder::QueryBuilder;
use crate::config::HuginnConfig;
use crate::discovery::DiscoveryEngine;
use crate::protocol::{ProtocolConfig, ProtocolHandler};
use crate::state::StateManager;
use crate::tools::{Dispatcher, ToolRegistry};
use crate::transport::{
    FramedTransport, HttpTransport, SseTransport, Transport, TransportKind,
};
use crate::validator::Validator;
use crate::{HuginnError, Result};

/// Builds the component graph from configuration and runs one transport
/// until shutdown.
pub struct Supervisor {
    config: HuginnConfig,
    root: CancellationToken,
}

impl Supervisor {
    pub fn new(config: HuginnConfig) -> Self {
        Self {
            config,
            root: CancellationToken::new(),
        }
    }

    /// The root cancellation token; cancelling it drains the process.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Wire everything and serve. Returns when the transport closes or a
    /// shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let config = &self.config;

        // State manager: the exclusive owner of mutable shared state.
        let state = Arc::new(build_state(config).await?);

        // Backend adapter with retry on top of the governed HTTP client.
        let http = HttpBackend::new(build_backend_config(config)?)?;
        let backend: Arc<dyn Backend> = Arc::new(RetryingBackend::new(
            Arc::new(http),
            config.retry.retry_config(),
        ));

        let engine = Arc::new(DiscoveryEngine::new(
            backend.clone(),
            state.cache().clone(),
            config.discovery.engine_config(config.quality.clone()),
        )?);

        let validator = Arc::new(Validator::new(config.validator.clone()));
        let builder = Arc::new(QueryBuilder::new(Validator::new(config.validator.clone())));
        let registry = Arc::new(ToolRegistry::builtin());

        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            engine,
            state.clone(),
            backend,
            builder,
            validator,
            config.limits.dispatch_limits(),
            config.backend.account,
        ));

        let protocol = Arc::new(ProtocolHandler::new(
            dispatcher,
            ProtocolConfig {
                server_name: "huginn".to_string(),
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                timeout_ceiling: config.limits.dispatch_limits().timeout_ceiling,
            },
            self.root.clone(),
        ));

        // Background session expiry.
        let sweeper = state.spawn_sweeper(self.root.child_token());

        // Shutdown signal: cancel the root, transports drain.
        let signal_root = self.root.clone();
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received, draining");
                signal_root.cancel();
            }
        });

        let kind = TransportKind::parse(&config.server.transport)?;
        let transport = build_transport(kind, config)?;
        info!(
            transport = kind.as_str(),
            account = config.backend.account,
            "hugd serving"
        );
        let served = transport.serve(protocol, self.root.clone()).await;

        // Drain whatever is still running, then stop the helpers.
        self.root.cancel();
        signal.abort();
        if let Err(e) = &served {
            warn!(error = %e, "transport ended with error");
        }
        let _ = sweeper.await;
        info!("hugd stopped");
        served
    }
}

async fn build_state(config: &HuginnConfig) -> Result<StateManager> {
    match config.cache.url.as_deref() {
        None => Ok(StateManager::in_memory(config.cache.state_config())),
        #[cfg(feature = "redis-cache")]
        Some(url) => {
            StateManager::networked(url, &config.cache.prefix, config.cache.state_config()).await
        }
        #[cfg(not(feature = "redis-cache"))]
        Some(_) => Err(HuginnError::Configuration(
            "cache url set but huginn was built without the redis-cache feature".into(),
        )),
    }
}

fn build_backend_config(config: &HuginnConfig) -> Result<BackendConfig> {
    let mut backend = BackendConfig::new(config.api_key()?)
        .region(Region::parse(&config.backend.region));
    if let Some(ref endpoint) = config.backend.endpoint {
        backend = backend.endpoint(endpoint.clone());
    }
    backend.ratelimit = config.ratelimit.ratelimit_config();
    backend.breaker = config.breaker.breaker_config();
    Ok(backend)
}

fn build_transport(kind: TransportKind, config: &HuginnConfig) -> Result<Box<dyn Transport>> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| HuginnError::Configuration(format!("bind address: {e}")))?;
    Ok(match kind {
        TransportKind::Stdio => Box::new(FramedTransport),
        TransportKind::Http => Box::new(HttpTransport::new(addr)),
        TransportKind::Sse => Box::new(SseTransport::new(addr)),
    })
}
