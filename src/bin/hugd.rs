//! hugd — Huginn daemon.
//!
//! Serves the MCP protocol over the configured transport (stdio by
//! default), mediating between AI callers and the observability backend.

use clap::Parser;
use tracing::info;

use huginn::{HuginnConfig, Supervisor};

/// Huginn daemon — discovery-first MCP gateway.
#[derive(Parser)]
#[command(name = "hugd")]
#[command(version)]
#[command(about = "Discovery-first MCP gateway for observability backends")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Transport override: stdio, http, or sse.
    #[arg(short, long, env = "HUGINN_TRANSPORT")]
    transport: Option<String>,

    /// Port override for http/sse transports.
    #[arg(short, long, env = "HUGINN_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = HuginnConfig::load(args.config.as_deref())?;
    if let Some(transport) = args.transport {
        config.server.transport = transport;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Log to stderr: stdout may carry protocol frames on the stdio
    // transport. RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.server.log_level)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = %config.server.transport,
        account = config.backend.account,
        "hugd starting"
    );

    Supervisor::new(config).run().await?;
    Ok(())
}
