use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

use relay_server::{RelayFileConfig, RelayState, create_router, load_config};

#[derive(Parser)]
#[command(name = "serial-relay")]
#[command(about = "Relay that keeps serial terminal viewers in sync")]
struct Args {
    /// Config file (TOML)
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the HTTP server, 0 for automatic (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory of static UI files served at /
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "relay_server=debug,tower_http=debug,info"
    } else {
        "relay_server=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let fc: RelayFileConfig = load_config(&args.config)
        .extract()
        .with_context(|| format!("Invalid configuration in {:?}", args.config))?;

    let host = args.host.unwrap_or(fc.server.host);
    let port = args.port.unwrap_or(fc.server.port);
    let static_dir = args.static_dir.or(fc.server.static_dir);

    let state = RelayState::new(fc.relay.hub_config());
    let app = create_router(state, static_dir.as_deref());

    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Serial relay listening on http://{}", actual_addr);
    info!("Endpoints:");
    info!("  GET  /ws        - WebSocket for relay events");
    info!("  GET  /health    - Liveness check");
    info!("  GET  /api/stats - Relay counters");
    if let Some(dir) = &static_dir {
        info!("  GET  /          - Static files from {:?}", dir);
    }

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, exiting gracefully");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")
}
