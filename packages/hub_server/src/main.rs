use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hub_server::AppState;
use hub_server::config::{FileConfig, HubConfig, load_config};
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "hub")]
#[command(about = "Real-time group messaging hub over WebSockets")]
struct Cli {
    /// Config file (missing file means defaults)
    #[arg(short, long, default_value = "hub.toml")]
    config: PathBuf,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the web server, 0 = auto-select (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "hub=debug,hub_server=debug,group_hub=debug,tower_http=debug,info"
    } else {
        "hub=info,hub_server=info,group_hub=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        file_config.server.host = host;
    }
    if let Some(port) = cli.port {
        file_config.server.port = port;
    }
    let config = HubConfig::from_file(&file_config)?;

    info!("Starting group hub");
    info!(
        "Hub config: default_group={}, heartbeat={:?}, outbound_capacity={}, broadcast_timeout={:?}",
        config.default_group,
        config.connection.heartbeat_interval,
        config.connection.outbound_capacity,
        config.registry.send_timeout
    );
    if config.tokens.is_empty() {
        info!("Token auth disabled (add [auth.tokens] to enable)");
    } else {
        info!("Token auth enabled ({} tokens)", config.tokens.len());
    }

    let state = AppState::new(&config);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Hub listening on http://{}", actual_addr);
    info!("  GET    /ws                        - WebSocket endpoint");
    info!("  GET    /api/groups                - List groups");
    info!("  POST   /api/groups/:id/push       - Broadcast to a group");
    info!("  GET    /health, /health/live, /metrics");

    // Create shutdown signal handler
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    hub_server::serve(listener, state, shutdown_signal).await
}
