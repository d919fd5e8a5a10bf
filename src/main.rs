//! CGI Gateway
//!
//! An HTTP front for CGI/1.1 programs built with Tokio and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌────────────────────────────────────────────────┐
//!                    │                  CGI GATEWAY                    │
//!                    │                                                 │
//!   Client Request   │  ┌─────────┐    ┌──────────┐    ┌───────────┐  │
//!   ─────────────────┼─▶│  http   │───▶│ routing  │───▶│   chain   │  │
//!                    │  │ server  │    │ registry │    │   steps   │  │
//!                    │  └─────────┘    └──────────┘    └─────┬─────┘  │
//!                    │                                       │        │
//!                    │                                       ▼        │
//!                    │                                ┌───────────┐   │
//!                    │                                │  gateway  │   │
//!                    │                                │ subprocess│   │
//!                    │                                └─────┬─────┘   │
//!                    │                                      │         │
//!   Client Response  │  ┌──────────┐    ┌───────────┐      │         │
//!   ◀────────────────┼──│ streamed │◀───│  response │◀─────┘         │
//!                    │  │   body   │    │   sink    │  stdout pipe   │
//!                    │  └──────────┘    └───────────┘                │
//!                    │                                                │
//!                    │  ┌──────────────────────────────────────────┐  │
//!                    │  │          Cross-Cutting Concerns           │  │
//!                    │  │  ┌────────┐ ┌─────────────┐ ┌──────────┐ │  │
//!                    │  │  │ config │ │observability│ │lifecycle │ │  │
//!                    │  │  └────────┘ └─────────────┘ └──────────┘ │  │
//!                    │  └──────────────────────────────────────────┘  │
//!                    └────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cgi_gateway::config::{load_config, GatewayServerConfig};
use cgi_gateway::http::GatewayServer;
use cgi_gateway::lifecycle::Shutdown;
use cgi_gateway::observability::metrics;

#[derive(Debug, Parser)]
#[command(name = "cgi-gateway", about = "HTTP gateway for CGI/1.1 programs")]
struct Args {
    /// Path of the TOML configuration file.
    #[arg(long, default_value = "gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cgi_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = if args.config.exists() {
        load_config(&args.config)?
    } else {
        tracing::warn!(path = %args.config.display(), "config file not found, using defaults");
        GatewayServerConfig::default()
    };

    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        default_timeout_ms = config.timeouts.route_ms,
        "configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(error) => tracing::error!(
                %error,
                metrics_address = %config.observability.metrics_address,
                "failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = GatewayServer::from_config(&config)?;

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move {
        shutdown.listen_for_signals().await;
    });

    server.run(listener, receiver).await?;

    tracing::info!("shutdown complete");
    Ok(())
}
