//! # Tidings Server
//!
//! Topic-based notification broker over plain HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tidings
//!
//! # Run with a config file
//! tidings --config /etc/tidings/tidings.toml
//!
//! # Override settings from the environment
//! TIDINGS_PORT=8080 TIDINGS_CACHE__RETENTION=6h tidings
//!
//! # Publish and subscribe
//! curl -d "backup done" localhost:8080/backups
//! curl -s localhost:8080/backups/json
//! ```

mod config;
mod feed;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "tidings", version, about = "Topic-based notification broker")]
struct Args {
    /// Path to a TOML config file.
    #[arg(short, long, env = "TIDINGS_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to, overriding the config.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, overriding the config.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tidings=info,tidings_core=info,tidings_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = config::Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    tracing::info!("Starting Tidings server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
