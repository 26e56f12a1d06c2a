//! # postbus
//!
//! Long-poll pub/sub message bus server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory backlog)
//! postbus
//!
//! # Run with custom config
//! postbus --config /path/to/postbus.toml
//!
//! # Run with environment variables
//! POSTBUS__PORT=8080 POSTBUS__BACKEND__KIND=redis postbus
//! ```

mod config;
mod handlers;
mod lookup;
mod metrics;

use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (None, _) => Ok(None),
        (Some("--config" | "-c"), Some(path)) => Ok(Some(PathBuf::from(path))),
        (Some(arg), _) => bail!("Unexpected argument: {arg} (usage: postbus [--config <path>])"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "postbus=debug,postbus_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load(config_path()?.as_deref())?;

    tracing::info!(
        backend = ?config.backend.kind,
        "Starting postbus server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
