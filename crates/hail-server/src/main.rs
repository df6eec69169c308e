//! # hail
//!
//! Realtime dispatch server for ride-hailing clients.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory gateway)
//! hail
//!
//! # Point at the platform backend
//! HAIL__GATEWAY__BACKEND=http HAIL__GATEWAY__BASE_URL=http://backend/internal/dispatch hail
//!
//! # Change the listen port
//! HAIL__PORT=8080 HAIL__HOST=0.0.0.0 hail
//! ```

mod config;
mod gateway;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hail=debug,hail_core=debug,hail_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting hail server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
