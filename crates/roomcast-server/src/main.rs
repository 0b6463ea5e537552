//! # roomcast
//!
//! Multi-tenant realtime room messaging and presence server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! roomcast
//!
//! # Run with a config file in the working directory
//! cat roomcast.toml && roomcast
//!
//! # Override any setting through the environment
//! ROOMCAST__PORT=9000 ROOMCAST__HUB__PRESENCE_GRACE_MS=5000 roomcast
//! ```

mod config;
mod handlers;
mod metrics;
mod session;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting roomcast on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
