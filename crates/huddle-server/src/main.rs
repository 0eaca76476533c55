//! # Huddle Server
//!
//! Realtime chat server: rooms, presence, typing indicators and direct messages.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! huddle
//!
//! # Run with environment overrides
//! HUDDLE_PORT=8080 HUDDLE_HOST=0.0.0.0 HUDDLE_ROUTER__USERNAME_POLICY=reject huddle
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        policy = ?config.router.username_policy,
        "Starting Huddle server"
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
