//! race-relay
//!
//! Transparent TCP relay for clients that cannot know which backend owns
//! their connection.
//!
//! This service:
//! - Accepts TCP connections on the configured listen address
//! - Sends each client's first payload to every candidate backend
//! - Keeps the first candidate (in priority order) that answers in time
//! - Relays bytes between the client and that candidate until either closes
//! - Optionally unwraps a TLS backend so the client side stays plaintext

use std::sync::Arc;

use anyhow::{Context, Result};
use race_relay::config::Config;
use race_relay::{Listener, TracingLogger};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting race-relay");
    info!(
        listen_addr = %config.listen_addr,
        candidate_count = config.candidates.len(),
        tls_unwrap = config.tls_unwrap_addr.as_deref().unwrap_or("off"),
        race_window_ms = config.race_window.as_millis() as u64,
        disable_nagle = config.disable_nagle,
        "Configuration loaded"
    );

    let listener_config = config.listener_config(Arc::new(TracingLogger))?;
    let listener = match Listener::bind(listener_config).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(
                bind_addr = %config.listen_addr,
                error = %e,
                "Failed to bind listener"
            );
            return Err(e).context("failed to bind listener");
        }
    };

    listener.run().await.context("listener stopped")
}
