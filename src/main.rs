//! p4rpc - logging relay for the p4 RPC protocol
//!
//! Sits between p4 clients and a server and logs every frame in both
//! directions.

use p4rpc_relay::{Config, Relay, RelayConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if P4RELAY_CONFIG is set, then env overrides)
    let config_path = std::env::var("P4RELAY_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };

    let relay_config = match RelayConfig::from_config(&config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting p4rpc relay");
    tracing::info!("  Listen address: {}", relay_config.bind_addr);
    tracing::info!("  Upstream: {}", relay_config.upstream);
    tracing::info!("  Max connections: {}", relay_config.max_connections);

    let relay = Arc::new(Relay::new(relay_config));
    let relay_handle = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.run().await })
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Received shutdown signal");
            relay.shutdown();
        }
        result = relay_handle => {
            result??;
            return Ok(());
        }
    }

    let stats = relay.stats();
    tracing::info!(
        "Relayed {} frames over {} connections",
        stats
            .frames_forwarded
            .load(std::sync::atomic::Ordering::Relaxed),
        stats
            .connections_total
            .load(std::sync::atomic::Ordering::Relaxed)
    );
    Ok(())
}
