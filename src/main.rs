//! # Security Gateway - Main Entry Point
//!
//! Startup sequence:
//! 1. load the configuration named by `GATEWAY_CONFIG` (defaults when the file is missing)
//! 2. install the tracing subscriber
//! 3. connect the shared store
//! 4. build the gateway and subscribe it to configuration changes
//! 5. serve until SIGINT or SIGTERM, then drain and flush

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use security_gateway::core::config::StoreBackend;
use security_gateway::observability::init_tracing;
use security_gateway::store::{KvStore, MemoryStore, RedisStore};
use security_gateway::{ConfigManager, Gateway, GatewayConfig};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("GATEWAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config_exists = config_path.exists();
    let config = load_config(&config_path, config_exists).await?;

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting security gateway");
    if !config_exists {
        warn!(path = %config_path.display(), "Configuration file not found, running with defaults");
    }

    let store = connect_store(&config).await?;
    let gateway = Gateway::builder(config)
        .store(store)
        .build()
        .context("failed to build security gateway")?;

    // keep the manager alive so its file watcher keeps running
    let _config_manager = if config_exists {
        let manager = ConfigManager::new(&config_path)
            .await
            .with_context(|| format!("failed to watch {}", config_path.display()))?;
        gateway.watch_config(manager.subscribe_to_changes());
        Some(manager)
    } else {
        None
    };

    gateway
        .serve(shutdown_signal())
        .await
        .context("security gateway terminated with an error")?;

    info!("Security gateway shutdown complete");
    Ok(())
}

async fn load_config(path: &Path, exists: bool) -> Result<GatewayConfig> {
    if exists {
        return GatewayConfig::load_from_file(path)
            .await
            .with_context(|| format!("failed to load configuration from {}", path.display()));
    }

    let mut config = GatewayConfig::default();
    config
        .apply_env_overrides()
        .context("invalid GATEWAY_* environment override")?;
    config.validate().context("invalid default configuration")?;
    Ok(config)
}

async fn connect_store(config: &GatewayConfig) -> Result<Arc<dyn KvStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.store)
                .await
                .with_context(|| format!("failed to connect to redis at {}", config.store.redis_url))?;
            Ok(Arc::new(store))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
