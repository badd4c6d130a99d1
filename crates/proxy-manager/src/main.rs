//! Proxy manager binary

use anyhow::anyhow;
use proxy_manager::{Config, ProxyManager, setup_tracing, shutdown_signal};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing is not initialized yet
    let config = match Config::load() {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Using default configuration");
            None
        }
    };
    let loaded = config.is_some();
    let config = config.unwrap_or_else(|| {
        let mut defaults = Config::default();
        defaults.apply_env_overrides(|key| std::env::var(key).ok());
        defaults
    });

    let _telemetry_guard = setup_tracing(&config.logging, &config.telemetry)
        .map_err(|e| anyhow!("failed to initialize tracing: {}", e))?;

    if loaded {
        tracing::info!("Configuration loaded successfully");
    } else {
        tracing::warn!("Using default configuration");
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    ProxyManager::new(config)
        .run(shutdown)
        .await
        .map_err(|e| anyhow!("proxy manager failed: {}", e))?;

    // Telemetry guard will flush spans on drop
    Ok(())
}
