use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ssmanager::config::{GlobalConfig, DEFAULT_CONFIG_PATH};
use ssmanager::Manager;
use tracing_subscriber::EnvFilter;

/// How often running instances' traffic totals are logged.
const USAGE_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("ssmanager starting");

    let config_path = std::env::var("SSMANAGER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let cfg = GlobalConfig::load(&config_path)?;

    let manager = Arc::new(Manager::new(cfg.manager));
    for entry in cfg.servers {
        manager.add_instance(&entry.host, entry.proxy)?;
    }

    if let Err(e) = manager.start().await {
        tracing::error!("Failed to start manager: {}", e);
        return Err(e.into());
    }

    for instance in manager.instances()? {
        if let Err(e) = manager.start_instance(instance.port()).await {
            tracing::warn!("Failed to start instance on port {}: {}", instance.port(), e);
        }
    }

    // 주기적으로 사용량 보고
    let reporter = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(USAGE_REPORT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match manager.instances() {
                    Ok(instances) => {
                        for i in instances.iter().filter(|i| i.is_running()) {
                            tracing::info!("{}:{} traffic: {} bytes", i.host(), i.port(), i.traffic());
                        }
                    }
                    Err(e) => tracing::error!("Usage report failed: {}", e),
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, cleaning up...");
    reporter.abort();
    manager.stop().await;

    tracing::info!("ssmanager shutting down");
    Ok(())
}
