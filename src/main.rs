use anyhow::Context;
use lotuslink::core::config::{ExchangeConfig, ResilienceConfig};
use lotuslink::{ConnectivityCore, OperationType};
use serde_json::json;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    #[cfg(feature = "env-file")]
    let exchange = ExchangeConfig::from_env_file("KRAKEN");
    #[cfg(not(feature = "env-file"))]
    let exchange = ExchangeConfig::from_env("KRAKEN");
    let exchange = exchange.context("loading KRAKEN_* credentials")?;

    let config = match std::env::var("LOTUSLINK_CONFIG") {
        Ok(path) => ResilienceConfig::from_file(&path)
            .with_context(|| format!("loading resilience config from {}", path))?,
        Err(_) => ResilienceConfig::default(),
    };

    let core = ConnectivityCore::connect(&exchange, config)?;
    core.init().await?;

    let status = core.service_status();
    info!(level = %status.level, stream_connected = status.stream_connected, "Connectivity core up");
    println!("{}", serde_json::to_string_pretty(&status)?);

    match core.request(OperationType::SystemStatus, json!({})).await {
        Ok(system) => info!(status = %system, "Exchange system status"),
        Err(e) => warn!(error = %e, "System status check failed"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    println!("{}", serde_json::to_string_pretty(&core.statistics())?);
    core.shutdown().await;
    Ok(())
}
