//! OpenSASE Rate Limiter - Main Entry Point

use sase_ratelimit::config::DEFAULT_CONFIG_PATH;
use sase_ratelimit::{RateLimitConfig, RateLimitService};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("OpenSASE Rate Limiter v{}", env!("CARGO_PKG_VERSION"));

    // Load config; there is no sensible default tier policy, so missing config is fatal
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let config = RateLimitConfig::load(&config_path)?;
    tracing::info!(
        path = %config_path,
        store = %config.store_path.display(),
        chain = %config.firewall.chain,
        "Configuration loaded"
    );

    let service = RateLimitService::new(config).await?;
    service.init().await?;

    service.run().await?;

    Ok(())
}
