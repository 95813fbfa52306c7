use anyhow::Context;
use tracing_subscriber::EnvFilter;

use symserver_service::{config::Config, metrics, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    metrics::configure(config.statsd_addr);

    server::run(config).await
}
