//! Scrape orchestrator server.

use anyhow::{Context, Result};
use scrape_orchestrator::{api, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scrape_orchestrator=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        model = %config.model,
        max_steps = config.orchestrator.max_steps,
        max_concurrent_jobs = config.orchestrator.max_concurrent_jobs,
        state_dir = %config.state_dir.display(),
        "Starting scrape orchestrator"
    );

    api::serve(config).await
}
