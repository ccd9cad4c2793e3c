//! Queue worker process.
//!
//! Opens the shared store named by `DATABASE_URL`, serves the categories in
//! `CAFETAL_ANALYSIS_ENDPOINTS` through their HTTP analysis services, and
//! runs until Ctrl-C.

use anyhow::Context;

use cafetal_queue::{JobQueue, QueueConfig, connect_store};

mod endpoints;

const DEFAULT_DATABASE_URL: &str = "sqlite://cafetal-queue.db";
const CONFIG_PATH_ENV: &str = "CAFETAL_QUEUE_CONFIG";

fn load_config() -> anyhow::Result<QueueConfig> {
    let base = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => QueueConfig::load(&path).with_context(|| format!("loading {path}"))?,
        Err(_) => QueueConfig::default(),
    };
    base.merge_lookup(|key| std::env::var(key).ok())
        .context("reading CAFETAL_QUEUE_* overrides")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cafetal_observability::init();

    let config = load_config()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
        tracing::warn!("DATABASE_URL not set; using {DEFAULT_DATABASE_URL}");
        DEFAULT_DATABASE_URL.to_string()
    });
    let store = connect_store(&database_url)
        .await
        .context("opening work item store")?;

    let raw_endpoints = std::env::var(endpoints::ENDPOINTS_ENV).unwrap_or_default();
    let registry = endpoints::registry(&raw_endpoints)?;
    if registry.is_empty() {
        tracing::warn!("{} is empty; submitted jobs will fail as unknown categories", endpoints::ENDPOINTS_ENV);
    }

    let queue = JobQueue::builder()
        .store(store)
        .registry(registry)
        .config(config)
        .build()?;

    let recovered = queue.start().await?;
    tracing::info!(
        scheduler_id = %queue.scheduler_id(),
        reset = recovered.reset,
        failed = recovered.failed,
        "worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;

    tracing::info!("shutdown requested");
    queue.shutdown().await;
    Ok(())
}
