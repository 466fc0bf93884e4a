//! Orchestrator daemon: runs the scheduling worker, the timeout monitor and
//! the cleanup worker against Postgres until interrupted.

use std::sync::Arc;

use anyhow::Context;
use prometheus_orchestrator::builders::OrchestratorBuilder;
use prometheus_orchestrator::config::OrchestratorConfig;
use prometheus_orchestrator::core::AppResult;
use prometheus_orchestrator::infra::store::PostgresStore;
use prometheus_orchestrator::infra::transport::PgNotifyTransport;
use prometheus_orchestrator::util::{init_tracing, init_tracing_json};
use tracing::info;

#[tokio::main]
async fn main() -> AppResult<()> {
    let config = OrchestratorConfig::from_env().map_err(anyhow::Error::msg)?;
    if config.logging.json {
        init_tracing_json();
    } else {
        init_tracing();
    }
    let url = config
        .database
        .url
        .clone()
        .context("DATABASE_URL must be set")?;

    let store = PostgresStore::connect(&url, config.database.max_connections).await?;
    store.migrate().await?;
    let transport = PgNotifyTransport::connect(
        store.pool().clone(),
        &config.events.channel,
        config.events.max_payload_bytes,
    )
    .await?;

    let built = OrchestratorBuilder::new()
        .config(config)
        .store(Arc::new(store))
        .transport(transport.clone())
        .build()?;
    let (_orchestrator, runtime) = built.start();
    info!("orchestrator running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    runtime.shutdown().await;
    transport.close();
    Ok(())
}
