use anyhow::Result;
use pipeline_core::promotion::MemoryRegistry;
use pipeline_core::{
    connect_transport, init_tracing, load_config, mark_ready, start_health_server, Orchestrator,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("coordinator")?;
    let cfg = load_config()?;
    start_health_server(cfg.http_port).await?;
    info!(target: "coordinator", transport = ?cfg.transport, "starting coordinator service");

    let bus = connect_transport(&cfg).await?;
    // TODO: swap for the durable registry service once it is deployed.
    let registry = Arc::new(MemoryRegistry::new());
    let _orchestrator = Orchestrator::start(bus, registry, &cfg).await?;
    mark_ready();

    tokio::signal::ctrl_c().await?;
    info!(target: "coordinator", "shutdown signal received");
    pipeline_core::clear_ready();
    Ok(())
}
