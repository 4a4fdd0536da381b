use anyhow::Result;
use pipeline_core::admission::{AdmissionController, EchoInferencer, PromotionSubscriber};
use pipeline_core::types::TOPIC_STAGE_PROMOTION;
use pipeline_core::{connect_transport, init_tracing, load_config, ClaimCheck, MemoryBlobStore};
use std::sync::Arc;
use tracing::info;

mod server;

const PROMOTION_GROUP: &str = "inference-gateway";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("inference-gateway")?;
    let cfg = load_config()?;
    info!(target: "gateway", transport = ?cfg.transport, port = cfg.http_port, "starting inference gateway");

    // TODO: replace with the shared object-store client once it lands; the
    // in-memory store only covers single-process deployments.
    let store = Arc::new(MemoryBlobStore::new());
    let loader = Arc::new(ClaimCheck::new(store));
    let controller = Arc::new(AdmissionController::new(
        cfg.concurrency_limit,
        cfg.request_timeout(),
        loader,
        Arc::new(EchoInferencer),
    ));

    let bus = connect_transport(&cfg).await?;
    bus.subscribe(
        TOPIC_STAGE_PROMOTION,
        PROMOTION_GROUP,
        Arc::new(PromotionSubscriber { controller: controller.clone() }),
    )
    .await?;

    server::serve(controller, cfg.http_port).await
}
