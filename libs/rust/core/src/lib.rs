//! Core coordination substrate for the pipeline services: message bus with
//! dead-letter routing, claim-check storage, completion barrier, promotion
//! engine and admission-controlled serving.

use anyhow::Result;
use axum::{routing::get, Router};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod admission;
pub mod blob;
pub mod bus;
pub mod claim_check;
pub mod completion;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod promotion;
pub mod types;

pub use admission::{AdmissionController, EchoInferencer, Inferencer, PredictOutcome, PromotionSubscriber};
pub use blob::{BlobStore, MemoryBlobStore};
pub use bus::{connect_transport, BusHandler, InProcessBus, MessageBus, NatsBus, RedeliveryPolicy};
pub use claim_check::ClaimCheck;
pub use completion::{CompletedSet, CompletionTracker, Observation};
pub use config::{load_config, PipelineConfig, TransportKind};
pub use error::{CoordinationError, HandlerError};
pub use orchestrator::Orchestrator;
pub use promotion::{MemoryRegistry, PromotionEngine, PromotionRegistry, ScoreWeights};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() {
    NODE_READINESS.store(true, Ordering::SeqCst);
}

pub fn clear_ready() {
    NODE_READINESS.store(false, Ordering::SeqCst);
}

pub fn mark_not_live() {
    NODE_LIVENESS.store(false, Ordering::SeqCst);
}

/// Install the global tracing subscriber. `PIPELINE_JSON_LOG=1` switches to
/// JSON output for log shipping; filtering follows `RUST_LOG`.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("PIPELINE_JSON_LOG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let env_filter = tracing_subscriber::EnvFilter::from_default_env();
        if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
                .try_init()?;
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_line_number(true),
                )
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "pipeline", service, "tracing initialized");
    Ok(())
}

/// Spawn the liveness/readiness/metrics endpoint shared by every service.
pub async fn start_health_server(port: u16) -> Result<()> {
    let app = Router::new()
        .route(
            "/live",
            get(|| async {
                axum::Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)}))
            }),
        )
        .route(
            "/ready",
            get(|| async {
                axum::Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)}))
            }),
        )
        .route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(?addr, "health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "health server failed");
        }
    });
    Ok(())
}

pub async fn metrics_handler() -> axum::response::Response {
    let metric_families = prometheus::default_registry().gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return axum::response::Response::builder()
            .status(500)
            .body(axum::body::Body::from(format!("encode error: {e}")))
            .unwrap();
    }
    axum::response::Response::builder()
        .status(200)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(axum::body::Body::from(buf))
        .unwrap()
}
