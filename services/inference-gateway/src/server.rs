//! HTTP surface of the gateway: predict requests plus health and metrics.
//!
//! The admission controller decides the outcome; this layer only maps it to
//! status codes. DEFERRED maps to 503 (retry later, no model yet) and
//! REJECTED to 429 (backpressure), so clients can tell the two apart.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pipeline_core::admission::{AdmissionController, PredictOutcome};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub fn router(controller: Arc<AdmissionController>) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/healthz", get(healthz))
        .route("/metrics", get(pipeline_core::metrics_handler))
        .with_state(controller)
}

pub async fn serve(controller: Arc<AdmissionController>, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "gateway", ?addr, "gateway listening");
    axum::serve(listener, router(controller)).await?;
    Ok(())
}

async fn predict(
    State(controller): State<Arc<AdmissionController>>,
    Json(request): Json<serde_json::Value>,
) -> Response {
    let outcome = controller.predict(request).await;
    let (status, body) = render_outcome(outcome);
    (status, Json(body)).into_response()
}

async fn healthz(State(controller): State<Arc<AdmissionController>>) -> Response {
    let snapshot = controller.health();
    let status = if snapshot.model_generation.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot)).into_response()
}

fn render_outcome(outcome: PredictOutcome) -> (StatusCode, serde_json::Value) {
    match outcome {
        PredictOutcome::Ok { result, generation, req_id } => (
            StatusCode::OK,
            serde_json::json!({
                "status": "OK",
                "request_id": req_id,
                "model_generation": generation,
                "result": result,
            }),
        ),
        PredictOutcome::Deferred => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "DEFERRED",
                "detail": "no model promoted yet, retry later",
            }),
        ),
        PredictOutcome::Rejected => (
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({
                "status": "REJECTED",
                "detail": "concurrency limit reached",
            }),
        ),
        PredictOutcome::Error { detail } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({
                "status": "ERROR",
                "detail": detail,
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_status_codes() {
        let (s, body) = render_outcome(PredictOutcome::Ok {
            result: serde_json::json!({"y": 1}),
            generation: 3,
            req_id: "abc12345".into(),
        });
        assert_eq!(s, StatusCode::OK);
        assert_eq!(body["model_generation"], 3);
        assert_eq!(body["result"]["y"], 1);

        assert_eq!(render_outcome(PredictOutcome::Deferred).0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(render_outcome(PredictOutcome::Rejected).0, StatusCode::TOO_MANY_REQUESTS);
        let (s, body) = render_outcome(PredictOutcome::Error { detail: "boom".into() });
        assert_eq!(s, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "boom");
    }
}
