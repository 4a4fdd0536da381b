//! Admission-controlled serving: bounded in-flight concurrency, deferred
//! processing while no model is promoted, and atomic hot-swap of the active
//! model handle.
//!
//! Request state machine: RECEIVED -> {ADMITTED -> EXECUTING -> COMPLETED}
//! | DEFERRED | REJECTED. DEFERRED and REJECTED are expected outcomes, not
//! errors, and never touch a dead-letter queue.

use crate::bus::BusHandler;
use crate::claim_check::ClaimCheck;
use crate::error::{CoordinationError, HandlerError};
use crate::metrics;
use crate::types::PromotionRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

/// Immutable snapshot of the currently promoted model. Swapped as a whole
/// `Arc`: readers observe either the old or the new handle, never a mix.
#[derive(Debug, Clone)]
pub struct ActiveModelHandle {
    pub winner_id: String,
    pub pointer: crate::types::ClaimCheckPointer,
    pub weights: Arc<Vec<u8>>,
    pub loaded_at: DateTime<Utc>,
    pub generation: u64,
}

/// Opaque inference collaborator invoked with the active handle.
#[async_trait]
pub trait Inferencer: Send + Sync {
    async fn predict(
        &self,
        model: &ActiveModelHandle,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, CoordinationError>;
}

/// Placeholder collaborator: echoes the request alongside the serving model.
/// Keeps the gateway runnable end to end without a real model runtime.
pub struct EchoInferencer;

#[async_trait]
impl Inferencer for EchoInferencer {
    async fn predict(
        &self,
        model: &ActiveModelHandle,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, CoordinationError> {
        Ok(serde_json::json!({
            "model": model.winner_id,
            "generation": model.generation,
            "weights_bytes": model.weights.len(),
            "echo": request,
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredictOutcome {
    Ok { result: serde_json::Value, generation: u64, req_id: String },
    /// No model promoted yet; recoverable, try again later.
    Deferred,
    /// Concurrency limit reached; backpressure, distinct from Deferred.
    Rejected,
    Error { detail: String },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub model_generation: Option<u64>,
    pub in_flight: u64,
    pub concurrency_limit: usize,
}

pub struct AdmissionController {
    concurrency_limit: usize,
    slots: Arc<Semaphore>,
    in_flight: Arc<AtomicU64>,
    active: RwLock<Option<Arc<ActiveModelHandle>>>,
    generation: AtomicU64,
    request_timeout: Duration,
    loader: Arc<ClaimCheck>,
    inferencer: Arc<dyn Inferencer>,
}

impl AdmissionController {
    pub fn new(
        concurrency_limit: usize,
        request_timeout: Duration,
        loader: Arc<ClaimCheck>,
        inferencer: Arc<dyn Inferencer>,
    ) -> Self {
        Self {
            concurrency_limit,
            slots: Arc::new(Semaphore::new(concurrency_limit)),
            in_flight: Arc::new(AtomicU64::new(0)),
            active: RwLock::new(None),
            generation: AtomicU64::new(0),
            request_timeout,
            loader,
            inferencer,
        }
    }

    pub fn active_handle(&self) -> Option<Arc<ActiveModelHandle>> {
        self.active.read().clone()
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            model_generation: self.active_handle().map(|h| h.generation),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            concurrency_limit: self.concurrency_limit,
        }
    }

    /// Load the promoted weights and swap the active handle. The load happens
    /// before the write lock is taken, so serving never stalls on model I/O.
    pub async fn install_promotion(&self, record: &PromotionRecord) -> Result<u64, CoordinationError> {
        let weights = self.loader.read(&record.winner_pointer).await?;
        // The generation is assigned inside the critical section, so a swap
        // can never install a lower generation than the one it replaces.
        let generation = {
            let mut active = self.active.write();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *active = Some(Arc::new(ActiveModelHandle {
                winner_id: record.winner_id.clone(),
                pointer: record.winner_pointer.clone(),
                weights: Arc::new(weights),
                loaded_at: Utc::now(),
                generation,
            }));
            generation
        };
        metrics::MODEL_GENERATION.set(generation as i64);
        info!(
            target: "admission",
            winner = %record.winner_id,
            fingerprint = %record.fingerprint,
            generation,
            "active model swapped"
        );
        Ok(generation)
    }

    pub async fn predict(&self, request: serde_json::Value) -> PredictOutcome {
        // DEFERRED consumes no slot: an empty handle is an expected state
        // before the first promotion, not a failure.
        let Some(handle) = self.active_handle() else {
            metrics::PREDICT_OUTCOMES_TOTAL.with_label_values(&["deferred"]).inc();
            return PredictOutcome::Deferred;
        };

        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                metrics::PREDICT_OUTCOMES_TOTAL.with_label_values(&["rejected"]).inc();
                return PredictOutcome::Rejected;
            }
        };

        let req_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let _guard = InFlightGuard::new(permit, self.in_flight.clone());
        let outcome = match tokio::time::timeout(
            self.request_timeout,
            self.inferencer.predict(&handle, request),
        )
        .await
        {
            Ok(Ok(result)) => {
                metrics::PREDICT_OUTCOMES_TOTAL.with_label_values(&["ok"]).inc();
                PredictOutcome::Ok { result, generation: handle.generation, req_id }
            }
            Ok(Err(e)) => {
                metrics::PREDICT_OUTCOMES_TOTAL.with_label_values(&["error"]).inc();
                warn!(target: "admission", req_id = %req_id, error = %e, "inference failed");
                PredictOutcome::Error { detail: e.to_string() }
            }
            Err(_) => {
                metrics::PREDICT_OUTCOMES_TOTAL.with_label_values(&["error"]).inc();
                warn!(target: "admission", req_id = %req_id, timeout_ms = self.request_timeout.as_millis() as u64, "request timed out");
                PredictOutcome::Error { detail: "request timed out".into() }
            }
        };
        // _guard drops here: the slot and gauge are released on every path,
        // including inference errors and timeouts.
        outcome
    }
}

/// RAII slot holder; the decrement survives any failure in the handler body.
struct InFlightGuard {
    _permit: OwnedSemaphorePermit,
    gauge: Arc<AtomicU64>,
}

impl InFlightGuard {
    fn new(permit: OwnedSemaphorePermit, gauge: Arc<AtomicU64>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        metrics::IN_FLIGHT_REQUESTS.inc();
        Self { _permit: permit, gauge }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
        metrics::IN_FLIGHT_REQUESTS.dec();
    }
}

/// Bus subscriber performing the hot swap when a promotion arrives. Weights
/// not yet visible in the blob store count as transient: the message is
/// redelivered until the store catches up or retries exhaust.
pub struct PromotionSubscriber {
    pub controller: Arc<AdmissionController>,
}

#[async_trait]
impl BusHandler for PromotionSubscriber {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let record: PromotionRecord = serde_json::from_slice(payload)
            .map_err(|e| HandlerError::malformed(format!("invalid promotion record: {e}")))?;
        self.controller.install_promotion(&record).await.map_err(HandlerError::from)?;
        Ok(())
    }
}
