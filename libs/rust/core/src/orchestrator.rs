//! Coordinator wiring: the lifecycle consumer feeds the completion barrier,
//! fired sets flow to a promotion worker, and a background sweeper reports
//! stale fingerprints.
//!
//! The barrier fires exactly once, so the promotion step must not ride on bus
//! redelivery: fired sets cross an in-process channel and the worker retries
//! promotion on its own schedule, dead-lettering only after retries exhaust.

use crate::bus::{retry_async, BusHandler, MessageBus, RedeliveryPolicy};
use crate::completion::{CompletedSet, CompletionTracker, Observation};
use crate::config::PipelineConfig;
use crate::error::HandlerError;
use crate::metrics;
use crate::promotion::{PromotionEngine, PromotionRegistry};
use crate::types::{
    dlq_topic, DlqEnvelope, IncompleteSignal, LifecycleEvent, LifecycleStatus,
    TOPIC_STAGE_INCOMPLETE, TOPIC_STAGE_LIFECYCLE, TOPIC_STAGE_PROMOTION,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const LIFECYCLE_GROUP: &str = "coordinator";

fn status_label(status: LifecycleStatus) -> &'static str {
    match status {
        LifecycleStatus::Started => "started",
        LifecycleStatus::Succeeded => "succeeded",
        LifecycleStatus::Failed => "failed",
    }
}

/// Bus handler folding `stage-lifecycle` events into the tracker. Fired sets
/// are forwarded to the promotion worker; the handler itself never fails
/// after the barrier has fired, so redelivery cannot double-promote.
pub struct LifecycleConsumer {
    tracker: Arc<CompletionTracker>,
    fired_tx: mpsc::UnboundedSender<CompletedSet>,
}

#[async_trait::async_trait]
impl BusHandler for LifecycleConsumer {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let event: LifecycleEvent = serde_json::from_slice(payload)
            .map_err(|e| HandlerError::malformed(format!("invalid lifecycle event: {e}")))?;
        if event.fingerprint.is_empty() {
            return Err(HandlerError::malformed("lifecycle event with empty fingerprint"));
        }
        if event.producer_id.is_empty() {
            return Err(HandlerError::malformed("lifecycle event with empty producer_id"));
        }
        metrics::LIFECYCLE_EVENTS_TOTAL
            .with_label_values(&[status_label(event.status)])
            .inc();

        match self.tracker.observe(&event) {
            Observation::Pending { missing } => {
                debug!(target: "orchestrator", fingerprint = %event.fingerprint, missing = missing.len(), "barrier pending");
            }
            Observation::AlreadyFired => {
                debug!(target: "orchestrator", fingerprint = %event.fingerprint, "event after barrier fired, ignored");
            }
            Observation::Fired(set) => {
                if self.fired_tx.send(set).is_err() {
                    // Worker gone means the process is shutting down.
                    return Err(HandlerError::transient("promotion worker unavailable"));
                }
            }
        }
        Ok(())
    }
}

/// Long-lived background pieces of the coordinator.
pub struct Orchestrator {
    pub tracker: Arc<CompletionTracker>,
}

impl Orchestrator {
    /// Subscribe the lifecycle consumer and spawn the promotion worker and
    /// the stale sweeper. Returns once the subscription is attached.
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn PromotionRegistry>,
        cfg: &PipelineConfig,
    ) -> anyhow::Result<Self> {
        let tracker = Arc::new(CompletionTracker::new(cfg.expected_producers.iter().cloned()));
        let engine = Arc::new(PromotionEngine::new(cfg.score_weights, registry));
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();

        spawn_promotion_worker(
            fired_rx,
            engine,
            bus.clone(),
            RedeliveryPolicy::with_retry_limit(cfg.retry_limit),
        );
        spawn_stale_sweeper(
            tracker.clone(),
            bus.clone(),
            cfg.stale_timeout(),
            cfg.record_retention(),
        );

        let consumer = Arc::new(LifecycleConsumer { tracker: tracker.clone(), fired_tx });
        bus.subscribe(TOPIC_STAGE_LIFECYCLE, LIFECYCLE_GROUP, consumer).await?;
        info!(
            target: "orchestrator",
            expected = ?cfg.expected_producers,
            stale_timeout_secs = cfg.stale_timeout_secs,
            "coordinator started"
        );
        Ok(Self { tracker })
    }
}

/// Promote each fired set and publish the record on `stage-promotion`. The
/// whole step retries with backoff; a set that still fails afterwards is
/// dead-lettered so no completion is silently lost.
fn spawn_promotion_worker(
    mut fired_rx: mpsc::UnboundedReceiver<CompletedSet>,
    engine: Arc<PromotionEngine>,
    bus: Arc<dyn MessageBus>,
    policy: RedeliveryPolicy,
) {
    tokio::spawn(async move {
        while let Some(set) = fired_rx.recv().await {
            let fingerprint = set.fingerprint.clone();
            let result = retry_async(&policy, |attempt| {
                let engine = engine.clone();
                let bus = bus.clone();
                let set = &set;
                async move {
                    if attempt > 0 {
                        warn!(target: "orchestrator", fingerprint = %set.fingerprint, attempt, "retrying promotion");
                    }
                    // promote is idempotent, so a retry after a failed
                    // publish re-reads the same record from the registry.
                    let record = engine.promote(&set.fingerprint, &set.completed).await?;
                    let bytes = serde_json::to_vec(&record)
                        .map_err(|e| crate::error::CoordinationError::Malformed(e.to_string()))?;
                    bus.publish(TOPIC_STAGE_PROMOTION, bytes, Some(&set.fingerprint)).await
                }
            })
            .await;

            if let Err(e) = result {
                error!(target: "orchestrator", fingerprint = %fingerprint, error = %e, "promotion failed after retries, dead-lettering");
                let envelope = DlqEnvelope::new(
                    TOPIC_STAGE_PROMOTION,
                    &serde_json::to_vec(&serde_json::json!({ "fingerprint": fingerprint }))
                        .unwrap_or_default(),
                    e.to_string(),
                );
                match serde_json::to_vec(&envelope) {
                    Ok(bytes) => {
                        if bus.publish(&dlq_topic(TOPIC_STAGE_PROMOTION), bytes, None).await.is_ok()
                        {
                            metrics::DLQ_MESSAGES_TOTAL
                                .with_label_values(&[TOPIC_STAGE_PROMOTION])
                                .inc();
                        } else {
                            metrics::DLQ_DROPPED_TOTAL.inc();
                        }
                    }
                    Err(_) => metrics::DLQ_DROPPED_TOTAL.inc(),
                }
            }
        }
    });
}

/// Periodic sweep: report unfired barriers past the stale timeout on
/// `stage-incomplete` and garbage-collect fired records past retention.
fn spawn_stale_sweeper(
    tracker: Arc<CompletionTracker>,
    bus: Arc<dyn MessageBus>,
    stale_timeout: Duration,
    retention: Duration,
) {
    // Sweep at a quarter of the timeout, bounded to stay responsive in tests.
    let interval = (stale_timeout / 4).max(Duration::from_millis(50));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for stale in tracker.sweep_stale(stale_timeout) {
                metrics::STALE_FINGERPRINTS_TOTAL.inc();
                warn!(
                    target: "orchestrator",
                    fingerprint = %stale.fingerprint,
                    missing = ?stale.missing,
                    age_secs = stale.age.as_secs(),
                    "fingerprint incomplete past stale timeout"
                );
                let signal = IncompleteSignal {
                    fingerprint: stale.fingerprint,
                    missing: stale.missing,
                    age_secs: stale.age.as_secs(),
                    detected_at: Utc::now(),
                };
                match serde_json::to_vec(&signal) {
                    Ok(bytes) => {
                        if let Err(e) =
                            bus.publish(TOPIC_STAGE_INCOMPLETE, bytes, Some(&signal.fingerprint)).await
                        {
                            error!(target: "orchestrator", error = %e, "failed to publish incomplete signal");
                        }
                    }
                    Err(e) => {
                        error!(target: "orchestrator", error = %e, "failed to encode incomplete signal")
                    }
                }
            }
            let collected = tracker.sweep_fired(retention);
            if collected > 0 {
                debug!(target: "orchestrator", collected, "fired records garbage-collected");
            }
        }
    });
}
