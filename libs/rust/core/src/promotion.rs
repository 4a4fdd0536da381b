//! Promotion engine: deterministic winner selection over a completed
//! candidate set, persisted once per fingerprint.
//!
//! Composite score = w_rmse*rmse + w_mae*mae + w_mse*mse, lower is better.
//! Ties break lexicographically on producer id so the decision is
//! reproducible from the same input set regardless of message timing.

use crate::error::CoordinationError;
use crate::metrics;
use crate::types::{LifecycleEvent, PromotionRecord};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

pub const METRIC_RMSE: &str = "rmse";
pub const METRIC_MAE: &str = "mae";
pub const METRIC_MSE: &str = "mse";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub rmse: f64,
    pub mae: f64,
    pub mse: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self { rmse: 0.5, mae: 0.3, mse: 0.2 }
    }
}

impl ScoreWeights {
    /// A candidate missing a metric scores infinity for it and can only win
    /// if every candidate is equally incomplete.
    pub fn composite(&self, candidate_metrics: &BTreeMap<String, f64>) -> f64 {
        let get = |name: &str| candidate_metrics.get(name).copied().unwrap_or(f64::INFINITY);
        self.rmse * get(METRIC_RMSE) + self.mae * get(METRIC_MAE) + self.mse * get(METRIC_MSE)
    }
}

/// Registry collaborator holding the durable promotion pointer per
/// fingerprint.
#[async_trait]
pub trait PromotionRegistry: Send + Sync {
    async fn put_promotion(&self, fingerprint: &str, record: &PromotionRecord) -> Result<(), CoordinationError>;
    async fn get_promotion(&self, fingerprint: &str) -> Result<Option<PromotionRecord>, CoordinationError>;
}

#[derive(Default)]
pub struct MemoryRegistry {
    records: RwLock<HashMap<String, PromotionRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PromotionRegistry for MemoryRegistry {
    async fn put_promotion(&self, fingerprint: &str, record: &PromotionRecord) -> Result<(), CoordinationError> {
        self.records.write().insert(fingerprint.to_string(), record.clone());
        Ok(())
    }

    async fn get_promotion(&self, fingerprint: &str) -> Result<Option<PromotionRecord>, CoordinationError> {
        Ok(self.records.read().get(fingerprint).cloned())
    }
}

pub struct PromotionEngine {
    weights: ScoreWeights,
    registry: Arc<dyn PromotionRegistry>,
}

impl PromotionEngine {
    pub fn new(weights: ScoreWeights, registry: Arc<dyn PromotionRegistry>) -> Self {
        Self { weights, registry }
    }

    /// Score every candidate and pick the winner. Pure: no clock, no I/O.
    pub fn select_winner<'a>(
        &self,
        candidates: &'a BTreeMap<String, LifecycleEvent>,
    ) -> Result<(&'a str, &'a LifecycleEvent, f64, BTreeMap<String, f64>), CoordinationError> {
        let mut scores = BTreeMap::new();
        let mut best: Option<(&str, &LifecycleEvent, f64)> = None;
        // BTreeMap iterates in producer-id order, so keeping the first
        // strictly-lower score implements the lexicographic tie-break.
        for (producer_id, event) in candidates {
            let mut score = self.weights.composite(&event.metrics);
            if score.is_nan() {
                score = f64::INFINITY;
            }
            scores.insert(producer_id.clone(), score);
            if best.map_or(true, |(_, _, s)| score < s) {
                best = Some((producer_id.as_str(), event, score));
            }
        }
        let (winner_id, winner_event, composite) =
            best.ok_or_else(|| CoordinationError::Malformed("empty candidate set".into()))?;
        Ok((winner_id, winner_event, composite, scores))
    }

    /// Promote the completed set for one fingerprint. Idempotent: if the
    /// registry already holds a record for this fingerprint, the first write
    /// wins and the existing record is returned unchanged.
    pub async fn promote(
        &self,
        fingerprint: &str,
        candidates: &BTreeMap<String, LifecycleEvent>,
    ) -> Result<PromotionRecord, CoordinationError> {
        let (winner_id, winner_event, composite, scores) = self.select_winner(candidates)?;
        let winner_pointer = winner_event.result_pointer.clone().ok_or_else(|| {
            CoordinationError::Malformed(format!("winner {winner_id} has no result pointer"))
        })?;

        if let Some(existing) = self.registry.get_promotion(fingerprint).await? {
            if existing.winner_id != winner_id || existing.composite_score != composite {
                warn!(
                    target: "promotion",
                    fingerprint,
                    existing_winner = %existing.winner_id,
                    computed_winner = winner_id,
                    "re-promotion computed a different record; keeping the first write"
                );
            }
            return Ok(existing);
        }

        let record = PromotionRecord {
            fingerprint: fingerprint.to_string(),
            winner_id: winner_id.to_string(),
            winner_pointer,
            composite_score: composite,
            per_candidate_scores: scores,
            promoted_at: Utc::now(),
        };
        self.registry.put_promotion(fingerprint, &record).await?;
        metrics::PROMOTIONS_TOTAL.inc();
        info!(
            target: "promotion",
            fingerprint,
            winner = %record.winner_id,
            score = record.composite_score,
            "candidate promoted"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClaimCheckPointer, LifecycleStatus, POINTER_SCHEMA_VERSION};

    fn pointer(key: &str) -> ClaimCheckPointer {
        ClaimCheckPointer {
            bucket: "models".into(),
            key: key.into(),
            size_bytes: 1,
            schema_version: POINTER_SCHEMA_VERSION,
            fingerprint: "fp".into(),
            produced_at: Utc::now(),
        }
    }

    fn candidate(producer: &str, rmse: f64, mae: f64, mse: f64) -> LifecycleEvent {
        let mut metrics = BTreeMap::new();
        metrics.insert(METRIC_RMSE.to_string(), rmse);
        metrics.insert(METRIC_MAE.to_string(), mae);
        metrics.insert(METRIC_MSE.to_string(), mse);
        LifecycleEvent {
            producer_id: producer.into(),
            fingerprint: "fp".into(),
            status: LifecycleStatus::Succeeded,
            metrics,
            started_at: None,
            ended_at: None,
            result_pointer: Some(pointer(producer)),
        }
    }

    fn engine() -> PromotionEngine {
        PromotionEngine::new(ScoreWeights::default(), Arc::new(MemoryRegistry::new()))
    }

    #[tokio::test]
    async fn lowest_composite_score_wins() {
        let e = engine();
        let mut set = BTreeMap::new();
        set.insert("GRU".to_string(), candidate("GRU", 2.0, 2.0, 2.0));
        set.insert("LSTM".to_string(), candidate("LSTM", 1.0, 1.0, 1.0));
        set.insert("PROPHET".to_string(), candidate("PROPHET", 3.0, 3.0, 3.0));
        let record = e.promote("fp", &set).await.unwrap();
        assert_eq!(record.winner_id, "LSTM");
        assert_eq!(record.composite_score, 1.0);
        assert_eq!(record.per_candidate_scores.len(), 3);
        assert_eq!(record.winner_pointer.key, "LSTM");
    }

    #[tokio::test]
    async fn ties_break_lexicographically() {
        let e = engine();
        let mut set = BTreeMap::new();
        set.insert("LSTM".to_string(), candidate("LSTM", 1.0, 1.0, 1.0));
        set.insert("GRU".to_string(), candidate("GRU", 1.0, 1.0, 1.0));
        let record = e.promote("fp", &set).await.unwrap();
        assert_eq!(record.winner_id, "GRU");
    }

    #[tokio::test]
    async fn missing_metric_scores_infinity() {
        let e = engine();
        let mut incomplete = candidate("GRU", 0.1, 0.1, 0.1);
        incomplete.metrics.remove(METRIC_RMSE);
        let mut set = BTreeMap::new();
        set.insert("GRU".to_string(), incomplete);
        set.insert("LSTM".to_string(), candidate("LSTM", 9.0, 9.0, 9.0));
        let record = e.promote("fp", &set).await.unwrap();
        assert_eq!(record.winner_id, "LSTM");
    }

    #[tokio::test]
    async fn promotion_is_idempotent() {
        let registry = Arc::new(MemoryRegistry::new());
        let e = PromotionEngine::new(ScoreWeights::default(), registry.clone());
        let mut set = BTreeMap::new();
        set.insert("GRU".to_string(), candidate("GRU", 1.0, 1.0, 1.0));
        set.insert("LSTM".to_string(), candidate("LSTM", 2.0, 2.0, 2.0));
        let first = e.promote("fp", &set).await.unwrap();
        let second = e.promote("fp", &set).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.get_promotion("fp").await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn re_promotion_with_different_input_keeps_first_write() {
        let e = engine();
        let mut set = BTreeMap::new();
        set.insert("GRU".to_string(), candidate("GRU", 1.0, 1.0, 1.0));
        let first = e.promote("fp", &set).await.unwrap();
        set.insert("LSTM".to_string(), candidate("LSTM", 0.1, 0.1, 0.1));
        let second = e.promote("fp", &set).await.unwrap();
        assert_eq!(second.winner_id, first.winner_id);
    }

    #[tokio::test]
    async fn empty_candidate_set_is_rejected() {
        let e = engine();
        assert!(matches!(
            e.promote("fp", &BTreeMap::new()).await,
            Err(CoordinationError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn winner_without_pointer_is_rejected() {
        let e = engine();
        let mut broken = candidate("GRU", 1.0, 1.0, 1.0);
        broken.result_pointer = None;
        let mut set = BTreeMap::new();
        set.insert("GRU".to_string(), broken);
        assert!(matches!(
            e.promote("fp", &set).await,
            Err(CoordinationError::Malformed(_))
        ));
    }
}
