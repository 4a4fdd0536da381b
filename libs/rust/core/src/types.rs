//! Wire records shared by every pipeline stage.
//!
//! All records cross the bus as JSON. `ClaimCheckPointer` and
//! `LifecycleEvent` are immutable once published; `PromotionRecord` is
//! written once per fingerprint by the promotion engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Version stamped into every claim-check pointer.
pub const POINTER_SCHEMA_VERSION: u8 = 1;

pub const TOPIC_STAGE_INPUT: &str = "stage-input";
pub const TOPIC_STAGE_LIFECYCLE: &str = "stage-lifecycle";
pub const TOPIC_STAGE_PROMOTION: &str = "stage-promotion";
pub const TOPIC_STAGE_INCOMPLETE: &str = "stage-incomplete";

/// Dead-letter topic for a given source topic.
pub fn dlq_topic(topic: &str) -> String {
    format!("DLQ-{topic}")
}

/// Stable hex SHA-256 over a producing configuration. The fingerprint is the
/// join key across every stage of one experiment.
pub fn fingerprint_of(config_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config_bytes);
    hex::encode(hasher.finalize())
}

/// Small pointer message carried over the bus while the payload lives in the
/// blob store (claim-check pattern).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimCheckPointer {
    pub bucket: String,
    pub key: String,
    pub size_bytes: u64,
    pub schema_version: u8,
    pub fingerprint: String,
    pub produced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Started,
    Succeeded,
    Failed,
}

/// Emitted by each parallel producer on `stage-lifecycle`. Multiple
/// STARTED/FAILED events per producer are tolerated; at most one terminal
/// SUCCEEDED is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub producer_id: String,
    pub fingerprint: String,
    pub status: LifecycleStatus,
    /// Present iff status == SUCCEEDED.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result_pointer: Option<ClaimCheckPointer>,
}

/// Written exactly once per fingerprint by the promotion engine and published
/// on `stage-promotion`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub fingerprint: String,
    pub winner_id: String,
    pub winner_pointer: ClaimCheckPointer,
    pub composite_score: f64,
    pub per_candidate_scores: BTreeMap<String, f64>,
    pub promoted_at: DateTime<Utc>,
}

/// Envelope published on `DLQ-<topic>` for messages that exhausted retries or
/// were malformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub original_topic: String,
    pub payload: serde_json::Value,
    pub error_detail: String,
    pub failed_at: DateTime<Utc>,
}

impl DlqEnvelope {
    pub fn new(original_topic: &str, payload: &[u8], error_detail: String) -> Self {
        // Keep the payload verbatim when it is JSON; otherwise carry it as a
        // lossy string so operators can still inspect it.
        let payload = serde_json::from_slice(payload)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()));
        Self {
            original_topic: original_topic.to_string(),
            payload,
            error_detail,
            failed_at: Utc::now(),
        }
    }
}

/// Emitted on `stage-incomplete` when an expected producer never succeeds
/// within the stale timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncompleteSignal {
    pub fingerprint: String,
    pub missing: Vec<String>,
    pub age_secs: u64,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_status_uses_wire_names() {
        assert_eq!(serde_json::to_string(&LifecycleStatus::Succeeded).unwrap(), "\"SUCCEEDED\"");
        let s: LifecycleStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(s, LifecycleStatus::Failed);
    }

    #[test]
    fn event_without_fingerprint_is_rejected_by_serde() {
        let raw = r#"{"producer_id":"GRU","status":"STARTED"}"#;
        assert!(serde_json::from_str::<LifecycleEvent>(raw).is_err());
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint_of(b"cfg-a"), fingerprint_of(b"cfg-a"));
        assert_ne!(fingerprint_of(b"cfg-a"), fingerprint_of(b"cfg-b"));
    }

    #[test]
    fn dlq_envelope_keeps_json_payload_verbatim() {
        let env = DlqEnvelope::new("stage-lifecycle", br#"{"x":1}"#, "bad".into());
        assert_eq!(env.payload, serde_json::json!({"x": 1}));
        assert_eq!(env.original_topic, "stage-lifecycle");
    }
}
