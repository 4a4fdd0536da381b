//! In-process transport: the direct-call counterpart of the NATS bus.
//!
//! Each (topic, group) pair gets one unbounded channel drained by a single
//! dispatch task, which preserves publish order within a group. Topics retain
//! a bounded tail of their log so a late subscriber replays recent messages,
//! matching the earliest-offset behaviour pipelines rely on during startup
//! without holding the whole traffic history for the process lifetime.

use super::{deliver_with_retry, BusHandler, MessageBus, RedeliveryPolicy};
use crate::error::CoordinationError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages kept per topic for late-subscriber replay.
const RETAINED_LIMIT: usize = 1024;

#[derive(Clone)]
pub struct InProcessBus {
    policy: RedeliveryPolicy,
    inner: Arc<Inner>,
}

struct Inner {
    topics: Mutex<HashMap<String, TopicState>>,
}

#[derive(Default)]
struct TopicState {
    retained: VecDeque<Arc<Vec<u8>>>,
    lanes: Vec<GroupLane>,
}

struct GroupLane {
    group: String,
    tx: mpsc::UnboundedSender<Arc<Vec<u8>>>,
}

impl InProcessBus {
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self {
            policy,
            inner: Arc::new(Inner { topics: Mutex::new(HashMap::new()) }),
        }
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _partition_key: Option<&str>,
    ) -> Result<(), CoordinationError> {
        let payload = Arc::new(payload);
        let mut topics = self.inner.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        state.retained.push_back(payload.clone());
        if state.retained.len() > RETAINED_LIMIT {
            state.retained.pop_front();
        }
        // Dispatch tasks own the receiving side; a closed lane means its
        // subscriber is gone and can be skipped.
        state.lanes.retain(|lane| lane.tx.send(payload.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<(), CoordinationError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut topics = self.inner.topics.lock();
            let state = topics.entry(topic.to_string()).or_default();
            if state.lanes.iter().any(|l| l.group == group) {
                return Err(CoordinationError::Bus(format!(
                    "group {group} already subscribed to {topic} (one consumer per group)"
                )));
            }
            for msg in &state.retained {
                let _ = tx.send(msg.clone());
            }
            state.lanes.push(GroupLane { group: group.to_string(), tx });
        }
        let policy = self.policy.clone();
        let bus = self.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                deliver_with_retry(&policy, &topic, &payload, handler.as_ref(), &bus).await;
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::types::{dlq_topic, DlqEnvelope};
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Collect {
        seen: Arc<PlMutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl BusHandler for Collect {
        async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
            self.seen.lock().push(payload.to_vec());
            Ok(())
        }
    }

    fn fast_policy(retry_limit: usize) -> RedeliveryPolicy {
        RedeliveryPolicy {
            retry_limit,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn delivers_in_publish_order_within_group() {
        let bus = InProcessBus::new(fast_policy(0));
        let seen = Arc::new(PlMutex::new(Vec::new()));
        bus.subscribe("t", "g", Arc::new(Collect { seen: seen.clone() })).await.unwrap();
        for i in 0u8..5 {
            bus.publish("t", vec![i], Some("k")).await.unwrap();
        }
        settle().await;
        assert_eq!(*seen.lock(), vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    }

    #[tokio::test]
    async fn late_subscriber_replays_retained_log() {
        let bus = InProcessBus::new(fast_policy(0));
        bus.publish("t", b"early".to_vec(), None).await.unwrap();
        let seen = Arc::new(PlMutex::new(Vec::new()));
        bus.subscribe("t", "late", Arc::new(Collect { seen: seen.clone() })).await.unwrap();
        settle().await;
        assert_eq!(*seen.lock(), vec![b"early".to_vec()]);
    }

    #[tokio::test]
    async fn retained_log_is_bounded() {
        let bus = InProcessBus::new(fast_policy(0));
        let total = RETAINED_LIMIT + 10;
        for i in 0..total {
            bus.publish("t", i.to_le_bytes().to_vec(), None).await.unwrap();
        }
        let seen = Arc::new(PlMutex::new(Vec::new()));
        bus.subscribe("t", "late", Arc::new(Collect { seen: seen.clone() })).await.unwrap();
        for _ in 0..100 {
            if seen.lock().len() >= RETAINED_LIMIT {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let seen = seen.lock();
        assert_eq!(seen.len(), RETAINED_LIMIT);
        // The oldest messages were evicted; the tail survives in order.
        assert_eq!(seen[0], 10usize.to_le_bytes().to_vec());
        assert_eq!(*seen.last().unwrap(), (total - 1).to_le_bytes().to_vec());
    }

    struct AlwaysTransient {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BusHandler for AlwaysTransient {
        async fn handle(&self, _payload: &[u8]) -> Result<(), HandlerError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::transient("downstream unavailable"))
        }
    }

    #[tokio::test]
    async fn transient_failure_retries_then_dead_letters() {
        let bus = InProcessBus::new(fast_policy(2));
        let attempts = Arc::new(AtomicUsize::new(0));
        let dlq_seen = Arc::new(PlMutex::new(Vec::new()));
        bus.subscribe(&dlq_topic("t"), "ops", Arc::new(Collect { seen: dlq_seen.clone() }))
            .await
            .unwrap();
        bus.subscribe("t", "g", Arc::new(AlwaysTransient { attempts: attempts.clone() }))
            .await
            .unwrap();
        bus.publish("t", b"{\"n\":1}".to_vec(), None).await.unwrap();
        settle().await;
        // initial attempt + retry_limit redeliveries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let dlq = dlq_seen.lock();
        assert_eq!(dlq.len(), 1);
        let envelope: DlqEnvelope = serde_json::from_slice(&dlq[0]).unwrap();
        assert_eq!(envelope.original_topic, "t");
        assert!(!envelope.error_detail.is_empty());
    }

    struct AlwaysMalformed {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BusHandler for AlwaysMalformed {
        async fn handle(&self, _payload: &[u8]) -> Result<(), HandlerError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::malformed("missing fingerprint"))
        }
    }

    #[tokio::test]
    async fn malformed_skips_retry_and_keeps_payload_verbatim() {
        let bus = InProcessBus::new(fast_policy(5));
        let attempts = Arc::new(AtomicUsize::new(0));
        let dlq_seen = Arc::new(PlMutex::new(Vec::new()));
        bus.subscribe(&dlq_topic("t"), "ops", Arc::new(Collect { seen: dlq_seen.clone() }))
            .await
            .unwrap();
        bus.subscribe("t", "g", Arc::new(AlwaysMalformed { attempts: attempts.clone() }))
            .await
            .unwrap();
        bus.publish("t", b"{\"producer_id\":\"GRU\"}".to_vec(), None).await.unwrap();
        settle().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let dlq = dlq_seen.lock();
        let envelope: DlqEnvelope = serde_json::from_slice(&dlq[0]).unwrap();
        assert_eq!(envelope.payload, serde_json::json!({"producer_id": "GRU"}));
        assert_eq!(envelope.error_detail, "missing fingerprint");
    }

    #[tokio::test]
    async fn duplicate_group_subscription_is_rejected() {
        let bus = InProcessBus::new(fast_policy(0));
        let seen = Arc::new(PlMutex::new(Vec::new()));
        bus.subscribe("t", "g", Arc::new(Collect { seen: seen.clone() })).await.unwrap();
        let err = bus.subscribe("t", "g", Arc::new(Collect { seen })).await;
        assert!(err.is_err());
    }
}
