//! Message bus adapter: named topics, consumer groups, at-least-once
//! delivery with bounded redelivery and dead-letter routing.
//!
//! Two transports implement the same trait and are selected at construction
//! time: `NatsBus` (production) and `InProcessBus` (direct-call mode, used by
//! local runs and tests). Handlers must be idempotent.

use crate::config::{PipelineConfig, TransportKind};
use crate::error::{CoordinationError, HandlerError};
use crate::metrics;
use crate::types::{dlq_topic, DlqEnvelope};
use async_trait::async_trait;
use rand::{thread_rng, Rng};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

mod memory;
mod nats;

pub use memory::InProcessBus;
pub use nats::NatsBus;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload to a topic. Messages sharing a partition key are
    /// delivered in publish order to a given subscriber group.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        partition_key: Option<&str>,
    ) -> Result<(), CoordinationError>;

    /// Attach a handler to a topic under a consumer group. Delivery is
    /// at-least-once; handler errors drive redelivery and DLQ routing.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<(), CoordinationError>;
}

#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Redelivery policy applied between handler attempts before a message is
/// dead-lettered.
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    pub retry_limit: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(1500),
            jitter: 0.25,
        }
    }
}

impl RedeliveryPolicy {
    pub fn with_retry_limit(retry_limit: usize) -> Self {
        Self { retry_limit, ..Self::default() }
    }
}

pub(crate) fn backoff_delay(policy: &RedeliveryPolicy, attempt: usize) -> Duration {
    let exp = policy.base_delay.mul_f64(2f64.powi(attempt as i32));
    let mut delay = std::cmp::min(exp, policy.max_delay);
    if policy.jitter > 0.0 {
        let jitter_ms = (delay.as_millis() as f64 * policy.jitter) as u64;
        if jitter_ms > 0 {
            let offset: i64 = thread_rng().gen_range(-(jitter_ms as i64)..(jitter_ms as i64 + 1));
            let base_ms = delay.as_millis() as i64 + offset;
            delay = Duration::from_millis(base_ms.max(0) as u64);
        }
    }
    delay
}

/// Retry an async operation with the bus backoff schedule.
pub async fn retry_async<F, Fut, T, E>(policy: &RedeliveryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= policy.retry_limit => return Err(e),
            Err(_) => tokio::time::sleep(backoff_delay(policy, attempt)).await,
        }
        attempt += 1;
    }
}

/// Drive one message through a handler: retry transient failures up to the
/// policy limit, then dead-letter; dead-letter malformed messages at once.
/// Never returns an error - the DLQ is the end of the line, and a DLQ publish
/// failure is logged at the highest severity and the message dropped.
pub(crate) async fn deliver_with_retry(
    policy: &RedeliveryPolicy,
    topic: &str,
    payload: &[u8],
    handler: &dyn BusHandler,
    bus: &dyn MessageBus,
) {
    let mut attempt = 0usize;
    loop {
        match handler.handle(payload).await {
            Ok(()) => return,
            Err(HandlerError::Malformed(detail)) => {
                route_to_dlq(bus, topic, payload, detail).await;
                return;
            }
            Err(HandlerError::Transient(detail)) if attempt >= policy.retry_limit => {
                warn!(target: "bus", topic, attempt, %detail, "retries exhausted, dead-lettering");
                route_to_dlq(bus, topic, payload, detail).await;
                return;
            }
            Err(HandlerError::Transient(detail)) => {
                warn!(target: "bus", topic, attempt, %detail, "handler failed, redelivering");
                tokio::time::sleep(backoff_delay(policy, attempt)).await;
                attempt += 1;
            }
        }
    }
}

async fn route_to_dlq(bus: &dyn MessageBus, topic: &str, payload: &[u8], detail: String) {
    // A failed DLQ handler must not dead-letter again; that would loop.
    if topic.starts_with("DLQ-") {
        error!(target: "bus", topic, %detail, "handler failed on dead-letter topic, dropping message");
        metrics::DLQ_DROPPED_TOTAL.inc();
        return;
    }
    let envelope = DlqEnvelope::new(topic, payload, detail);
    let dlq = dlq_topic(topic);
    let bytes = match serde_json::to_vec(&envelope) {
        Ok(b) => b,
        Err(e) => {
            error!(target: "bus", topic, error = %e, "failed to encode DLQ envelope, dropping message");
            metrics::DLQ_DROPPED_TOTAL.inc();
            return;
        }
    };
    match bus.publish(&dlq, bytes, None).await {
        Ok(()) => {
            metrics::DLQ_MESSAGES_TOTAL.with_label_values(&[topic]).inc();
        }
        Err(e) => {
            // No further fallback exists past the DLQ.
            error!(target: "bus", topic, dlq, error = %e, "DLQ publish failed, dropping message");
            metrics::DLQ_DROPPED_TOTAL.inc();
        }
    }
}

/// Build the transport named by the configuration.
pub async fn connect_transport(cfg: &PipelineConfig) -> Result<Arc<dyn MessageBus>, CoordinationError> {
    let policy = RedeliveryPolicy::with_retry_limit(cfg.retry_limit);
    match cfg.transport {
        TransportKind::Memory => Ok(Arc::new(InProcessBus::new(policy))),
        TransportKind::Nats => Ok(Arc::new(NatsBus::connect(&cfg.nats_url, policy).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_eventually_succeeds() {
        let policy = RedeliveryPolicy {
            retry_limit: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        };
        let mut attempts = 0;
        let res: Result<usize, &str> = retry_async(&policy, |_| {
            attempts += 1;
            async move { if attempts < 3 { Err("fail") } else { Ok(7) } }
        })
        .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn backoff_is_bounded() {
        let policy = RedeliveryPolicy {
            retry_limit: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            jitter: 0.0,
        };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 5), Duration::from_millis(400));
    }
}
