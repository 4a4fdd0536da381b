//! NATS-backed transport. Consumer groups map to NATS queue groups; the
//! partition key rides a header (core NATS already preserves per-publisher
//! order on a subject, which gives same-key publish order per group).

use super::{deliver_with_retry, BusHandler, MessageBus, RedeliveryPolicy};
use crate::error::CoordinationError;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{info, warn};

pub const PARTITION_KEY_HEADER: &str = "partition-key";

#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    policy: RedeliveryPolicy,
}

impl NatsBus {
    pub async fn connect(url: &str, policy: RedeliveryPolicy) -> Result<Self, CoordinationError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| CoordinationError::Bus(format!("connect {url}: {e}")))?;
        info!(target: "bus", url, "connected to NATS");
        Ok(Self { client, policy })
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        partition_key: Option<&str>,
    ) -> Result<(), CoordinationError> {
        let res = match partition_key {
            Some(key) => {
                let mut headers = async_nats::HeaderMap::new();
                headers.insert(PARTITION_KEY_HEADER, key);
                self.client
                    .publish_with_headers(topic.to_string(), headers, payload.into())
                    .await
            }
            None => self.client.publish(topic.to_string(), payload.into()).await,
        };
        res.map_err(|e| CoordinationError::Bus(format!("publish {topic}: {e}")))?;
        self.client
            .flush()
            .await
            .map_err(|e| CoordinationError::Bus(format!("flush {topic}: {e}")))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<(), CoordinationError> {
        let mut sub = self
            .client
            .queue_subscribe(topic.to_string(), group.to_string())
            .await
            .map_err(|e| CoordinationError::Bus(format!("subscribe {topic}: {e}")))?;
        info!(target: "bus", topic, group, "subscribed");
        let policy = self.policy.clone();
        let bus = self.clone();
        let topic = topic.to_string();
        let group = group.to_string();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                deliver_with_retry(&policy, &topic, &msg.payload, handler.as_ref(), &bus).await;
            }
            warn!(target: "bus", topic, group, "subscription stream closed");
        });
        Ok(())
    }
}
