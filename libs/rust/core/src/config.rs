//! Service configuration, loaded from an optional YAML file plus environment
//! overrides (`PIPELINE__` prefix, `__` separator). Invalid configuration is
//! fatal at startup.

use crate::promotion::ScoreWeights;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Nats,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PipelineConfig {
    /// Producer ids the completion barrier waits for.
    pub expected_producers: Vec<String>,
    /// Maximum in-flight inference requests before admission rejects.
    pub concurrency_limit: usize,
    /// Seconds before an unfired barrier record is swept as stale.
    pub stale_timeout_secs: u64,
    /// Redeliveries before a failing message is dead-lettered.
    pub retry_limit: usize,
    pub score_weights: ScoreWeights,
    pub transport: TransportKind,
    pub nats_url: String,
    pub http_port: u16,
    pub request_timeout_secs: u64,
    /// Seconds a fired barrier record is retained before GC.
    pub record_retention_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            expected_producers: vec!["GRU".into(), "LSTM".into(), "PROPHET".into()],
            concurrency_limit: 8,
            stale_timeout_secs: 900,
            retry_limit: 3,
            score_weights: ScoreWeights::default(),
            transport: TransportKind::Nats,
            nats_url: "nats://127.0.0.1:4222".into(),
            http_port: 8080,
            request_timeout_secs: 30,
            record_retention_secs: 3600,
        }
    }
}

impl PipelineConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn record_retention(&self) -> Duration {
        Duration::from_secs(self.record_retention_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.expected_producers.is_empty() {
            bail!("expected_producers must not be empty");
        }
        let mut deduped = self.expected_producers.clone();
        deduped.sort();
        deduped.dedup();
        if deduped.len() != self.expected_producers.len() {
            bail!("expected_producers contains duplicates");
        }
        if self.concurrency_limit == 0 {
            bail!("concurrency_limit must be at least 1");
        }
        if self.stale_timeout_secs == 0 {
            bail!("stale_timeout_secs must be positive");
        }
        let w = &self.score_weights;
        for (name, value) in [("rmse", w.rmse), ("mae", w.mae), ("mse", w.mse)] {
            if !value.is_finite() || value < 0.0 {
                bail!("score weight {name} must be a non-negative finite number");
            }
        }
        if w.rmse + w.mae + w.mse <= 0.0 {
            bail!("score weights must not all be zero");
        }
        Ok(())
    }
}

/// Load configuration: defaults, then the file named by
/// `PIPELINE_CONFIG_FILE` if set, then `PIPELINE__*` environment overrides.
pub fn load_config() -> Result<PipelineConfig> {
    let mut builder = Config::builder();
    if let Ok(path) = std::env::var("PIPELINE_CONFIG_FILE") {
        builder = builder.add_source(File::with_name(&path));
    }
    let raw = builder
        .add_source(
            Environment::with_prefix("PIPELINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("expected_producers"),
        )
        .build()
        .context("building configuration")?;
    let cfg: PipelineConfig =
        raw.try_deserialize().context("deserializing configuration")?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PipelineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.expected_producers, vec!["GRU", "LSTM", "PROPHET"]);
        assert_eq!(cfg.transport, TransportKind::Nats);
    }

    #[test]
    fn empty_producer_list_is_rejected() {
        let cfg = PipelineConfig { expected_producers: vec![], ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_producers_are_rejected() {
        let cfg = PipelineConfig {
            expected_producers: vec!["GRU".into(), "GRU".into()],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = PipelineConfig { concurrency_limit: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_weight_is_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.score_weights.mae = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn yaml_round_trips() {
        let cfg = PipelineConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: PipelineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.concurrency_limit, cfg.concurrency_limit);
        assert_eq!(back.transport, cfg.transport);
    }
}
