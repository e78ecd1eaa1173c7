//! Harness configuration.

use std::path::Path;

use anyhow::{Context, Result};
use foresight_core::PredictionConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Simulation ticks per second of game time.
    #[serde(default = "default_tick_rate")]
    pub tick_rate: f64,

    /// Upper bound on ticks spent waiting for the network to go quiet.
    #[serde(default = "default_settle_ticks")]
    pub settle_ticks: u64,

    /// Keep a JSON transcript of every message in the report.
    #[serde(default)]
    pub record_transcript: bool,

    #[serde(default)]
    pub prediction: PredictionConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// One-way delay, in ticks, applied in both directions.
    #[serde(default = "default_latency_ticks")]
    pub latency_ticks: u64,
}

fn default_tick_rate() -> f64 {
    30.0
}
fn default_settle_ticks() -> u64 {
    120
}
fn default_latency_ticks() -> u64 {
    3
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency_ticks: default_latency_ticks(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_rate: default_tick_rate(),
            settle_ticks: default_settle_ticks(),
            record_transcript: false,
            prediction: PredictionConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given and present, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                tracing::warn!(path = %path.display(), "config file not found; using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.tick_rate > 0.0,
            "tick_rate must be positive, got {}",
            self.tick_rate
        );
        anyhow::ensure!(
            self.prediction.replicated_key_slots > 0,
            "prediction.replicated_key_slots must be at least 1"
        );
        Ok(())
    }

    /// Seconds of game time per tick.
    pub fn tick_interval(&self) -> f64 {
        1.0 / self.tick_rate
    }
}
