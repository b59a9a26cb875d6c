//! Training-state configuration types

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Checkpoint settings
    pub checkpoint: CheckpointConfig,

    /// EMA settings
    pub ema: EmaConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl TrainConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: TrainConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ema.decay) {
            return Err(Error::InvalidConfig {
                message: format!("ema.decay must be in [0, 1], got {}", self.ema.decay),
            });
        }
        if self.checkpoint.keep_count == 0 {
            return Err(Error::InvalidConfig {
                message: "checkpoint.keep_count must be at least 1".to_string(),
            });
        }
        if self.checkpoint.save_interval_steps == 0 {
            return Err(Error::InvalidConfig {
                message: "checkpoint.save_interval_steps must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory holding step-indexed checkpoints
    pub directory: PathBuf,

    /// Number of checkpoints to keep
    pub keep_count: usize,

    /// Save every N steps
    pub save_interval_steps: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./checkpoints"),
            keep_count: 5,
            save_interval_steps: 1000,
        }
    }
}

/// EMA configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    /// Weight kept from the previous average on each update
    pub decay: f64,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self { decay: 0.999 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter, overridden by `RUST_LOG`
    pub filter: String,

    /// Directory for scalar event logs
    pub event_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            event_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrainConfig::default();
        assert_eq!(config.checkpoint.keep_count, 5);
        assert_eq!(config.ema.decay, 0.999);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = TrainConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(&path, r#"{"ema": {"decay": 0.99}, "checkpoint": {"keep_count": 2}}"#)
            .unwrap();

        let config = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(config.ema.decay, 0.99);
        assert_eq!(config.checkpoint.keep_count, 2);
        assert_eq!(config.checkpoint.save_interval_steps, 1000);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_validate_rejects_bad_decay() {
        let mut config = TrainConfig::default();
        config.ema.decay = 1.5;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));
    }
}
