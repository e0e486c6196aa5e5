//! TOML configuration for detectk.
//!
//! A single file describes where history is stored, how long it is kept and
//! which metrics are monitored with which detectors. Values are validated
//! once at startup; the pipeline only ever sees resolved, typed settings.

pub mod duration;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detect::params::{DetectorKind, DetectorSpec};
use crate::detect::registry::{resolve_specs, DefaultTable};
use crate::storage::retention::RetentionPolicy;
use self::duration::{human, max_duration, MAX_DURATION_DAYS};

/// Environment variable that overrides the configuration file location.
pub const CONFIG_ENV: &str = "DETECTK_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error("unknown detector kind '{0}'")]
    UnknownDetectorKind(String),

    #[error("invalid {kind} detector parameters: {reason}")]
    InvalidParams { kind: DetectorKind, reason: String },

    #[error("duplicate detector id '{id}' for metric '{metric}'")]
    DuplicateDetectorId { metric: String, id: String },

    #[error("invalid metric '{metric}': {reason}")]
    InvalidMetric { metric: String, reason: String },

    #[error("unknown seasonal feature '{0}'")]
    UnknownFeature(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectkConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

impl DetectkConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), metrics = config.metrics.len(), "loaded configuration");
        Ok(config)
    }

    /// Try `DETECTK_CONFIG`, then `./detectk.toml`, then compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "DETECTK_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new("detectk.toml");
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(path = %local.display(), error = %e, "config file could not be loaded, using defaults");
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Validate every metric and reject duplicate metric names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for metric in &self.metrics {
            metric.validate()?;
            if !seen.insert(metric.name.as_str()) {
                return Err(ConfigError::InvalidMetric {
                    metric: metric.name.clone(),
                    reason: "metric defined more than once".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn metric(&self, name: &str) -> Option<&MetricConfig> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// Persist every detection result (needed for cooldown across restarts).
    pub save_detections: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/detectk.db"),
            save_detections: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// One monitored metric and the detectors that run against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Width of the period collected on each scheduled check.
    #[serde(default = "default_collect_interval", with = "human")]
    pub collect_interval: Duration,
    /// Minimum time between two dispatched alerts per detector.
    #[serde(default = "default_cooldown", with = "human")]
    pub cooldown: Duration,
    /// Sub-range width used by bulk loads.
    #[serde(default = "default_batch_size_days")]
    pub batch_size_days: u32,
    /// Calendar features attached to collected points that lack them.
    #[serde(default)]
    pub context_features: Vec<String>,
    #[serde(default)]
    pub detectors: Vec<DetectorConfig>,
}

fn default_collect_interval() -> Duration {
    Duration::minutes(10)
}

fn default_cooldown() -> Duration {
    Duration::minutes(60)
}

fn default_batch_size_days() -> u32 {
    30
}

impl MetricConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            collect_interval: default_collect_interval(),
            cooldown: default_cooldown(),
            batch_size_days: default_batch_size_days(),
            context_features: Vec::new(),
            detectors: Vec::new(),
        }
    }

    /// Builder-style setter adding a detector.
    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidMetric {
            metric: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("use only alphanumeric, underscore and dash"));
        }
        if self.collect_interval <= Duration::zero() {
            return Err(invalid("collect_interval must be positive"));
        }
        if self.cooldown < Duration::zero() {
            return Err(invalid("cooldown cannot be negative"));
        }
        if self.collect_interval > max_duration() || self.cooldown > max_duration() {
            return Err(invalid("durations cannot exceed 36500 days"));
        }
        if self.batch_size_days == 0 {
            return Err(invalid("batch_size_days must be at least 1"));
        }
        if i64::from(self.batch_size_days) > MAX_DURATION_DAYS {
            return Err(invalid("batch_size_days cannot exceed 36500"));
        }
        if self.detectors.is_empty() {
            return Err(invalid("at least one detector is required"));
        }
        crate::context::ContextAnnotator::from_names(&self.context_features)?;
        self.detector_specs(&DefaultTable::v1()).map(|_| ())
    }

    /// Resolve detector ids and typed parameters.
    pub fn detector_specs(&self, defaults: &DefaultTable) -> Result<Vec<DetectorSpec>, ConfigError> {
        resolve_specs(&self.name, &self.detectors, defaults)
    }
}

/// Raw detector entry as written in the file. `params` is interpreted per `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Explicit id; generated from `kind` and `params` when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl DetectorConfig {
    pub fn new(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            params,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}
