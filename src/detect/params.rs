//! Typed detector parameters, validated at construction.

use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::config::duration::{human, human_opt};
use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    Threshold,
    Mad,
    Zscore,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 3] = [DetectorKind::Threshold, DetectorKind::Mad, DetectorKind::Zscore];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Threshold => "threshold",
            DetectorKind::Mad => "mad",
            DetectorKind::Zscore => "zscore",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "threshold" => Ok(DetectorKind::Threshold),
            "mad" => Ok(DetectorKind::Mad),
            "zscore" | "z_score" | "z-score" => Ok(DetectorKind::Zscore),
            _ => Err(ConfigError::UnknownDetectorKind(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Threshold
// ---------------------------------------------------------------------------

/// Condition that marks a value as anomalous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOperator {
    #[serde(alias = "greater_than")]
    Gt,
    #[serde(alias = "greater_than_or_equal")]
    Gte,
    #[serde(alias = "less_than")]
    Lt,
    #[serde(alias = "less_than_or_equal")]
    Lte,
    #[serde(alias = "equals")]
    Eq,
    #[serde(alias = "not_equals")]
    Neq,
    /// Anomalous inside `[min_value, max_value]`.
    Between,
    /// Anomalous outside `[min_value, max_value]`.
    Outside,
}

impl ThresholdOperator {
    pub fn is_range(&self) -> bool {
        matches!(self, ThresholdOperator::Between | ThresholdOperator::Outside)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Compare the raw value.
    Static,
    /// Compare the percent change against a baseline.
    PercentChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Baseline {
    /// Last stored point with a value.
    Previous,
    /// Mean over `baseline_window`.
    Average,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThresholdParams {
    pub operator: ThresholdOperator,
    #[serde(alias = "threshold")]
    pub value: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub mode: ThresholdMode,
    pub baseline: Baseline,
    #[serde(with = "human_opt")]
    pub baseline_window: Option<Duration>,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self {
            operator: ThresholdOperator::Gt,
            value: None,
            min_value: None,
            max_value: None,
            mode: ThresholdMode::Static,
            baseline: Baseline::Previous,
            baseline_window: None,
        }
    }
}

impl ThresholdParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidParams {
            kind: DetectorKind::Threshold,
            reason,
        };

        if self.operator.is_range() {
            let (Some(min), Some(max)) = (self.min_value, self.max_value) else {
                return Err(invalid(format!(
                    "operator {:?} requires min_value and max_value",
                    self.operator
                )));
            };
            if !min.is_finite() || !max.is_finite() {
                return Err(invalid("min_value and max_value must be finite".into()));
            }
            if min > max {
                return Err(invalid(format!("min_value {min} exceeds max_value {max}")));
            }
        } else {
            match self.value {
                Some(v) if v.is_finite() => {}
                Some(v) => return Err(invalid(format!("value {v} must be finite"))),
                None => {
                    return Err(invalid(format!("operator {:?} requires value", self.operator)))
                }
            }
        }

        if self.mode == ThresholdMode::PercentChange && self.baseline == Baseline::Average {
            match self.baseline_window {
                Some(w) if w > Duration::zero() => {}
                _ => return Err(invalid("average baseline requires a positive baseline_window".into())),
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MAD / Z-score
// ---------------------------------------------------------------------------

/// Parameters shared by the MAD and Z-score detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatisticalParams {
    /// History considered before the current point.
    #[serde(with = "human")]
    pub window_size: Duration,
    pub n_sigma: f64,
    /// Fewest points (after seasonal filtering) needed to evaluate.
    pub min_window_size: usize,
    pub seasonal_features: Vec<String>,
    /// Match all features (intersection) instead of any one (union).
    pub use_combined_seasonality: bool,
    pub use_weighted: bool,
    /// Decay per day of age when `use_weighted` is set.
    #[serde(alias = "decay_factor")]
    pub exp_decay_factor: f64,
}

pub type MadParams = StatisticalParams;
pub type ZScoreParams = StatisticalParams;

impl Default for StatisticalParams {
    fn default() -> Self {
        Self {
            window_size: Duration::days(30),
            n_sigma: 3.0,
            min_window_size: 100,
            seasonal_features: Vec::new(),
            use_combined_seasonality: false,
            use_weighted: false,
            exp_decay_factor: 0.1,
        }
    }
}

impl StatisticalParams {
    /// Seasonal features form a set; order and repeats carry no meaning.
    fn normalize(&mut self) {
        self.seasonal_features.sort();
        self.seasonal_features.dedup();
    }

    pub fn validate(&self, kind: DetectorKind) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidParams { kind, reason };

        if self.window_size <= Duration::zero() {
            return Err(invalid("window_size must be positive".into()));
        }
        if !(self.n_sigma.is_finite() && self.n_sigma > 0.0) {
            return Err(invalid(format!("n_sigma {} must be a positive number", self.n_sigma)));
        }
        if self.min_window_size == 0 {
            return Err(invalid("min_window_size must be at least 1".into()));
        }
        if !(self.exp_decay_factor.is_finite() && self.exp_decay_factor >= 0.0) {
            return Err(invalid(format!(
                "exp_decay_factor {} must be a non-negative number",
                self.exp_decay_factor
            )));
        }
        if self.seasonal_features.iter().any(|f| f.trim().is_empty()) {
            return Err(invalid("seasonal feature names cannot be empty".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tagged params + spec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorParams {
    Threshold(ThresholdParams),
    Mad(MadParams),
    Zscore(ZScoreParams),
}

impl DetectorParams {
    /// Interpret a loosely-typed parameter map for `kind`, validating it.
    pub fn from_value(kind: DetectorKind, value: serde_json::Value) -> Result<Self, ConfigError> {
        let value = match value {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        let invalid = |e: serde_json::Error| ConfigError::InvalidParams {
            kind,
            reason: e.to_string(),
        };

        let params = match kind {
            DetectorKind::Threshold => {
                DetectorParams::Threshold(serde_json::from_value(value).map_err(invalid)?)
            }
            DetectorKind::Mad => {
                let mut p: MadParams = serde_json::from_value(value).map_err(invalid)?;
                p.normalize();
                DetectorParams::Mad(p)
            }
            DetectorKind::Zscore => {
                let mut p: ZScoreParams = serde_json::from_value(value).map_err(invalid)?;
                p.normalize();
                DetectorParams::Zscore(p)
            }
        };
        params.validate()?;
        Ok(params)
    }

    pub fn kind(&self) -> DetectorKind {
        match self {
            DetectorParams::Threshold(_) => DetectorKind::Threshold,
            DetectorParams::Mad(_) => DetectorKind::Mad,
            DetectorParams::Zscore(_) => DetectorKind::Zscore,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DetectorParams::Threshold(p) => p.validate(),
            DetectorParams::Mad(p) => p.validate(DetectorKind::Mad),
            DetectorParams::Zscore(p) => p.validate(DetectorKind::Zscore),
        }
    }

    /// The fully-populated parameter object, defaults included.
    pub fn to_value(&self) -> serde_json::Value {
        let value = match self {
            DetectorParams::Threshold(p) => serde_json::to_value(p),
            DetectorParams::Mad(p) | DetectorParams::Zscore(p) => serde_json::to_value(p),
        };
        // Plain structs of scalars, strings and string lists always serialize.
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// One detector configuration for a metric, with its resolved id.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSpec {
    pub id: String,
    pub params: DetectorParams,
}

impl DetectorSpec {
    pub fn kind(&self) -> DetectorKind {
        self.params.kind()
    }
}
