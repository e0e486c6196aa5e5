//! Core value types: measurements, seasonal context and detection outcomes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scalar context value attached to a measurement (e.g. `hour_of_day = 14`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::Bool(b) => write!(f, "{b}"),
            ContextValue::Int(i) => write!(f, "{i}"),
            ContextValue::Float(x) => write!(f, "{x}"),
            ContextValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        ContextValue::Int(v)
    }
}

impl From<u32> for ContextValue {
    fn from(v: u32) -> Self {
        ContextValue::Int(i64::from(v))
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Float(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::Text(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::Text(v)
    }
}

/// Seasonal context keyed by feature name. Ordered so it serializes stably.
pub type Context = BTreeMap<String, ContextValue>;

/// One observation of a metric. Identified by `(metric_name, timestamp)` once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    /// `None` when the source reported no value for this instant.
    pub value: Option<f64>,
    #[serde(default)]
    pub context: Context,
}

impl Measurement {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value: Some(value),
            context: Context::new(),
        }
    }

    pub fn missing(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            value: None,
            context: Context::new(),
        }
    }

    /// Builder-style setter for a single context feature.
    pub fn with_context(mut self, feature: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.context.insert(feature.into(), value.into());
        self
    }
}

/// Which side of the expected range a value fell on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// Outcome of evaluating one detector against one measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub metric_name: String,
    pub detector_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub is_anomaly: bool,
    pub score: Option<f64>,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
    pub direction: Option<Direction>,
    pub percent_deviation: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl DetectionResult {
    /// A non-anomalous result with no bounds, to be filled in by the detector.
    pub fn normal(
        metric_name: impl Into<String>,
        detector_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Self {
        Self {
            metric_name: metric_name.into(),
            detector_id: detector_id.into(),
            timestamp,
            value,
            is_anomaly: false,
            score: None,
            lower_bound: None,
            upper_bound: None,
            direction: None,
            percent_deviation: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Builder-style setter for a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// `(value - center) / |center| * 100`, undefined for a zero center. The sign
/// follows `value - center`, so a rise is positive even below zero.
pub fn percent_deviation(value: f64, center: f64) -> Option<f64> {
    if center == 0.0 {
        None
    } else {
        Some((value - center) / center.abs() * 100.0)
    }
}
