//! Anomaly detection: detector trait, built-in algorithms and detector identity.

pub mod params;
pub mod registry;
pub mod seasonal;
pub mod stats;
pub mod statistical;
pub mod threshold;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{DetectionResult, Measurement};
use crate::storage::{Storage, StorageError};
use self::params::{DetectorKind, DetectorSpec};

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("insufficient data: need {required} samples, have {observed}")]
    InsufficientData { observed: usize, required: usize },

    #[error("measurement at {timestamp} has no value")]
    MissingValue { timestamp: DateTime<Utc> },

    #[error("non-finite input: {0}")]
    NonFinite(String),

    #[error("history unavailable: {0}")]
    Storage(#[from] StorageError),
}

impl DetectError {
    /// Whether waiting for more history could make the evaluation succeed.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, DetectError::InsufficientData { .. })
    }
}

/// What a detector is asked to judge.
#[derive(Debug, Clone, Copy)]
pub struct Evaluation<'a> {
    pub metric_name: &'a str,
    pub detector_id: &'a str,
    pub current: &'a Measurement,
}

impl<'a> Evaluation<'a> {
    /// The current value, rejecting missing and non-finite inputs.
    pub fn value(&self) -> Result<f64, DetectError> {
        let value = self.current.value.ok_or(DetectError::MissingValue {
            timestamp: self.current.timestamp,
        })?;
        if !value.is_finite() {
            return Err(DetectError::NonFinite(format!(
                "current value {value} at {}",
                self.current.timestamp
            )));
        }
        Ok(value)
    }
}

/// A configured anomaly detection algorithm.
pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Judge `eval.current`, reading whatever history the algorithm needs.
    fn detect(&self, eval: &Evaluation<'_>, storage: &dyn Storage) -> Result<DetectionResult, DetectError>;
}

/// A detector bound to the spec (and id) it was built from.
pub struct ConfiguredDetector {
    pub spec: DetectorSpec,
    detector: Box<dyn Detector>,
}

impl ConfiguredDetector {
    pub fn new(spec: DetectorSpec, detector: Box<dyn Detector>) -> Self {
        Self { spec, detector }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn kind(&self) -> DetectorKind {
        self.detector.kind()
    }

    pub fn detect(
        &self,
        metric_name: &str,
        current: &Measurement,
        storage: &dyn Storage,
    ) -> Result<DetectionResult, DetectError> {
        let eval = Evaluation {
            metric_name,
            detector_id: &self.spec.id,
            current,
        };
        self.detector.detect(&eval, storage)
    }
}

impl std::fmt::Debug for ConfiguredDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredDetector")
            .field("spec", &self.spec)
            .finish()
    }
}
