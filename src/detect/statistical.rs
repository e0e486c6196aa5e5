//! MAD and Z-score detectors: one implementation, two estimators.

use serde_json::json;
use tracing::trace;

use super::params::{DetectorKind, StatisticalParams};
use super::seasonal::{ContextFilter, SeasonalMode};
use super::stats::{decay_weights, TimeSeries};
use super::{DetectError, Detector, Evaluation};
use crate::model::{percent_deviation, DetectionResult, Direction, Measurement};
use crate::storage::Storage;

/// How center and spread are estimated from the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Estimator {
    /// Median and scaled median absolute deviation.
    Median,
    /// Mean and population standard deviation.
    Mean,
}

impl Estimator {
    fn center_and_spread(&self, series: &TimeSeries) -> (f64, f64) {
        match self {
            Estimator::Median => (series.median(), series.mad()),
            Estimator::Mean => (series.mean(), series.std_dev()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatisticalDetector {
    kind: DetectorKind,
    estimator: Estimator,
    params: StatisticalParams,
}

impl StatisticalDetector {
    pub fn mad(params: StatisticalParams) -> Self {
        Self {
            kind: DetectorKind::Mad,
            estimator: Estimator::Median,
            params,
        }
    }

    pub fn zscore(params: StatisticalParams) -> Self {
        Self {
            kind: DetectorKind::Zscore,
            estimator: Estimator::Mean,
            params,
        }
    }

    pub fn params(&self) -> &StatisticalParams {
        &self.params
    }

    fn filter_for(&self, current: &Measurement) -> Option<ContextFilter> {
        if self.params.seasonal_features.is_empty() {
            return None;
        }
        let filter = ContextFilter::for_point(
            &self.params.seasonal_features,
            current,
            SeasonalMode::from_combined(self.params.use_combined_seasonality),
        );
        (!filter.is_passthrough()).then_some(filter)
    }

    /// Judge the current point against an already-filtered history window.
    pub fn evaluate_window(
        &self,
        eval: &Evaluation<'_>,
        window: &[Measurement],
    ) -> Result<DetectionResult, DetectError> {
        let value = eval.value()?;

        let mut values = Vec::with_capacity(window.len());
        let mut stamps = Vec::with_capacity(window.len());
        for m in window {
            let Some(v) = m.value else { continue };
            if !v.is_finite() {
                return Err(DetectError::NonFinite(format!(
                    "window value {v} at {}",
                    m.timestamp
                )));
            }
            values.push(v);
            stamps.push(m.timestamp);
        }

        if values.len() < self.params.min_window_size {
            return Err(DetectError::InsufficientData {
                observed: values.len(),
                required: self.params.min_window_size,
            });
        }

        let observed = values.len();
        let series = if self.params.use_weighted {
            let weights = decay_weights(&stamps, eval.current.timestamp, self.params.exp_decay_factor);
            TimeSeries::weighted(values, weights)
        } else {
            TimeSeries::new(values)
        };
        let (center, spread) = self.estimator.center_and_spread(&series);
        if !center.is_finite() || !spread.is_finite() {
            return Err(DetectError::NonFinite(format!(
                "center {center} / spread {spread}"
            )));
        }

        let mut result = DetectionResult::normal(eval.metric_name, eval.detector_id, eval.current.timestamp, value)
            .with_metadata("center", center)
            .with_metadata("spread", spread)
            .with_metadata("window_points", observed as u64)
            .with_metadata("weighted", self.params.use_weighted);
        result.percent_deviation = percent_deviation(value, center);

        if spread == 0.0 {
            // Degenerate window: any departure from the center is anomalous.
            result.lower_bound = Some(center);
            result.upper_bound = Some(center);
            result.is_anomaly = value != center;
            result.direction = direction_from(value, center, center);
            result.metadata.insert("zero_spread".into(), json!(true));
        } else {
            let lower = center - self.params.n_sigma * spread;
            let upper = center + self.params.n_sigma * spread;
            result.lower_bound = Some(lower);
            result.upper_bound = Some(upper);
            result.is_anomaly = value < lower || value > upper;
            result.direction = direction_from(value, lower, upper);
            result.score = Some((value - center).abs() / spread);
        }

        Ok(result)
    }
}

fn direction_from(value: f64, lower: f64, upper: f64) -> Option<Direction> {
    if value > upper {
        Some(Direction::Up)
    } else if value < lower {
        Some(Direction::Down)
    } else {
        None
    }
}

impl Detector for StatisticalDetector {
    fn kind(&self) -> DetectorKind {
        self.kind
    }

    fn detect(&self, eval: &Evaluation<'_>, storage: &dyn Storage) -> Result<DetectionResult, DetectError> {
        // Reject a bad current point before touching storage.
        eval.value()?;

        let filter = self.filter_for(eval.current);
        let window = storage.query_window(
            eval.metric_name,
            eval.current.timestamp,
            self.params.window_size,
            filter.as_ref(),
        )?;
        trace!(
            metric = %eval.metric_name,
            detector = %eval.detector_id,
            points = window.len(),
            "fetched history window"
        );

        let mut result = self.evaluate_window(eval, &window)?;
        if let Some(filter) = filter {
            result
                .metadata
                .insert("seasonal_context".into(), filter.describe());
        }
        Ok(result)
    }
}
