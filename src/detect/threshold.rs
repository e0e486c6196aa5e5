//! Threshold detector: fixed bounds on the value or on its change.

use super::params::{Baseline, DetectorKind, ThresholdMode, ThresholdOperator, ThresholdParams};
use super::{DetectError, Detector, Evaluation};
use crate::model::{percent_deviation, DetectionResult, Direction};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct ThresholdDetector {
    params: ThresholdParams,
}

/// Outcome of applying the operator to one observed quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Verdict {
    is_anomaly: bool,
    lower: Option<f64>,
    upper: Option<f64>,
    direction: Option<Direction>,
}

impl ThresholdDetector {
    pub fn new(params: ThresholdParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ThresholdParams {
        &self.params
    }

    fn judge(&self, observed: f64) -> Verdict {
        use ThresholdOperator::*;

        // Validated at construction: single-value operators carry `value`,
        // range operators carry both bounds.
        let value = self.params.value.unwrap_or_default();
        let min = self.params.min_value.unwrap_or_default();
        let max = self.params.max_value.unwrap_or_default();

        let (is_anomaly, lower, upper) = match self.params.operator {
            Gt => (observed > value, None, Some(value)),
            Gte => (observed >= value, None, Some(value)),
            Lt => (observed < value, Some(value), None),
            Lte => (observed <= value, Some(value), None),
            Eq => (observed == value, Some(value), Some(value)),
            Neq => (observed != value, Some(value), Some(value)),
            Between => (observed >= min && observed <= max, Some(min), Some(max)),
            Outside => (observed < min || observed > max, Some(min), Some(max)),
        };

        let direction = if !is_anomaly {
            None
        } else {
            match self.params.operator {
                Gt | Gte => Some(Direction::Up),
                Lt | Lte => Some(Direction::Down),
                Neq if observed > value => Some(Direction::Up),
                Neq => Some(Direction::Down),
                Outside if observed > max => Some(Direction::Up),
                Outside => Some(Direction::Down),
                Eq | Between => None,
            }
        };

        Verdict {
            is_anomaly,
            lower,
            upper,
            direction,
        }
    }

    /// Reference value for percent-change mode.
    fn baseline(&self, eval: &Evaluation<'_>, storage: &dyn Storage) -> Result<f64, DetectError> {
        match self.params.baseline {
            Baseline::Previous => {
                let previous = storage
                    .latest_before(eval.metric_name, eval.current.timestamp)?
                    .and_then(|m| m.value);
                previous.ok_or(DetectError::InsufficientData {
                    observed: 0,
                    required: 1,
                })
            }
            Baseline::Average => {
                let window = self.params.baseline_window.unwrap_or_else(chrono::Duration::zero);
                let points = storage.query_window(eval.metric_name, eval.current.timestamp, window, None)?;
                let values: Vec<f64> = points.iter().filter_map(|m| m.value).collect();
                if values.is_empty() {
                    return Err(DetectError::InsufficientData {
                        observed: 0,
                        required: 1,
                    });
                }
                if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
                    return Err(DetectError::NonFinite(format!("baseline value {bad}")));
                }
                Ok(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
    }

    /// Judge a value against static bounds. Never touches storage.
    pub fn evaluate_static(&self, eval: &Evaluation<'_>) -> Result<DetectionResult, DetectError> {
        let value = eval.value()?;
        let verdict = self.judge(value);

        let mut result = DetectionResult::normal(eval.metric_name, eval.detector_id, eval.current.timestamp, value);
        result.is_anomaly = verdict.is_anomaly;
        result.lower_bound = verdict.lower;
        result.upper_bound = verdict.upper;
        result.direction = verdict.direction;
        Ok(result.with_metadata("mode", "static"))
    }

    /// Judge the percent change of the value against `baseline`.
    pub fn evaluate_change(&self, eval: &Evaluation<'_>, baseline: f64) -> Result<DetectionResult, DetectError> {
        let value = eval.value()?;
        let change = percent_deviation(value, baseline)
            .ok_or_else(|| DetectError::NonFinite("zero baseline for percent change".into()))?;
        let verdict = self.judge(change);

        // Bounds are reported in value space. Inverse of `percent_deviation`.
        let to_value = |pct: f64| baseline + baseline.abs() * pct / 100.0;

        let mut result = DetectionResult::normal(eval.metric_name, eval.detector_id, eval.current.timestamp, value);
        result.is_anomaly = verdict.is_anomaly;
        result.lower_bound = verdict.lower.map(to_value);
        result.upper_bound = verdict.upper.map(to_value);
        result.direction = verdict.direction;
        result.percent_deviation = Some(change);
        result.score = Some(change.abs());
        Ok(result
            .with_metadata("mode", "percent_change")
            .with_metadata("baseline", baseline))
    }
}

impl Detector for ThresholdDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Threshold
    }

    fn detect(&self, eval: &Evaluation<'_>, storage: &dyn Storage) -> Result<DetectionResult, DetectError> {
        match self.params.mode {
            ThresholdMode::Static => self.evaluate_static(eval),
            ThresholdMode::PercentChange => {
                eval.value()?;
                let baseline = self.baseline(eval, storage)?;
                self.evaluate_change(eval, baseline)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Measurement;
    use crate::storage::SqliteStorage;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn single(operator: ThresholdOperator, value: f64) -> ThresholdDetector {
        ThresholdDetector::new(ThresholdParams {
            operator,
            value: Some(value),
            ..ThresholdParams::default()
        })
    }

    fn range(operator: ThresholdOperator, min: f64, max: f64) -> ThresholdDetector {
        ThresholdDetector::new(ThresholdParams {
            operator,
            min_value: Some(min),
            max_value: Some(max),
            ..ThresholdParams::default()
        })
    }

    fn check(detector: &ThresholdDetector, value: f64) -> DetectionResult {
        let current = Measurement::new(t0(), value);
        let eval = Evaluation {
            metric_name: "m",
            detector_id: "d",
            current: &current,
        };
        detector.evaluate_static(&eval).unwrap()
    }

    #[test]
    fn test_single_value_operators() {
        use ThresholdOperator::*;
        let cases = [
            (Gt, 10.0, 11.0, true),
            (Gt, 10.0, 10.0, false),
            (Gte, 10.0, 10.0, true),
            (Lt, 10.0, 9.0, true),
            (Lt, 10.0, 10.0, false),
            (Lte, 10.0, 10.0, true),
            (Eq, 0.0, 0.0, true),
            (Eq, 0.0, 1.0, false),
            (Neq, 0.0, 1.0, true),
            (Neq, 0.0, 0.0, false),
        ];
        for (op, threshold, value, expected) in cases {
            let result = check(&single(op, threshold), value);
            assert_eq!(result.is_anomaly, expected, "{op:?} {threshold} vs {value}");
        }
    }

    #[test]
    fn test_directions() {
        assert_eq!(check(&single(ThresholdOperator::Gt, 1.0), 5.0).direction, Some(Direction::Up));
        assert_eq!(check(&single(ThresholdOperator::Lte, 1.0), 0.0).direction, Some(Direction::Down));
        assert_eq!(check(&single(ThresholdOperator::Neq, 1.0), 0.0).direction, Some(Direction::Down));
        assert_eq!(check(&single(ThresholdOperator::Gt, 1.0), 0.0).direction, None);

        let outside = range(ThresholdOperator::Outside, 10.0, 20.0);
        assert_eq!(check(&outside, 25.0).direction, Some(Direction::Up));
        assert_eq!(check(&outside, 5.0).direction, Some(Direction::Down));
        assert!(!check(&outside, 15.0).is_anomaly);
    }

    #[test]
    fn test_range_operators_are_inclusive() {
        let between = range(ThresholdOperator::Between, 10.0, 20.0);
        assert!(check(&between, 10.0).is_anomaly);
        assert!(check(&between, 20.0).is_anomaly);
        assert!(!check(&between, 20.5).is_anomaly);
        assert_eq!(check(&between, 15.0).direction, None);

        let outside = range(ThresholdOperator::Outside, 10.0, 20.0);
        assert!(!check(&outside, 10.0).is_anomaly);
        let r = check(&outside, 21.0);
        assert_eq!((r.lower_bound, r.upper_bound), (Some(10.0), Some(20.0)));
    }

    #[test]
    fn test_static_mode_has_no_score() {
        let r = check(&single(ThresholdOperator::Gt, 1.0), 5.0);
        assert_eq!(r.score, None);
        assert_eq!(r.upper_bound, Some(1.0));
        assert_eq!(r.lower_bound, None);
    }

    #[test]
    fn test_percent_change_against_previous() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .save_batch(
                "m",
                &[
                    Measurement::new(t0(), 80.0),
                    Measurement::new(t0() + Duration::minutes(10), 100.0),
                    Measurement::missing(t0() + Duration::minutes(20)),
                ],
            )
            .unwrap();

        let detector = ThresholdDetector::new(ThresholdParams {
            operator: ThresholdOperator::Outside,
            min_value: Some(-20.0),
            max_value: Some(20.0),
            mode: ThresholdMode::PercentChange,
            baseline: Baseline::Previous,
            ..ThresholdParams::default()
        });

        let current = Measurement::new(t0() + Duration::minutes(30), 130.0);
        let eval = Evaluation {
            metric_name: "m",
            detector_id: "d",
            current: &current,
        };
        let result = detector.detect(&eval, &storage).unwrap();
        assert!(result.is_anomaly);
        assert_eq!(result.direction, Some(Direction::Up));
        assert!((result.percent_deviation.unwrap() - 30.0).abs() < 1e-9);
        assert_eq!(result.upper_bound, Some(120.0));
        assert_eq!(result.lower_bound, Some(80.0));

        let current = Measurement::new(t0() + Duration::minutes(30), 110.0);
        let eval = Evaluation { current: &current, ..eval };
        assert!(!detector.detect(&eval, &storage).unwrap().is_anomaly);
    }

    #[test]
    fn test_percent_change_against_average() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let points: Vec<Measurement> = (0..4)
            .map(|i| Measurement::new(t0() + Duration::hours(i), 50.0 + 50.0 * (i % 2) as f64))
            .collect();
        storage.save_batch("m", &points).unwrap();

        let detector = ThresholdDetector::new(ThresholdParams {
            operator: ThresholdOperator::Lt,
            value: Some(-50.0),
            mode: ThresholdMode::PercentChange,
            baseline: Baseline::Average,
            baseline_window: Some(Duration::days(1)),
            ..ThresholdParams::default()
        });

        // baseline mean is 75; 30 is a 60% drop
        let current = Measurement::new(t0() + Duration::hours(5), 30.0);
        let eval = Evaluation {
            metric_name: "m",
            detector_id: "d",
            current: &current,
        };
        let result = detector.detect(&eval, &storage).unwrap();
        assert!(result.is_anomaly);
        assert_eq!(result.direction, Some(Direction::Down));
        assert_eq!(result.metadata["baseline"], serde_json::json!(75.0));
        assert!((result.score.unwrap() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_percent_change_without_history_is_insufficient() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let detector = ThresholdDetector::new(ThresholdParams {
            value: Some(10.0),
            mode: ThresholdMode::PercentChange,
            ..ThresholdParams::default()
        });
        let current = Measurement::new(t0(), 1.0);
        let eval = Evaluation {
            metric_name: "m",
            detector_id: "d",
            current: &current,
        };
        let err = detector.detect(&eval, &storage).unwrap_err();
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn test_percent_change_from_negative_baseline() {
        let detector = ThresholdDetector::new(ThresholdParams {
            operator: ThresholdOperator::Outside,
            min_value: Some(-20.0),
            max_value: Some(20.0),
            mode: ThresholdMode::PercentChange,
            ..ThresholdParams::default()
        });
        let judge = |value: f64| {
            let current = Measurement::new(t0(), value);
            let eval = Evaluation {
                metric_name: "m",
                detector_id: "d",
                current: &current,
            };
            detector.evaluate_change(&eval, -100.0).unwrap()
        };

        // -130 is 30% further below a baseline of -100.
        let below = judge(-130.0);
        assert!(below.is_anomaly);
        assert_eq!(below.direction, Some(Direction::Down));
        assert!((below.percent_deviation.unwrap() + 30.0).abs() < 1e-9);
        assert_eq!(below.lower_bound, Some(-120.0));
        assert_eq!(below.upper_bound, Some(-80.0));
        assert!(below.value < below.lower_bound.unwrap());

        let above = judge(-70.0);
        assert!(above.is_anomaly);
        assert_eq!(above.direction, Some(Direction::Up));
        assert!(above.value > above.upper_bound.unwrap());

        let inside = judge(-90.0);
        assert!(!inside.is_anomaly);
        assert!(inside.value >= inside.lower_bound.unwrap() && inside.value <= inside.upper_bound.unwrap());
    }

    #[test]
    fn test_zero_baseline_is_rejected() {
        let detector = single(ThresholdOperator::Gt, 10.0);
        let current = Measurement::new(t0(), 1.0);
        let eval = Evaluation {
            metric_name: "m",
            detector_id: "d",
            current: &current,
        };
        assert!(matches!(
            detector.evaluate_change(&eval, 0.0),
            Err(DetectError::NonFinite(_))
        ));
    }
}
