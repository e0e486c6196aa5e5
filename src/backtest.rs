//! Replay detectors over stored history to see what they would have flagged.
//!
//! Each step judges the stored point at that instant with exactly the
//! history a live check would have seen, and runs a private cooldown gate
//! keyed on data time to count the alerts that would have gone out.

use std::io::Write;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::alert::{AlertKey, CooldownGate};
use crate::config::{ConfigError, MetricConfig};
use crate::detect::registry::{DefaultTable, DetectorRegistry};
use crate::detect::{ConfiguredDetector, DetectError};
use crate::model::{Direction, Measurement};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("invalid backtest range [{start}, {end}]")]
    InvalidRange { start: DateTime<Utc>, end: DateTime<Utc> },

    #[error("step must be positive")]
    InvalidStep,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write report: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Evaluated,
    InsufficientData,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestRow {
    pub timestamp: DateTime<Utc>,
    pub detector_id: String,
    pub status: RowStatus,
    pub value: f64,
    pub is_anomaly: bool,
    pub score: Option<f64>,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
    pub direction: Option<Direction>,
    pub alert_would_send: bool,
    pub error: Option<String>,
}

impl BacktestRow {
    const CSV_HEADER: [&'static str; 10] = [
        "timestamp",
        "detector_id",
        "status",
        "value",
        "is_anomaly",
        "score",
        "lower_bound",
        "upper_bound",
        "direction",
        "alert_would_send",
    ];

    fn csv_record(&self) -> [String; 10] {
        let opt = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
        let status = match self.status {
            RowStatus::Evaluated => "evaluated",
            RowStatus::InsufficientData => "insufficient_data",
            RowStatus::Failed => "failed",
        };
        [
            self.timestamp.to_rfc3339(),
            self.detector_id.clone(),
            status.to_string(),
            self.value.to_string(),
            self.is_anomaly.to_string(),
            opt(self.score),
            opt(self.lower_bound),
            opt(self.upper_bound),
            self.direction.map(|d| d.to_string()).unwrap_or_default(),
            self.alert_would_send.to_string(),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BacktestReport {
    pub metric_name: String,
    /// Steps with no stored measurement (or no value) at that instant.
    pub steps_without_data: usize,
    /// Detector evaluations attempted.
    pub total_checks: usize,
    pub anomalies_detected: usize,
    pub alerts_would_send: usize,
    pub rows: Vec<BacktestRow>,
}

impl BacktestReport {
    pub fn write_csv(&self, out: impl Write) -> Result<(), BacktestError> {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(BacktestRow::CSV_HEADER)?;
        for row in &self.rows {
            writer.write_record(row.csv_record())?;
        }
        writer.flush()?;
        Ok(())
    }
}

pub struct Backtest<'a> {
    metric_name: String,
    cooldown: Duration,
    detectors: Vec<ConfiguredDetector>,
    storage: &'a dyn Storage,
}

impl<'a> Backtest<'a> {
    pub fn new(
        metric_name: impl Into<String>,
        cooldown: Duration,
        detectors: Vec<ConfiguredDetector>,
        storage: &'a dyn Storage,
    ) -> Self {
        Self {
            metric_name: metric_name.into(),
            cooldown,
            detectors,
            storage,
        }
    }

    pub fn from_config(
        config: &MetricConfig,
        registry: &DetectorRegistry,
        defaults: &DefaultTable,
        storage: &'a dyn Storage,
    ) -> Result<Self, BacktestError> {
        config.validate()?;
        let detectors = registry.build_all(config.detector_specs(defaults)?)?;
        Ok(Self::new(config.name.clone(), config.cooldown, detectors, storage))
    }

    fn point_at(&self, ts: DateTime<Utc>) -> Result<Option<Measurement>, StorageError> {
        if !self.storage.has_measurement(&self.metric_name, ts)? {
            return Ok(None);
        }
        let tick = Duration::nanoseconds(1);
        let mut found = self.storage.query_window(&self.metric_name, ts + tick, tick, None)?;
        Ok(found.pop())
    }

    /// Judge every stored point at `start, start + step, ..` up to and
    /// including `end`.
    pub fn run(&self, start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Result<BacktestReport, BacktestError> {
        if end < start {
            return Err(BacktestError::InvalidRange { start, end });
        }
        if step <= Duration::zero() {
            return Err(BacktestError::InvalidStep);
        }

        info!(metric = %self.metric_name, %start, %end, step_secs = step.num_seconds(), "backtest started");

        let gate = CooldownGate::new();
        let mut report = BacktestReport {
            metric_name: self.metric_name.clone(),
            ..BacktestReport::default()
        };

        let mut t = start;
        while t <= end {
            match self.point_at(t)? {
                Some(point) if point.value.is_some() => self.judge(&point, &gate, &mut report),
                _ => report.steps_without_data += 1,
            }
            // Past the last representable instant there is nothing left to judge.
            match t.checked_add_signed(step) {
                Some(next) => t = next,
                None => break,
            }
        }

        info!(
            metric = %self.metric_name,
            checks = report.total_checks,
            anomalies = report.anomalies_detected,
            alerts = report.alerts_would_send,
            "backtest finished"
        );
        Ok(report)
    }

    fn judge(&self, point: &Measurement, gate: &CooldownGate, report: &mut BacktestReport) {
        let value = point.value.unwrap_or_default();
        for detector in &self.detectors {
            report.total_checks += 1;
            let mut row = BacktestRow {
                timestamp: point.timestamp,
                detector_id: detector.id().to_string(),
                status: RowStatus::Evaluated,
                value,
                is_anomaly: false,
                score: None,
                lower_bound: None,
                upper_bound: None,
                direction: None,
                alert_would_send: false,
                error: None,
            };

            match detector.detect(&self.metric_name, point, self.storage) {
                Ok(result) => {
                    row.is_anomaly = result.is_anomaly;
                    row.score = result.score;
                    row.lower_bound = result.lower_bound;
                    row.upper_bound = result.upper_bound;
                    row.direction = result.direction;
                    if result.is_anomaly {
                        report.anomalies_detected += 1;
                        let key = AlertKey::new(&self.metric_name, detector.id());
                        row.alert_would_send = gate.evaluate(&key, point.timestamp, self.cooldown).is_permitted();
                        if row.alert_would_send {
                            report.alerts_would_send += 1;
                        }
                    }
                }
                Err(DetectError::InsufficientData { observed, required }) => {
                    debug!(detector = %detector.id(), observed, required, "insufficient history");
                    row.status = RowStatus::InsufficientData;
                }
                Err(e) => {
                    row.status = RowStatus::Failed;
                    row.error = Some(e.to_string());
                }
            }
            report.rows.push(row);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::storage::SqliteStorage;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn metric(cooldown: Duration) -> MetricConfig {
        let mut config = MetricConfig::new("orders").with_detector(
            DetectorConfig::new("threshold", json!({"operator": "gt", "value": 150.0})).with_id("cap"),
        );
        config.cooldown = cooldown;
        config
    }

    fn storage_with(values: &[f64]) -> SqliteStorage {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let points: Vec<Measurement> = values
            .iter()
            .enumerate()
            .map(|(i, v)| Measurement::new(t0() + Duration::hours(i as i64), *v))
            .collect();
        storage.save_batch("orders", &points).unwrap();
        storage
    }

    #[test]
    fn test_counts_checks_anomalies_and_cooldown() {
        let storage = storage_with(&[100.0, 200.0, 210.0, 100.0, 220.0, 100.0]);
        let backtest = Backtest::from_config(
            &metric(Duration::hours(2)),
            &DetectorRegistry::with_builtins(),
            &DefaultTable::v1(),
            &storage,
        )
        .unwrap();

        let report = backtest
            .run(t0(), t0() + Duration::hours(5), Duration::hours(1))
            .unwrap();

        assert_eq!(report.total_checks, 6);
        assert_eq!(report.anomalies_detected, 3);
        // 01:00 sends, 02:00 is inside the 2h cooldown, 04:00 sends again.
        assert_eq!(report.alerts_would_send, 2);
        let sent: Vec<bool> = report.rows.iter().map(|r| r.alert_would_send).collect();
        assert_eq!(sent, vec![false, true, false, false, true, false]);
    }

    #[test]
    fn test_end_is_inclusive_and_gaps_are_counted() {
        let storage = storage_with(&[100.0, 100.0, 100.0]);
        let backtest = Backtest::from_config(
            &metric(Duration::hours(1)),
            &DetectorRegistry::with_builtins(),
            &DefaultTable::v1(),
            &storage,
        )
        .unwrap();

        let report = backtest
            .run(t0(), t0() + Duration::hours(4), Duration::minutes(30))
            .unwrap();
        // 9 steps, 3 land on stored points
        assert_eq!(report.total_checks, 3);
        assert_eq!(report.steps_without_data, 6);
        assert_eq!(report.rows.last().unwrap().timestamp, t0() + Duration::hours(2));
    }

    #[test]
    fn test_insufficient_history_rows() {
        let storage = storage_with(&[1.0, 2.0, 3.0]);
        let config = MetricConfig::new("orders")
            .with_detector(DetectorConfig::new("mad", json!({"min_window_size": 2})).with_id("mad"));
        let backtest =
            Backtest::from_config(&config, &DetectorRegistry::with_builtins(), &DefaultTable::v1(), &storage).unwrap();

        let report = backtest.run(t0(), t0() + Duration::hours(2), Duration::hours(1)).unwrap();
        let statuses: Vec<RowStatus> = report.rows.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![RowStatus::InsufficientData, RowStatus::InsufficientData, RowStatus::Evaluated]
        );
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let storage = storage_with(&[]);
        let backtest = Backtest::new("orders", Duration::zero(), Vec::new(), &storage);
        assert!(matches!(
            backtest.run(t0(), t0() - Duration::hours(1), Duration::hours(1)),
            Err(BacktestError::InvalidRange { .. })
        ));
        assert!(matches!(
            backtest.run(t0(), t0(), Duration::zero()),
            Err(BacktestError::InvalidStep)
        ));
    }

    #[test]
    fn test_step_past_the_calendar_ends_the_run() {
        let storage = storage_with(&[100.0]);
        let backtest = Backtest::from_config(
            &metric(Duration::hours(1)),
            &DetectorRegistry::with_builtins(),
            &DefaultTable::v1(),
            &storage,
        )
        .unwrap();

        let report = backtest.run(t0(), t0(), Duration::weeks(100_000_000)).unwrap();
        assert_eq!(report.total_checks, 1);
        assert_eq!(report.steps_without_data, 0);
    }

    #[test]
    fn test_csv_export() {
        let storage = storage_with(&[100.0, 200.0]);
        let backtest = Backtest::from_config(
            &metric(Duration::hours(1)),
            &DetectorRegistry::with_builtins(),
            &DefaultTable::v1(),
            &storage,
        )
        .unwrap();
        let report = backtest.run(t0(), t0() + Duration::hours(1), Duration::hours(1)).unwrap();

        let mut buf = Vec::new();
        report.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,detector_id"));
        assert!(lines[2].contains(",cap,evaluated,200,true,"));
        assert!(lines[2].ends_with(",up,true"));
    }

    #[test]
    fn test_csv_quotes_ids_with_separators() {
        let storage = storage_with(&[200.0]);
        let config = MetricConfig::new("orders").with_detector(
            DetectorConfig::new("threshold", json!({"operator": "gt", "value": 150.0})).with_id("cap,\"hard\""),
        );
        let backtest =
            Backtest::from_config(&config, &DetectorRegistry::with_builtins(), &DefaultTable::v1(), &storage).unwrap();
        let report = backtest.run(t0(), t0(), Duration::hours(1)).unwrap();

        let mut buf = Vec::new();
        report.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains(",\"cap,\"\"hard\"\"\",evaluated,"));

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0][1], "cap,\"hard\"");
        assert_eq!(records[0].len(), 10);
    }
}
