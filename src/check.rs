//! One scheduled check of one metric: collect, store, detect, alert, record.
//!
//! Every stage reports its own outcome in [`CheckResult`]; a failing stage
//! only stops the stages that depend on it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::{AlertKey, Alerter, CooldownGate, GateDecision};
use crate::collector::Collector;
use crate::config::{ConfigError, MetricConfig};
use crate::context::ContextAnnotator;
use crate::detect::params::DetectorKind;
use crate::detect::registry::{DefaultTable, DetectorRegistry};
use crate::detect::{ConfiguredDetector, DetectError};
use crate::model::{DetectionResult, Measurement};
use crate::storage::{DetectionRecord, Storage};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed { count: usize },
    Failed { error: String },
}

impl StageOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StageOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Evaluated { result: DetectionResult },
    InsufficientData { observed: usize, required: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorRun {
    pub detector_id: String,
    pub kind: DetectorKind,
    pub timestamp: DateTime<Utc>,
    pub outcome: EvaluationOutcome,
}

impl DetectorRun {
    pub fn result(&self) -> Option<&DetectionResult> {
        match &self.outcome {
            EvaluationOutcome::Evaluated { result } => Some(result),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AlertStatus {
    Sent { reason: String },
    /// The channel accepted the call but did not deliver.
    NotDelivered,
    Suppressed {
        last_dispatch: DateTime<Utc>,
        remaining_secs: i64,
    },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRun {
    pub detector_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: AlertStatus,
}

/// Everything one check attempted, stage by stage.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub run_id: Uuid,
    pub metric_name: String,
    pub executed_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub collection: StageOutcome,
    /// `None` when collection failed.
    pub storage: Option<StageOutcome>,
    pub evaluations: Vec<DetectorRun>,
    pub alerts: Vec<AlertRun>,
    /// `None` when detection did not run or persistence is disabled.
    pub detections_saved: Option<StageOutcome>,
    pub errors: Vec<String>,
}

impl CheckResult {
    fn new(metric_name: &str, now: DateTime<Utc>, period_start: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            metric_name: metric_name.to_string(),
            executed_at: now,
            period_start,
            period_end: now,
            collection: StageOutcome::Completed { count: 0 },
            storage: None,
            evaluations: Vec::new(),
            alerts: Vec::new(),
            detections_saved: None,
            errors: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn anomalies(&self) -> usize {
        self.evaluations
            .iter()
            .filter_map(DetectorRun::result)
            .filter(|r| r.is_anomaly)
            .count()
    }

    pub fn alerts_sent(&self) -> usize {
        self.alerts
            .iter()
            .filter(|a| matches!(a.status, AlertStatus::Sent { .. }))
            .count()
    }
}

/// Scheduled check for one metric.
pub struct MetricCheck {
    metric_name: String,
    collect_interval: Duration,
    cooldown: Duration,
    annotator: ContextAnnotator,
    detectors: Arc<[ConfiguredDetector]>,
    collector: Arc<dyn Collector>,
    storage: Arc<dyn Storage>,
    alerter: Option<Arc<dyn Alerter>>,
    gate: Arc<CooldownGate>,
    save_detections: bool,
}

impl MetricCheck {
    pub fn from_config(
        config: &MetricConfig,
        registry: &DetectorRegistry,
        defaults: &DefaultTable,
        collector: Arc<dyn Collector>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let detectors = registry.build_all(config.detector_specs(defaults)?)?;
        Ok(Self {
            metric_name: config.name.clone(),
            collect_interval: config.collect_interval,
            cooldown: config.cooldown,
            annotator: ContextAnnotator::from_names(&config.context_features)?,
            detectors: detectors.into(),
            collector,
            storage,
            alerter: None,
            gate: Arc::new(CooldownGate::new()),
            save_detections: true,
        })
    }

    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = Some(alerter);
        self
    }

    /// Share one gate across checks (e.g. a scheduler's lifetime).
    pub fn with_gate(mut self, gate: Arc<CooldownGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_save_detections(mut self, save: bool) -> Self {
        self.save_detections = save;
        self
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn detectors(&self) -> &[ConfiguredDetector] {
        &self.detectors
    }

    /// Run the check for the period `[now - collect_interval, now)`.
    pub async fn execute(&self, now: DateTime<Utc>) -> CheckResult {
        let metric = self.metric_name.as_str();
        let Some(period_start) = now.checked_sub_signed(self.collect_interval) else {
            let mut result = CheckResult::new(metric, now, now);
            let error = format!("collection period before {now} is not representable");
            error!(metric = %metric, %now, "collection period out of range");
            result.errors.push(format!("collection: {error}"));
            result.collection = StageOutcome::Failed { error };
            return result;
        };
        let mut result = CheckResult::new(metric, now, period_start);

        info!(metric = %metric, run_id = %result.run_id, %period_start, period_end = %now, "check started");

        // Collection
        let mut points = match self.collector.collect(period_start, now).await {
            Ok(points) => points,
            Err(e) => {
                error!(metric = %metric, error = %e, "collection failed");
                result.errors.push(format!("collection: {e}"));
                result.collection = StageOutcome::Failed { error: e.to_string() };
                return result;
            }
        };
        result.collection = StageOutcome::Completed { count: points.len() };
        self.annotator.annotate_all(&mut points);

        // Storage; detection needs the points to be stored first.
        let saved = {
            let storage = Arc::clone(&self.storage);
            let metric_name = self.metric_name.clone();
            let batch = points.clone();
            tokio::task::spawn_blocking(move || storage.save_batch(&metric_name, &batch)).await
        };
        match flatten(saved) {
            Ok(changed) => result.storage = Some(StageOutcome::Completed { count: changed }),
            Err(e) => {
                error!(metric = %metric, error = %e, "saving measurements failed, skipping detection");
                result.errors.push(format!("storage: {e}"));
                result.storage = Some(StageOutcome::Failed { error: e });
                return result;
            }
        }

        points.retain(|m| m.value.is_some());
        points.sort_by_key(|m| m.timestamp);

        self.seed_gate().await;

        // Detection
        let runs = match self.evaluate_all(points).await {
            Ok(runs) => runs,
            Err(e) => {
                error!(metric = %metric, error = %e, "detection task failed");
                result.errors.push(format!("detection: {e}"));
                return result;
            }
        };

        // Alerting
        let mut records = Vec::new();
        for run in runs {
            if let EvaluationOutcome::Failed { error } = &run.outcome {
                result.errors.push(format!("detector {}: {error}", run.detector_id));
            }

            if let EvaluationOutcome::Evaluated { result: detection } = &run.outcome {
                let mut record = DetectionRecord::new(detection.clone(), run.kind);
                if detection.is_anomaly {
                    if let Some(alert) = self.alert(detection, now).await {
                        match &alert.status {
                            AlertStatus::Sent { reason } => {
                                record = record.mark_alerted(now, reason.clone());
                            }
                            AlertStatus::Failed { error } => {
                                result.errors.push(format!("alert {}: {error}", run.detector_id));
                            }
                            AlertStatus::NotDelivered => {
                                result.errors.push(format!("alert {}: not delivered", run.detector_id));
                            }
                            AlertStatus::Suppressed { .. } => {}
                        }
                        result.alerts.push(alert);
                    }
                }
                records.push(record);
            }
            result.evaluations.push(run);
        }

        // Persistence
        if self.save_detections {
            let count = records.len();
            let storage = Arc::clone(&self.storage);
            let saved = tokio::task::spawn_blocking(move || storage.save_detections(&records)).await;
            let outcome = match flatten(saved) {
                Ok(_) => StageOutcome::Completed { count },
                Err(e) => {
                    error!(metric = %metric, error = %e, "saving detections failed");
                    result.errors.push(format!("detections: {e}"));
                    StageOutcome::Failed { error: e }
                }
            };
            result.detections_saved = Some(outcome);
        }

        info!(
            metric = %metric,
            run_id = %result.run_id,
            evaluations = result.evaluations.len(),
            anomalies = result.anomalies(),
            alerts_sent = result.alerts_sent(),
            errors = result.errors.len(),
            "check finished"
        );
        result
    }

    /// Pick up dispatch times recorded by earlier processes.
    async fn seed_gate(&self) {
        if self.alerter.is_none() {
            return;
        }
        let storage = Arc::clone(&self.storage);
        let metric_name = self.metric_name.clone();
        let detectors = Arc::clone(&self.detectors);
        let lookups = tokio::task::spawn_blocking(move || {
            detectors
                .iter()
                .map(|d| (d.id().to_string(), storage.last_alert_at(&metric_name, d.id())))
                .collect::<Vec<_>>()
        })
        .await;

        let lookups = match lookups {
            Ok(lookups) => lookups,
            Err(e) => {
                warn!(metric = %self.metric_name, error = %e, "could not read last alert times");
                return;
            }
        };
        for (detector_id, lookup) in lookups {
            match lookup {
                Ok(Some(at)) => self.gate.seed(AlertKey::new(&self.metric_name, &detector_id), at),
                Ok(None) => {}
                Err(e) => warn!(
                    metric = %self.metric_name,
                    detector = %detector_id,
                    error = %e,
                    "could not read last alert time"
                ),
            }
        }
    }

    /// Every point against every detector, points in time order and
    /// detectors in configured order. History reads block, so the whole
    /// pass runs on the blocking pool.
    async fn evaluate_all(&self, points: Vec<Measurement>) -> Result<Vec<DetectorRun>, JoinError> {
        let storage = Arc::clone(&self.storage);
        let metric_name = self.metric_name.clone();
        let detectors = Arc::clone(&self.detectors);
        tokio::task::spawn_blocking(move || {
            let mut runs = Vec::with_capacity(points.len() * detectors.len());
            for point in &points {
                for detector in detectors.iter() {
                    runs.push(evaluate(&metric_name, detector, point, storage.as_ref()));
                }
            }
            runs
        })
        .await
    }

    async fn alert(&self, detection: &DetectionResult, now: DateTime<Utc>) -> Option<AlertRun> {
        let alerter = self.alerter.as_ref()?;
        let key = AlertKey::new(&detection.metric_name, &detection.detector_id);

        let status = match self.gate.evaluate(&key, now, self.cooldown) {
            GateDecision::Suppressed { last_dispatch, remaining } => {
                debug!(%key, %last_dispatch, "alert suppressed by cooldown");
                AlertStatus::Suppressed {
                    last_dispatch,
                    remaining_secs: remaining.num_seconds(),
                }
            }
            GateDecision::Permitted { previous } => match alerter.send(detection).await {
                Ok(true) => {
                    info!(%key, channel = alerter.name(), "alert sent");
                    AlertStatus::Sent {
                        reason: alert_reason(detection),
                    }
                }
                Ok(false) => {
                    self.gate.rollback(&key, now, previous);
                    warn!(%key, channel = alerter.name(), "alert not delivered");
                    AlertStatus::NotDelivered
                }
                Err(e) => {
                    self.gate.rollback(&key, now, previous);
                    error!(%key, channel = alerter.name(), error = %e, "alert failed");
                    AlertStatus::Failed { error: e.to_string() }
                }
            },
        };

        Some(AlertRun {
            detector_id: detection.detector_id.clone(),
            timestamp: detection.timestamp,
            status,
        })
    }
}

fn evaluate(metric_name: &str, detector: &ConfiguredDetector, point: &Measurement, storage: &dyn Storage) -> DetectorRun {
    let outcome = match detector.detect(metric_name, point, storage) {
        Ok(result) => {
            debug!(
                metric = %metric_name,
                detector = %detector.id(),
                timestamp = %point.timestamp,
                is_anomaly = result.is_anomaly,
                "evaluated"
            );
            EvaluationOutcome::Evaluated { result }
        }
        Err(DetectError::InsufficientData { observed, required }) => {
            info!(
                metric = %metric_name,
                detector = %detector.id(),
                observed,
                required,
                "not enough history yet"
            );
            EvaluationOutcome::InsufficientData { observed, required }
        }
        Err(e) => {
            warn!(metric = %metric_name, detector = %detector.id(), error = %e, "detector failed");
            EvaluationOutcome::Failed { error: e.to_string() }
        }
    };
    DetectorRun {
        detector_id: detector.id().to_string(),
        kind: detector.kind(),
        timestamp: point.timestamp,
        outcome,
    }
}

/// Collapse a blocking task's join error and its own error into one message.
fn flatten<T, E: std::fmt::Display>(joined: Result<Result<T, E>, JoinError>) -> Result<T, String> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("storage task failed: {e}")),
    }
}

fn alert_reason(detection: &DetectionResult) -> String {
    match detection.score {
        Some(score) => format!("anomaly detected: score={score:.2}"),
        None => "anomaly detected".to_string(),
    }
}

/// Run independent checks concurrently, returning one result per check in
/// input order. A check whose task panics is reported as a failed run.
pub async fn execute_all(checks: Vec<Arc<MetricCheck>>, now: DateTime<Utc>) -> Vec<CheckResult> {
    let names: Vec<String> = checks.iter().map(|c| c.metric_name.clone()).collect();
    let mut set = JoinSet::new();
    for (index, check) in checks.into_iter().enumerate() {
        set.spawn(async move { (index, check.execute(now).await) });
    }

    let mut results: Vec<Option<CheckResult>> = names.iter().map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => error!(error = %e, "check task panicked"),
        }
    }

    results
        .into_iter()
        .zip(names)
        .map(|(result, name)| {
            result.unwrap_or_else(|| {
                let mut aborted = CheckResult::new(&name, now, now);
                let error = "check task panicked".to_string();
                aborted.errors.push(error.clone());
                aborted.collection = StageOutcome::Failed { error };
                aborted
            })
        })
        .collect()
}
