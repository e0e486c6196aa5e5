//! Alert delivery.

pub mod gate;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::model::DetectionResult;

pub use self::gate::{AlertKey, CooldownGate, GateDecision};

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("channel {channel} unreachable: {reason}")]
    Unreachable { channel: String, reason: String },

    #[error("channel {channel} rejected alert: {reason}")]
    Rejected { channel: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Delivery channel for anomaly notifications.
#[async_trait]
pub trait Alerter: Send + Sync {
    /// Short channel name for logs.
    fn name(&self) -> &str;

    /// Deliver one anomaly. `Ok(false)` means the channel accepted the call
    /// but chose not to deliver.
    async fn send(&self, result: &DetectionResult) -> Result<bool, AlertError>;
}

/// One-line human summary of an anomalous result.
pub fn summarize(result: &DetectionResult) -> String {
    let mut line = format!(
        "{} anomaly ({}): value {} at {}",
        result.metric_name,
        result.detector_id,
        result.value,
        result.timestamp.to_rfc3339()
    );
    match (result.lower_bound, result.upper_bound) {
        (Some(lo), Some(hi)) => line.push_str(&format!(", expected [{lo:.4}, {hi:.4}]")),
        (None, Some(hi)) => line.push_str(&format!(", expected <= {hi:.4}")),
        (Some(lo), None) => line.push_str(&format!(", expected >= {lo:.4}")),
        (None, None) => {}
    }
    if let Some(direction) = result.direction {
        line.push_str(&format!(", direction {direction}"));
    }
    if let Some(pct) = result.percent_deviation {
        line.push_str(&format!(", {pct:+.1}%"));
    }
    line
}

/// Writes anomalies to the log as structured warnings.
#[derive(Debug, Default, Clone)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, result: &DetectionResult) -> Result<bool, AlertError> {
        warn!(
            metric = %result.metric_name,
            detector = %result.detector_id,
            timestamp = %result.timestamp,
            value = result.value,
            score = ?result.score,
            direction = ?result.direction,
            "{}",
            summarize(result)
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;
    use chrono::{TimeZone, Utc};

    fn anomaly() -> DetectionResult {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut r = DetectionResult::normal("sessions", "abcd1234", ts, 500.0);
        r.is_anomaly = true;
        r.lower_bound = Some(90.0);
        r.upper_bound = Some(110.0);
        r.direction = Some(Direction::Up);
        r.percent_deviation = Some(400.0);
        r
    }

    #[test]
    fn test_summary_mentions_bounds_and_direction() {
        let line = summarize(&anomaly());
        assert!(line.starts_with("sessions anomaly (abcd1234): value 500"));
        assert!(line.contains("expected [90.0000, 110.0000]"));
        assert!(line.contains("direction up"));
        assert!(line.contains("+400.0%"));
    }

    #[tokio::test]
    async fn test_log_alerter_reports_delivery() {
        assert!(LogAlerter.send(&anomaly()).await.unwrap());
        assert_eq!(LogAlerter.name(), "log");
    }
}
