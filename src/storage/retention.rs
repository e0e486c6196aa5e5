//! Retention sweep. Best-effort: failures are logged and reported, never raised.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{RecordKind, Storage};

/// How many days of each record kind to keep. `0` keeps everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub measurements_days: u32,
    pub detections_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            measurements_days: 90,
            detections_days: 30,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RetentionReport {
    /// Rows deleted per kind; `None` when the sweep was skipped or failed.
    pub measurements_deleted: Option<usize>,
    pub detections_deleted: Option<usize>,
    pub errors: Vec<String>,
}

impl RetentionPolicy {
    pub fn cutoff(&self, kind: RecordKind, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let days = match kind {
            RecordKind::Measurements => self.measurements_days,
            RecordKind::Detections => self.detections_days,
        };
        if days == 0 {
            return None;
        }
        now.checked_sub_signed(Duration::days(i64::from(days)))
    }

    pub fn sweep(&self, storage: &dyn Storage, now: DateTime<Utc>) -> RetentionReport {
        let mut report = RetentionReport::default();

        for kind in [RecordKind::Measurements, RecordKind::Detections] {
            let Some(cutoff) = self.cutoff(kind, now) else {
                continue;
            };
            let deleted = match storage.purge_older_than(cutoff, kind) {
                Ok(n) => {
                    info!(%kind, %cutoff, deleted = n, "retention sweep");
                    Some(n)
                }
                Err(e) => {
                    warn!(%kind, error = %e, "retention sweep failed");
                    report.errors.push(format!("{kind}: {e}"));
                    None
                }
            };
            match kind {
                RecordKind::Measurements => report.measurements_deleted = deleted,
                RecordKind::Detections => report.detections_deleted = deleted,
            }
        }

        report
    }
}
