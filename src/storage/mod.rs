//! Time-series storage: measurements, detection outcomes and load checkpoints.
//!
//! The store, not the loader, owns idempotency. Every write is an upsert on
//! the natural key, so overlapping or repeated batches converge to the same
//! state and a crashed backfill can simply be re-run.

pub mod retention;
pub mod schema;
pub mod sqlite;

use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detect::params::DetectorKind;
use crate::detect::seasonal::ContextFilter;
use crate::model::{DetectionResult, Measurement};

pub use self::sqlite::SqliteStorage;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

/// Which table a retention sweep applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Measurements,
    Detections,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Measurements => write!(f, "measurements"),
            RecordKind::Detections => write!(f, "detections"),
        }
    }
}

/// A detection result as persisted, with the alert bookkeeping attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    #[serde(flatten)]
    pub result: DetectionResult,
    pub detector_kind: DetectorKind,
    pub alert_sent: bool,
    /// Wall-clock time the alert was dispatched.
    pub alerted_at: Option<DateTime<Utc>>,
    pub alert_reason: Option<String>,
}

impl DetectionRecord {
    pub fn new(result: DetectionResult, detector_kind: DetectorKind) -> Self {
        Self {
            result,
            detector_kind,
            alert_sent: false,
            alerted_at: None,
            alert_reason: None,
        }
    }

    pub fn mark_alerted(mut self, at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        self.alert_sent = true;
        self.alerted_at = Some(at);
        self.alert_reason = Some(reason.into());
        self
    }
}

/// Storage backend contract.
///
/// Implementations must tolerate concurrent callers: writes for different
/// metrics must not interfere, and overlapping writes for the same metric
/// resolve by last-write-wins on the natural key rather than by locking.
pub trait Storage: Send + Sync {
    /// Upsert measurements keyed by `(metric_name, timestamp)`.
    /// Returns the number of rows inserted or changed.
    fn save_batch(&self, metric_name: &str, measurements: &[Measurement]) -> Result<usize, StorageError>;

    /// Measurements in `[end_time - window, end_time)`, oldest first,
    /// optionally restricted to those matching `filter`.
    fn query_window(
        &self,
        metric_name: &str,
        end_time: DateTime<Utc>,
        window: Duration,
        filter: Option<&ContextFilter>,
    ) -> Result<Vec<Measurement>, StorageError>;

    /// Most recent measurement with a value strictly before `before`.
    fn latest_before(&self, metric_name: &str, before: DateTime<Utc>) -> Result<Option<Measurement>, StorageError>;

    fn has_measurement(&self, metric_name: &str, timestamp: DateTime<Utc>) -> Result<bool, StorageError>;

    fn get_checkpoint(&self, metric_name: &str) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Advance the checkpoint. An older timestamp than the stored one is ignored.
    fn set_checkpoint(&self, metric_name: &str, timestamp: DateTime<Utc>) -> Result<(), StorageError>;

    /// Upsert detections keyed by `(metric_name, detector_id, timestamp)`.
    /// A recorded dispatch is never cleared by a later write.
    fn save_detections(&self, records: &[DetectionRecord]) -> Result<usize, StorageError>;

    /// Stored detections in `[start, end)`, oldest first.
    fn query_detections(
        &self,
        metric_name: &str,
        detector_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DetectionRecord>, StorageError>;

    /// Last dispatch time recorded for a `(metric, detector)` pair.
    fn last_alert_at(&self, metric_name: &str, detector_id: &str) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Delete rows of `kind` older than `cutoff`. Returns rows deleted.
    fn purge_older_than(&self, cutoff: DateTime<Utc>, kind: RecordKind) -> Result<usize, StorageError>;
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool, StorageError> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA busy_timeout = 5000;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Single-connection in-memory pool. Each SQLite memory connection is its own
/// database, so the pool is pinned to one connection that never expires.
pub fn open_memory_pool() -> Result<Pool, StorageError> {
    let manager = SqliteConnectionManager::memory();
    let pool = R2D2Pool::builder()
        .max_size(1)
        .max_lifetime(None)
        .idle_timeout(None)
        .build(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode_ts(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            table,
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}
