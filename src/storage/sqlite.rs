//! SQLite-backed [`Storage`] on an r2d2 connection pool.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tracing::debug;

use super::{
    decode_ts, encode_ts, open_memory_pool, open_pool, DetectionRecord, Pool, RecordKind, Storage,
    StorageError,
};
use crate::detect::params::DetectorKind;
use crate::detect::seasonal::ContextFilter;
use crate::model::{Context, DetectionResult, Direction, Measurement};

#[derive(Clone)]
pub struct SqliteStorage {
    pool: Pool,
}

impl SqliteStorage {
    /// Open (or create) a database file, creating its parent directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Corrupt {
                table: "database",
                reason: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
        let pool = open_pool(&path.to_string_lossy())?;
        debug!(path = %path.display(), "opened sqlite storage");
        Ok(Self { pool })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            pool: open_memory_pool()?,
        })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }

    /// Number of stored measurements for a metric.
    pub fn count_measurements(&self, metric_name: &str) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM measurements WHERE metric_name = ?1",
            params![metric_name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn decode_measurement(
    ts: String,
    value: Option<f64>,
    context_json: Option<String>,
) -> Result<Measurement, StorageError> {
    let context: Context = match context_json {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Context::new(),
    };
    Ok(Measurement {
        timestamp: decode_ts("measurements", &ts)?,
        value,
        context,
    })
}

struct DetectionRow {
    metric_name: String,
    detector_id: String,
    ts: String,
    detector_kind: String,
    value: f64,
    is_anomaly: bool,
    score: Option<f64>,
    lower_bound: Option<f64>,
    upper_bound: Option<f64>,
    direction: Option<String>,
    percent_deviation: Option<f64>,
    metadata_json: String,
    alert_sent: bool,
    alerted_at: Option<String>,
    alert_reason: Option<String>,
}

impl DetectionRow {
    fn into_record(self) -> Result<DetectionRecord, StorageError> {
        let corrupt = |reason: String| StorageError::Corrupt {
            table: "detections",
            reason,
        };
        let detector_kind: DetectorKind =
            self.detector_kind.parse().map_err(|e| corrupt(format!("{e}")))?;
        let direction: Option<Direction> = self
            .direction
            .map(|d| d.parse())
            .transpose()
            .map_err(corrupt)?;
        let alerted_at = self
            .alerted_at
            .map(|raw| decode_ts("detections", &raw))
            .transpose()?;

        Ok(DetectionRecord {
            result: DetectionResult {
                metric_name: self.metric_name,
                detector_id: self.detector_id,
                timestamp: decode_ts("detections", &self.ts)?,
                value: self.value,
                is_anomaly: self.is_anomaly,
                score: self.score,
                lower_bound: self.lower_bound,
                upper_bound: self.upper_bound,
                direction,
                percent_deviation: self.percent_deviation,
                metadata: serde_json::from_str(&self.metadata_json)?,
            },
            detector_kind,
            alert_sent: self.alert_sent,
            alerted_at,
            alert_reason: self.alert_reason,
        })
    }
}

impl Storage for SqliteStorage {
    fn save_batch(&self, metric_name: &str, measurements: &[Measurement]) -> Result<usize, StorageError> {
        if measurements.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = encode_ts(&Utc::now());
        let mut changed = 0;
        {
            // Identical rows are skipped by the WHERE clause, so `changed`
            // counts only rows that actually landed or were overwritten.
            let mut stmt = tx.prepare_cached(
                "INSERT INTO measurements (metric_name, ts, value, context_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(metric_name, ts) DO UPDATE SET
                     value = excluded.value,
                     context_json = excluded.context_json,
                     updated_at = excluded.updated_at
                 WHERE measurements.value IS NOT excluded.value
                    OR measurements.context_json IS NOT excluded.context_json",
            )?;

            for m in measurements {
                let context_json = if m.context.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&m.context)?)
                };
                changed += stmt.execute(params![
                    metric_name,
                    encode_ts(&m.timestamp),
                    m.value,
                    context_json,
                    now
                ])?;
            }
        }
        tx.commit()?;

        debug!(metric = %metric_name, received = measurements.len(), changed, "saved measurement batch");
        Ok(changed)
    }

    fn query_window(
        &self,
        metric_name: &str,
        end_time: DateTime<Utc>,
        window: Duration,
        filter: Option<&ContextFilter>,
    ) -> Result<Vec<Measurement>, StorageError> {
        let start = end_time
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT ts, value, context_json FROM measurements
             WHERE metric_name = ?1 AND ts >= ?2 AND ts < ?3
             ORDER BY ts ASC",
        )?;

        let rows = stmt.query_map(
            params![metric_name, encode_ts(&start), encode_ts(&end_time)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )?;

        let mut points = Vec::new();
        for r in rows {
            let (ts, value, context_json) = r?;
            let m = decode_measurement(ts, value, context_json)?;
            if filter.map_or(true, |f| f.matches(&m)) {
                points.push(m);
            }
        }
        Ok(points)
    }

    fn latest_before(&self, metric_name: &str, before: DateTime<Utc>) -> Result<Option<Measurement>, StorageError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT ts, value, context_json FROM measurements
                 WHERE metric_name = ?1 AND ts < ?2 AND value IS NOT NULL
                 ORDER BY ts DESC LIMIT 1",
                params![metric_name, encode_ts(&before)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(ts, value, context_json)| decode_measurement(ts, value, context_json))
            .transpose()
    }

    fn has_measurement(&self, metric_name: &str, timestamp: DateTime<Utc>) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM measurements WHERE metric_name = ?1 AND ts = ?2)",
            params![metric_name, encode_ts(&timestamp)],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    fn get_checkpoint(&self, metric_name: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT last_loaded_at FROM checkpoints WHERE metric_name = ?1",
                params![metric_name],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| decode_ts("checkpoints", &r)).transpose()
    }

    fn set_checkpoint(&self, metric_name: &str, timestamp: DateTime<Utc>) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO checkpoints (metric_name, last_loaded_at, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(metric_name) DO UPDATE SET
                 last_loaded_at = excluded.last_loaded_at,
                 updated_at = excluded.updated_at
             WHERE excluded.last_loaded_at > checkpoints.last_loaded_at",
            params![metric_name, encode_ts(&timestamp), encode_ts(&Utc::now())],
        )?;
        Ok(())
    }

    fn save_detections(&self, records: &[DetectionRecord]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = encode_ts(&Utc::now());
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO detections (
                    metric_name, detector_id, ts, detector_kind, value, is_anomaly,
                    score, lower_bound, upper_bound, direction, percent_deviation,
                    metadata_json, alert_sent, alerted_at, alert_reason, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(metric_name, detector_id, ts) DO UPDATE SET
                     detector_kind = excluded.detector_kind,
                     value = excluded.value,
                     is_anomaly = excluded.is_anomaly,
                     score = excluded.score,
                     lower_bound = excluded.lower_bound,
                     upper_bound = excluded.upper_bound,
                     direction = excluded.direction,
                     percent_deviation = excluded.percent_deviation,
                     metadata_json = excluded.metadata_json,
                     alert_sent = MAX(detections.alert_sent, excluded.alert_sent),
                     alerted_at = COALESCE(excluded.alerted_at, detections.alerted_at),
                     alert_reason = COALESCE(excluded.alert_reason, detections.alert_reason),
                     updated_at = excluded.updated_at",
            )?;

            for record in records {
                let r = &record.result;
                changed += stmt.execute(params![
                    r.metric_name,
                    r.detector_id,
                    encode_ts(&r.timestamp),
                    record.detector_kind.as_str(),
                    r.value,
                    r.is_anomaly,
                    r.score,
                    r.lower_bound,
                    r.upper_bound,
                    r.direction.map(|d| d.to_string()),
                    r.percent_deviation,
                    serde_json::to_string(&r.metadata)?,
                    record.alert_sent,
                    record.alerted_at.as_ref().map(encode_ts),
                    record.alert_reason,
                    now
                ])?;
            }
        }
        tx.commit()?;

        debug!(records = records.len(), "saved detections");
        Ok(changed)
    }

    fn query_detections(
        &self,
        metric_name: &str,
        detector_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DetectionRecord>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT metric_name, detector_id, ts, detector_kind, value, is_anomaly,
                    score, lower_bound, upper_bound, direction, percent_deviation,
                    metadata_json, alert_sent, alerted_at, alert_reason
             FROM detections
             WHERE metric_name = ?1
               AND (?2 IS NULL OR detector_id = ?2)
               AND ts >= ?3 AND ts < ?4
             ORDER BY ts ASC, detector_id ASC",
        )?;

        let rows = stmt.query_map(
            params![metric_name, detector_id, encode_ts(&start), encode_ts(&end)],
            |row| {
                Ok(DetectionRow {
                    metric_name: row.get(0)?,
                    detector_id: row.get(1)?,
                    ts: row.get(2)?,
                    detector_kind: row.get(3)?,
                    value: row.get(4)?,
                    is_anomaly: row.get(5)?,
                    score: row.get(6)?,
                    lower_bound: row.get(7)?,
                    upper_bound: row.get(8)?,
                    direction: row.get(9)?,
                    percent_deviation: row.get(10)?,
                    metadata_json: row.get(11)?,
                    alert_sent: row.get(12)?,
                    alerted_at: row.get(13)?,
                    alert_reason: row.get(14)?,
                })
            },
        )?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r?.into_record()?);
        }
        Ok(records)
    }

    fn last_alert_at(&self, metric_name: &str, detector_id: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn.query_row(
            "SELECT MAX(alerted_at) FROM detections
             WHERE metric_name = ?1 AND detector_id = ?2 AND alert_sent = 1",
            params![metric_name, detector_id],
            |row| row.get(0),
        )?;
        raw.map(|r| decode_ts("detections", &r)).transpose()
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>, kind: RecordKind) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let sql = match kind {
            RecordKind::Measurements => "DELETE FROM measurements WHERE ts < ?1",
            RecordKind::Detections => "DELETE FROM detections WHERE ts < ?1",
        };
        let deleted = conn.execute(sql, params![encode_ts(&cutoff)])?;
        debug!(%kind, deleted, "purged old rows");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::seasonal::SeasonalMode;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn series(n: i64, value: f64) -> Vec<Measurement> {
        (0..n)
            .map(|i| Measurement::new(t0() + Duration::minutes(10 * i), value + i as f64))
            .collect()
    }

    fn snapshot(storage: &SqliteStorage, metric: &str) -> Vec<Measurement> {
        storage
            .query_window(metric, t0() + Duration::days(365), Duration::days(3650), None)
            .unwrap()
    }

    #[test]
    fn test_save_batch_twice_is_idempotent() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let batch = series(20, 1.0);

        assert_eq!(storage.save_batch("m", &batch).unwrap(), 20);
        let once = snapshot(&storage, "m");

        assert_eq!(storage.save_batch("m", &batch).unwrap(), 0);
        let twice = snapshot(&storage, "m");

        assert_eq!(once, twice);
        assert_eq!(storage.count_measurements("m").unwrap(), 20);
    }

    #[test]
    fn test_last_write_wins_on_conflict() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_batch("m", &[Measurement::new(t0(), 1.0)]).unwrap();
        let changed = storage
            .save_batch("m", &[Measurement::new(t0(), 2.0).with_context("hour_of_day", 0i64)])
            .unwrap();
        assert_eq!(changed, 1);

        let stored = snapshot(&storage, "m");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value, Some(2.0));
        assert_eq!(stored[0].context.len(), 1);
    }

    #[test]
    fn test_overlapping_batches_merge() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let all = series(30, 0.0);
        storage.save_batch("m", &all[..20]).unwrap();
        storage.save_batch("m", &all[10..]).unwrap();
        assert_eq!(snapshot(&storage, "m"), all);
    }

    #[test]
    fn test_metrics_are_isolated() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_batch("a", &series(5, 1.0)).unwrap();
        storage.save_batch("b", &series(3, 1.0)).unwrap();
        assert_eq!(storage.count_measurements("a").unwrap(), 5);
        assert_eq!(storage.count_measurements("b").unwrap(), 3);
    }

    #[test]
    fn test_query_window_is_half_open() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_batch("m", &series(6, 0.0)).unwrap();

        // [t0 + 10m, t0 + 40m) -> points at 10, 20, 30
        let window = storage
            .query_window("m", t0() + Duration::minutes(40), Duration::minutes(30), None)
            .unwrap();
        let minutes: Vec<i64> = window
            .iter()
            .map(|m| (m.timestamp - t0()).num_minutes())
            .collect();
        assert_eq!(minutes, vec![10, 20, 30]);
    }

    #[test]
    fn test_query_window_empty_is_not_an_error() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let window = storage
            .query_window("nothing", t0(), Duration::days(30), None)
            .unwrap();
        assert!(window.is_empty());
    }

    #[test]
    fn test_query_window_applies_context_filter() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let points: Vec<Measurement> = (0..24)
            .map(|h| Measurement::new(t0() + Duration::hours(h), h as f64).with_context("hour_of_day", h))
            .collect();
        storage.save_batch("m", &points).unwrap();

        let target = Measurement::new(t0() + Duration::days(1), 0.0).with_context("hour_of_day", 5i64);
        let filter = ContextFilter::for_point(&["hour_of_day".to_string()], &target, SeasonalMode::Combined);
        let window = storage
            .query_window("m", target.timestamp, Duration::days(1), Some(&filter))
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].value, Some(5.0));
    }

    #[test]
    fn test_missing_values_are_stored() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .save_batch("m", &[Measurement::missing(t0()), Measurement::new(t0() + Duration::minutes(1), 4.0)])
            .unwrap();
        let stored = snapshot(&storage, "m");
        assert_eq!(stored[0].value, None);

        // latest_before skips points without a value
        let prev = storage.latest_before("m", t0() + Duration::minutes(5)).unwrap().unwrap();
        assert_eq!(prev.value, Some(4.0));
        assert!(storage.latest_before("m", t0() + Duration::seconds(30)).unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_never_moves_backwards() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.get_checkpoint("m").unwrap().is_none());

        storage.set_checkpoint("m", t0() + Duration::days(2)).unwrap();
        storage.set_checkpoint("m", t0() + Duration::days(1)).unwrap();
        assert_eq!(storage.get_checkpoint("m").unwrap(), Some(t0() + Duration::days(2)));

        storage.set_checkpoint("m", t0() + Duration::days(3)).unwrap();
        assert_eq!(storage.get_checkpoint("m").unwrap(), Some(t0() + Duration::days(3)));
    }

    #[test]
    fn test_detections_roundtrip_and_keep_alert_flag() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut result = DetectionResult::normal("m", "abcd1234", t0(), 500.0);
        result.is_anomaly = true;
        result.direction = Some(Direction::Up);
        result.upper_bound = Some(130.0);
        let alerted_at = t0() + Duration::seconds(5);

        let sent = DetectionRecord::new(result.clone(), DetectorKind::Mad).mark_alerted(alerted_at, "anomaly");
        storage.save_detections(&[sent.clone()]).unwrap();

        // A later re-evaluation that did not alert must not erase the dispatch.
        storage
            .save_detections(&[DetectionRecord::new(result, DetectorKind::Mad)])
            .unwrap();

        let stored = storage
            .query_detections("m", Some("abcd1234"), t0(), t0() + Duration::days(1))
            .unwrap();
        assert_eq!(stored, vec![sent]);
        assert_eq!(storage.last_alert_at("m", "abcd1234").unwrap(), Some(alerted_at));
        assert!(storage.last_alert_at("m", "other").unwrap().is_none());
    }

    #[test]
    fn test_purge_older_than() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_batch("m", &series(10, 0.0)).unwrap();
        let deleted = storage
            .purge_older_than(t0() + Duration::minutes(45), RecordKind::Measurements)
            .unwrap();
        assert_eq!(deleted, 5);
        assert_eq!(storage.count_measurements("m").unwrap(), 5);
    }

    #[test]
    fn test_file_backed_storage_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("detectk.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.save_batch("m", &series(3, 0.0)).unwrap();
            storage.set_checkpoint("m", t0() + Duration::hours(1)).unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.count_measurements("m").unwrap(), 3);
        assert_eq!(storage.get_checkpoint("m").unwrap(), Some(t0() + Duration::hours(1)));
    }

    #[test]
    fn test_concurrent_writers_for_different_metrics() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = std::sync::Arc::new(SqliteStorage::open(dir.path().join("detectk.db")).unwrap());
        assert!(storage.pool.max_size() > 1);

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let storage = std::sync::Arc::clone(&storage);
                std::thread::spawn(move || {
                    let metric = format!("metric_{w}");
                    let points = series(50, 1000.0 * w as f64);
                    // Overlapping halves, written twice.
                    for _ in 0..2 {
                        storage.save_batch(&metric, &points[..30]).unwrap();
                        storage.save_batch(&metric, &points[20..]).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        for w in 0..4 {
            let metric = format!("metric_{w}");
            assert_eq!(storage.count_measurements(&metric).unwrap(), 50);
            let stored = snapshot(&storage, &metric);
            assert_eq!(stored, series(50, 1000.0 * w as f64));
        }
    }

    #[test]
    fn test_concurrent_overlapping_writes_resolve_per_batch() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = std::sync::Arc::new(SqliteStorage::open(dir.path().join("detectk.db")).unwrap());

        let writers: Vec<_> = [1.0, 2.0]
            .into_iter()
            .map(|value| {
                let storage = std::sync::Arc::clone(&storage);
                std::thread::spawn(move || {
                    let points: Vec<Measurement> = (0..20)
                        .map(|i| Measurement::new(t0() + Duration::minutes(i), value))
                        .collect();
                    for _ in 0..10 {
                        storage.save_batch("shared", &points).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let stored = snapshot(&storage, "shared");
        assert_eq!(stored.len(), 20);
        // Each batch commits atomically, so the last one to commit owns every row.
        let last = stored[0].value.unwrap();
        assert!(last == 1.0 || last == 2.0);
        assert!(stored.iter().all(|m| m.value == Some(last)));
    }
}
