//! Database schema and migrations.

use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS measurements (
            metric_name TEXT NOT NULL,
            ts TEXT NOT NULL,
            value REAL,
            context_json TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (metric_name, ts)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS detections (
            metric_name TEXT NOT NULL,
            detector_id TEXT NOT NULL,
            ts TEXT NOT NULL,
            detector_kind TEXT NOT NULL,
            value REAL NOT NULL,
            is_anomaly INTEGER NOT NULL,
            score REAL,
            lower_bound REAL,
            upper_bound REAL,
            direction TEXT,
            percent_deviation REAL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            alert_sent INTEGER NOT NULL DEFAULT 0,
            alerted_at TEXT,
            alert_reason TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (metric_name, detector_id, ts)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS checkpoints (
            metric_name TEXT PRIMARY KEY,
            last_loaded_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_measurements_ts ON measurements(ts);
        CREATE INDEX IF NOT EXISTS idx_detections_ts ON detections(ts);
        CREATE INDEX IF NOT EXISTS idx_detections_alerts
            ON detections(metric_name, detector_id, alerted_at)
            WHERE alert_sent = 1;",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
