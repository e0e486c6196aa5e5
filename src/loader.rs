//! Resumable bulk loading of history in fixed-width batches.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::collector::{CollectionError, Collector};
use crate::context::ContextAnnotator;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid load range [{start}, {end})")]
    InvalidRange { start: DateTime<Utc>, end: DateTime<Utc> },

    #[error("batch size must be at least one day")]
    InvalidBatchSize,

    #[error("collecting [{start}, {end}) failed: {source}")]
    Collection {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        #[source]
        source: CollectionError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub batches_total: usize,
    /// Batches already covered by the checkpoint.
    pub batches_skipped: usize,
    pub batches_loaded: usize,
    /// Points returned by the collector across loaded batches.
    pub points_loaded: usize,
    /// Checkpoint after the load.
    pub checkpoint: Option<DateTime<Utc>>,
}

/// Consecutive `[start, end)` sub-ranges of at most `step`.
pub fn split_range(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut ranges = Vec::new();
    if step <= Duration::zero() {
        return ranges;
    }
    let mut cursor = start;
    while cursor < end {
        let next = cursor.checked_add_signed(step).map_or(end, |n| n.min(end));
        ranges.push((cursor, next));
        cursor = next;
    }
    ranges
}

pub struct BatchLoader {
    batch_size: Duration,
    annotator: ContextAnnotator,
}

impl BatchLoader {
    pub fn new(batch_size_days: u32) -> Self {
        Self {
            batch_size: Duration::days(i64::from(batch_size_days)),
            annotator: ContextAnnotator::default(),
        }
    }

    /// Attach calendar features to loaded points that lack them.
    pub fn with_annotator(mut self, annotator: ContextAnnotator) -> Self {
        self.annotator = annotator;
        self
    }

    /// Load `[start, end)` for one metric, resuming after the stored
    /// checkpoint. The checkpoint advances only once a batch is stored, so
    /// an interrupted load can be re-run and picks up where it stopped.
    pub async fn load(
        &self,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        collector: &dyn Collector,
        storage: &dyn Storage,
    ) -> Result<LoadReport, LoadError> {
        if end <= start {
            return Err(LoadError::InvalidRange { start, end });
        }
        if self.batch_size < Duration::days(1) {
            return Err(LoadError::InvalidBatchSize);
        }

        let ranges = split_range(start, end, self.batch_size);
        let checkpoint = storage.get_checkpoint(metric_name)?;
        let mut report = LoadReport {
            batches_total: ranges.len(),
            checkpoint,
            ..LoadReport::default()
        };

        info!(
            metric = %metric_name,
            %start,
            %end,
            batches = ranges.len(),
            checkpoint = ?checkpoint,
            "starting load"
        );

        for (batch_start, batch_end) in ranges {
            if checkpoint.is_some_and(|cp| batch_end <= cp) {
                report.batches_skipped += 1;
                debug!(metric = %metric_name, %batch_start, %batch_end, "batch already loaded");
                continue;
            }

            let mut points = collector
                .collect(batch_start, batch_end)
                .await
                .map_err(|source| LoadError::Collection {
                    start: batch_start,
                    end: batch_end,
                    source,
                })?;
            self.annotator.annotate_all(&mut points);

            let changed = storage.save_batch(metric_name, &points)?;
            storage.set_checkpoint(metric_name, batch_end)?;

            report.batches_loaded += 1;
            report.points_loaded += points.len();
            report.checkpoint = Some(report.checkpoint.map_or(batch_end, |cp| cp.max(batch_end)));

            info!(
                metric = %metric_name,
                %batch_start,
                %batch_end,
                points = points.len(),
                changed,
                "batch loaded"
            );
        }

        info!(
            metric = %metric_name,
            loaded = report.batches_loaded,
            skipped = report.batches_skipped,
            points = report.points_loaded,
            "load complete"
        );
        Ok(report)
    }
}

/// Load with default settings and no annotation.
pub async fn load(
    metric_name: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    batch_size_days: u32,
    collector: &dyn Collector,
    storage: &dyn Storage,
) -> Result<LoadReport, LoadError> {
    BatchLoader::new(batch_size_days)
        .load(metric_name, start, end, collector, storage)
        .await
}
