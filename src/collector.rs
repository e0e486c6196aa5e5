//! Collector contract: where measurements come from.
//!
//! Adapters live outside this crate (SQL sources, HTTP APIs, ...). The crate
//! only needs something that can return the points of a half-open period.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::Measurement;

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid period [{start}, {end})")]
    InvalidPeriod { start: DateTime<Utc>, end: DateTime<Utc> },

    #[error("malformed source data: {0}")]
    Malformed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Source of measurements for one metric.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Points with timestamps in `[period_start, period_end)`.
    async fn collect(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, CollectionError>;
}

/// Collector over an in-memory series. Used for replays and tests.
#[derive(Debug, Default)]
pub struct MemoryCollector {
    points: Vec<Measurement>,
    calls: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl MemoryCollector {
    pub fn new(mut points: Vec<Measurement>) -> Self {
        points.sort_by_key(|m| m.timestamp);
        Self {
            points,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Periods requested so far, in call order.
    pub fn calls(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Collector for MemoryCollector {
    async fn collect(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, CollectionError> {
        if period_end < period_start {
            return Err(CollectionError::InvalidPeriod {
                start: period_start,
                end: period_end,
            });
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((period_start, period_end));
        }
        Ok(self
            .points
            .iter()
            .filter(|m| m.timestamp >= period_start && m.timestamp < period_end)
            .cloned()
            .collect())
    }
}
