//! detectk -- scheduled anomaly detection for business and operational metrics.
//!
//! This crate provides idempotent time-series storage, resumable history
//! loading, statistical and threshold detectors with seasonal filtering,
//! cooldown-gated alerting, and the check orchestrator that ties them together.

pub mod alert;
pub mod backtest;
pub mod check;
pub mod collector;
pub mod config;
pub mod context;
pub mod detect;
pub mod loader;
pub mod model;
pub mod storage;

use anyhow::{Context, Result};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&logging.level))
        .context("invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
