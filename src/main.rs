use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use detectk::backtest::Backtest;
use detectk::config::duration::parse_duration;
use detectk::config::DetectkConfig;
use detectk::detect::registry::{canonical_form, DefaultTable, DetectorRegistry};
use detectk::storage::{SqliteStorage, Storage};

#[derive(Parser)]
#[command(
    name = "detectk",
    about = "Metric anomaly detection with seasonal baselines and alert cooldowns",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "DETECTK_CONFIG")]
    config: Option<PathBuf>,

    /// Database path, overriding `storage.path`
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and apply migrations
    InitDb,

    /// Validate the configuration file
    Validate,

    /// Show resolved detector ids
    DetectorIds {
        /// Only this metric
        #[arg(long)]
        metric: Option<String>,
    },

    /// Show or advance a metric's load checkpoint
    Checkpoint {
        metric: String,

        /// New checkpoint (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        set: Option<String>,
    },

    /// Apply the retention policy
    Purge,

    /// Replay detectors over stored history
    Backtest {
        #[arg(long)]
        metric: String,

        /// First instant (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// Last instant, inclusive
        #[arg(long)]
        end: String,

        /// Step between evaluations, e.g. "10 minutes"
        #[arg(long, default_value = "10 minutes")]
        step: String,

        #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,
    },

    /// List stored detections
    History {
        #[arg(long)]
        metric: String,

        #[arg(long)]
        detector: Option<String>,

        /// Start of range (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// End of range, exclusive
        #[arg(long)]
        end: String,

        /// Only anomalous rows
        #[arg(long)]
        anomalies_only: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("'{raw}' is neither RFC 3339 nor YYYY-MM-DD"))?;
    match date.and_hms_opt(0, 0, 0) {
        Some(naive) => Ok(naive.and_utc()),
        None => bail!("'{raw}' is not a valid date"),
    }
}

fn load_config(cli: &Cli) -> Result<DetectkConfig> {
    match &cli.config {
        Some(path) => DetectkConfig::load(path),
        None => Ok(DetectkConfig::load_or_default()),
    }
}

fn open_storage(cli: &Cli, config: &DetectkConfig) -> Result<SqliteStorage> {
    let path = cli.db.clone().unwrap_or_else(|| config.storage.path.clone());
    SqliteStorage::open(&path).with_context(|| format!("failed to open database {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    detectk::init_tracing(&config.logging)?;

    match &cli.command {
        Commands::InitDb => {
            let storage = open_storage(&cli, &config)?;
            drop(storage);
            let path = cli.db.clone().unwrap_or_else(|| config.storage.path.clone());
            tracing::info!(path = %path.display(), "database ready");
            println!("Database initialized at {}", path.display());
        }
        Commands::Validate => {
            config.validate()?;
            println!("Configuration OK: {} metric(s)", config.metrics.len());
            for metric in &config.metrics {
                println!(
                    "  {:<24} every {:<12} {} detector(s)",
                    metric.name,
                    detectk::config::duration::format_duration(metric.collect_interval),
                    metric.detectors.len()
                );
            }
        }
        Commands::DetectorIds { metric } => {
            let defaults = DefaultTable::v1();
            let registry = DetectorRegistry::with_builtins();
            let selected: Vec<_> = config
                .metrics
                .iter()
                .filter(|m| metric.as_deref().map_or(true, |name| m.name == name))
                .collect();
            if selected.is_empty() {
                bail!("no matching metrics in configuration");
            }

            println!("{:<24} | {:<16} | {:<9} | Canonical parameters", "Metric", "Detector", "Kind");
            println!("{:-<24}-|-{:-<16}-|-{:-<9}-|-{:-<30}", "", "", "", "");
            for m in selected {
                for spec in m.detector_specs(&defaults)? {
                    // Fail early if a kind has no constructor.
                    let built = registry.build(spec.clone())?;
                    println!(
                        "{:<24} | {:<16} | {:<9} | {}",
                        m.name,
                        built.id(),
                        built.kind(),
                        canonical_form(&spec.params, &defaults)
                    );
                }
            }
        }
        Commands::Checkpoint { metric, set } => {
            let storage = open_storage(&cli, &config)?;
            if let Some(raw) = set {
                let ts = parse_instant(raw)?;
                storage.set_checkpoint(metric, ts)?;
            }
            match storage.get_checkpoint(metric)? {
                Some(ts) => println!("{metric}: {}", ts.to_rfc3339()),
                None => println!("{metric}: no checkpoint"),
            }
        }
        Commands::Purge => {
            let storage = open_storage(&cli, &config)?;
            let report = config.retention.sweep(&storage, Utc::now());
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.errors.is_empty() {
                bail!("retention sweep finished with {} error(s)", report.errors.len());
            }
        }
        Commands::Backtest {
            metric,
            start,
            end,
            step,
            format,
        } => {
            let metric_config = config
                .metric(metric)
                .with_context(|| format!("metric '{metric}' not found in configuration"))?;
            let storage = open_storage(&cli, &config)?;
            let backtest = Backtest::from_config(
                metric_config,
                &DetectorRegistry::with_builtins(),
                &DefaultTable::v1(),
                &storage,
            )?;
            let report = backtest.run(parse_instant(start)?, parse_instant(end)?, parse_duration(step)?)?;

            match format {
                OutputFormat::Csv => report.write_csv(std::io::stdout().lock())?,
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            eprintln!(
                "{} checks, {} anomalies, {} alerts would be sent",
                report.total_checks, report.anomalies_detected, report.alerts_would_send
            );
        }
        Commands::History {
            metric,
            detector,
            start,
            end,
            anomalies_only,
            json,
        } => {
            let storage = open_storage(&cli, &config)?;
            let mut records = storage.query_detections(
                metric,
                detector.as_deref(),
                parse_instant(start)?,
                parse_instant(end)?,
            )?;
            if *anomalies_only {
                records.retain(|r| r.result.is_anomaly);
            }

            if *json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No detections found.");
            } else {
                println!(
                    "{:<25} | {:<10} | {:>12} | {:>8} | {:<5} | Alert",
                    "Timestamp", "Detector", "Value", "Score", "Dir"
                );
                println!("{:-<25}-|-{:-<10}-|-{:->12}-|-{:->8}-|-{:-<5}-|-{:-<5}", "", "", "", "", "", "");
                for r in &records {
                    let score = r.result.score.map(|s| format!("{s:.2}")).unwrap_or_default();
                    let direction = r.result.direction.map(|d| d.to_string()).unwrap_or_default();
                    let flag = if r.result.is_anomaly { "!" } else { " " };
                    println!(
                        "{:<25} | {:<10} | {:>12} | {:>8} | {:<5} | {}{}",
                        r.result.timestamp.to_rfc3339(),
                        r.result.detector_id,
                        r.result.value,
                        score,
                        direction,
                        flag,
                        if r.alert_sent { "sent" } else { "" }
                    );
                }
            }
        }
    }

    Ok(())
}
