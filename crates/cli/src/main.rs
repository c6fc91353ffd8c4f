//! `warehouse-sync` CLI entry-point.
//!
//! Available sub-commands:
//! - `sync`     — load every table in a manifest.
//! - `forecast` — fit revenue trends and load them into `forecasts`.
//! - `check`    — readiness probe against the warehouse.
//! - `validate` — parse a manifest and its sources without touching the warehouse.

mod manifest;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use engine::forecast::{COMPANY_REVENUE, DEFAULT_HORIZON};
use engine::{
    cancellation, catalog, forecast_records, prepare, revenue_series, CancelHandle,
    LinearTrend, LoaderConfig, Reader, SyncOrchestrator, SyncReport, TableJob,
};
use pool::{ConnectionPool, PoolConfig};
use serde::Serialize;
use tracing::{error, info, warn};
use warehouse::PgConnector;

use crate::manifest::Manifest;

#[derive(Parser)]
#[command(
    name = "warehouse-sync",
    about = "Idempotent batch sync into an analytical warehouse",
    version
)]
struct Cli {
    #[command(flatten)]
    warehouse: WarehouseArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct WarehouseArgs {
    /// Postgres URL of the warehouse.
    #[arg(long, env = "WAREHOUSE_URL", global = true, hide_env_values = true)]
    warehouse_url: Option<String>,

    /// Maximum number of pooled connections.
    #[arg(long, env = "POOL_CAPACITY", default_value_t = 5, global = true)]
    pool_capacity: usize,

    /// Seconds to wait for a free connection before giving up.
    #[arg(long, env = "ACQUIRE_TIMEOUT_SECS", default_value_t = 30, global = true)]
    acquire_timeout_secs: u64,
}

#[derive(Args)]
struct LoadArgs {
    /// Records per batch.
    #[arg(long, env = "BATCH_SIZE", default_value_t = 100)]
    batch_size: usize,

    /// Batches applied concurrently.
    #[arg(long, env = "MAX_IN_FLIGHT", default_value_t = 1)]
    max_in_flight: usize,

    /// Retries for a batch that failed on a lost connection or a full pool.
    #[arg(long, env = "BATCH_RETRIES", default_value_t = 0)]
    batch_retries: u32,
}

impl LoadArgs {
    fn config(&self) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.batch_size,
            max_in_flight: self.max_in_flight,
            batch_retries: self.batch_retries,
            ..LoaderConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Load every table listed in a manifest.
    Sync {
        #[arg(long)]
        manifest: PathBuf,
        #[command(flatten)]
        load: LoadArgs,
    },
    /// Forecast company revenue from `company_financials` into `forecasts`.
    Forecast {
        /// Company to forecast; repeat for several.
        #[arg(long = "company", default_values_t = ["Apple".to_string(), "Samsung".to_string()])]
        companies: Vec<String>,
        /// Years to forecast past the last observation.
        #[arg(long, default_value_t = DEFAULT_HORIZON)]
        horizon: usize,
        #[command(flatten)]
        load: LoadArgs,
    },
    /// Check that the warehouse accepts connections.
    Check,
    /// Validate a manifest and its source files offline.
    Validate {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long, env = "BATCH_SIZE", default_value_t = 100)]
        batch_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Sync { manifest, load } => {
            let manifest = Manifest::load(&manifest)?;
            let jobs = manifest.jobs()?;
            let pool = connect(&cli.warehouse)?;
            let report = run_jobs(&pool, load.config(), &jobs).await;
            pool.close().await;
            finish(&report)
        }
        Command::Forecast {
            companies,
            horizon,
            load,
        } => {
            let pool = connect(&cli.warehouse)?;
            let reader = Reader::new(pool.clone());

            let mut records = Vec::new();
            for company in &companies {
                let rows = reader
                    .company_revenue(company)
                    .await
                    .with_context(|| format!("cannot read revenue for '{company}'"))?;
                let series = revenue_series(&rows);
                let forecast =
                    forecast_records(&LinearTrend, COMPANY_REVENUE, company, &series, horizon);
                if forecast.is_empty() {
                    warn!(
                        "only {} years of revenue for '{company}', not enough to forecast",
                        series.len()
                    );
                    continue;
                }
                info!("forecast {} years for '{company}'", forecast.len());
                records.extend(forecast);
            }

            let jobs = [TableJob::merge(catalog::forecasts()?, records)];
            let report = run_jobs(&pool, load.config(), &jobs).await;
            pool.close().await;
            finish(&report)
        }
        Command::Check => {
            let pool = connect(&cli.warehouse)?;
            let outcome = pool.ping().await;
            let status = pool.status();
            pool.close().await;
            match outcome {
                Ok(()) => {
                    println!("{}", serde_json::json!({ "status": "ready", "pool": status }));
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    error!("warehouse is not ready: {err}");
                    let line = serde_json::json!({
                        "status": "not_ready",
                        "error": err.to_string(),
                    });
                    println!("{line}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Validate { manifest, batch_size } => validate(&manifest, batch_size),
    }
}

fn connect(args: &WarehouseArgs) -> Result<ConnectionPool> {
    let url = args
        .warehouse_url
        .as_deref()
        .context("no warehouse configured; set WAREHOUSE_URL or pass --warehouse-url")?;
    let connector = PgConnector::new(url)?;
    let config = PoolConfig::default()
        .with_capacity(args.pool_capacity)
        .with_acquire_timeout(Duration::from_secs(args.acquire_timeout_secs));
    Ok(ConnectionPool::new(Arc::new(connector), config)?)
}

async fn run_jobs(pool: &ConnectionPool, config: LoaderConfig, jobs: &[TableJob]) -> SyncReport {
    let (handle, token) = cancellation();
    let watcher = tokio::spawn(cancel_on_interrupt(handle));

    let report = SyncOrchestrator::new(pool.clone(), config)
        .with_cancellation(token)
        .run(jobs)
        .await;

    watcher.abort();
    report
}

async fn cancel_on_interrupt(handle: CancelHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted; finishing in-flight batches and skipping the rest");
        handle.cancel();
    }
}

/// Print the JSON summary. Non-zero only when every table failed.
fn finish(report: &SyncReport) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(&report.summary())?);
    Ok(if report.all_failed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[derive(Serialize)]
struct ValidationLine {
    table: String,
    mode: engine::LoadMode,
    source: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    loadable: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dropped: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    superseded: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batches: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn validate(path: &std::path::Path, batch_size: usize) -> Result<ExitCode> {
    let manifest = Manifest::load(path)?;
    let mut ok = true;
    let mut lines = Vec::with_capacity(manifest.tables.len());

    for entry in &manifest.tables {
        let mut line = ValidationLine {
            table: entry.name.clone(),
            mode: entry.mode(),
            source: entry.source.clone(),
            records: None,
            loadable: None,
            dropped: None,
            superseded: None,
            batches: None,
            error: None,
        };

        let checked = entry.spec().and_then(|spec| {
            let job = entry.job()?;
            let records = job.source.read()?;
            Ok((spec, records))
        });
        match checked {
            Ok((spec, records)) => {
                line.records = Some(records.len());
                let prepared = prepare(&spec, records, batch_size);
                if prepared.dropped > 0 {
                    warn!(
                        "table '{}': {} records would be dropped for missing key columns",
                        entry.name, prepared.dropped
                    );
                }
                line.loadable = Some(prepared.rows());
                line.dropped = Some(prepared.dropped);
                line.superseded = Some(prepared.superseded);
                line.batches = Some(prepared.batches.len());
            }
            Err(err) => {
                ok = false;
                error!("table '{}' is invalid: {err:#}", entry.name);
                line.error = Some(format!("{err:#}"));
            }
        }
        lines.push(line);
    }

    println!("{}", serde_json::to_string_pretty(&lines)?);
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
