//! Multi-table sync runs.
//!
//! `SyncOrchestrator` takes each table through
//! `Pending → SchemaVerified → Loading → {Completed | PartiallyCompleted | Failed}`.
//! Tables are independent: a failure on one never stops the next from
//! being attempted.

use std::sync::Arc;

use chrono::Utc;
use pool::ConnectionPool;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use warehouse::TableSpec;

use crate::models::{LoadMode, SyncReport, TableOutcome, TableState, TableSyncResult};
use crate::source::RecordSource;
use crate::{BatchLoader, Cancellation, EngineError, LoaderConfig, SchemaGuard};

// ---------------------------------------------------------------------------
// TableJob
// ---------------------------------------------------------------------------

/// One table to sync: where it goes, how, and where the records come from.
pub struct TableJob {
    pub spec: Arc<TableSpec>,
    pub mode: LoadMode,
    pub source: Box<dyn RecordSource>,
}

impl TableJob {
    pub fn new(spec: TableSpec, mode: LoadMode, source: impl RecordSource + 'static) -> Self {
        Self {
            spec: Arc::new(spec),
            mode,
            source: Box::new(source),
        }
    }

    pub fn merge(spec: TableSpec, source: impl RecordSource + 'static) -> Self {
        Self::new(spec, LoadMode::Merge, source)
    }

    pub fn truncate_then_load(spec: TableSpec, source: impl RecordSource + 'static) -> Self {
        Self::new(spec, LoadMode::TruncateThenLoad, source)
    }

    pub fn table(&self) -> &str {
        self.spec.name()
    }
}

impl std::fmt::Debug for TableJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableJob")
            .field("table", &self.spec.name())
            .field("mode", &self.mode)
            .field("source", &self.source.describe())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SyncOrchestrator
// ---------------------------------------------------------------------------

/// Runs table jobs against one shared pool.
#[derive(Debug, Clone)]
pub struct SyncOrchestrator {
    schema: SchemaGuard,
    loader: BatchLoader,
    cancel: Cancellation,
}

impl SyncOrchestrator {
    pub fn new(pool: ConnectionPool, config: LoaderConfig) -> Self {
        Self {
            schema: SchemaGuard::new(pool.clone()),
            loader: BatchLoader::new(pool, config),
            cancel: Cancellation::never(),
        }
    }

    /// Stop starting new tables and batches once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn loader(&self) -> &BatchLoader {
        &self.loader
    }

    /// Sync every job in order and report one outcome per table.
    #[instrument(skip_all, fields(run_id = tracing::field::Empty, tables = jobs.len()))]
    pub async fn run(&self, jobs: &[TableJob]) -> SyncReport {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let started_at = Utc::now();
        info!("sync run {run_id} started with {} tables", jobs.len());

        let mut tables = Vec::with_capacity(jobs.len());
        for job in jobs {
            let result = self.sync_table(job).await;
            tables.push(TableOutcome {
                table: job.table().to_owned(),
                result,
            });
        }

        let report = SyncReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            tables,
        };

        if report.all_succeeded() {
            info!("sync run {run_id} succeeded");
        } else if report.all_failed() {
            error!("sync run {run_id} failed for every table");
        } else {
            warn!("sync run {run_id} finished with partial success");
        }
        report.log_warnings();
        report
    }

    /// Take one table through its state machine. Never panics or returns
    /// early with an error; every failure ends up in the result.
    #[instrument(skip_all, fields(table = %job.table(), mode = ?job.mode))]
    pub async fn sync_table(&self, job: &TableJob) -> TableSyncResult {
        let table = job.table();
        log_state(table, TableState::Pending);

        let result = match self.prepare_and_load(job).await {
            Ok(result) => result,
            Err(err) => TableSyncResult::Failed(err),
        };

        match &result {
            TableSyncResult::Failed(err) => {
                error!("table '{table}' is now {}: {err}", result.state());
            }
            _ => log_state(table, result.state()),
        }
        result
    }

    async fn prepare_and_load(&self, job: &TableJob) -> Result<TableSyncResult, EngineError> {
        let spec = job.spec.as_ref();
        let table = spec.name();

        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled {
                table: table.to_owned(),
            });
        }

        // Read before touching the table so a bad source never truncates.
        let records = job.source.read().map_err(|err| EngineError::Source {
            table: table.to_owned(),
            message: err.to_string(),
        })?;
        info!(
            "read {} records for '{table}' from {}",
            records.len(),
            job.source.describe()
        );

        match job.mode {
            LoadMode::Merge => self.schema.ensure_table(spec).await?,
            LoadMode::TruncateThenLoad => {
                let existed = self.schema.table_exists(table).await?;
                self.schema.ensure_table(spec).await?;
                if existed {
                    self.schema.truncate(table).await?;
                } else {
                    warn!("table '{table}' does not exist yet, skipping truncation");
                }
            }
        }
        log_state(table, TableState::SchemaVerified);

        log_state(table, TableState::Loading);
        let result = self.loader.load_until(spec, records, &self.cancel).await?;

        if result.batches_succeeded == 0
            && result.failures.is_empty()
            && !result.not_attempted.is_empty()
        {
            return Err(EngineError::Cancelled {
                table: table.to_owned(),
            });
        }
        Ok(TableSyncResult::from_load(result))
    }
}

fn log_state(table: &str, state: TableState) {
    info!("table '{table}' is now {state}");
}
