//! Core result and state types for a sync run.
//!
//! These are transient: built per load call or per run and handed to the
//! caller. Nothing here is persisted beyond the warehouse rows themselves.

use chrono::{DateTime, Utc};
use pool::PoolError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;
use warehouse::{Record, WarehouseError};

use crate::EngineError;

// ---------------------------------------------------------------------------
// LoadMode
// ---------------------------------------------------------------------------

/// How a table is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Ensure the table, then merge by key. For continuously appended facts.
    #[default]
    Merge,
    /// Empty the table first, then load. For small reference tables.
    TruncateThenLoad,
}

// ---------------------------------------------------------------------------
// TableState
// ---------------------------------------------------------------------------

/// Per-table lifecycle: `Pending → SchemaVerified → Loading → terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Pending,
    SchemaVerified,
    Loading,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl TableState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyCompleted | Self::Failed
        )
    }
}

impl std::fmt::Display for TableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::SchemaVerified => write!(f, "schema_verified"),
            Self::Loading => write!(f, "loading"),
            Self::Completed => write!(f, "completed"),
            Self::PartiallyCompleted => write!(f, "partially_completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// An ordered, size-bounded slice of valid records.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// 0-based position among the batches of one load.
    pub index: usize,
    pub records: Vec<Record>,
}

/// Why a single batch failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BatchError {
    #[error("could not lease a connection: {0}")]
    Acquire(PoolError),

    #[error("upsert failed: {0}")]
    Apply(WarehouseError),
}

impl BatchError {
    /// Transient failures (lost connection, exhausted pool) may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Acquire(e) => e.is_retryable(),
            Self::Apply(e) => e.is_connection_broken(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub index: usize,
    pub rows: usize,
    pub error: BatchError,
}

// ---------------------------------------------------------------------------
// LoadResult
// ---------------------------------------------------------------------------

/// Aggregate outcome of one `BatchLoader::load` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadResult {
    /// Rows applied by successful batches.
    pub rows_succeeded: u64,
    pub batches_succeeded: usize,
    /// Failed batches in batch order, with the captured error.
    pub failures: Vec<BatchFailure>,
    /// Records rejected for a missing key column.
    pub dropped: usize,
    /// Earlier occurrences of a duplicated key, replaced by the last one.
    pub superseded: usize,
    /// Batches never started because the run was cancelled.
    pub not_attempted: Vec<usize>,
}

impl LoadResult {
    pub fn batches_failed(&self) -> usize {
        self.failures.len()
    }

    pub fn total_batches(&self) -> usize {
        self.batches_succeeded + self.failures.len() + self.not_attempted.len()
    }

    /// Every batch was attempted and succeeded. Dropped rows do not count
    /// against completeness.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.not_attempted.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TableSyncResult
// ---------------------------------------------------------------------------

/// Terminal outcome for one table.
#[derive(Debug, Clone)]
pub enum TableSyncResult {
    Completed(LoadResult),
    PartiallyCompleted(LoadResult),
    Failed(EngineError),
}

impl TableSyncResult {
    /// Classify a load that did not fail outright.
    pub fn from_load(result: LoadResult) -> Self {
        if result.is_complete() {
            Self::Completed(result)
        } else {
            Self::PartiallyCompleted(result)
        }
    }

    pub fn state(&self) -> TableState {
        match self {
            Self::Completed(_) => TableState::Completed,
            Self::PartiallyCompleted(_) => TableState::PartiallyCompleted,
            Self::Failed(_) => TableState::Failed,
        }
    }

    /// The load result, including the one attached to a `LoadFailed` error.
    pub fn load_result(&self) -> Option<&LoadResult> {
        match self {
            Self::Completed(r) | Self::PartiallyCompleted(r) => Some(r),
            Self::Failed(EngineError::LoadFailed { result, .. }) => Some(result),
            Self::Failed(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SyncReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TableOutcome {
    pub table: String,
    pub result: TableSyncResult,
}

/// Everything one orchestrator run produced.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableOutcome>,
}

impl SyncReport {
    /// True when every table completed.
    pub fn all_succeeded(&self) -> bool {
        self.tables
            .iter()
            .all(|t| matches!(t.result, TableSyncResult::Completed(_)))
    }

    /// True when there was at least one table and every one failed.
    pub fn all_failed(&self) -> bool {
        !self.tables.is_empty()
            && self
                .tables
                .iter()
                .all(|t| matches!(t.result, TableSyncResult::Failed(_)))
    }

    pub fn outcome(&self, table: &str) -> Option<&TableSyncResult> {
        self.tables
            .iter()
            .find(|t| t.table == table)
            .map(|t| &t.result)
    }

    /// Serializable per-table summary.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            all_succeeded: self.all_succeeded(),
            tables: self.tables.iter().map(TableSummary::from).collect(),
        }
    }

    /// Emit one structured warning per table that dropped rows, lost
    /// batches or failed outright.
    pub fn log_warnings(&self) {
        for table in self.summary().tables.iter().filter(|t| t.has_warnings()) {
            let failed: Vec<usize> = table.failed_batches.iter().map(|b| b.index).collect();
            warn!(
                table = %table.table,
                status = %table.status,
                dropped_rows = table.dropped_rows,
                failed_batches = ?failed,
                not_attempted_batches = ?table.not_attempted_batches,
                error = table.error.as_deref().unwrap_or(""),
                "table finished with warnings"
            );
        }
    }
}

/// JSON-friendly view of a [`SyncReport`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub all_succeeded: bool,
    pub tables: Vec<TableSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedBatchSummary {
    pub index: usize,
    pub rows: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub table: String,
    pub status: TableState,
    pub rows_loaded: u64,
    pub batches_succeeded: usize,
    pub failed_batches: Vec<FailedBatchSummary>,
    pub dropped_rows: usize,
    pub superseded_rows: usize,
    pub not_attempted_batches: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableSummary {
    /// Whether this table deserves a line in the warning summary.
    pub fn has_warnings(&self) -> bool {
        self.dropped_rows > 0
            || !self.failed_batches.is_empty()
            || !self.not_attempted_batches.is_empty()
            || self.error.is_some()
    }
}

impl From<&TableOutcome> for TableSummary {
    fn from(outcome: &TableOutcome) -> Self {
        let load = outcome.result.load_result().cloned().unwrap_or_default();
        let error = match &outcome.result {
            TableSyncResult::Failed(e) => Some(e.to_string()),
            _ => None,
        };
        Self {
            table: outcome.table.clone(),
            status: outcome.result.state(),
            rows_loaded: load.rows_succeeded,
            batches_succeeded: load.batches_succeeded,
            failed_batches: load
                .failures
                .iter()
                .map(|f| FailedBatchSummary {
                    index: f.index,
                    rows: f.rows,
                    error: f.error.to_string(),
                })
                .collect(),
            dropped_rows: load.dropped,
            superseded_rows: load.superseded,
            not_attempted_batches: load.not_attempted,
            error,
        }
    }
}
