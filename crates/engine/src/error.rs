//! Engine-level error types.

use pool::PoolError;
use thiserror::Error;
use warehouse::{SpecError, WarehouseError};

use crate::models::LoadResult;

/// Errors that make a whole table fail.
///
/// Row-level and batch-level problems never show up here; they are recovered
/// locally and aggregated into a [`LoadResult`].
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    // ------ Connection-level errors ------

    /// No connection could be leased (exhausted, closed, or failed to open).
    #[error("could not lease a warehouse connection: {0}")]
    Pool(#[from] PoolError),

    /// A schema or truncate statement failed.
    #[error("warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),

    // ------ Table-level errors ------

    /// The existing table cannot carry the required uniqueness constraint.
    /// A configuration problem, never retried.
    #[error("table '{table}' conflicts with its required shape: {reason}")]
    SchemaConflict { table: String, reason: String },

    /// Every attempted batch failed.
    #[error("all {} attempted batches for table '{table}' failed", .result.failures.len())]
    LoadFailed { table: String, result: LoadResult },

    /// The record source could not be read.
    #[error("could not read records for table '{table}': {message}")]
    Source { table: String, message: String },

    /// The run was cancelled before anything was applied to this table.
    #[error("sync of table '{table}' was cancelled")]
    Cancelled { table: String },

    #[error("invalid table spec: {0}")]
    Spec(#[from] SpecError),
}
