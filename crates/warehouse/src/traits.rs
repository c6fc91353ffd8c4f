//! The `WarehouseConnection` and `Connector` traits: the contract every
//! backend must fulfil.
//!
//! The pool only ever sees these trait objects, so the loader and the
//! orchestrator run unchanged against Postgres or the in-memory backend.

use async_trait::async_trait;

use crate::{Record, Selection, TableShape, TableSpec, WarehouseError};

/// One live connection to the warehouse.
///
/// Every statement is parameterized; values never get spliced into SQL text.
#[async_trait]
pub trait WarehouseConnection: Send {
    /// Shape of `table`, or `None` if it does not exist.
    async fn describe_table(&mut self, table: &str) -> Result<Option<TableShape>, WarehouseError>;

    /// `CREATE TABLE IF NOT EXISTS` with a uniqueness constraint over the
    /// spec's key columns.
    async fn create_table(&mut self, spec: &TableSpec) -> Result<(), WarehouseError>;

    /// Remove every row from `table`.
    async fn truncate(&mut self, table: &str) -> Result<(), WarehouseError>;

    /// Merge `rows` by the spec's key: matching rows have their non-key
    /// columns updated, others are inserted. Rows are applied in slice order
    /// and the whole slice commits or none of it does.
    ///
    /// Returns the number of rows applied.
    async fn upsert_batch(
        &mut self,
        spec: &TableSpec,
        rows: &[Record],
    ) -> Result<u64, WarehouseError>;

    /// Run a parameterized `SELECT`.
    async fn fetch(&mut self, selection: &Selection) -> Result<Vec<Record>, WarehouseError>;

    /// Cheap liveness check. Never errors: a failed probe is just `false`.
    async fn probe(&mut self) -> bool;

    /// Close the underlying connection.
    async fn close(self: Box<Self>) -> Result<(), WarehouseError>;
}

/// Opens new connections on demand.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn WarehouseConnection>, WarehouseError>;
}
