//! Table existence and shape checks.
//!
//! `SchemaGuard` makes sure a table exists with the uniqueness constraint the
//! merge needs before any batch is written to it.

use pool::{ConnectionPool, Lease};
use tracing::{debug, info, warn};
use warehouse::TableSpec;

use crate::EngineError;

/// Creates, verifies and truncates warehouse tables on leased connections.
#[derive(Debug, Clone)]
pub struct SchemaGuard {
    pool: ConnectionPool,
}

impl SchemaGuard {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Create the table if absent; otherwise check that it carries every
    /// spec column and a unique constraint over exactly the key columns.
    ///
    /// # Errors
    /// - [`EngineError::SchemaConflict`] when the existing table is
    ///   incompatible. Not retryable.
    /// - [`EngineError::Pool`] / [`EngineError::Warehouse`] for connection
    ///   and statement failures.
    pub async fn ensure_table(&self, spec: &TableSpec) -> Result<(), EngineError> {
        let mut lease = self.pool.acquire().await?;
        let result = Self::ensure_on(&mut lease, spec).await;
        release_after(lease, &result).await;
        result
    }

    /// Whether the table exists at all.
    pub async fn table_exists(&self, table: &str) -> Result<bool, EngineError> {
        let mut lease = self.pool.acquire().await?;
        let result = lease.describe_table(table).await;
        let healthy = !matches!(&result, Err(e) if e.is_connection_broken());
        lease.release(healthy).await;
        Ok(result?.is_some())
    }

    /// Remove every row from an existing table.
    pub async fn truncate(&self, table: &str) -> Result<(), EngineError> {
        let mut lease = self.pool.acquire().await?;
        let result = lease.truncate(table).await;
        let healthy = !matches!(&result, Err(e) if e.is_connection_broken());
        lease.release(healthy).await;
        result?;
        info!("truncated table '{table}'");
        Ok(())
    }

    async fn ensure_on(lease: &mut Lease, spec: &TableSpec) -> Result<(), EngineError> {
        let Some(shape) = lease.describe_table(spec.name()).await? else {
            lease.create_table(spec).await?;
            info!(
                "created table '{}' with unique key ({})",
                spec.name(),
                spec.key().join(", ")
            );
            return Ok(());
        };

        let missing = shape.missing_columns(spec);
        if !missing.is_empty() {
            return Err(EngineError::SchemaConflict {
                table: spec.name().to_owned(),
                reason: format!("missing columns: {}", missing.join(", ")),
            });
        }
        if !shape.has_unique_key(spec) {
            return Err(EngineError::SchemaConflict {
                table: spec.name().to_owned(),
                reason: format!("no unique constraint over ({})", spec.key().join(", ")),
            });
        }

        debug!("table '{}' already has a compatible shape", spec.name());
        Ok(())
    }
}

/// Release with `healthy = false` only when the connection itself broke.
async fn release_after<T>(lease: Lease, result: &Result<T, EngineError>) {
    let broken = matches!(result, Err(EngineError::Warehouse(e)) if e.is_connection_broken());
    if broken {
        warn!("discarding connection after a broken schema statement");
    }
    lease.release(!broken).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pool::PoolConfig;
    use warehouse::{Column, MemoryWarehouse, WarehouseError};

    use super::*;

    fn spec() -> TableSpec {
        TableSpec::new(
            "company_financials",
            vec![
                Column::text("company"),
                Column::integer("year"),
                Column::double("revenue_usd"),
            ],
            ["company", "year"],
        )
        .unwrap()
    }

    fn guard(wh: &MemoryWarehouse) -> SchemaGuard {
        let pool = ConnectionPool::new(Arc::new(wh.connector()), PoolConfig::default()).unwrap();
        SchemaGuard::new(pool)
    }

    #[tokio::test]
    async fn creates_missing_table_once() {
        let wh = MemoryWarehouse::new();
        let guard = guard(&wh);

        guard.ensure_table(&spec()).await.unwrap();
        assert!(wh.has_table("company_financials"));

        // Second call is a no-op on a compatible table.
        guard.ensure_table(&spec()).await.unwrap();
        assert!(guard.table_exists("company_financials").await.unwrap());
    }

    #[tokio::test]
    async fn table_without_key_constraint_conflicts() {
        let wh = MemoryWarehouse::new();
        wh.create_raw_table(
            "company_financials",
            &["company", "year", "revenue_usd"],
            &[&["company"]],
        );

        let err = guard(&wh).ensure_table(&spec()).await.unwrap_err();
        match err {
            EngineError::SchemaConflict { table, reason } => {
                assert_eq!(table, "company_financials");
                assert!(reason.contains("unique constraint"));
            }
            other => panic!("expected SchemaConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn table_missing_columns_conflicts() {
        let wh = MemoryWarehouse::new();
        wh.create_raw_table("company_financials", &["company", "year"], &[&["company", "year"]]);

        let err = guard(&wh).ensure_table(&spec()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::SchemaConflict { ref reason, .. } if reason.contains("revenue_usd")
        ));
    }

    #[tokio::test]
    async fn truncating_a_missing_table_is_a_warehouse_error() {
        let wh = MemoryWarehouse::new();
        let guard = guard(&wh);

        assert!(!guard.table_exists("countries").await.unwrap());
        let err = guard.truncate("countries").await.unwrap_err();
        assert!(matches!(err, EngineError::Warehouse(WarehouseError::MissingTable(_))));
    }
}
