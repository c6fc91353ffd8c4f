//! Read side: parameterized queries against the loaded tables.

use pool::ConnectionPool;
use tracing::debug;
use warehouse::{Record, Selection};

use crate::catalog::{COMPANY_FINANCIALS, FORECASTS, MACRO_INDICATORS};
use crate::forecast::COMPANY_REVENUE;
use crate::EngineError;

/// Runs selections on leased connections from the shared pool.
#[derive(Debug, Clone)]
pub struct Reader {
    pool: ConnectionPool,
}

impl Reader {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Every company's financials, by company then year.
    pub async fn companies(&self) -> Result<Vec<Record>, EngineError> {
        self.query(
            Selection::from_table(COMPANY_FINANCIALS)
                .order_by("company")
                .order_by("year"),
        )
        .await
    }

    /// One company's financials by year.
    pub async fn company_revenue(&self, company: &str) -> Result<Vec<Record>, EngineError> {
        self.query(
            Selection::from_table(COMPANY_FINANCIALS)
                .filter("company", company)
                .order_by("year"),
        )
        .await
    }

    /// Indicators for one country. The code is matched upper-cased.
    pub async fn macro_indicators(&self, country_code: &str) -> Result<Vec<Record>, EngineError> {
        self.query(
            Selection::from_table(MACRO_INDICATORS)
                .filter("country_code", country_code.to_ascii_uppercase())
                .order_by("year")
                .order_by("indicator"),
        )
        .await
    }

    /// Revenue forecasts for one company, every model.
    pub async fn forecasts(&self, company: &str) -> Result<Vec<Record>, EngineError> {
        self.query(
            Selection::from_table(FORECASTS)
                .filter("entity_name", company)
                .filter("entity_type", COMPANY_REVENUE)
                .order_by("year")
                .order_by("model_used"),
        )
        .await
    }

    /// Run one selection. The lease is released whether the query succeeds
    /// or not; only a broken connection is discarded.
    pub async fn query(&self, selection: Selection) -> Result<Vec<Record>, EngineError> {
        let mut lease = self.pool.acquire().await?;
        let result = lease.fetch(&selection).await;
        let healthy = !matches!(&result, Err(e) if e.is_connection_broken());
        lease.release(healthy).await;

        let rows = result?;
        debug!("read {} rows from '{}'", rows.len(), selection.table);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pool::PoolConfig;
    use warehouse::{MemoryWarehouse, Value, WarehouseError};

    use super::*;

    fn reader(wh: &MemoryWarehouse) -> (Reader, ConnectionPool) {
        let pool = ConnectionPool::new(Arc::new(wh.connector()), PoolConfig::default()).unwrap();
        (Reader::new(pool.clone()), pool)
    }

    #[tokio::test]
    async fn query_error_still_releases_the_lease() {
        let wh = MemoryWarehouse::new();
        let (reader, pool) = reader(&wh);

        let err = reader.companies().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Warehouse(WarehouseError::MissingTable(_))
        ));

        let status = pool.status();
        assert_eq!(status.created, 1);
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn country_code_is_upper_cased() {
        let wh = MemoryWarehouse::new();
        let (reader, pool) = reader(&wh);
        let spec = crate::catalog::macro_indicators().unwrap();
        {
            let mut lease = pool.acquire().await.unwrap();
            lease.create_table(&spec).await.unwrap();
            lease
                .upsert_batch(
                    &spec,
                    &[
                        Record::new()
                            .with("country_code", "USA")
                            .with("year", 2022)
                            .with("indicator", "GDP"),
                        Record::new()
                            .with("country_code", "DEU")
                            .with("year", 2022)
                            .with("indicator", "GDP"),
                    ],
                )
                .await
                .unwrap();
            lease.release(true).await;
        }

        let rows = reader.macro_indicators("usa").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("country_code"), Some(&Value::from("USA")));
    }
}
