//! `MemoryWarehouse`: an in-process backend with fault injection.
//!
//! It honours the same contract as the Postgres backend (merge by key,
//! all-or-nothing batches, uniqueness constraints checked on merge) so the
//! loader and orchestrator can be exercised without a database. Knobs let
//! tests fail connects, poison individual values, break connections, and slow
//! statements down.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    Connector, Record, Selection, TableShape, TableSpec, Value, WarehouseConnection,
    WarehouseError,
};

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<String>,
    unique_keys: Vec<Vec<String>>,
    rows: Vec<Record>,
}

#[derive(Debug)]
struct Faults {
    failing_connects: usize,
    poisoned: Vec<Value>,
    breaking: Vec<Value>,
    probe_healthy: bool,
    statement_delay: Option<Duration>,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            failing_connects: 0,
            poisoned: Vec::new(),
            breaking: Vec::new(),
            probe_healthy: true,
            statement_delay: None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    faults: Faults,
    opened: usize,
    closed: usize,
    upserts: usize,
}

/// Shared handle to one in-memory warehouse. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<State>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector that opens connections to this warehouse.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            warehouse: self.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------ setup ------

    /// Create a table with an arbitrary shape, bypassing the usual DDL.
    /// Used to stage pre-existing tables that conflict with a spec.
    pub fn create_raw_table(&self, name: &str, columns: &[&str], unique_keys: &[&[&str]]) {
        self.state().tables.insert(
            name.to_owned(),
            MemoryTable {
                columns: columns.iter().map(|c| (*c).to_owned()).collect(),
                unique_keys: unique_keys
                    .iter()
                    .map(|k| k.iter().map(|c| (*c).to_owned()).collect())
                    .collect(),
                rows: Vec::new(),
            },
        );
    }

    // ------ fault injection ------

    /// The next `n` connection attempts fail with [`WarehouseError::Connect`].
    pub fn fail_next_connects(&self, n: usize) {
        self.state().faults.failing_connects = n;
    }

    /// Any batch containing `value` in any column fails with a statement error.
    pub fn poison(&self, value: impl Into<Value>) {
        self.state().faults.poisoned.push(value.into());
    }

    /// Any batch containing `value` fails and kills its connection.
    pub fn poison_breaking(&self, value: impl Into<Value>) {
        self.state().faults.breaking.push(value.into());
    }

    /// Remove every poisoned value.
    pub fn clear_poison(&self) {
        let mut state = self.state();
        state.faults.poisoned.clear();
        state.faults.breaking.clear();
    }

    /// Make every liveness probe succeed or fail.
    pub fn set_probe_healthy(&self, healthy: bool) {
        self.state().faults.probe_healthy = healthy;
    }

    /// Delay every batch by `delay` before it is applied.
    pub fn set_statement_delay(&self, delay: Duration) {
        self.state().faults.statement_delay = Some(delay);
    }

    // ------ inspection ------

    pub fn has_table(&self, table: &str) -> bool {
        self.state().tables.contains_key(table)
    }

    /// Rows of `table` in storage order (empty if it does not exist).
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Connections ever opened.
    pub fn opened(&self) -> usize {
        self.state().opened
    }

    /// Connections explicitly closed.
    pub fn closed(&self) -> usize {
        self.state().closed
    }

    /// Batches that reached the backend, successful or not.
    pub fn upsert_calls(&self) -> usize {
        self.state().upserts
    }
}

/// [`Connector`] for a [`MemoryWarehouse`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    warehouse: MemoryWarehouse,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn WarehouseConnection>, WarehouseError> {
        let mut state = self.warehouse.state();
        if state.faults.failing_connects > 0 {
            state.faults.failing_connects -= 1;
            return Err(WarehouseError::Connect("injected connect failure".into()));
        }
        state.opened += 1;
        let id = state.opened;
        drop(state);

        Ok(Box::new(MemoryConnection {
            id,
            warehouse: self.warehouse.clone(),
            dead: false,
        }))
    }
}

/// One connection to a [`MemoryWarehouse`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: usize,
    warehouse: MemoryWarehouse,
    dead: bool,
}

impl MemoryConnection {
    /// Sequence number of this connection (1-based, in open order).
    pub fn id(&self) -> usize {
        self.id
    }

    fn ensure_alive(&self) -> Result<(), WarehouseError> {
        if self.dead {
            return Err(WarehouseError::Broken(format!("connection {} is dead", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl WarehouseConnection for MemoryConnection {
    async fn describe_table(&mut self, table: &str) -> Result<Option<TableShape>, WarehouseError> {
        self.ensure_alive()?;
        Ok(self.warehouse.state().tables.get(table).map(|t| TableShape {
            columns: t.columns.clone(),
            unique_keys: t.unique_keys.clone(),
        }))
    }

    async fn create_table(&mut self, spec: &TableSpec) -> Result<(), WarehouseError> {
        self.ensure_alive()?;
        self.warehouse
            .state()
            .tables
            .entry(spec.name().to_owned())
            .or_insert_with(|| MemoryTable {
                columns: spec.column_names().map(str::to_owned).collect(),
                unique_keys: vec![spec.key().to_vec()],
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn truncate(&mut self, table: &str) -> Result<(), WarehouseError> {
        self.ensure_alive()?;
        match self.warehouse.state().tables.get_mut(table) {
            Some(t) => {
                t.rows.clear();
                Ok(())
            }
            None => Err(WarehouseError::MissingTable(table.to_owned())),
        }
    }

    async fn upsert_batch(
        &mut self,
        spec: &TableSpec,
        rows: &[Record],
    ) -> Result<u64, WarehouseError> {
        self.ensure_alive()?;

        let delay = self.warehouse.state().faults.statement_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.warehouse.state();
        state.upserts += 1;

        let contains = |needles: &[Value]| {
            rows.iter().any(|r| {
                spec.column_names()
                    .any(|c| r.get(c).is_some_and(|v| needles.contains(v)))
            })
        };
        if contains(&state.faults.breaking) {
            drop(state);
            self.dead = true;
            return Err(WarehouseError::Broken("injected connection loss".into()));
        }
        if contains(&state.faults.poisoned) {
            return Err(WarehouseError::Statement("injected statement failure".into()));
        }

        let table = state
            .tables
            .get_mut(spec.name())
            .ok_or_else(|| WarehouseError::MissingTable(spec.name().to_owned()))?;

        let shape = TableShape {
            columns: table.columns.clone(),
            unique_keys: table.unique_keys.clone(),
        };
        if !shape.has_unique_key(spec) {
            return Err(WarehouseError::Statement(format!(
                "no unique constraint on '{}' matches the merge key",
                spec.name()
            )));
        }

        // Every row is checked before the table is touched.
        let mut staged = Vec::with_capacity(rows.len());
        for row in rows {
            let row = spec
                .normalize(row.clone())
                .map_err(|e| WarehouseError::Statement(e.to_string()))?;
            let key = spec
                .key_of(&row)
                .ok_or_else(|| WarehouseError::Statement("null value in key column".into()))?;
            let stored: Record = spec
                .column_names()
                .map(|c| (c.to_owned(), row.value_or_null(c)))
                .collect();
            staged.push((key, stored));
        }

        for (key, stored) in staged {
            match table
                .rows
                .iter_mut()
                .find(|existing| spec.key_of(existing).as_ref() == Some(&key))
            {
                Some(existing) => *existing = stored,
                None => table.rows.push(stored),
            }
        }

        Ok(rows.len() as u64)
    }

    async fn fetch(&mut self, selection: &Selection) -> Result<Vec<Record>, WarehouseError> {
        self.ensure_alive()?;
        let state = self.warehouse.state();
        let table = state
            .tables
            .get(&selection.table)
            .ok_or_else(|| WarehouseError::MissingTable(selection.table.clone()))?;

        let mut rows: Vec<Record> = table
            .rows
            .iter()
            .filter(|r| {
                selection
                    .filters
                    .iter()
                    .all(|(col, want)| r.get(col) == Some(want))
            })
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            selection
                .order_by
                .iter()
                .map(|col| compare_values(&a.value_or_null(col), &b.value_or_null(col)))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });

        Ok(rows)
    }

    async fn probe(&mut self) -> bool {
        !self.dead && self.warehouse.state().faults.probe_healthy
    }

    async fn close(self: Box<Self>) -> Result<(), WarehouseError> {
        self.warehouse.state().closed += 1;
        Ok(())
    }
}

// NULLs sort first, numbers numerically, text lexically.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Text(_), _) => Ordering::Greater,
        (_, Value::Text(_)) => Ordering::Less,
        (x, y) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Column;

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

    fn row(company: &str, year: i64, revenue: f64) -> Record {
        Record::new()
            .with("company", company)
            .with("year", year)
            .with("revenue_usd", revenue)
    }

    #[tokio::test]
    async fn upsert_updates_matching_key_in_slice_order() {
        let wh = MemoryWarehouse::new();
        let mut conn = wh.connector().connect().await.unwrap();
        conn.create_table(&spec()).await.unwrap();

        conn.upsert_batch(&spec(), &[row("Apple", 2023, 100.0), row("Apple", 2023, 150.0)])
            .await
            .unwrap();

        let rows = wh.rows("company_financials");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("revenue_usd"), Some(&Value::Float(150.0)));
    }

    #[tokio::test]
    async fn null_key_mid_slice_applies_nothing() {
        let wh = MemoryWarehouse::new();
        let mut conn = wh.connector().connect().await.unwrap();
        conn.create_table(&spec()).await.unwrap();

        let err = conn
            .upsert_batch(
                &spec(),
                &[
                    row("Apple", 2022, 1.0),
                    Record::new().with("company", "Apple").with("year", Value::Null),
                    row("Apple", 2024, 3.0),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, WarehouseError::Statement(_)));
        assert_eq!(wh.row_count("company_financials"), 0);
    }

    #[tokio::test]
    async fn integral_float_key_hits_the_same_row() {
        let wh = MemoryWarehouse::new();
        let mut conn = wh.connector().connect().await.unwrap();
        conn.create_table(&spec()).await.unwrap();

        conn.upsert_batch(&spec(), &[row("Apple", 2023, 100.0)])
            .await
            .unwrap();
        let as_float = Record::new()
            .with("company", "Apple")
            .with("year", 2023.0)
            .with("revenue_usd", 150.0);
        conn.upsert_batch(&spec(), &[as_float]).await.unwrap();

        let rows = wh.rows("company_financials");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("year"), Some(&Value::Int(2023)));
        assert_eq!(rows[0].get("revenue_usd"), Some(&Value::Float(150.0)));
    }

    #[tokio::test]
    async fn poisoned_batch_applies_nothing() {
        let wh = MemoryWarehouse::new();
        let mut conn = wh.connector().connect().await.unwrap();
        conn.create_table(&spec()).await.unwrap();
        wh.poison("Broken Co");

        let err = conn
            .upsert_batch(&spec(), &[row("Apple", 2023, 1.0), row("Broken Co", 2023, 2.0)])
            .await
            .unwrap_err();

        assert!(!err.is_connection_broken());
        assert_eq!(wh.row_count("company_financials"), 0);
        assert!(conn.probe().await, "statement failures leave the connection usable");
    }

    #[tokio::test]
    async fn breaking_value_kills_the_connection() {
        let wh = MemoryWarehouse::new();
        let mut conn = wh.connector().connect().await.unwrap();
        conn.create_table(&spec()).await.unwrap();
        wh.poison_breaking("Broken Co");

        let err = conn
            .upsert_batch(&spec(), &[row("Broken Co", 2023, 2.0)])
            .await
            .unwrap_err();

        assert!(err.is_connection_broken());
        assert!(!conn.probe().await);
    }

    #[tokio::test]
    async fn merge_without_matching_constraint_is_rejected() {
        let wh = MemoryWarehouse::new();
        wh.create_raw_table("company_financials", &["company", "year", "revenue_usd"], &[]);
        let mut conn = wh.connector().connect().await.unwrap();

        let err = conn
            .upsert_batch(&spec(), &[row("Apple", 2023, 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Statement(_)));
    }

    #[tokio::test]
    async fn fetch_filters_and_orders() {
        let wh = MemoryWarehouse::new();
        let mut conn = wh.connector().connect().await.unwrap();
        conn.create_table(&spec()).await.unwrap();
        conn.upsert_batch(
            &spec(),
            &[row("Apple", 2024, 3.0), row("Samsung", 2020, 9.0), row("Apple", 2021, 1.0)],
        )
        .await
        .unwrap();

        let rows = conn
            .fetch(
                &Selection::from_table("company_financials")
                    .filter("company", "Apple")
                    .order_by("year"),
            )
            .await
            .unwrap();

        let years: Vec<_> = rows.iter().map(|r| r.value_or_null("year")).collect();
        assert_eq!(years, vec![Value::Int(2021), Value::Int(2024)]);
    }

    #[tokio::test]
    async fn connect_failures_are_counted_down() {
        let wh = MemoryWarehouse::new();
        wh.fail_next_connects(1);
        assert!(wh.connector().connect().await.is_err());
        assert!(wh.connector().connect().await.is_ok());
        assert_eq!(wh.opened(), 1);
    }
}
