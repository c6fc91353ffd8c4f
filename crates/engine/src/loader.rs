//! Batched, idempotent loading of records into one table.
//!
//! A load runs in three steps:
//! 1. Values are coerced to their column kinds. Records missing a key
//!    column, or whose key does not fit its column, are dropped and
//!    counted. Earlier
//!    occurrences of a duplicated key are removed in favour of the last one,
//!    which keeps its position in the input.
//! 2. The survivors are cut into consecutive batches of `batch_size`.
//! 3. Each batch gets its own lease and one atomic multi-row merge. A failed
//!    batch is recorded and the load moves on.
//!
//! Because step 1 leaves at most one record per key, batches touch disjoint
//! rows and may run concurrently (`max_in_flight`).

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use pool::ConnectionPool;
use tracing::{debug, info, instrument, warn};
use warehouse::{Record, TableSpec, Value};

use crate::models::{Batch, BatchError, BatchFailure, LoadResult};
use crate::{Cancellation, EngineError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Records per batch. Zero is treated as one.
    pub batch_size: usize,
    /// Batches applied concurrently. One means strictly sequential.
    pub max_in_flight: usize,
    /// Extra attempts for a batch that failed transiently.
    pub batch_retries: u32,
    /// Base delay for exponential back-off between batch attempts.
    pub retry_base_delay: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_in_flight: 1,
            batch_retries: 0,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl LoaderConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_batch_retries(mut self, retries: u32, base_delay: Duration) -> Self {
        self.batch_retries = retries;
        self.retry_base_delay = base_delay;
        self
    }
}

// ---------------------------------------------------------------------------
// Preparation
// ---------------------------------------------------------------------------

/// Records ready to load: validated, de-duplicated and partitioned.
#[derive(Debug, Clone, Default)]
pub struct PreparedLoad {
    pub batches: Vec<Batch>,
    pub dropped: usize,
    pub superseded: usize,
}

impl PreparedLoad {
    pub fn rows(&self) -> usize {
        self.batches.iter().map(|b| b.records.len()).sum()
    }
}

/// Normalize, collapse duplicate keys and partition, preserving input order.
pub fn prepare(spec: &TableSpec, records: Vec<Record>, batch_size: usize) -> PreparedLoad {
    let mut dropped = 0;
    let mut keyed: Vec<(Vec<Value>, Record)> = Vec::with_capacity(records.len());
    for record in records {
        match spec.normalize(record) {
            Ok(record) => {
                if let Some(key) = spec.key_of(&record) {
                    keyed.push((key, record));
                }
            }
            Err(err) => {
                dropped += 1;
                debug!("dropping record: {err}");
            }
        }
    }

    let mut last_seen: HashMap<&[Value], usize> = HashMap::with_capacity(keyed.len());
    for (position, (key, _)) in keyed.iter().enumerate() {
        last_seen.insert(key.as_slice(), position);
    }
    let keep: Vec<bool> = keyed
        .iter()
        .enumerate()
        .map(|(position, (key, _))| last_seen.get(key.as_slice()) == Some(&position))
        .collect();
    drop(last_seen);

    let valid = keyed.len();
    let survivors: Vec<Record> = keyed
        .into_iter()
        .zip(keep)
        .filter_map(|((_, record), keep)| keep.then_some(record))
        .collect();
    let superseded = valid - survivors.len();

    let batches = survivors
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            records: chunk.to_vec(),
        })
        .collect();

    PreparedLoad {
        batches,
        dropped,
        superseded,
    }
}

// ---------------------------------------------------------------------------
// BatchLoader
// ---------------------------------------------------------------------------

enum BatchOutcome {
    Applied { index: usize, rows: u64 },
    Failed(BatchFailure),
    NotAttempted(usize),
}

impl BatchOutcome {
    fn index(&self) -> usize {
        match self {
            Self::Applied { index, .. } | Self::NotAttempted(index) => *index,
            Self::Failed(failure) => failure.index,
        }
    }
}

/// Loads records into a table in independently committed batches.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    pool: ConnectionPool,
    config: LoaderConfig,
}

impl BatchLoader {
    pub fn new(pool: ConnectionPool, config: LoaderConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load every record. See [`BatchLoader::load_until`].
    pub async fn load(
        &self,
        spec: &TableSpec,
        records: Vec<Record>,
    ) -> Result<LoadResult, EngineError> {
        self.load_until(spec, records, &Cancellation::never()).await
    }

    /// Load records until `cancel` fires. Batches already running finish;
    /// the rest are reported in [`LoadResult::not_attempted`].
    ///
    /// # Errors
    /// [`EngineError::LoadFailed`] when no batch succeeded and at least one
    /// failed. Partial failures are returned inside the `LoadResult`.
    #[instrument(skip_all, fields(table = %spec.name()))]
    pub async fn load_until(
        &self,
        spec: &TableSpec,
        records: Vec<Record>,
        cancel: &Cancellation,
    ) -> Result<LoadResult, EngineError> {
        let prepared = prepare(spec, records, self.config.batch_size);
        if prepared.dropped > 0 {
            warn!(
                "dropped {} records with missing or mistyped key columns ({})",
                prepared.dropped,
                spec.key().join(", ")
            );
        }
        if prepared.superseded > 0 {
            info!(
                "{} records superseded by a later record with the same key",
                prepared.superseded
            );
        }

        let total = prepared.batches.len();
        info!(
            "loading {} rows in {} batches (batch_size={}, max_in_flight={})",
            prepared.rows(),
            total,
            self.config.batch_size.max(1),
            self.config.max_in_flight.max(1)
        );

        let mut outcomes: Vec<BatchOutcome> = stream::iter(prepared.batches)
            .map(|batch| self.run_batch(spec, batch, total, cancel))
            .buffer_unordered(self.config.max_in_flight.max(1))
            .collect()
            .await;
        outcomes.sort_by_key(BatchOutcome::index);

        let mut result = LoadResult {
            dropped: prepared.dropped,
            superseded: prepared.superseded,
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                BatchOutcome::Applied { rows, .. } => {
                    result.rows_succeeded += rows;
                    result.batches_succeeded += 1;
                }
                BatchOutcome::Failed(failure) => result.failures.push(failure),
                BatchOutcome::NotAttempted(index) => result.not_attempted.push(index),
            }
        }

        if !result.not_attempted.is_empty() {
            warn!(
                "cancelled: {} of {} batches not attempted",
                result.not_attempted.len(),
                total
            );
        }

        if result.batches_succeeded == 0 && !result.failures.is_empty() {
            return Err(EngineError::LoadFailed {
                table: spec.name().to_owned(),
                result,
            });
        }
        Ok(result)
    }

    async fn run_batch(
        &self,
        spec: &TableSpec,
        batch: Batch,
        total: usize,
        cancel: &Cancellation,
    ) -> BatchOutcome {
        if cancel.is_cancelled() {
            return BatchOutcome::NotAttempted(batch.index);
        }

        let position = batch.index + 1;
        match self.apply_with_retry(spec, &batch).await {
            Ok(rows) => {
                info!("batch {position}/{total} applied ({rows} rows)");
                BatchOutcome::Applied {
                    index: batch.index,
                    rows,
                }
            }
            Err(error) => {
                warn!(
                    "batch {position}/{total} failed ({} rows): {error}",
                    batch.records.len()
                );
                BatchOutcome::Failed(BatchFailure {
                    index: batch.index,
                    rows: batch.records.len(),
                    error,
                })
            }
        }
    }

    async fn apply_with_retry(&self, spec: &TableSpec, batch: &Batch) -> Result<u64, BatchError> {
        let mut attempts = 0u32;

        loop {
            match self.apply(spec, batch).await {
                Ok(rows) => return Ok(rows),

                Err(err) if err.is_transient() && attempts < self.config.batch_retries => {
                    attempts += 1;
                    let delay = self
                        .config
                        .retry_base_delay
                        .saturating_mul(2u32.saturating_pow(attempts - 1));

                    warn!(
                        "batch {} transient error (attempt {}/{}), retrying in {:?}: {}",
                        batch.index + 1,
                        attempts,
                        self.config.batch_retries,
                        delay,
                        err
                    );

                    tokio::time::sleep(delay).await;
                }

                Err(err) => return Err(err),
            }
        }
    }

    /// One lease, one atomic merge. The lease is discarded only when the
    /// connection broke.
    async fn apply(&self, spec: &TableSpec, batch: &Batch) -> Result<u64, BatchError> {
        let mut lease = self.pool.acquire().await.map_err(BatchError::Acquire)?;
        let result = lease.upsert_batch(spec, &batch.records).await;
        let healthy = !matches!(&result, Err(e) if e.is_connection_broken());
        lease.release(healthy).await;
        result.map_err(BatchError::Apply)
    }
}
