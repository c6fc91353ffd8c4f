//! `engine` crate — schema guarding, batched loading, and multi-table sync.

pub mod cancel;
pub mod catalog;
pub mod error;
pub mod forecast;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod reader;
pub mod schema;
pub mod source;

pub use cancel::{cancellation, CancelHandle, Cancellation};
pub use error::EngineError;
pub use forecast::{forecast_records, revenue_series, ForecastProvider, LinearTrend};
pub use loader::{prepare, BatchLoader, LoaderConfig, PreparedLoad};
pub use models::{
    Batch, BatchError, BatchFailure, LoadMode, LoadResult, RunSummary, SyncReport, TableOutcome,
    TableState, TableSummary, TableSyncResult,
};
pub use orchestrator::{SyncOrchestrator, TableJob};
pub use reader::Reader;
pub use schema::SchemaGuard;
pub use source::{CsvFileSource, FileSource, JsonFileSource, RecordSource, SourceError};
