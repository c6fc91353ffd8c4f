//! `warehouse` crate — the data model and the connection seam.
//!
//! Every backend implements [`WarehouseConnection`] and [`Connector`]; the
//! pool and the sync engine only ever talk to those traits. Two backends ship
//! here: Postgres (via `sqlx`) and an in-memory one used by tests and dry runs.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;
pub mod types;

pub use error::{SpecError, ValidationError, WarehouseError};
pub use memory::{MemoryConnector, MemoryWarehouse};
pub use postgres::PgConnector;
pub use traits::{Connector, WarehouseConnection};
pub use types::{Column, ColumnKind, Record, Selection, TableShape, TableSpec, Value};
