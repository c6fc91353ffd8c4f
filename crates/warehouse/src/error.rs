//! Error types for the warehouse crate.

use thiserror::Error;

/// Errors returned by a [`WarehouseConnection`](crate::WarehouseConnection)
/// or a [`Connector`](crate::Connector).
///
/// The pool and the loader branch on [`WarehouseError::is_connection_broken`]:
/// a broken connection is discarded, anything else leaves it reusable.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WarehouseError {
    /// Transport or authentication failure while opening a connection.
    #[error("failed to connect to warehouse: {0}")]
    Connect(String),

    /// The connection died while a statement was in flight.
    #[error("warehouse connection broken: {0}")]
    Broken(String),

    /// The backend rejected a statement (malformed row, constraint, type).
    #[error("statement failed: {0}")]
    Statement(String),

    /// The table does not exist.
    #[error("table '{0}' does not exist")]
    MissingTable(String),

    /// A column type the backend cannot map onto a [`Value`](crate::Value).
    #[error("unsupported column type '{type_name}' in column '{column}'")]
    UnsupportedType { column: String, type_name: String },
}

impl WarehouseError {
    /// Whether the connection that produced this error must be discarded.
    pub fn is_connection_broken(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Broken(_))
    }
}

/// A [`TableSpec`](crate::TableSpec) that no uniqueness constraint could cover.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("table name is empty")]
    EmptyName,

    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),

    #[error("table '{0}' has no key columns")]
    EmptyKey(String),

    #[error("key column '{column}' is not a column of table '{table}'")]
    UnknownKeyColumn { table: String, column: String },
}

/// Row-level rejection. Counted and dropped by the loader, never raised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("record for '{table}' is missing key column '{column}'")]
    MissingKey { table: String, column: String },

    #[error("key column '{column}' of '{table}' cannot hold value '{value}'")]
    KeyType {
        table: String,
        column: String,
        value: String,
    },
}
