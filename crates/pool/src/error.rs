//! Typed error type for the pool crate.

use std::time::Duration;

use thiserror::Error;
use warehouse::WarehouseError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PoolError {
    /// Every connection was leased and none came back within the timeout.
    #[error("no warehouse connection available after {waited:?}")]
    Exhausted { waited: Duration },

    /// Opening a new connection failed; the capacity slot was given back.
    #[error(transparent)]
    Connection(#[from] WarehouseError),

    #[error("connection pool is closed")]
    Closed,

    #[error("pool capacity must be at least 1")]
    InvalidCapacity,

    /// A readiness ping reached a connection that failed its probe.
    #[error("warehouse connection failed its liveness probe")]
    Unhealthy,
}

impl PoolError {
    /// Whether trying again later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Exhausted { .. } | Self::Connection(_) | Self::Unhealthy
        )
    }
}
