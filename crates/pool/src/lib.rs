//! `pool` crate — a bounded pool of warehouse connections.
//!
//! Provides [`ConnectionPool`], the [`Lease`] handed to callers, and the
//! [`HealthProbe`] that decides whether a returned connection is reused.
//! The pool is an explicit value passed to whoever needs it; there is no
//! process-wide instance.

pub mod error;
pub mod pool;
pub mod probe;

pub use error::PoolError;
pub use pool::{ConnectionPool, Lease, PoolConfig, PoolStats, PoolStatus};
pub use probe::HealthProbe;
