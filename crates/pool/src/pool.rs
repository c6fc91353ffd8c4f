//! Bounded warehouse connection pool.
//!
//! Connections are opened on demand up to `capacity`. The only cross-caller
//! gate is the compare-and-swap on the `created` counter; the idle queue has
//! its own short lock, so unrelated acquire/release pairs never wait on each
//! other. `acquire` is the only call that waits, and only up to
//! `acquire_timeout`.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warehouse::{Connector, WarehouseConnection};

use crate::{HealthProbe, PoolError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections.
    pub capacity: usize,
    /// How long `acquire` waits for a connection before giving up.
    pub acquire_timeout: Duration,
    /// Deadline for the liveness probe run on release.
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            acquire_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

// ---------------------------------------------------------------------------
// Status and statistics
// ---------------------------------------------------------------------------

/// Point-in-time occupancy of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    /// Connections open and not yet discarded (idle plus leased).
    pub created: usize,
    pub idle: usize,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub opened: u64,
    pub discarded: u64,
    pub acquisitions: u64,
    pub exhausted: u64,
}

#[derive(Debug, Default)]
struct AtomicPoolStats {
    opened: AtomicU64,
    discarded: AtomicU64,
    acquisitions: AtomicU64,
    exhausted: AtomicU64,
}

impl AtomicPoolStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            opened: self.opened.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

type BoxedConnection = Box<dyn WarehouseConnection>;

struct Inner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    probe: HealthProbe,
    /// Invariant: `0 <= created <= capacity`.
    created: AtomicUsize,
    idle: Mutex<VecDeque<BoxedConnection>>,
    /// Signalled when a connection goes idle or a discard frees capacity.
    available: Notify,
    closed: AtomicBool,
    stats: AtomicPoolStats,
}

/// Shared handle to the pool. Cloning is cheap; every clone is the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Create an empty pool. No connection is opened until the first acquire.
    ///
    /// # Errors
    /// [`PoolError::InvalidCapacity`] if `config.capacity` is zero.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Result<Self, PoolError> {
        if config.capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        info!(
            "creating warehouse pool (capacity={}, acquire_timeout={:?})",
            config.capacity, config.acquire_timeout
        );
        Ok(Self {
            inner: Arc::new(Inner {
                connector,
                probe: HealthProbe::new(config.probe_timeout),
                idle: Mutex::new(VecDeque::with_capacity(config.capacity)),
                config,
                created: AtomicUsize::new(0),
                available: Notify::new(),
                closed: AtomicBool::new(false),
                stats: AtomicPoolStats::default(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            capacity: self.inner.config.capacity,
            created: self.inner.created.load(Ordering::Acquire),
            idle: self.idle().len(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot()
    }

    /// Lease a connection: an idle one if available, a new one if below
    /// capacity, otherwise wait for a release.
    ///
    /// # Errors
    /// - [`PoolError::Exhausted`] after waiting `acquire_timeout`.
    /// - [`PoolError::Connection`] if opening a new connection fails.
    /// - [`PoolError::Closed`] once [`ConnectionPool::close`] has run.
    pub async fn acquire(&self) -> Result<Lease, PoolError> {
        let started = Instant::now();
        let deadline = started + self.inner.config.acquire_timeout;

        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed);
            }

            // Register interest before looking, so a release that lands
            // between the checks below and the wait is not missed.
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = self.pop_idle() {
                AtomicPoolStats::bump(&self.inner.stats.acquisitions);
                return Ok(self.lease(conn));
            }

            if self.try_reserve() {
                return match self.inner.connector.connect().await {
                    Ok(conn) => {
                        AtomicPoolStats::bump(&self.inner.stats.opened);
                        AtomicPoolStats::bump(&self.inner.stats.acquisitions);
                        debug!("opened warehouse connection ({:?})", self.status());
                        Ok(self.lease(conn))
                    }
                    Err(err) => {
                        self.unreserve();
                        warn!("failed to open warehouse connection: {err}");
                        Err(PoolError::Connection(err))
                    }
                };
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                AtomicPoolStats::bump(&self.inner.stats.exhausted);
                let waited = started.elapsed();
                warn!("warehouse pool exhausted after {waited:?}");
                return Err(PoolError::Exhausted { waited });
            }
        }
    }

    /// Readiness check: lease a connection, probe it, give it back.
    pub async fn ping(&self) -> Result<(), PoolError> {
        let mut lease = self.acquire().await?;
        let healthy = self.inner.probe.check(&mut *lease).await;
        lease.release(healthy).await;
        if healthy {
            Ok(())
        } else {
            Err(PoolError::Unhealthy)
        }
    }

    /// Close every idle connection and refuse further acquisitions.
    /// Leases still out are discarded when they come back.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<BoxedConnection> = self.idle().drain(..).collect();
        let count = drained.len();
        for conn in drained {
            self.discard(conn).await;
        }
        self.inner.available.notify_waiters();
        info!("warehouse pool closed ({count} idle connections closed)");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn idle(&self) -> MutexGuard<'_, VecDeque<BoxedConnection>> {
        self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop_idle(&self) -> Option<BoxedConnection> {
        self.idle().pop_front()
    }

    fn lease(&self, conn: BoxedConnection) -> Lease {
        Lease {
            conn: Some(conn),
            pool: self.clone(),
        }
    }

    /// The capacity gate: claim a slot if `created < capacity`.
    fn try_reserve(&self) -> bool {
        let capacity = self.inner.config.capacity;
        self.inner
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn unreserve(&self) {
        self.inner.created.fetch_sub(1, Ordering::AcqRel);
        self.inner.available.notify_one();
    }

    /// Push back to idle unless the pool closed meanwhile.
    fn return_to_idle(&self, conn: BoxedConnection) -> Result<(), BoxedConnection> {
        let mut idle = self.idle();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(conn);
        }
        idle.push_back(conn);
        drop(idle);
        self.inner.available.notify_one();
        Ok(())
    }

    async fn release_connection(&self, mut conn: BoxedConnection, healthy: bool) {
        if healthy
            && !self.inner.closed.load(Ordering::Acquire)
            && self.inner.probe.check(conn.as_mut()).await
        {
            match self.return_to_idle(conn) {
                Ok(()) => return,
                Err(back) => conn = back,
            }
        }
        self.discard(conn).await;
    }

    async fn discard(&self, conn: BoxedConnection) {
        self.unreserve();
        AtomicPoolStats::bump(&self.inner.stats.discarded);
        match tokio::time::timeout(self.inner.config.probe_timeout, conn.close()).await {
            Ok(Ok(())) => debug!("discarded warehouse connection"),
            Ok(Err(err)) => debug!("error closing discarded connection: {err}"),
            Err(_) => debug!("timed out closing discarded connection"),
        }
    }

    /// Drop a connection without closing it (no runtime to close it on).
    fn forget(&self, conn: BoxedConnection) {
        drop(conn);
        self.unreserve();
        AtomicPoolStats::bump(&self.inner.stats.discarded);
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A connection on loan from the pool.
///
/// Give it back with [`Lease::release`]. A lease dropped without an explicit
/// release (early return, `?`, panic unwinding) is handed back on the ambient
/// tokio runtime as if released healthy, so the probe still decides whether
/// it is reused.
pub struct Lease {
    conn: Option<BoxedConnection>,
    pool: ConnectionPool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("released", &self.conn.is_none())
            .field("pool", &self.pool.status())
            .finish()
    }
}

impl Lease {
    /// Return the connection. With `healthy == true` it goes back to idle if
    /// it passes the liveness probe; otherwise it is closed and its capacity
    /// slot freed. Never fails.
    pub async fn release(mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_connection(conn, healthy).await;
        }
    }
}

impl Deref for Lease {
    type Target = dyn WarehouseConnection;

    fn deref(&self) -> &Self::Target {
        // `conn` is only taken by `release` (which consumes the lease) and `drop`.
        self.conn.as_deref().expect("lease already released")
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("lease already released")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        pool.release_connection(conn, true).await;
                    });
                }
                Err(_) => pool.forget(conn),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warehouse::MemoryWarehouse;

    fn pool_with(wh: &MemoryWarehouse, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(Arc::new(wh.connector()), config).unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let wh = MemoryWarehouse::new();
        let config = PoolConfig::default().with_capacity(0);
        let err = ConnectionPool::new(Arc::new(wh.connector()), config).unwrap_err();
        assert_eq!(err, PoolError::InvalidCapacity);
    }

    #[tokio::test]
    async fn concurrent_acquires_open_one_connection_each() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(&wh, PoolConfig::default().with_capacity(4));

        let leases = futures::future::join_all((0..3).map(|_| pool.acquire())).await;
        assert!(leases.iter().all(Result::is_ok));
        assert_eq!(wh.opened(), 3);
        assert_eq!(pool.status().created, 3);

        let more = futures::future::join_all((0..1).map(|_| pool.acquire())).await;
        assert!(more.iter().all(Result::is_ok));
        assert_eq!(wh.opened(), 4);
        assert_eq!(pool.status().created, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn created_never_exceeds_capacity() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(
            &wh,
            PoolConfig::default()
                .with_capacity(2)
                .with_acquire_timeout(Duration::from_secs(1)),
        );

        let results = futures::future::join_all((0..5).map(|_| pool.acquire())).await;
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(PoolError::Exhausted { .. })))
            .count();

        assert_eq!(ok, 2);
        assert_eq!(exhausted, 3);
        assert_eq!(wh.opened(), 2);
        assert_eq!(pool.status().created, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_at_most_the_timeout() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(
            &wh,
            PoolConfig::default()
                .with_capacity(1)
                .with_acquire_timeout(Duration::from_secs(30)),
        );
        let _held = pool.acquire().await.unwrap();

        let started = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert!(err.is_retryable());
        assert!(waited >= Duration::from_secs(30));
        assert!(waited < Duration::from_secs(31));
    }

    #[tokio::test]
    async fn healthy_release_is_reused() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(&wh, PoolConfig::default().with_capacity(2));

        pool.acquire().await.unwrap().release(true).await;
        assert_eq!(pool.status().idle, 1);

        pool.acquire().await.unwrap().release(true).await;
        assert_eq!(wh.opened(), 1);
        assert_eq!(pool.stats().acquisitions, 2);
    }

    #[tokio::test]
    async fn unhealthy_release_discards() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(&wh, PoolConfig::default().with_capacity(1));

        pool.acquire().await.unwrap().release(false).await;

        let status = pool.status();
        assert_eq!(status.created, 0);
        assert_eq!(status.idle, 0);
        assert_eq!(wh.closed(), 1);

        pool.acquire().await.unwrap().release(true).await;
        assert_eq!(wh.opened(), 2, "a discarded connection is never handed out again");
    }

    #[tokio::test]
    async fn failed_probe_on_release_discards() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(&wh, PoolConfig::default());

        let lease = pool.acquire().await.unwrap();
        wh.set_probe_healthy(false);
        lease.release(true).await;

        assert_eq!(pool.status().created, 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn connect_failure_gives_the_slot_back() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(&wh, PoolConfig::default().with_capacity(1));
        wh.fail_next_connects(1);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Connection(_)));
        assert_eq!(pool.status().created, 0);

        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_receives_released_connection() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(&wh, PoolConfig::default().with_capacity(1));
        let held = pool.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|lease| drop(lease)) }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        held.release(true).await;

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(wh.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_opens_new_connection_after_discard() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(&wh, PoolConfig::default().with_capacity(1));
        let held = pool.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|lease| drop(lease)) }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        held.release(false).await;

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(wh.opened(), 2);
    }

    #[tokio::test]
    async fn dropped_lease_is_returned() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(&wh, PoolConfig::default());

        {
            let _lease = pool.acquire().await.unwrap();
        }
        settle().await;

        assert_eq!(pool.status().idle, 1);
        assert_eq!(pool.status().created, 1);
    }

    #[tokio::test]
    async fn lease_debug_shows_pool_status() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(&wh, PoolConfig::default().with_capacity(2));
        let lease = pool.acquire().await.unwrap();

        let shown = format!("{lease:?}");
        assert!(shown.starts_with("Lease"));
        assert!(shown.contains("released: false"));
        assert!(shown.contains("capacity: 2"));
        lease.release(true).await;
    }

    #[tokio::test]
    async fn close_drains_idle_and_rejects_acquire() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(&wh, PoolConfig::default().with_capacity(3));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        a.release(true).await;

        pool.close().await;
        assert_eq!(pool.status().idle, 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));

        b.release(true).await;
        assert_eq!(pool.status().created, 0);
        assert_eq!(wh.closed(), 2);
    }

    #[tokio::test]
    async fn ping_reports_probe_result() {
        let wh = MemoryWarehouse::new();
        let pool = pool_with(&wh, PoolConfig::default());
        assert!(pool.ping().await.is_ok());

        wh.set_probe_healthy(false);
        assert_eq!(pool.ping().await, Err(PoolError::Unhealthy));
    }
}
