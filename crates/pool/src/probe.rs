//! Liveness probing of pooled connections.

use std::time::Duration;

use tracing::debug;
use warehouse::WarehouseConnection;

/// Runs the backend's cheap liveness check (`SELECT 1` on Postgres) with a
/// deadline. A probe that errors, hangs, or reports dead is just `false`.
#[derive(Debug, Clone, Copy)]
pub struct HealthProbe {
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn check(&self, conn: &mut dyn WarehouseConnection) -> bool {
        match tokio::time::timeout(self.timeout, conn.probe()).await {
            Ok(healthy) => healthy,
            Err(_) => {
                debug!("liveness probe timed out after {:?}", self.timeout);
                false
            }
        }
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
