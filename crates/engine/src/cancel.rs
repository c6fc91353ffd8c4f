//! Cooperative cancellation for sync runs.
//!
//! Cancelling stops new batches (and new tables) from starting. Work already
//! in flight runs to completion.

use tokio::sync::watch;

/// Fires the cancellation. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// A token that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the value readable after the sender is gone.
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation fires. Pends forever for [`Cancellation::never`].
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}

/// A connected handle/token pair.
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_fires_every_clone() {
        let (handle, token) = cancellation();
        let mut other = token.clone();
        assert!(!token.is_cancelled());

        handle.cancel();
        assert!(token.is_cancelled());
        other.cancelled().await;
    }

    #[test]
    fn never_stays_clear() {
        assert!(!Cancellation::never().is_cancelled());
    }
}
