//! Single-owner election and broadcast-once readiness
//!
//! A [`Gate`] combines two coordination primitives that the lifecycle
//! pipelines use together:
//!
//! - `try_own` hands out at most one ownership token for the lifetime of
//!   the gate. Exactly one contending task wins.
//! - `signal_ready` / `wait_ready` form a latch. The first signal releases
//!   every current and future waiter; later signals are no-ops.

use tokio::sync::{watch, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Gate {
    owner: Semaphore,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Gate {
            owner: Semaphore::new(1),
            ready_tx,
            ready_rx,
        }
    }

    /// Attempt to claim ownership. Returns true for exactly one caller over
    /// the gate's lifetime; the token is never returned.
    pub fn try_own(&self) -> bool {
        match self.owner.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(TryAcquireError::NoPermits) => false,
            Err(TryAcquireError::Closed) => false,
        }
    }

    /// Mark the gate ready, releasing all waiters. Returns true only on the
    /// first transition.
    pub fn signal_ready(&self) -> bool {
        self.ready_tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    /// Whether the gate has been signalled
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Wait until the gate is signalled or the token is cancelled
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.ready_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                changed = rx.changed() => {
                    // The sender half lives as long as the gate.
                    changed.map_err(|_| Error::Cancelled)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn story_exactly_one_task_wins_ownership() {
        let gate = Gate::new();
        assert!(gate.try_own());
        assert!(!gate.try_own());
        assert!(!gate.try_own());
    }

    #[tokio::test]
    async fn story_ownership_is_exclusive_under_contention() {
        let gate = Arc::new(Gate::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let gate = Arc::clone(&gate);
            tasks.push(tokio::spawn(async move { gate.try_own() }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn story_first_signal_releases_all_waiters() {
        let gate = Arc::new(Gate::new());
        let cancel = CancellationToken::new();

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            waiters.push(tokio::spawn(async move { gate.wait_ready(&cancel).await }));
        }

        // First transition reports true, later signals are no-ops.
        assert!(gate.signal_ready());
        assert!(!gate.signal_ready());

        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }

        // A waiter arriving after the signal returns immediately.
        gate.wait_ready(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn story_cancellation_unblocks_waiters() {
        let gate = Gate::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gate.wait_ready(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
