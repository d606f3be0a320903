//! One-shot readiness signal.
//!
//! Components that become usable asynchronously flip a [`Readiness`] once;
//! waiters are woken by the signal rather than by polling. [`poll_until`]
//! exists for collaborators that cannot signal, and always has a deadline.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("Not ready after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug)]
pub struct Readiness {
    tx: watch::Sender<bool>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Flip to ready. Later calls are no-ops.
    pub fn mark_ready(&self) {
        self.tx.send_if_modified(|ready| !std::mem::replace(ready, true));
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until ready.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), ReadinessError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| ReadinessError::TimedOut(timeout))
    }
}

/// Poll `check` every `interval` until it returns true or `timeout` passes.
pub async fn poll_until<F>(check: F, interval: Duration, timeout: Duration) -> Result<(), ReadinessError>
where
    F: Fn() -> bool,
{
    let poll = async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(interval).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| ReadinessError::TimedOut(timeout))
}
