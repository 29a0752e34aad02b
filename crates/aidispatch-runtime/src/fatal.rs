//! Node-wide termination signal raised by unrecoverable worker errors.

use tokio::sync::watch;
use tracing::error;

/// Cloneable handle; every clone observes the same signal.
#[derive(Clone)]
pub struct FatalHandle {
    tx: watch::Sender<Option<String>>,
}

impl Default for FatalHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl FatalHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Flip the node into terminating. Only the first reason is kept.
    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let first = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.clone());
                true
            } else {
                false
            }
        });
        if first {
            error!("Unrecoverable worker error, node terminating: {}", reason);
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolve once the signal has been raised, returning its reason.
    pub async fn wait(&self) -> String {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender lives in `self`, so this cannot close while we wait.
                return String::new();
            }
        }
    }
}
