//! Single-assignment result cell for a request's final outcome.
//!
//! A `ResultSlot` starts `Pending` and settles exactly once, to either a value or
//! a `RelayError`. Later attempts to settle are no-ops and report `false`, so the
//! worker, the disconnect monitors and cancel calls can race without care.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::watch;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Pending,
    Succeeded,
    Failed,
}

impl SlotStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

enum Settlement<T> {
    Pending,
    Settled(Result<T, RelayError>),
    /// Outcome already handed to the consumer; the status is remembered.
    Taken(SlotStatus),
}

impl<T> Settlement<T> {
    fn status(&self) -> SlotStatus {
        match self {
            Self::Pending => SlotStatus::Pending,
            Self::Settled(Ok(_)) => SlotStatus::Succeeded,
            Self::Settled(Err(_)) => SlotStatus::Failed,
            Self::Taken(status) => *status,
        }
    }
}

struct Inner<T> {
    state: StdMutex<Settlement<T>>,
    settled_tx: watch::Sender<bool>,
}

/// Shared handle to a single-assignment outcome cell.
pub struct ResultSlot<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ResultSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ResultSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSlot")
            .field("status", &self.status())
            .finish()
    }
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        let (settled_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: StdMutex::new(Settlement::Pending),
                settled_tx,
            }),
        }
    }

    /// Lock the state, recovering from poison (the state is always consistent).
    fn lock(&self) -> MutexGuard<'_, Settlement<T>> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Result slot mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn settle(&self, outcome: Result<T, RelayError>) -> bool {
        {
            let mut state = self.lock();
            if !matches!(*state, Settlement::Pending) {
                return false;
            }
            *state = Settlement::Settled(outcome);
        }
        self.inner.settled_tx.send_replace(true);
        true
    }

    /// Settle with a value. Returns `false` if the slot was already settled.
    pub fn succeed(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with a failure. Returns `false` if the slot was already settled.
    pub fn fail(&self, error: RelayError) -> bool {
        self.settle(Err(error))
    }

    pub fn status(&self) -> SlotStatus {
        self.lock().status()
    }

    pub fn is_settled(&self) -> bool {
        self.status().is_settled()
    }

    /// Error the slot settled with, if it failed and has not been taken.
    pub fn error(&self) -> Option<RelayError> {
        match &*self.lock() {
            Settlement::Settled(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Wait until settled without consuming the outcome.
    ///
    /// Dropping this future has no effect on the slot, so it can be raced
    /// against timeouts and shutdown signals freely.
    pub async fn wait(&self) {
        let mut rx = self.inner.settled_tx.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot error.
        let _ = rx.wait_for(|settled| *settled).await;
    }

    /// Take the outcome out of a settled slot. `None` while pending or once taken.
    pub fn take(&self) -> Option<Result<T, RelayError>> {
        let mut state = self.lock();
        let status = state.status();
        match std::mem::replace(&mut *state, Settlement::Taken(status)) {
            Settlement::Settled(outcome) => Some(outcome),
            other => {
                *state = other;
                None
            }
        }
    }

    /// Wait for settlement and consume the outcome.
    pub async fn outcome(&self) -> Result<T, RelayError> {
        self.wait().await;
        self.take()
            .unwrap_or_else(|| Err(RelayError::server("result already consumed")))
    }
}
