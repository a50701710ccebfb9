//! Client connectivity: the checker trait, the HTTP-side link and the
//! per-execution disconnect probe handed to the backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

/// Tells whether the client behind a queued request is still there.
///
/// Implementations must answer quickly; callers bound each check with
/// [`probe_connected`] anyway.
#[async_trait]
pub trait ConnectivityChecker: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// Run one bounded connectivity check.
///
/// A check still pending after `bound` counts as connected: a live socket with
/// nothing to report looks exactly like that.
pub async fn probe_connected(checker: &dyn ConnectivityChecker, bound: Duration) -> bool {
    tokio::time::timeout(bound, checker.is_connected())
        .await
        .unwrap_or(true)
}

/// Connection state shared between an HTTP handler and the queue.
///
/// The handler holds a [`DisconnectGuard`]; when axum drops the handler future
/// or the response body, the guard marks the link disconnected.
#[derive(Debug, Clone, Default)]
pub struct ClientLink {
    closed: CancellationToken,
}

impl ClientLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_disconnected(&self) {
        self.closed.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn guard(&self) -> DisconnectGuard {
        DisconnectGuard {
            link: Some(self.clone()),
        }
    }

    pub fn checker(&self) -> Arc<dyn ConnectivityChecker> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl ConnectivityChecker for ClientLink {
    async fn is_connected(&self) -> bool {
        !self.is_disconnected()
    }
}

/// Marks the link disconnected on drop unless disarmed.
pub struct DisconnectGuard {
    link: Option<ClientLink>,
}

impl DisconnectGuard {
    /// Response fully delivered: dropping no longer means the client left.
    pub fn disarm(&mut self) {
        self.link = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.mark_disconnected();
        }
    }
}

/// Cooperative cancellation handle for one execution.
///
/// The coordinator trips it when the client goes away; the backend calls
/// [`DisconnectProbe::check`] at its own safe points.
#[derive(Debug, Clone)]
pub struct DisconnectProbe {
    req_id: Arc<str>,
    token: CancellationToken,
}

impl DisconnectProbe {
    pub fn new(req_id: impl Into<Arc<str>>) -> Self {
        Self {
            req_id: req_id.into(),
            token: CancellationToken::new(),
        }
    }

    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    pub fn trip(&self) {
        if !self.token.is_cancelled() {
            tracing::info!(req_id = %self.req_id, "Client disconnect detected, tripping probe");
        }
        self.token.cancel();
    }

    pub fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(ClientDisconnected)` once tripped.
    pub fn check(&self, stage: &str) -> Result<(), RelayError> {
        if self.is_tripped() {
            Err(RelayError::disconnected(stage))
        } else {
            Ok(())
        }
    }

    pub async fn tripped(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverAnswers;

    #[async_trait]
    impl ConnectivityChecker for NeverAnswers {
        async fn is_connected(&self) -> bool {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pending_probe_counts_as_connected() {
        assert!(probe_connected(&NeverAnswers, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn guard_marks_link_on_drop() {
        let link = ClientLink::new();
        let checker = link.checker();
        {
            let _guard = link.guard();
            assert!(checker.is_connected().await);
        }
        assert!(!checker.is_connected().await);
    }

    #[tokio::test]
    async fn disarmed_guard_leaves_link_alone() {
        let link = ClientLink::new();
        let mut guard = link.guard();
        guard.disarm();
        drop(guard);
        assert!(!link.is_disconnected());
    }

    #[test]
    fn probe_check_reports_stage() {
        let probe = DisconnectProbe::new("abc1234");
        assert!(probe.check("prepare").is_ok());
        probe.trip();
        assert_eq!(
            probe.check("prepare"),
            Err(RelayError::disconnected("prepare"))
        );
        assert_eq!(probe.req_id(), "abc1234");
    }
}
