//! Completion protocol: how the worker waits for a request it has handed to
//! the backend.
//!
//! Streaming runs are waited on through their [`CompletionSignal`]; everything
//! else through the request's [`ResultSlot`]. Both waits race a per-request
//! disconnect monitor and are bounded by the completion budget. The monitor
//! never outlives the wait.
//!
//! [`ResultSlot`]: crate::slot::ResultSlot

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;

use crate::backend::SessionHandles;
use crate::config::CoordinatorConfig;
use crate::connection::{DisconnectProbe, probe_connected};
use crate::error::RelayError;
use crate::queue::QueuedRequest;
use crate::signal::CompletionSignal;

/// How a completion wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionEnd {
    Completed,
    /// The client went away before the backend finished.
    ClientGone,
    TimedOut,
}

/// Background task aborted on drop, so it cannot outlive its owner.
pub(crate) struct MonitorTask {
    handle: Option<JoinHandle<()>>,
}

impl MonitorTask {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Abort and wait for the task to finish. Returns `true` if it panicked.
    pub(crate) async fn stop(mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        handle.abort();
        match handle.await {
            Ok(()) => false,
            Err(e) if e.is_panic() => {
                tracing::error!(error = %e, "Monitor task panicked");
                true
            }
            Err(_) => false,
        }
    }
}

impl Drop for MonitorTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Wait for a streaming run to signal completion.
///
/// On a clean finish, runs the stop-generation safety check before returning.
pub async fn await_stream(
    item: &QueuedRequest,
    completion: &CompletionSignal,
    session: &SessionHandles,
    config: &CoordinatorConfig,
) -> CompletionEnd {
    let req_id = item.req_id.as_str();
    let early_disconnect = Arc::new(AtomicBool::new(false));

    let monitor = MonitorTask::spawn({
        let connection = Arc::clone(&item.connection);
        let completion = completion.clone();
        let probe = session.probe.clone();
        let result = item.result.clone();
        let early = Arc::clone(&early_disconnect);
        let poll = config.monitor_poll;
        let bound = config.probe_bound;
        async move {
            while !completion.is_set() {
                if !probe_connected(connection.as_ref(), bound).await {
                    early.store(true, Ordering::SeqCst);
                    probe.trip();
                    result.fail(RelayError::disconnected("streaming"));
                    completion.set();
                    break;
                }
                tokio::select! {
                    _ = completion.wait() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    });

    let budget = config.completion_wait_budget();
    let waited = tokio::time::timeout(budget, completion.wait()).await;

    if monitor.stop().await {
        early_disconnect.store(true, Ordering::SeqCst);
        session.probe.trip();
        item.result.fail(RelayError::disconnected("streaming"));
    }

    if waited.is_err() {
        tracing::error!(req_id, budget_secs = budget.as_secs(), "Timed out waiting for stream completion");
        item.result.fail(RelayError::ProcessingTimeout);
        return CompletionEnd::TimedOut;
    }

    if early_disconnect.load(Ordering::SeqCst) {
        tracing::info!(req_id, "Stream ended early by client disconnect, skipping stop check");
        return CompletionEnd::ClientGone;
    }

    tracing::debug!(req_id, "Stream completed, running post-completion check");
    if let Err(e) = ensure_generation_stopped(session, config).await {
        if e.is_client_gone() {
            tracing::info!(req_id, error = %e, "Client left during post-completion check");
        } else {
            tracing::warn!(req_id, error = %e, "Post-completion stop check failed");
        }
    }
    CompletionEnd::Completed
}

/// Make sure the backend is not still generating after the stream ended.
async fn ensure_generation_stopped(
    session: &SessionHandles,
    config: &CoordinatorConfig,
) -> Result<(), RelayError> {
    let req_id = session.probe.req_id();
    session.probe.check("post-stream check")?;
    tokio::time::sleep(config.post_stream_settle).await;

    if !session.stop.is_generating().await? {
        tracing::debug!(req_id, "Backend idle after stream");
        return Ok(());
    }

    tracing::info!(req_id, "Backend still generating after stream end, stopping");
    session.probe.check("stop generation")?;
    session.stop.stop_generation().await?;
    if session.stop.wait_until_stopped(config.stop_wait).await? {
        tracing::info!(req_id, "Backend generation stopped");
    } else {
        tracing::warn!(req_id, wait_secs = config.stop_wait.as_secs(), "Backend still generating after stop wait");
    }
    Ok(())
}

/// Wait for a non-streaming run to settle the request's result.
pub async fn await_result(
    item: &QueuedRequest,
    probe: &DisconnectProbe,
    config: &CoordinatorConfig,
) -> CompletionEnd {
    let req_id = item.req_id.as_str();

    let monitor = MonitorTask::spawn({
        let connection = Arc::clone(&item.connection);
        let probe = probe.clone();
        let result = item.result.clone();
        let poll = config.monitor_poll;
        let bound = config.probe_bound;
        async move {
            while !result.is_settled() {
                if !probe_connected(connection.as_ref(), bound).await {
                    probe.trip();
                    result.fail(RelayError::disconnected("response wait"));
                    break;
                }
                tokio::select! {
                    _ = result.wait() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    });

    let budget = config.completion_wait_budget();
    let waited = tokio::time::timeout(budget, item.result.wait()).await;

    if monitor.stop().await {
        probe.trip();
        item.result.fail(RelayError::disconnected("response wait"));
    }

    if waited.is_err() && item.result.fail(RelayError::ProcessingTimeout) {
        tracing::error!(req_id, budget_secs = budget.as_secs(), "Timed out waiting for response");
        return CompletionEnd::TimedOut;
    }

    match item.result.error() {
        Some(e) if e.is_client_gone() => CompletionEnd::ClientGone,
        _ => CompletionEnd::Completed,
    }
}
