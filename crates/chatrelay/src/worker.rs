//! Worker loop: prune, dequeue, process, repeat until shutdown.

use std::sync::Arc;

use crate::coordinator::Coordinator;
use crate::error::RelayError;

/// Run one worker loop until the coordinator shuts down.
///
/// A request in flight when shutdown arrives is failed with `WorkerStopped`;
/// its monitor tasks are aborted with it.
pub async fn run_worker(coordinator: Arc<Coordinator>, worker_id: usize) {
    let shutdown = coordinator.shutdown_token().clone();
    let config = coordinator.config().clone();
    tracing::info!(worker = worker_id, "Worker loop started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let pruned = coordinator
            .queue
            .scan_and_prune_stale(config.scan_limit, config.probe_bound)
            .await;
        if pruned > 0 {
            tracing::info!(worker = worker_id, pruned, "Pruned disconnected requests from queue");
        }

        let item = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            item = coordinator.queue.dequeue(config.dequeue_wait) => item,
        };
        let Some(item) = item else {
            continue;
        };

        tracing::info!(
            worker = worker_id,
            req_id = %item.req_id,
            stream = item.is_streaming(),
            waited_ms = item.enqueued_at.elapsed().as_millis() as u64,
            "Dequeued request"
        );

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::warn!(worker = worker_id, req_id = %item.req_id, "Shutdown during processing");
                item.result.fail(RelayError::WorkerStopped);
                break;
            }
            _ = coordinator.process(&item, worker_id) => {}
        }
    }

    tracing::info!(worker = worker_id, "Worker loop exiting");
}
