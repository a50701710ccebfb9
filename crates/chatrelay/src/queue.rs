//! FIFO admission queue with in-place stale pruning and cancel-by-id.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::chat::{ChatCompletionRequest, ChatResponse};
use crate::connection::{ConnectivityChecker, probe_connected};
use crate::error::RelayError;
use crate::slot::ResultSlot;

/// A request waiting for (or handed to) the worker.
pub struct QueuedRequest {
    pub req_id: String,
    pub request: Arc<ChatCompletionRequest>,
    pub connection: Arc<dyn ConnectivityChecker>,
    pub result: ResultSlot<ChatResponse>,
    pub enqueued_at: Instant,
    pub enqueue_time: DateTime<Utc>,
    cancelled: AtomicBool,
}

impl QueuedRequest {
    pub fn new(
        req_id: impl Into<String>,
        request: ChatCompletionRequest,
        connection: Arc<dyn ConnectivityChecker>,
        result: ResultSlot<ChatResponse>,
    ) -> Self {
        Self {
            req_id: req_id.into(),
            request: Arc::new(request),
            connection,
            result,
            enqueued_at: Instant::now(),
            enqueue_time: Utc::now(),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.request.stream
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `true` if this call flipped the flag.
    fn mark_cancelled(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("req_id", &self.req_id)
            .field("stream", &self.is_streaming())
            .field("cancelled", &self.is_cancelled())
            .field("result", &self.result)
            .finish()
    }
}

/// Read-only view of one queued item.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub req_id: String,
    pub enqueue_time: DateTime<Utc>,
    pub wait_time_seconds: f64,
    pub is_streaming: bool,
    pub cancelled: bool,
}

pub struct AdmissionQueue {
    items: StdMutex<VecDeque<Arc<QueuedRequest>>>,
    available: Notify,
    capacity: Option<usize>,
}

impl AdmissionQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            items: StdMutex::new(VecDeque::new()),
            available: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<QueuedRequest>>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Admission queue mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn enqueue(&self, item: Arc<QueuedRequest>) -> Result<(), RelayError> {
        {
            let mut items = self.lock();
            if let Some(cap) = self.capacity
                && items.len() >= cap
            {
                return Err(RelayError::QueueFull);
            }
            items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Check up to `limit` head items and cancel those whose client is gone.
    ///
    /// Items stay where they are; a cancelled item is dropped by the worker
    /// when it reaches the head. Duplicate ids within the window are checked
    /// once. Returns how many items were newly pruned.
    pub async fn scan_and_prune_stale(&self, limit: usize, probe_bound: Duration) -> usize {
        let window: Vec<Arc<QueuedRequest>> = self.lock().iter().take(limit).cloned().collect();
        if window.is_empty() {
            return 0;
        }

        let mut seen = HashSet::with_capacity(window.len());
        let mut pruned = 0;
        for item in window {
            if !seen.insert(item.req_id.clone()) || item.is_cancelled() {
                continue;
            }
            if probe_connected(item.connection.as_ref(), probe_bound).await {
                continue;
            }
            if item.mark_cancelled() {
                tracing::info!(req_id = %item.req_id, "Client disconnected while queued, marking cancelled");
                item.result.fail(RelayError::disconnected("queue"));
                pruned += 1;
            }
        }
        pruned
    }

    /// Pop the head, waiting at most `wait` for one to arrive.
    pub async fn dequeue(&self, wait: Duration) -> Option<Arc<QueuedRequest>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(item) = self.lock().pop_front() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Cancel every still-queued, not yet cancelled item with this id.
    pub fn cancel_by_id(&self, req_id: &str) -> bool {
        let items = self.lock();
        let mut found = false;
        for item in items.iter().filter(|i| i.req_id == req_id) {
            if item.mark_cancelled() {
                item.result.fail(RelayError::ClientCancelled);
                found = true;
            }
        }
        found
    }

    /// Items sorted by enqueue time. Never mutates the queue.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        let now = Instant::now();
        let mut items: Vec<Arc<QueuedRequest>> = self.lock().iter().cloned().collect();
        items.sort_by_key(|i| i.enqueued_at);
        items
            .into_iter()
            .map(|i| QueueEntry {
                req_id: i.req_id.clone(),
                enqueue_time: i.enqueue_time,
                wait_time_seconds: now.saturating_duration_since(i.enqueued_at).as_secs_f64(),
                is_streaming: i.is_streaming(),
                cancelled: i.is_cancelled(),
            })
            .collect()
    }

    /// Remove everything, for shutdown.
    pub fn drain_all(&self) -> Vec<Arc<QueuedRequest>> {
        self.lock().drain(..).collect()
    }
}
