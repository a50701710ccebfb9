//! The coordinator: one object owning the queue, the single-flight execution
//! lock, pacing state, the active model and the parameter cache.
//!
//! Worker loops (see `worker`) pull requests from the queue and drive them
//! through [`Coordinator::process`]. Everything that touches the backend
//! happens with the execution lock held; model-switch and param-cache locks
//! are only ever taken inside it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{Collaborators, ExecutionContext, RunOutcome, SessionHandles};
use crate::chat::{ChatCompletionRequest, ChatResponse};
use crate::completion::{self, MonitorTask};
use crate::config::CoordinatorConfig;
use crate::connection::{ConnectivityChecker, DisconnectProbe, probe_connected};
use crate::error::RelayError;
use crate::model::{ModelCatalog, ModelSwitchState};
use crate::params::{ParamCache, RequestParams};
use crate::queue::{AdmissionQueue, QueueEntry, QueuedRequest};
use crate::slot::ResultSlot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacingState {
    pub was_last_streaming: bool,
    pub last_completion: Option<Instant>,
}

/// Delay before starting a streaming request right after another one.
///
/// `Some(max(floor, window - elapsed))` when both the previous and the next
/// request stream and the previous finished less than `window` ago.
pub fn pacing_delay(
    state: &PacingState,
    streaming: bool,
    now: Instant,
    window: Duration,
    floor: Duration,
) -> Option<Duration> {
    if !(state.was_last_streaming && streaming) {
        return None;
    }
    let elapsed = now.saturating_duration_since(state.last_completion?);
    if elapsed >= window {
        return None;
    }
    Some((window - elapsed).max(floor))
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub is_processing_locked: bool,
    pub items: Vec<QueueEntry>,
}

pub struct Coordinator {
    pub(crate) queue: AdmissionQueue,
    exec_lock: Mutex<()>,
    pacing: StdMutex<PacingState>,
    models: ModelSwitchState,
    catalog: Arc<ModelCatalog>,
    params: ParamCache,
    backend: Collaborators,
    config: CoordinatorConfig,
    shutdown: CancellationToken,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

fn recover<'a, T>(result: std::sync::LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        backend: Collaborators,
        catalog: Arc<ModelCatalog>,
        initial_model: Option<String>,
    ) -> Self {
        Self {
            queue: AdmissionQueue::new(config.max_queue),
            exec_lock: Mutex::new(()),
            pacing: StdMutex::new(PacingState::default()),
            models: ModelSwitchState::new(initial_model),
            catalog,
            params: ParamCache::new(),
            backend,
            config,
            shutdown: CancellationToken::new(),
            workers: StdMutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn current_model(&self) -> Option<String> {
        self.models.current()
    }

    pub fn backend_ready(&self) -> bool {
        self.backend.executor.is_ready()
    }

    pub fn pacing_state(&self) -> PacingState {
        *recover(self.pacing.lock())
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Admit a request. The caller keeps a clone of `result` to wait on.
    pub fn enqueue(
        &self,
        req_id: impl Into<String>,
        request: ChatCompletionRequest,
        connection: Arc<dyn ConnectivityChecker>,
        result: ResultSlot<ChatResponse>,
    ) -> Result<Arc<QueuedRequest>, RelayError> {
        if self.is_shutting_down() {
            return Err(RelayError::WorkerStopped);
        }
        let item = Arc::new(QueuedRequest::new(req_id, request, connection, result));
        self.queue.enqueue(Arc::clone(&item))?;
        tracing::info!(
            req_id = %item.req_id,
            stream = item.is_streaming(),
            queue_length = self.queue.len(),
            "Request queued"
        );
        Ok(item)
    }

    /// Cancel a request that is still waiting in the queue.
    pub fn cancel(&self, req_id: &str) -> bool {
        let found = self.queue.cancel_by_id(req_id);
        if found {
            tracing::info!(req_id, "Queued request cancelled");
        } else {
            tracing::debug!(req_id, "Cancel found no queued request");
        }
        found
    }

    pub fn is_processing_locked(&self) -> bool {
        self.exec_lock.try_lock().is_err()
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            queue_length: self.queue.len(),
            is_processing_locked: self.is_processing_locked(),
            items: self.queue.snapshot(),
        }
    }

    /// Start the configured number of worker loops. No-op if already started.
    pub fn spawn_workers(self: &Arc<Self>) -> usize {
        let mut workers = recover(self.workers.lock());
        if !workers.is_empty() {
            return workers.len();
        }
        for worker_id in 0..self.config.workers {
            let coordinator = Arc::clone(self);
            workers.push(tokio::spawn(crate::worker::run_worker(coordinator, worker_id)));
        }
        tracing::info!(workers = workers.len(), "Worker loops started");
        workers.len()
    }

    pub fn workers_running(&self) -> usize {
        recover(self.workers.lock())
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Stop the workers, failing every queued request with `WorkerStopped`.
    /// In-flight requests are failed by their worker on the way out.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let drained = self.queue.drain_all();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Failing queued requests on shutdown");
        }
        for item in drained {
            item.result.fail(RelayError::WorkerStopped);
        }

        let handles = std::mem::take(&mut *recover(self.workers.lock()));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Coordinator stopped");
    }

    async fn connected(&self, item: &QueuedRequest) -> bool {
        probe_connected(item.connection.as_ref(), self.config.probe_bound).await
    }

    /// Drive one dequeued request from admission checks to cleanup.
    ///
    /// A panic anywhere in the pipeline fails the request and leaves the
    /// worker running. Pacing is recorded once the execution lock was reached.
    pub(crate) async fn process(&self, item: &QueuedRequest, worker_id: usize) {
        let streaming = item.is_streaming();
        let mut reached_lock = false;
        let run = AssertUnwindSafe(self.run_pipeline(item, worker_id, &mut reached_lock))
            .catch_unwind()
            .await;
        if run.is_err() {
            tracing::error!(req_id = %item.req_id, worker = worker_id, "Panic while processing request");
            item.result.fail(RelayError::server("request processing panicked"));
        }
        if reached_lock {
            self.record_completion(streaming);
        }
    }

    async fn run_pipeline(&self, item: &QueuedRequest, worker_id: usize, reached_lock: &mut bool) {
        let req_id = item.req_id.as_str();

        if item.is_cancelled() {
            tracing::info!(req_id, worker = worker_id, "Request was cancelled while queued, skipping");
            item.result.fail(RelayError::ClientCancelled);
            return;
        }

        if !self.connected(item).await {
            tracing::info!(req_id, worker = worker_id, "Client disconnected before processing");
            item.result.fail(RelayError::disconnected("dequeue"));
            return;
        }

        let streaming = item.is_streaming();
        let delay = pacing_delay(
            &self.pacing_state(),
            streaming,
            Instant::now(),
            self.config.pacing_window,
            self.config.pacing_floor,
        );
        if let Some(delay) = delay {
            tracing::info!(req_id, delay_ms = delay.as_millis() as u64, "Pacing consecutive streaming request");
            tokio::time::sleep(delay).await;
        }

        if !self.connected(item).await {
            tracing::info!(req_id, worker = worker_id, "Client disconnected while pacing");
            item.result.fail(RelayError::disconnected("pacing"));
            return;
        }

        let session = {
            let _guard = self.exec_lock.lock().await;
            *reached_lock = true;
            tracing::info!(req_id, worker = worker_id, "Acquired execution lock");

            if !self.connected(item).await {
                tracing::info!(req_id, "Client disconnected after acquiring execution lock");
                item.result.fail(RelayError::disconnected("lock acquisition"));
                None
            } else if item.result.is_settled() {
                tracing::info!(req_id, status = ?item.result.status(), "Result already settled, skipping execution");
                None
            } else {
                self.execute(item).await
            }
        };
        tracing::debug!(req_id, worker = worker_id, "Released execution lock");

        self.cleanup(req_id, session).await;
    }

    fn record_completion(&self, streaming: bool) {
        let mut pacing = recover(self.pacing.lock());
        pacing.was_last_streaming = streaming;
        pacing.last_completion = Some(Instant::now());
    }

    async fn cleanup(&self, req_id: &str, session: Option<SessionHandles>) {
        let executor = &self.backend.executor;
        executor.clear_stream_buffer().await;

        let Some(session) = session else {
            return;
        };
        if self.config.continuous_chat || !executor.is_ready() {
            return;
        }
        match executor.reset_conversation(req_id, &session.probe).await {
            Ok(()) => tracing::debug!(req_id, "Conversation reset"),
            Err(e) if e.is_client_gone() => {
                tracing::info!(req_id, error = %e, "Client left during conversation reset")
            }
            Err(e) => tracing::error!(req_id, error = %e, "Conversation reset failed"),
        }
    }

    /// Run the request against the backend and wait for it. Lock held.
    async fn execute(&self, item: &QueuedRequest) -> Option<SessionHandles> {
        let req_id = item.req_id.as_str();
        let probe = DisconnectProbe::new(req_id);

        let watcher = MonitorTask::spawn(watch_connection(
            Arc::clone(&item.connection),
            probe.clone(),
            item.result.clone(),
            self.config.monitor_poll,
            self.config.probe_bound,
        ));
        let run = AssertUnwindSafe(self.prepare_and_run(item, &probe))
            .catch_unwind()
            .await;
        if watcher.stop().await {
            probe.trip();
            item.result.fail(RelayError::disconnected("processing"));
        }

        let outcome = match run {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                if e.is_client_gone() {
                    tracing::info!(req_id, error = %e, "Request ended by client before completion");
                } else {
                    tracing::error!(req_id, error = %e, status = e.status_code(), "Request failed");
                }
                item.result.fail(e);
                return None;
            }
            Err(_) => {
                tracing::error!(req_id, "Backend panicked while running request");
                item.result.fail(RelayError::server("backend panicked"));
                return None;
            }
        };

        let end = match &outcome {
            RunOutcome::StreamStarted {
                completion,
                session,
            } => completion::await_stream(item, completion, session, &self.config).await,
            RunOutcome::NonStreamDone { .. } => {
                completion::await_result(item, &probe, &self.config).await
            }
        };
        tracing::info!(req_id, end = ?end, "Request processing finished");

        outcome.session().cloned()
    }

    async fn prepare_and_run(
        &self,
        item: &QueuedRequest,
        probe: &DisconnectProbe,
    ) -> Result<RunOutcome, RelayError> {
        let req_id = item.req_id.as_str();
        item.request.validate()?;

        let target = self
            .catalog
            .resolve(item.request.model.as_deref(), &self.config.proxy_model_name)?;
        probe.check("model resolution")?;

        let switched = match target.as_deref() {
            Some(model) => {
                self.models
                    .switch(model, self.backend.switcher.as_ref(), req_id)
                    .await
            }
            None => Ok(false),
        };
        let current = self.models.current();
        self.params
            .invalidate_for(current.as_deref(), matches!(switched, Ok(true)))
            .await;
        switched?;
        probe.check("model switch")?;

        let limit = self.catalog.max_tokens_limit(current.as_deref());
        let params = RequestParams::resolve(&item.request, &self.config.param_defaults, limit);
        self.params
            .push_all(&params, self.backend.params.as_ref(), probe)
            .await?;
        probe.check("parameter adjustment")?;

        tracing::info!(req_id, model = ?current, "Running request on backend");
        self.backend
            .executor
            .run(ExecutionContext {
                req_id: item.req_id.clone(),
                request: Arc::clone(&item.request),
                model_id: current,
                params,
                result: item.result.clone(),
                probe: probe.clone(),
            })
            .await
    }
}

/// Trip the probe and fail the result as soon as the client disappears.
async fn watch_connection(
    connection: Arc<dyn ConnectivityChecker>,
    probe: DisconnectProbe,
    result: ResultSlot<ChatResponse>,
    poll: Duration,
    bound: Duration,
) {
    while !probe.is_tripped() {
        if !probe_connected(connection.as_ref(), bound).await {
            probe.trip();
            result.fail(RelayError::disconnected("processing"));
            break;
        }
        tokio::select! {
            _ = probe.tripped() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
