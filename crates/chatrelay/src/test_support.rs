//! Mock collaborators shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use crate::backend::{
    Collaborators, ExecutionBackend, ExecutionContext, RunOutcome, SessionHandles, StopControl,
};
use crate::chat::{ChatResponse, ChunkStream};
use crate::connection::DisconnectProbe;
use crate::error::RelayError;
use crate::model::ModelSwitcher;
use crate::params::{BackendParamSink, ParamValue};
use crate::signal::CompletionSignal;

#[derive(Default)]
pub struct MockParamSink {
    values: Mutex<HashMap<String, ParamValue>>,
    commit_override: Mutex<Option<ParamValue>>,
    failure: Mutex<Option<RelayError>>,
    applies: AtomicUsize,
    reads: AtomicUsize,
}

impl MockParamSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(&self, name: &str, value: ParamValue) {
        self.values.lock().unwrap().insert(name.to_string(), value);
    }

    /// Every later apply commits `value` instead of the requested one.
    pub fn commit_override(&self, value: ParamValue) {
        *self.commit_override.lock().unwrap() = Some(value);
    }

    pub fn fail_with(&self, error: RelayError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn failure(&self) -> Result<(), RelayError> {
        match self.failure.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackendParamSink for MockParamSink {
    async fn current_value(&self, name: &str) -> Result<Option<ParamValue>, RelayError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.failure()?;
        Ok(self.values.lock().unwrap().get(name).cloned())
    }

    async fn apply(&self, name: &str, value: &ParamValue) -> Result<ParamValue, RelayError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.failure()?;
        let committed = self
            .commit_override
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| value.clone());
        self.values
            .lock()
            .unwrap()
            .insert(name.to_string(), committed.clone());
        Ok(committed)
    }
}

pub struct MockSwitcher {
    accept: AtomicBool,
    calls: AtomicUsize,
}

impl MockSwitcher {
    pub fn accepting() -> Self {
        Self {
            accept: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn refusing() -> Self {
        let s = Self::accepting();
        s.refuse();
        s
    }

    pub fn refuse(&self) {
        self.accept.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelSwitcher for MockSwitcher {
    async fn switch_to(&self, _model_id: &str) -> Result<bool, RelayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.accept.load(Ordering::SeqCst))
    }
}

pub struct MockStop {
    generating: AtomicBool,
    is_generating_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl MockStop {
    fn with(generating: bool) -> Self {
        Self {
            generating: AtomicBool::new(generating),
            is_generating_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn generating() -> Self {
        Self::with(true)
    }

    pub fn idle() -> Self {
        Self::with(false)
    }

    pub fn is_generating_now(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    pub fn is_generating_calls(&self) -> usize {
        self.is_generating_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StopControl for MockStop {
    async fn is_generating(&self) -> Result<bool, RelayError> {
        self.is_generating_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.is_generating_now())
    }

    async fn stop_generation(&self) -> Result<(), RelayError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.generating.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_until_stopped(&self, _timeout: Duration) -> Result<bool, RelayError> {
        Ok(!self.is_generating_now())
    }
}

/// What [`MockBackend::run`] does for a given request id.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Settle immediately with `{"echo": <last user text>}`.
    Reply,
    /// Never settle the result.
    Hang,
    /// Hand back a chunk stream, emit `chunks` chunks `interval` apart, then
    /// signal completion.
    Stream { chunks: usize, interval: Duration },
    Fail(RelayError),
    Panic,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub req_id: String,
    pub started_at: Instant,
}

pub struct MockBackend {
    scripts: Mutex<HashMap<String, Behavior>>,
    default_behavior: Mutex<Behavior>,
    runs: Mutex<Vec<RunRecord>>,
    clears: Mutex<Vec<Instant>>,
    run_delay: Mutex<Duration>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    resets: AtomicUsize,
    panic_on_reset: AtomicBool,
    ready: AtomicBool,
    pub stop: Arc<MockStop>,
    pub switcher: Arc<MockSwitcher>,
    pub params: Arc<MockParamSink>,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_behavior: Mutex::new(Behavior::Reply),
            runs: Mutex::new(Vec::new()),
            clears: Mutex::new(Vec::new()),
            run_delay: Mutex::new(Duration::ZERO),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            panic_on_reset: AtomicBool::new(false),
            ready: AtomicBool::new(true),
            stop: Arc::new(MockStop::idle()),
            switcher: Arc::new(MockSwitcher::accepting()),
            params: Arc::new(MockParamSink::new()),
        }
    }

    pub fn script(&self, req_id: &str, behavior: Behavior) {
        self.scripts
            .lock()
            .unwrap()
            .insert(req_id.to_string(), behavior);
    }

    /// Behavior for request ids without a script of their own.
    pub fn script_default(&self, behavior: Behavior) {
        *self.default_behavior.lock().unwrap() = behavior;
    }

    /// Make every later `reset_conversation` call panic.
    pub fn panic_on_reset(&self) {
        self.panic_on_reset.store(true, Ordering::SeqCst);
    }

    pub fn set_run_delay(&self, delay: Duration) {
        *self.run_delay.lock().unwrap() = delay;
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().unwrap().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn buffer_clears(&self) -> usize {
        self.clears.lock().unwrap().len()
    }

    pub fn buffer_clear_times(&self) -> Vec<Instant> {
        self.clears.lock().unwrap().clone()
    }

    fn session(&self, probe: &DisconnectProbe) -> SessionHandles {
        SessionHandles {
            stop: self.stop.clone(),
            probe: probe.clone(),
        }
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn run(&self, ctx: ExecutionContext) -> Result<RunOutcome, RelayError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveGuard(&self.active);
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.runs.lock().unwrap().push(RunRecord {
            req_id: ctx.req_id.clone(),
            started_at: Instant::now(),
        });

        let delay = *self.run_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let behavior = self
            .scripts
            .lock()
            .unwrap()
            .get(&ctx.req_id)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.lock().unwrap().clone());

        match behavior {
            Behavior::Reply => {
                let text = ctx
                    .request
                    .last_user_message()
                    .map(|m| m.text())
                    .unwrap_or_default();
                ctx.result
                    .succeed(ChatResponse::Completion(json!({ "echo": text })));
                Ok(RunOutcome::NonStreamDone {
                    session: Some(self.session(&ctx.probe)),
                })
            }
            Behavior::Hang => Ok(RunOutcome::NonStreamDone {
                session: Some(self.session(&ctx.probe)),
            }),
            Behavior::Stream { chunks, interval } => {
                let (tx, stream) = ChunkStream::channel(chunks.max(1) + 1);
                ctx.result.succeed(ChatResponse::Stream(stream));
                let completion = CompletionSignal::new();
                let done = completion.clone();
                let probe = ctx.probe.clone();
                tokio::spawn(async move {
                    for i in 0..chunks {
                        if probe.is_tripped() {
                            return;
                        }
                        tokio::time::sleep(interval).await;
                        let _ = tx.try_send(json!({ "index": i }));
                    }
                    done.set();
                });
                Ok(RunOutcome::StreamStarted {
                    completion,
                    session: self.session(&ctx.probe),
                })
            }
            Behavior::Fail(e) => Err(e),
            Behavior::Panic => panic!("mock backend panic"),
        }
    }

    async fn clear_stream_buffer(&self) {
        self.clears.lock().unwrap().push(Instant::now());
    }

    async fn reset_conversation(
        &self,
        _req_id: &str,
        _probe: &DisconnectProbe,
    ) -> Result<(), RelayError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_reset.load(Ordering::SeqCst) {
            panic!("mock reset panic");
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Wire a mock backend with its own switcher and param sink.
pub fn collaborators(backend: Arc<MockBackend>) -> Collaborators {
    Collaborators {
        switcher: backend.switcher.clone(),
        params: backend.params.clone(),
        executor: backend,
    }
}
