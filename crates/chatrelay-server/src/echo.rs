//! In-process backend that answers by echoing the last user message.
//!
//! Stands in for a real browser session: it keeps a conversation, a model
//! selection and generation parameters in memory, and streams its reply one
//! word at a time so cancellation and stop control have something to act on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatrelay::chat::ChunkSender;
use chatrelay::params::ParamValue;
use chatrelay::{
    BackendParamSink, ChatResponse, ChunkStream, CompletionSignal, DisconnectProbe,
    ExecutionBackend, ExecutionContext, ModelSwitcher, RelayError, RunOutcome, SessionHandles,
    StopControl,
};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::{debug, info};

const ECHO_MODEL: &str = "echo";
const STREAM_BUFFER: usize = 32;

#[derive(Debug, Default)]
struct EchoState {
    conversation: Vec<String>,
    params: HashMap<String, ParamValue>,
    model: Option<String>,
}

/// Generation flag plus a wakeup for anyone waiting on it to drop.
#[derive(Debug, Default)]
pub struct EchoStop {
    generating: AtomicBool,
    stopped: Notify,
}

impl EchoStop {
    fn begin(&self) {
        self.generating.store(true, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.generating.store(false, Ordering::SeqCst);
        self.stopped.notify_waiters();
    }

    fn generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StopControl for EchoStop {
    async fn is_generating(&self) -> Result<bool, RelayError> {
        Ok(self.generating())
    }

    async fn stop_generation(&self) -> Result<(), RelayError> {
        info!("Stopping echo generation");
        self.finish();
        Ok(())
    }

    async fn wait_until_stopped(&self, timeout: Duration) -> Result<bool, RelayError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.stopped.notified();
            if !self.generating() {
                return Ok(true);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(!self.generating());
            }
        }
    }
}

pub struct EchoBackend {
    state: Mutex<EchoState>,
    stop: Arc<EchoStop>,
    models: Vec<String>,
    chunk_interval: Duration,
}

impl EchoBackend {
    /// `models` empty means any model id is accepted.
    pub fn new(models: Vec<String>) -> Self {
        Self {
            state: Mutex::new(EchoState::default()),
            stop: Arc::new(EchoStop::default()),
            models,
            chunk_interval: Duration::from_millis(20),
        }
    }

    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EchoState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self, probe: &DisconnectProbe) -> SessionHandles {
        SessionHandles {
            stop: self.stop.clone(),
            probe: probe.clone(),
        }
    }
}

#[cfg(test)]
impl EchoBackend {
    fn conversation_len(&self) -> usize {
        self.state().conversation.len()
    }

    fn active_model(&self) -> Option<String> {
        self.state().model.clone()
    }
}

fn completion_id(req_id: &str) -> String {
    format!("chatcmpl-{req_id}")
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn completion_body(req_id: &str, model: &str, prompt: &str, reply: &str) -> Value {
    let prompt_tokens = word_count(prompt);
    let completion_tokens = word_count(reply);
    json!({
        "id": completion_id(req_id),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": reply },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })
}

fn chunk_body(req_id: &str, model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": completion_id(req_id),
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
    })
}

/// One streamed reply, fed word by word into the chunk channel.
struct WordStream {
    tx: ChunkSender,
    req_id: String,
    model: String,
    reply: String,
    interval: Duration,
    probe: DisconnectProbe,
    stop: Arc<EchoStop>,
    done: CompletionSignal,
}

impl WordStream {
    async fn run(self) {
        let Self {
            tx,
            req_id,
            model,
            reply,
            interval,
            probe,
            stop,
            done,
        } = self;
        let mut words = reply.split_inclusive(' ').peekable();
        let first = chunk_body(&req_id, &model, json!({ "role": "assistant" }), None);
        let mut delivered = tx.send(first).await.is_ok();

        while delivered && stop.generating() && !probe.is_tripped() {
            let Some(word) = words.next() else { break };
            tokio::time::sleep(interval).await;
            let chunk = chunk_body(&req_id, &model, json!({ "content": word }), None);
            delivered = tx.send(chunk).await.is_ok();
        }

        if delivered && words.peek().is_none() {
            let last = chunk_body(&req_id, &model, json!({}), Some("stop"));
            let _ = tx.send(last).await;
        }
        debug!(req_id = %req_id, delivered, "Echo stream finished");
        stop.finish();
        done.set();
    }
}

#[async_trait]
impl ExecutionBackend for EchoBackend {
    async fn run(&self, ctx: ExecutionContext) -> Result<RunOutcome, RelayError> {
        ctx.probe.check("echo submit")?;

        let prompt = ctx
            .request
            .last_user_message()
            .map(|m| m.text())
            .unwrap_or_default();
        let model = ctx.model_id.clone().unwrap_or_else(|| ECHO_MODEL.to_string());
        let reply = prompt.clone();
        self.state().conversation.extend([prompt.clone(), reply.clone()]);

        if !ctx.request.stream {
            ctx.result.succeed(ChatResponse::Completion(completion_body(
                &ctx.req_id,
                &model,
                &prompt,
                &reply,
            )));
            return Ok(RunOutcome::NonStreamDone {
                session: Some(self.session(&ctx.probe)),
            });
        }

        let (tx, stream) = ChunkStream::channel(STREAM_BUFFER);
        let completion = CompletionSignal::new();
        self.stop.begin();
        ctx.result.succeed(ChatResponse::Stream(stream));
        let job = WordStream {
            tx,
            req_id: ctx.req_id.clone(),
            model,
            reply,
            interval: self.chunk_interval,
            probe: ctx.probe.clone(),
            stop: self.stop.clone(),
            done: completion.clone(),
        };
        tokio::spawn(job.run());

        Ok(RunOutcome::StreamStarted {
            completion,
            session: self.session(&ctx.probe),
        })
    }

    async fn reset_conversation(
        &self,
        req_id: &str,
        probe: &DisconnectProbe,
    ) -> Result<(), RelayError> {
        probe.check("conversation reset")?;
        let mut state = self.state();
        debug!(req_id, turns = state.conversation.len(), "Clearing echo conversation");
        state.conversation.clear();
        Ok(())
    }
}

#[async_trait]
impl ModelSwitcher for EchoBackend {
    async fn switch_to(&self, model_id: &str) -> Result<bool, RelayError> {
        if !self.models.is_empty() && !self.models.iter().any(|m| m == model_id) {
            return Ok(false);
        }
        self.state().model = Some(model_id.to_string());
        Ok(true)
    }
}

#[async_trait]
impl BackendParamSink for EchoBackend {
    async fn current_value(&self, name: &str) -> Result<Option<ParamValue>, RelayError> {
        Ok(self.state().params.get(name).cloned())
    }

    async fn apply(&self, name: &str, value: &ParamValue) -> Result<ParamValue, RelayError> {
        self.state()
            .params
            .insert(name.to_string(), value.clone());
        Ok(value.clone())
    }
}
