//! Collaborator traits for the shared backend session.
//!
//! The coordinator never touches the backend except through these seams:
//! [`ExecutionBackend`] runs a prepared request, [`StopControl`] is the
//! post-generation safety valve, and the model/parameter traits live in
//! `model` and `params`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::chat::{ChatCompletionRequest, ChatResponse};
use crate::connection::DisconnectProbe;
use crate::error::RelayError;
use crate::model::ModelSwitcher;
use crate::params::{BackendParamSink, RequestParams};
use crate::signal::CompletionSignal;
use crate::slot::ResultSlot;

/// Everything the backend needs for one request.
pub struct ExecutionContext {
    pub req_id: String,
    pub request: Arc<ChatCompletionRequest>,
    /// Active model after resolution and switching.
    pub model_id: Option<String>,
    pub params: RequestParams,
    /// The backend settles this: a full completion, or a chunk stream for
    /// streaming requests.
    pub result: ResultSlot<ChatResponse>,
    pub probe: DisconnectProbe,
}

/// Control over the backend's "stop generation" button.
#[async_trait]
pub trait StopControl: Send + Sync {
    async fn is_generating(&self) -> Result<bool, RelayError>;

    async fn stop_generation(&self) -> Result<(), RelayError>;

    /// `Ok(false)` if still generating after `timeout`.
    async fn wait_until_stopped(&self, timeout: Duration) -> Result<bool, RelayError>;
}

/// Handles a run leaves behind for post-completion checks and cleanup.
#[derive(Clone)]
pub struct SessionHandles {
    pub stop: Arc<dyn StopControl>,
    pub probe: DisconnectProbe,
}

impl std::fmt::Debug for SessionHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandles")
            .field("req_id", &self.probe.req_id())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The backend has settled (or will settle) the result slot itself.
    NonStreamDone { session: Option<SessionHandles> },
    /// Chunks are flowing; `completion` is set when generation ends.
    StreamStarted {
        completion: CompletionSignal,
        session: SessionHandles,
    },
}

impl RunOutcome {
    pub fn session(&self) -> Option<&SessionHandles> {
        match self {
            Self::NonStreamDone { session } => session.as_ref(),
            Self::StreamStarted { session, .. } => Some(session),
        }
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Drive one request against the shared session.
    ///
    /// Called with the execution lock held. Implementations check
    /// `ctx.probe` at their own safe points.
    async fn run(&self, ctx: ExecutionContext) -> Result<RunOutcome, RelayError>;

    /// Drop any buffered output left over from the previous request.
    async fn clear_stream_buffer(&self) {}

    /// Start a fresh conversation for the next request.
    async fn reset_conversation(
        &self,
        req_id: &str,
        probe: &DisconnectProbe,
    ) -> Result<(), RelayError>;

    fn is_ready(&self) -> bool {
        true
    }
}

/// The backend seams, bundled for the coordinator.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn ExecutionBackend>,
    pub switcher: Arc<dyn ModelSwitcher>,
    pub params: Arc<dyn BackendParamSink>,
}

impl Collaborators {
    /// One object implementing all three traits.
    pub fn from_single<B>(backend: Arc<B>) -> Self
    where
        B: ExecutionBackend + ModelSwitcher + BackendParamSink + 'static,
    {
        Self {
            executor: backend.clone(),
            switcher: backend.clone(),
            params: backend,
        }
    }
}
