//! Error taxonomy shared by the coordinator, the backend traits and transports.
//!
//! Every failure a request can end in is funneled into its `ResultSlot` as one
//! of these variants. Transports map them to status codes via `status_code()`.

/// Non-standard status used for client-closed requests.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Default `Retry-After` hint for 503 responses.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Malformed input, surfaced as-is.
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Service is currently unavailable. Please retry later.")]
    ServiceUnavailable { retry_after_secs: u64 },

    #[error("Client disconnected{}", stage_suffix(.stage))]
    ClientDisconnected { stage: String },

    #[error("Request cancelled.")]
    ClientCancelled,

    /// Backend automation failed for this request.
    #[error("Upstream backend failed: {0}")]
    Upstream(String),

    #[error("Could not switch to model '{model}'. Please ensure the model is available.")]
    ModelSwitchFailed { model: String },

    /// The worker's completion wait exceeded its budget.
    #[error("Processing timed out waiting for completion.")]
    ProcessingTimeout,

    /// The endpoint's overall wait exceeded its budget.
    #[error("Request processing timed out.")]
    GatewayTimeout,

    #[error("Request queue is full.")]
    QueueFull,

    #[error("Worker stopped before the request completed.")]
    WorkerStopped,

    #[error("Internal server error: {0}")]
    Server(String),
}

fn stage_suffix(stage: &str) -> String {
    if stage.is_empty() {
        ".".to_string()
    } else {
        format!(" during {}.", stage)
    }
}

impl RelayError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn disconnected(stage: impl Into<String>) -> Self {
        Self::ClientDisconnected {
            stage: stage.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server(message.into())
    }

    pub fn unavailable() -> Self {
        Self::ServiceUnavailable {
            retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::ServiceUnavailable { .. } | Self::QueueFull | Self::WorkerStopped => 503,
            Self::ClientDisconnected { .. } | Self::ClientCancelled => CLIENT_CLOSED_REQUEST,
            Self::Upstream(_) => 502,
            Self::ModelSwitchFailed { .. } => 422,
            Self::ProcessingTimeout | Self::GatewayTimeout => 504,
            Self::Server(_) => 500,
        }
    }

    /// Terminal client-side outcomes: never retried, logged at info.
    pub fn is_client_gone(&self) -> bool {
        matches!(self, Self::ClientDisconnected { .. } | Self::ClientCancelled)
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::ServiceUnavailable { retry_after_secs } => Some(*retry_after_secs),
            Self::QueueFull | Self::WorkerStopped => Some(DEFAULT_RETRY_AFTER_SECS),
            _ => None,
        }
    }
}
