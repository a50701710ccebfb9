//! chatrelay: OpenAI-compatible chat relay over a single shared backend session.

mod health;
mod version;

pub mod backend;
pub mod chat;
pub mod completion;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod params;
pub mod queue;
pub mod service;
pub mod signal;
pub mod slot;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use backend::{
    Collaborators, ExecutionBackend, ExecutionContext, RunOutcome, SessionHandles, StopControl,
};
pub use chat::{ChatCompletionRequest, ChatMessage, ChatResponse, ChunkSender, ChunkStream};
pub use config::CoordinatorConfig;
pub use connection::{ClientLink, ConnectivityChecker, DisconnectGuard, DisconnectProbe};
pub use coordinator::{Coordinator, QueueStatus};
pub use error::RelayError;
pub use health::Health;
pub use model::{ModelCatalog, ModelInfo, ModelSwitcher};
pub use params::{BackendParamSink, ParamDefaults, ParamValue, RequestParams};
pub use service::{ChatService, HealthSnapshot};
pub use signal::CompletionSignal;
pub use slot::ResultSlot;
pub use version::{CHATRELAY_VERSION, VersionInfo};
