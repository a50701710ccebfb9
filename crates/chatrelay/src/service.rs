//! ChatService: the transport-facing front of the coordinator.
//!
//! Gates submissions on readiness, bounds each request by the overall wait
//! budget and relays shutdown requests from transports to the server loop.
//! Transports only translate its results and errors to their wire format.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, watch};

use crate::chat::{ChatCompletionRequest, ChatResponse};
use crate::connection::ConnectivityChecker;
use crate::coordinator::{Coordinator, QueueStatus};
use crate::error::RelayError;
use crate::health::Health;
use crate::slot::ResultSlot;
use crate::version::VersionInfo;

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: Health,
    pub queue_length: usize,
    pub workers_running: usize,
    pub processing_locked: bool,
    pub backend_ready: bool,
    pub current_model: Option<String>,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status.is_ready() && self.backend_ready && self.workers_running > 0
    }

    /// Why the service is not ready; empty when it is.
    pub fn reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if !self.status.is_ready() {
            reasons.push(format!("service status is {:?}", self.status));
        }
        if !self.backend_ready {
            reasons.push("backend session is not ready".to_string());
        }
        if self.workers_running == 0 {
            reasons.push("no worker is running".to_string());
        }
        reasons
    }
}

pub struct ChatService {
    coordinator: Arc<Coordinator>,
    health: RwLock<Health>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    version: VersionInfo,
}

impl ChatService {
    /// Health starts at `UNKNOWN`; the binary moves it to `READY` once the
    /// backend is up and workers are spawned.
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            coordinator,
            health: RwLock::new(Health::Unknown),
            shutdown_tx,
            shutdown_rx,
            version: VersionInfo::new(),
        }
    }

    pub fn with_health(mut self, health: Health) -> Self {
        self.health = RwLock::new(health);
        self
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub async fn set_health(&self, health: Health) {
        *self.health.write().await = health;
    }

    pub async fn health(&self) -> HealthSnapshot {
        let status = *self.health.read().await;
        HealthSnapshot {
            status,
            queue_length: self.coordinator.queue_status().queue_length,
            workers_running: self.coordinator.workers_running(),
            processing_locked: self.coordinator.is_processing_locked(),
            backend_ready: self.coordinator.backend_ready(),
            current_model: self.coordinator.current_model(),
            version: self.version.clone(),
        }
    }

    /// Queue a chat request and wait for its outcome.
    ///
    /// Rejected with `ServiceUnavailable` when not ready. The wait is bounded
    /// by the overall budget; past it the request is abandoned with
    /// `GatewayTimeout`.
    pub async fn submit(
        &self,
        req_id: String,
        request: ChatCompletionRequest,
        connection: Arc<dyn ConnectivityChecker>,
    ) -> Result<ChatResponse, RelayError> {
        let health = self.health().await;
        if !health.is_ready() {
            tracing::warn!(req_id = %req_id, reasons = ?health.reasons(), "Rejecting request, service not ready");
            return Err(RelayError::unavailable());
        }

        let slot = ResultSlot::new();
        self.coordinator
            .enqueue(req_id.clone(), request, connection, slot.clone())?;

        let budget = self.coordinator.config().overall_budget();
        match tokio::time::timeout(budget, slot.outcome()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(req_id = %req_id, budget_secs = budget.as_secs(), "Request timed out");
                slot.fail(RelayError::GatewayTimeout);
                Err(RelayError::GatewayTimeout)
            }
        }
    }

    pub fn cancel(&self, req_id: &str) -> bool {
        self.coordinator.cancel(req_id)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.coordinator.queue_status()
    }

    pub fn models(&self) -> serde_json::Value {
        self.coordinator
            .catalog()
            .list_json(chrono::Utc::now().timestamp())
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Stop the coordinator; queued and in-flight requests fail with `WorkerStopped`.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }
}
