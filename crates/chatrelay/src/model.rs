//! Model catalog, request model resolution and the guarded model switch.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};

use crate::error::RelayError;
use crate::params::DEFAULT_MODEL_MAX_OUTPUT_TOKENS;

/// Listed when the backend has not reported any models.
pub const DEFAULT_FALLBACK_MODEL_ID: &str = "no model list";

/// Backend control that selects the active model.
#[async_trait]
pub trait ModelSwitcher: Send + Sync {
    /// `Ok(false)` means the backend refused or could not confirm the switch.
    async fn switch_to(&self, model_id: &str) -> Result<bool, RelayError>;
}

/// Process-wide active model id, mutated only by [`ModelSwitchState::switch`].
///
/// The mutex serializes switches and holds the tentative id while one is in
/// progress. Readers see `committed`, which only moves once a switch succeeds.
#[derive(Debug)]
pub struct ModelSwitchState {
    current: Mutex<Option<String>>,
    committed: watch::Sender<Option<String>>,
}

impl ModelSwitchState {
    pub fn new(initial: Option<String>) -> Self {
        let (committed, _) = watch::channel(initial.clone());
        Self {
            current: Mutex::new(initial),
            committed,
        }
    }

    /// Last committed model id. Never waits on a switch in progress.
    pub fn current(&self) -> Option<String> {
        self.committed.borrow().clone()
    }

    /// Switch to `target` unless already active. Returns whether a switch happened.
    ///
    /// On failure the previous id is restored and `ModelSwitchFailed` is
    /// returned; a client disconnect during the switch is passed through.
    pub async fn switch(
        &self,
        target: &str,
        switcher: &dyn ModelSwitcher,
        req_id: &str,
    ) -> Result<bool, RelayError> {
        let mut current = self.current.lock().await;
        if current.as_deref() == Some(target) {
            return Ok(false);
        }

        let previous = current.replace(target.to_string());
        tracing::info!(req_id, from = ?previous, to = target, "Switching model");

        let failure = match switcher.switch_to(target).await {
            Ok(true) => {
                tracing::info!(req_id, model = target, "Model switch succeeded");
                self.committed.send_replace(current.clone());
                return Ok(true);
            }
            Ok(false) => RelayError::ModelSwitchFailed {
                model: target.to_string(),
            },
            Err(e) if e.is_client_gone() => e,
            Err(e) => {
                tracing::error!(req_id, model = target, error = %e, "Model switch errored");
                RelayError::ModelSwitchFailed {
                    model: target.to_string(),
                }
            }
        };

        tracing::warn!(req_id, model = target, restored = ?previous, "Model switch failed, restoring previous model");
        *current = previous;
        Err(failure)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_max_output_tokens: Option<i64>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            description: None,
            supported_max_output_tokens: None,
        }
    }

    pub fn with_max_output_tokens(mut self, limit: i64) -> Self {
        self.supported_max_output_tokens = Some(limit);
        self
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    models: Vec<ModelInfo>,
    excluded: HashSet<String>,
}

/// Models the backend exposes, as last reported.
#[derive(Debug, Default)]
pub struct ModelCatalog {
    state: RwLock<CatalogState>,
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self {
            state: RwLock::new(CatalogState {
                models,
                excluded: HashSet::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn replace(&self, models: Vec<ModelInfo>) {
        self.write().models = models;
    }

    pub fn exclude(&self, ids: impl IntoIterator<Item = String>) {
        self.write().excluded.extend(ids);
    }

    pub fn is_empty(&self) -> bool {
        self.read().models.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().models.iter().map(|m| m.id.clone()).collect()
    }

    /// Output token cap for `model_id`, or the default when unknown.
    pub fn max_tokens_limit(&self, model_id: Option<&str>) -> i64 {
        let Some(id) = model_id else {
            return DEFAULT_MODEL_MAX_OUTPUT_TOKENS;
        };
        self.read()
            .models
            .iter()
            .find(|m| m.id == id)
            .and_then(|m| m.supported_max_output_tokens)
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_MODEL_MAX_OUTPUT_TOKENS)
    }

    /// Model id a request asks for, or `None` to keep the active one.
    ///
    /// Empty names and the proxy's own name keep the active model. Prefixed
    /// ids (`models/x`) are reduced to their last segment.
    pub fn resolve(
        &self,
        requested: Option<&str>,
        proxy_model_name: &str,
    ) -> Result<Option<String>, RelayError> {
        let requested = match requested.map(str::trim) {
            None | Some("") => return Ok(None),
            Some(name) if name == proxy_model_name => return Ok(None),
            Some(name) => name,
        };
        let id = requested.rsplit('/').next().unwrap_or(requested);
        if id.is_empty() {
            return Err(RelayError::bad_request(format!(
                "Invalid model name '{}'.",
                requested
            )));
        }

        let state = self.read();
        if !state.models.is_empty() && !state.models.iter().any(|m| m.id == id) {
            let available = state
                .models
                .iter()
                .map(|m| m.id.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(RelayError::bad_request(format!(
                "Invalid model '{}'. Available models: {}",
                id, available
            )));
        }
        Ok(Some(id.to_string()))
    }

    /// OpenAI `list` body: catalog minus exclusions, or one fallback entry.
    pub fn list_json(&self, created: i64) -> Value {
        let state = self.read();
        let entry = |id: &str| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "chatrelay",
            })
        };
        let data: Vec<Value> = if state.models.is_empty() {
            vec![entry(DEFAULT_FALLBACK_MODEL_ID)]
        } else {
            state
                .models
                .iter()
                .filter(|m| !state.excluded.contains(&m.id))
                .map(|m| {
                    let mut e = entry(&m.id);
                    if let Some(name) = &m.display_name {
                        e["display_name"] = json!(name);
                    }
                    if let Some(limit) = m.supported_max_output_tokens {
                        e["supported_max_output_tokens"] = json!(limit);
                    }
                    e
                })
                .collect()
        };
        json!({ "object": "list", "data": data })
    }
}
