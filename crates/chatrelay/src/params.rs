//! Generation parameters: per-request resolution and the last-applied cache.
//!
//! The cache sits in front of a [`BackendParamSink`] so a parameter is only
//! pushed to the backend when it differs from what was last committed. It is
//! tagged with the model it was filled under and cleared when that changes.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::chat::ChatCompletionRequest;
use crate::connection::DisconnectProbe;
use crate::error::RelayError;

pub const TEMPERATURE: &str = "temperature";
pub const MAX_OUTPUT_TOKENS: &str = "max_output_tokens";
pub const TOP_P: &str = "top_p";
pub const STOP_SEQUENCES: &str = "stop_sequences";

/// Floats closer than this are the same setting.
pub const FLOAT_TOLERANCE: f64 = 0.001;

pub const DEFAULT_MODEL_MAX_OUTPUT_TOKENS: i64 = 65_536;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Float(f64),
    Integer(i64),
    Sequences(BTreeSet<String>),
}

impl ParamValue {
    pub fn matches(&self, other: &ParamValue) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => (a - b).abs() < FLOAT_TOLERANCE,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Sequences(a), Self::Sequences(b)) => a == b,
            _ => false,
        }
    }
}

/// Backend side of parameter adjustment.
#[async_trait]
pub trait BackendParamSink: Send + Sync {
    /// Value currently in effect, if the backend can tell.
    async fn current_value(&self, name: &str) -> Result<Option<ParamValue>, RelayError>;

    /// Apply `value` and return what the backend actually committed.
    async fn apply(&self, name: &str, value: &ParamValue) -> Result<ParamValue, RelayError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamPush {
    /// Cache already held this value; backend untouched.
    Cached,
    /// Backend already had it; cache refreshed.
    AlreadySet,
    Applied,
    /// Backend committed something else; cache entry evicted.
    Mismatch { committed: ParamValue },
    /// Backend error; cache entry evicted, request continues.
    Failed,
}

#[derive(Debug, Default)]
struct CacheState {
    values: HashMap<String, ParamValue>,
    model_tag: Option<String>,
}

#[derive(Debug, Default)]
pub struct ParamCache {
    state: Mutex<CacheState>,
}

impl ParamCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the cache when a switch happened or the active model no longer
    /// matches the tag. Returns whether it was cleared.
    pub async fn invalidate_for(&self, current_model: Option<&str>, switched: bool) -> bool {
        let mut state = self.state.lock().await;
        let stale = switched || state.model_tag.as_deref() != current_model;
        if stale {
            if !state.values.is_empty() {
                tracing::info!(
                    previous = ?state.model_tag,
                    current = ?current_model,
                    switched,
                    "Clearing parameter cache"
                );
            }
            state.values.clear();
            state.model_tag = current_model.map(str::to_string);
        }
        stale
    }

    pub async fn clear(&self) {
        self.state.lock().await.values.clear();
    }

    pub async fn cached(&self, name: &str) -> Option<ParamValue> {
        self.state.lock().await.values.get(name).cloned()
    }

    pub async fn model_tag(&self) -> Option<String> {
        self.state.lock().await.model_tag.clone()
    }

    /// Push one parameter through the cache.
    ///
    /// Only a client disconnect is returned as an error; backend failures
    /// evict the entry and report [`ParamPush::Failed`].
    pub async fn push(
        &self,
        name: &str,
        desired: ParamValue,
        sink: &dyn BackendParamSink,
        probe: &DisconnectProbe,
    ) -> Result<ParamPush, RelayError> {
        let mut state = self.state.lock().await;
        let req_id = probe.req_id();

        if state.values.get(name).is_some_and(|v| v.matches(&desired)) {
            tracing::debug!(req_id, param = name, "Parameter unchanged, using cache");
            return Ok(ParamPush::Cached);
        }

        probe.check(name)?;
        match sink.current_value(name).await {
            Ok(Some(current)) if current.matches(&desired) => {
                tracing::debug!(req_id, param = name, "Backend already has requested value");
                state.values.insert(name.to_string(), desired);
                return Ok(ParamPush::AlreadySet);
            }
            Ok(_) => {}
            Err(e) => return Self::evict_on_error(&mut state, name, req_id, e),
        }

        probe.check(name)?;
        match sink.apply(name, &desired).await {
            Ok(committed) if committed.matches(&desired) => {
                tracing::info!(req_id, param = name, value = ?desired, "Parameter applied");
                state.values.insert(name.to_string(), desired);
                Ok(ParamPush::Applied)
            }
            Ok(committed) => {
                tracing::warn!(
                    req_id,
                    param = name,
                    requested = ?desired,
                    committed = ?committed,
                    "Backend committed a different value"
                );
                state.values.remove(name);
                Ok(ParamPush::Mismatch { committed })
            }
            Err(e) => Self::evict_on_error(&mut state, name, req_id, e),
        }
    }

    fn evict_on_error(
        state: &mut CacheState,
        name: &str,
        req_id: &str,
        error: RelayError,
    ) -> Result<ParamPush, RelayError> {
        state.values.remove(name);
        if error.is_client_gone() {
            return Err(error);
        }
        tracing::error!(req_id, param = name, error = %error, "Parameter push failed");
        Ok(ParamPush::Failed)
    }

    /// Push every resolved parameter in a fixed order.
    pub async fn push_all(
        &self,
        params: &RequestParams,
        sink: &dyn BackendParamSink,
        probe: &DisconnectProbe,
    ) -> Result<Vec<(&'static str, ParamPush)>, RelayError> {
        let mut outcomes = Vec::with_capacity(4);
        for (name, value) in params.entries() {
            let outcome = self.push(name, value, sink, probe).await?;
            outcomes.push((name, outcome));
        }
        Ok(outcomes)
    }
}

/// Fallbacks for parameters a request leaves out.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDefaults {
    pub temperature: f64,
    pub max_output_tokens: i64,
    pub top_p: f64,
    pub stop_sequences: Vec<String>,
}

impl Default for ParamDefaults {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_output_tokens: DEFAULT_MODEL_MAX_OUTPUT_TOKENS,
            top_p: 0.95,
            stop_sequences: vec!["用户:".to_string()],
        }
    }
}

/// Parameters resolved for one request, already clamped.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParams {
    pub temperature: f64,
    pub max_output_tokens: i64,
    pub top_p: f64,
    pub stop_sequences: BTreeSet<String>,
}

fn finite_or(value: Option<f64>, fallback: f64) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(fallback)
}

impl RequestParams {
    /// `max_tokens_limit` is the active model's output cap.
    pub fn resolve(
        request: &ChatCompletionRequest,
        defaults: &ParamDefaults,
        max_tokens_limit: i64,
    ) -> Self {
        let limit = max_tokens_limit.max(1);
        let stops = match &request.stop {
            Some(stop) => stop.to_vec(),
            None => defaults.stop_sequences.clone(),
        };
        Self {
            temperature: finite_or(request.temperature, defaults.temperature).clamp(0.0, 2.0),
            max_output_tokens: request
                .max_output_tokens
                .unwrap_or(defaults.max_output_tokens)
                .clamp(1, limit),
            top_p: finite_or(request.top_p, defaults.top_p).clamp(0.0, 1.0),
            stop_sequences: stops
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn entries(&self) -> [(&'static str, ParamValue); 4] {
        [
            (TEMPERATURE, ParamValue::Float(self.temperature)),
            (MAX_OUTPUT_TOKENS, ParamValue::Integer(self.max_output_tokens)),
            (STOP_SEQUENCES, ParamValue::Sequences(self.stop_sequences.clone())),
            (TOP_P, ParamValue::Float(self.top_p)),
        ]
    }
}
