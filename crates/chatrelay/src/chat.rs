//! OpenAI-compatible chat request model and the response a backend produces.

use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// String or list of content parts; kept as-is for the backend.
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    /// Plain text of the message, joining `text` parts of multi-part content.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default, alias = "max_tokens")]
    pub max_output_tokens: Option<i64>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub reasoning_effort: Option<Value>,
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub response_format: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    /// Minimal request with one user message. Mostly for tests and tooling.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: Value::String(text.into()),
                extra: Map::new(),
            }],
            model: None,
            stream: false,
            temperature: None,
            max_output_tokens: None,
            stop: None,
            top_p: None,
            reasoning_effort: None,
            tools: None,
            tool_choice: None,
            seed: None,
            response_format: None,
            extra: Map::new(),
        }
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.messages.is_empty() {
            return Err(RelayError::bad_request("'messages' must not be empty."));
        }
        if self.messages.iter().all(|m| m.role == "system") {
            return Err(RelayError::bad_request(
                "At least one non-system message is required.",
            ));
        }
        Ok(())
    }

    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == "user")
    }
}

/// Receiving half of a streamed completion: one JSON chunk per item.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::Receiver<Value>,
}

pub type ChunkSender = mpsc::Sender<Value>;

impl ChunkStream {
    pub fn channel(buffer: usize) -> (ChunkSender, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    pub async fn next_chunk(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl futures::Stream for ChunkStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

/// What a settled request hands back to the transport.
#[derive(Debug)]
pub enum ChatResponse {
    /// Complete `chat.completion` body.
    Completion(Value),
    Stream(ChunkStream),
}

impl ChatResponse {
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}
