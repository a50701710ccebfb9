//! Command-line and environment settings.

use std::time::Duration;

use chatrelay::config::DEFAULT_PROXY_MODEL_NAME;
use chatrelay::transport::ServerConfig;
use chatrelay::{CoordinatorConfig, ParamDefaults};
use clap::Parser;
use tracing::warn;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "chatrelay",
    about = "OpenAI-compatible chat relay over a single backend session",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 2048)]
    pub port: u16,

    /// Completion timeout in milliseconds
    #[arg(long = "completion-timeout-ms", env = "RESPONSE_COMPLETION_TIMEOUT", default_value_t = 300_000)]
    pub completion_timeout_ms: u64,

    /// Keep conversation state between requests
    #[arg(long, env = "ENABLE_CONTINUOUS_CHAT")]
    pub continuous_chat: bool,

    /// Model name clients use to mean "the active model"
    #[arg(long, env = "MODEL_NAME", default_value = DEFAULT_PROXY_MODEL_NAME)]
    pub model_name: String,

    #[arg(long, env = "DEFAULT_TEMPERATURE", default_value_t = 1.0)]
    pub default_temperature: f64,

    #[arg(long, env = "DEFAULT_MAX_OUTPUT_TOKENS", default_value_t = 65_536)]
    pub default_max_output_tokens: i64,

    #[arg(long, env = "DEFAULT_TOP_P", default_value_t = 0.95)]
    pub default_top_p: f64,

    /// JSON array of stop sequences
    #[arg(long, env = "DEFAULT_STOP_SEQUENCES")]
    pub default_stop_sequences: Option<String>,

    /// Worker loops; backend access stays single-flight regardless
    #[arg(long, env = "RELAY_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Queue capacity; unbounded when unset
    #[arg(long, env = "RELAY_MAX_QUEUE")]
    pub max_queue: Option<usize>,

    /// Models the echo backend advertises (comma separated)
    #[arg(long = "model", env = "ECHO_MODELS", value_delimiter = ',')]
    pub models: Vec<String>,

    /// Delay between streamed words from the echo backend
    #[arg(long = "chunk-interval-ms", env = "ECHO_CHUNK_INTERVAL_MS", default_value_t = 20)]
    pub chunk_interval_ms: u64,

    /// Ignore SIGTERM; stop only on SIGINT or POST /shutdown
    #[arg(long, env = "AWAIT_EXPLICIT_SHUTDOWN")]
    pub await_explicit_shutdown: bool,
}

/// Parse `DEFAULT_STOP_SEQUENCES`, falling back to the built-in list.
pub fn parse_stop_sequences(raw: Option<&str>) -> Vec<String> {
    let fallback = || ParamDefaults::default().stop_sequences;
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return fallback();
    };
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(stops) => stops,
        Err(e) => {
            warn!(value = raw, error = %e, "Invalid DEFAULT_STOP_SEQUENCES, using built-in default");
            fallback()
        }
    }
}

impl Args {
    pub fn param_defaults(&self) -> ParamDefaults {
        ParamDefaults {
            temperature: self.default_temperature,
            max_output_tokens: self.default_max_output_tokens,
            top_p: self.default_top_p,
            stop_sequences: parse_stop_sequences(self.default_stop_sequences.as_deref()),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_completion_timeout(Duration::from_millis(self.completion_timeout_ms))
            .with_continuous_chat(self.continuous_chat)
            .with_workers(self.workers)
            .with_max_queue(self.max_queue)
            .with_proxy_model_name(self.model_name.clone())
            .with_param_defaults(self.param_defaults())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            await_explicit_shutdown: self.await_explicit_shutdown,
        }
    }
}
