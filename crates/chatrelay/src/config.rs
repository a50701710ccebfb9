//! Coordinator configuration.

use std::time::Duration;

use crate::params::ParamDefaults;

/// Default `RESPONSE_COMPLETION_TIMEOUT`.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Name clients may use to mean "whatever model is active".
pub const DEFAULT_PROXY_MODEL_NAME: &str = "AI-Studio_Proxy_API";

const COMPLETION_WAIT_GRACE: Duration = Duration::from_secs(60);
const OVERALL_WAIT_GRACE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub completion_timeout: Duration,
    /// Keep conversation state between requests instead of resetting it.
    pub continuous_chat: bool,
    pub workers: usize,
    /// `None` for an unbounded queue.
    pub max_queue: Option<usize>,
    pub scan_limit: usize,
    pub dequeue_wait: Duration,
    pub monitor_poll: Duration,
    pub probe_bound: Duration,
    pub pacing_window: Duration,
    pub pacing_floor: Duration,
    pub stop_wait: Duration,
    /// Pause before the post-completion stop check.
    pub post_stream_settle: Duration,
    pub proxy_model_name: String,
    pub param_defaults: ParamDefaults,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            continuous_chat: false,
            workers: 1,
            max_queue: None,
            scan_limit: 10,
            dequeue_wait: Duration::from_secs(5),
            monitor_poll: Duration::from_millis(300),
            probe_bound: Duration::from_millis(10),
            pacing_window: Duration::from_secs(1),
            pacing_floor: Duration::from_millis(500),
            stop_wait: Duration::from_secs(30),
            post_stream_settle: Duration::from_millis(500),
            proxy_model_name: DEFAULT_PROXY_MODEL_NAME.to_string(),
            param_defaults: ParamDefaults::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Worker's wait for a single completion.
    pub fn completion_wait_budget(&self) -> Duration {
        self.completion_timeout + COMPLETION_WAIT_GRACE
    }

    /// Endpoint's wait for the whole request, queueing included.
    pub fn overall_budget(&self) -> Duration {
        self.completion_timeout + OVERALL_WAIT_GRACE
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn with_continuous_chat(mut self, enabled: bool) -> Self {
        self.continuous_chat = enabled;
        self
    }

    /// At least one worker always runs.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_queue(mut self, max_queue: Option<usize>) -> Self {
        self.max_queue = max_queue;
        self
    }

    pub fn with_proxy_model_name(mut self, name: impl Into<String>) -> Self {
        self.proxy_model_name = name.into();
        self
    }

    pub fn with_param_defaults(mut self, defaults: ParamDefaults) -> Self {
        self.param_defaults = defaults;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_derive_from_completion_timeout() {
        let config = CoordinatorConfig::default().with_completion_timeout(Duration::from_secs(10));
        assert_eq!(config.completion_wait_budget(), Duration::from_secs(70));
        assert_eq!(config.overall_budget(), Duration::from_secs(130));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.completion_timeout, Duration::from_secs(300));
        assert_eq!(config.workers, 1);
        assert_eq!(config.scan_limit, 10);
        assert_eq!(config.monitor_poll, Duration::from_millis(300));
        assert!(config.max_queue.is_none());
        assert!(!config.continuous_chat);
    }

    #[test]
    fn worker_count_never_zero() {
        assert_eq!(CoordinatorConfig::default().with_workers(0).workers, 1);
    }
}
