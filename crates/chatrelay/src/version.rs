//! Version information for chatrelay.

/// chatrelay version from Cargo.toml
pub const CHATRELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub chatrelay: &'static str,
    /// Backend description, if the binary reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            chatrelay: CHATRELAY_VERSION,
            backend: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }
}
