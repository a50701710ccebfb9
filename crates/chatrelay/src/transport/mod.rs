//! Transport layer for chatrelay.
//!
//! Currently provides the OpenAI-compatible HTTP transport via axum.

pub mod http;

pub use http::{ServerConfig, serve};
