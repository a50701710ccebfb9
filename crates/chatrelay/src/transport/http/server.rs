//! HTTP listener and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::service::ChatService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Ignore SIGTERM; only SIGINT or `POST /shutdown` stop the server.
    pub await_explicit_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2048,
            await_explicit_shutdown: false,
        }
    }
}

impl ServerConfig {
    fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// What ended the serve loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownCause {
    Interrupt,
    Terminate,
    Requested,
}

/// Serve the chat API until shutdown, then stop the coordinator so queued
/// and in-flight requests are failed rather than left hanging.
pub async fn serve(config: ServerConfig, service: Arc<ChatService>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.socket_addr()?).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "chatrelay listening");

    let requested = service.shutdown_rx();
    let explicit_only = config.await_explicit_shutdown;
    axum::serve(listener, routes(Arc::clone(&service)))
        .with_graceful_shutdown(async move {
            let cause = wait_for_shutdown(explicit_only, requested).await;
            info!(cause = ?cause, "Shutting down HTTP server");
        })
        .await?;

    service.shutdown().await;
    info!("chatrelay stopped");
    Ok(())
}

/// Resolves on SIGINT, SIGTERM (unless `explicit_only`) or a shutdown request.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured. That is a startup error and should fail fast.
async fn wait_for_shutdown(
    explicit_only: bool,
    mut requested: watch::Receiver<bool>,
) -> ShutdownCause {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        if explicit_only {
            info!("SIGTERM ignored, waiting for SIGINT or /shutdown");
            std::future::pending::<()>().await
        }
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = {
        let _ = explicit_only;
        std::future::pending::<()>()
    };

    // A closed channel means no one can request shutdown any more.
    let request = async {
        if requested.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await
        }
    };

    tokio::select! {
        _ = interrupt => ShutdownCause::Interrupt,
        _ = terminate => ShutdownCause::Terminate,
        _ = request => ShutdownCause::Requested,
    }
}
