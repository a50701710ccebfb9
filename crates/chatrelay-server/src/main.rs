//! chatrelay server binary.
//!
//! Wires the relay coordinator to the in-process echo backend and serves the
//! OpenAI-compatible HTTP API.

mod echo;
mod settings;

use std::sync::Arc;
use std::time::Duration;

use chatrelay::transport::serve;
use chatrelay::{
    ChatService, Collaborators, Coordinator, Health, ModelCatalog, ModelInfo, VersionInfo,
};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::echo::EchoBackend;
use crate::settings::Args;

/// `RUST_LOG` wins when set; otherwise `CHATRELAY_LOG` picks the level for
/// our own crates. `LOG_FORMAT=json` switches to JSON lines on stderr.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CHATRELAY_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("chatrelay={level},chatrelay_server={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = args.coordinator_config();
    info!(
        host = %args.host,
        port = args.port,
        workers = config.workers,
        max_queue = ?config.max_queue,
        completion_timeout_ms = config.completion_timeout.as_millis() as u64,
        continuous_chat = config.continuous_chat,
        "Starting chatrelay"
    );

    let backend = Arc::new(
        EchoBackend::new(args.models.clone())
            .with_chunk_interval(Duration::from_millis(args.chunk_interval_ms)),
    );
    let catalog = Arc::new(ModelCatalog::new(
        args.models.iter().map(ModelInfo::new).collect(),
    ));
    let initial_model = args.models.first().cloned();

    let coordinator = Arc::new(Coordinator::new(
        config,
        Collaborators::from_single(backend),
        catalog,
        initial_model,
    ));
    let service = Arc::new(
        ChatService::new(Arc::clone(&coordinator))
            .with_health(Health::Starting)
            .with_version(VersionInfo::new().with_backend("echo")),
    );

    let spawned = coordinator.spawn_workers();
    info!(workers = spawned, "Queue workers running");
    service.set_health(Health::Ready).await;

    serve(args.server_config(), service).await
}
