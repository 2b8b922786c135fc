use clap::Parser;
use quill_core::{
    broker::{amqp::AmqpConnection, connect_with_retry},
    shutdown::shutdown_signal,
    telemetry::init_telemetry,
};
use quill_worker::{
    CompletionWorker, EchoEngine,
    config::{CliArgs, EngineKind, Settings},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let settings = Settings::try_from(args)?;

    init_telemetry(settings.log_format)?;
    log_startup_info(&settings);

    let broker = &settings.broker;
    let connection = connect_with_retry(broker.connect_retries, broker.connect_delay, || {
        AmqpConnection::connect(broker.uri())
    })
    .await?;
    let connection = Arc::new(connection);
    tracing::info!("Connected to broker");

    let engine = match settings.worker.engine {
        EngineKind::Echo => EchoEngine::new(
            settings.worker.echo_token_delay,
            settings.worker.echo_max_tokens,
            settings.worker.chunk_buffer_size,
        ),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let worker = CompletionWorker::new(
        Arc::clone(&connection),
        Arc::new(engine),
        broker.topology.clone(),
        settings.worker.clone(),
    );
    let result = worker.run(shutdown).await;

    if let Err(e) = connection.close().await {
        tracing::warn!("Failed to close broker connection: {e}");
    }

    result?;
    tracing::info!("Worker shut down successfully");
    Ok(())
}

fn log_startup_info(settings: &Settings) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting completion worker with full config: {:#?}", settings);
    } else {
        tracing::info!(
            "Starting completion worker on queue {} with a {}-token context",
            settings.broker.topology.work_queue,
            settings.worker.window.context_size
        );
    }
}
