use clap::Parser;
use quill_core::{
    broker::{amqp::AmqpConnection, connect_with_retry},
    shutdown::shutdown_signal,
    telemetry::init_telemetry,
};
use quill_gateway::{
    AppState, CompletionGateway,
    config::{CliArgs, GatewayConfig},
    router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
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
    let config = GatewayConfig::try_from(args)?;

    init_telemetry(config.log_format)?;
    log_startup_info(&config);

    let broker = &config.broker;
    let connection = connect_with_retry(broker.connect_retries, broker.connect_delay, || {
        AmqpConnection::connect(broker.uri())
    })
    .await?;
    let connection = Arc::new(connection);
    tracing::info!("Connected to broker");

    let gateway = Arc::new(
        CompletionGateway::new(
            Arc::clone(&connection),
            broker.topology.clone(),
            config.reply_buffer_size,
        )
        .await?,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let app = router(AppState {
        gateway: Arc::clone(&gateway),
        config: config.session.clone(),
    });
    let listener = TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;

    if let Err(e) = gateway.close().await {
        tracing::warn!("Failed to close gateway channel: {e}");
    }
    if let Err(e) = connection.close().await {
        tracing::warn!("Failed to close broker connection: {e}");
    }

    served?;
    tracing::info!("Gateway shut down successfully");
    Ok(())
}

fn log_startup_info(config: &GatewayConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting completion gateway with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting completion gateway on {} publishing to queue {}",
            config.server_addr,
            config.broker.topology.work_queue
        );
    }
}
