//! The completion worker role.
//!
//! [`CompletionWorker`] consumes the shared work queue and turns each request
//! into a stream of responses on the request's private reply queue.
//!
//! ## Responsibilities
//!
//! - Declare the work queue and consume it with a prefetch of one, handling
//!   deliveries strictly one at a time. A worker never holds more than one
//!   request, so the broker spreads load across competing workers.
//! - Bind a private queue to the cancellation fanout exchange and apply every
//!   broadcast to the [`CancellationRegistry`].
//! - Sweep expired registry entries in the background.
//! - On shutdown, stop consuming, cancel the in-flight generation (which still
//!   terminates with `End`) and close all channels.

use super::{cancellation::consume_cancellations, processor::Processor};
use crate::{config::WorkerConfig, engine::GenerationEngine, registry::CancellationRegistry};
use futures::StreamExt;
use quill_core::{
    Error, Result,
    broker::{BrokerChannel, BrokerConnection, QueueKind},
    config::Topology,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct CompletionWorker<C, E> {
    connection: Arc<C>,
    engine: Arc<E>,
    registry: Arc<CancellationRegistry>,
    topology: Topology,
    config: WorkerConfig,
}

impl<C: BrokerConnection, E: GenerationEngine> CompletionWorker<C, E> {
    pub fn new(connection: Arc<C>, engine: Arc<E>, topology: Topology, config: WorkerConfig) -> Self {
        Self {
            connection,
            engine,
            registry: Arc::new(CancellationRegistry::new(config.token_lifetime)),
            topology,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    /// Runs the worker until `shutdown` fires or the broker ends the request
    /// consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the topology cannot be declared or the request
    /// consumer fails. A requested shutdown returns `Ok(())`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let stop = shutdown.child_token();
        let topology = &self.topology;

        let request_channel = self.connection.open_channel().await?;
        request_channel.set_prefetch(1).await?;
        request_channel
            .declare_queue(&topology.work_queue, QueueKind::Shared)
            .await?;

        let cancel_channel = self.connection.open_channel().await?;
        cancel_channel
            .declare_fanout(&topology.cancel_exchange)
            .await?;
        let cancel_queue = cancel_channel
            .declare_queue("", QueueKind::Exclusive)
            .await?;
        cancel_channel
            .bind_queue(&cancel_queue, &topology.cancel_exchange)
            .await?;
        let cancellations = cancel_channel.consume(&cancel_queue).await?;

        let publish_channel = self.connection.open_channel().await?;

        let sweeper = self
            .registry
            .spawn_sweeper(self.config.token_sweep, stop.clone());
        let canceller = tokio::spawn(consume_cancellations(
            cancellations,
            Arc::clone(&self.registry),
            Arc::clone(&self.engine),
            stop.clone(),
        ));

        let mut requests = request_channel.consume(&topology.work_queue).await?;
        tracing::info!(
            queue = %topology.work_queue,
            cancel_queue = %cancel_queue,
            "Worker is consuming requests"
        );

        let processor = Processor {
            channel: &publish_channel,
            engine: &*self.engine,
            registry: &self.registry,
            window: self.config.window,
            lifecycle: &stop,
        };

        let result = loop {
            let delivery = tokio::select! {
                biased;
                () = stop.cancelled() => break Ok(()),
                next = requests.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => break Err(e),
                    None => break Err(Error::broker("request consumer closed by the broker")),
                },
            };
            processor.handle(delivery).await;
        };

        tracing::info!("Worker stopping");
        drop(requests);
        stop.cancel();

        if let Err(e) = canceller.await {
            tracing::error!("Cancellation consumer task failed: {e}");
        }
        if let Err(e) = sweeper.await {
            tracing::error!("Registry sweeper task failed: {e}");
        }

        for channel in [&request_channel, &cancel_channel, &publish_channel] {
            if let Err(e) = channel.close().await {
                tracing::warn!("Failed to close channel: {e}");
            }
        }

        tracing::info!("Worker stopped");
        result
    }
}
