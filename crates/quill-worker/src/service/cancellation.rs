use crate::{engine::GenerationEngine, registry::CancellationRegistry};
use futures::StreamExt;
use quill_core::{
    broker::{Deliveries, Delivery},
    protocol::CancellationNotice,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Applies cancellation broadcasts until `shutdown` fires or the consumer
/// ends.
///
/// Every broadcast is applied whether or not this process owns the request:
/// the registry either cancels the live token or leaves a pre-cancelled one
/// behind for a delivery that has not arrived yet. Deliveries are always
/// acknowledged.
pub async fn consume_cancellations<E: GenerationEngine>(
    mut deliveries: Deliveries,
    registry: Arc<CancellationRegistry>,
    engine: Arc<E>,
    shutdown: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            () = shutdown.cancelled() => break,
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    tracing::error!("Cancellation consumer failed: {e}");
                    break;
                }
                None => {
                    tracing::warn!("Cancellation consumer closed by the broker");
                    break;
                }
            },
        };

        match target(&delivery) {
            Some(request_id) => {
                let live = registry.cancel(&request_id);
                engine.cancel(&request_id);
                tracing::debug!(request_id = %request_id, live, "Cancellation received");
            }
            None => tracing::warn!("Ignoring cancellation without a request id"),
        }

        if let Err(e) = delivery.ack().await {
            tracing::warn!("Failed to ack cancellation: {e}");
        }
    }

    tracing::trace!("Cancellation consumer stopped");
}

fn target(delivery: &Delivery) -> Option<String> {
    delivery
        .correlation_id
        .clone()
        .filter(|id| !id.is_empty())
        .or_else(|| {
            CancellationNotice::decode(&delivery.body)
                .ok()
                .map(|notice| notice.request_id)
        })
        .filter(|id| !id.is_empty())
}
