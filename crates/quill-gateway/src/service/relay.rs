use futures::StreamExt;
use quill_core::{
    Result,
    broker::{BrokerChannel, Deliveries, Publishing},
    protocol::{CancellationNotice, CompletionResponse},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything a relay task owns for the lifetime of one request.
pub(crate) struct Relay<Ch> {
    pub channel: Ch,
    pub replies: Deliveries,
    pub request_id: String,
    pub cancel_exchange: String,
    pub tx: mpsc::Sender<CompletionResponse>,
    pub cancel: CancellationToken,
}

enum Outcome {
    /// A terminal response was forwarded.
    Finished,
    /// The request was cancelled locally or the session stopped listening.
    Abandoned,
    /// The reply stream failed or was closed by the broker.
    Broken,
}

impl<Ch: BrokerChannel> Relay<Ch> {
    /// Forwards responses from the reply queue to the session.
    ///
    /// # Behavior
    ///
    /// - Every reply is acked. Undecodable replies and replies for another
    ///   request are skipped. A repeated `Start` after a worker requeue is
    ///   forwarded so the session can discard the partial answer.
    /// - Forwarding stops after the first terminal response.
    /// - If `cancel` fires or the session drops its receiver first, a
    ///   cancellation broadcast is published for the request.
    /// - A broker failure ends the relay without a terminal response, which
    ///   the session reports as an interrupted stream.
    pub(crate) async fn run(mut self) {
        let outcome = self.forward().await;

        match outcome {
            Outcome::Finished => tracing::debug!("Relay finished"),
            Outcome::Abandoned => {
                match publish_cancel(&self.channel, &self.cancel_exchange, &self.request_id).await {
                    Ok(()) => tracing::info!("Cancellation broadcast"),
                    Err(e) => tracing::warn!("Failed to broadcast cancellation: {e}"),
                }
            }
            Outcome::Broken => tracing::warn!("Reply stream ended before a terminal response"),
        }

        // Unregister the consumer before the channel goes away.
        drop(self.replies);
        if let Err(e) = self.channel.close().await {
            tracing::debug!("Failed to close reply channel: {e}");
        }
    }

    async fn forward(&mut self) -> Outcome {
        loop {
            let delivery = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Outcome::Abandoned,
                () = self.tx.closed() => return Outcome::Abandoned,
                next = self.replies.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        tracing::warn!("Reply consumer failed: {e}");
                        return Outcome::Broken;
                    }
                    None => return Outcome::Broken,
                },
            };

            let decoded = CompletionResponse::decode(&delivery.body);
            if let Err(e) = delivery.ack().await {
                tracing::warn!("Failed to ack reply: {e}");
            }

            let response = match decoded {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Skipping undecodable reply: {e}");
                    continue;
                }
            };
            if response.request_id != self.request_id {
                tracing::debug!(other = %response.request_id, "Skipping reply for another request");
                continue;
            }

            let terminal = response.response_type.is_terminal();
            let sent = tokio::select! {
                biased;
                () = self.cancel.cancelled() => false,
                sent = self.tx.send(response) => sent.is_ok(),
            };
            if !sent {
                return Outcome::Abandoned;
            }
            if terminal {
                return Outcome::Finished;
            }
        }
    }
}

/// Publishes a cancellation notice for `request_id` on the fanout exchange,
/// correlated with the request.
pub(crate) async fn publish_cancel<Ch: BrokerChannel>(
    channel: &Ch,
    exchange: &str,
    request_id: &str,
) -> Result<()> {
    let notice = CancellationNotice {
        request_id: request_id.to_owned(),
    };
    let message = Publishing::new(notice.encode()?).with_correlation_id(request_id);
    channel.publish(exchange, "", message).await
}
