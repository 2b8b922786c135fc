use super::relay::{Relay, publish_cancel};
use quill_core::{
    Result,
    broker::{BrokerChannel, BrokerConnection, DEFAULT_EXCHANGE, Publishing, QueueKind},
    config::Topology,
    protocol::{CompletionRequest, CompletionResponse},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Gateway side of the broker protocol.
///
/// Publishes completion requests to the shared work queue, relays each
/// request's responses from a private reply queue, and broadcasts
/// cancellations to every worker.
pub struct CompletionGateway<C: BrokerConnection> {
    connection: Arc<C>,
    publisher: C::Channel,
    topology: Topology,
    reply_buffer: usize,
}

impl<C: BrokerConnection> CompletionGateway<C> {
    /// Opens the shared publishing channel and declares the work queue and
    /// the cancellation exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened or a declaration is
    /// rejected.
    pub async fn new(connection: Arc<C>, topology: Topology, reply_buffer: usize) -> Result<Self> {
        let publisher = connection.open_channel().await?;
        publisher.declare_fanout(&topology.cancel_exchange).await?;
        publisher
            .declare_queue(&topology.work_queue, QueueKind::Shared)
            .await?;

        tracing::info!(
            queue = %topology.work_queue,
            exchange = %topology.cancel_exchange,
            "Gateway topology declared"
        );

        Ok(Self {
            connection,
            publisher,
            topology,
            reply_buffer: reply_buffer.max(1),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Submits `request` and returns the stream of its responses.
    ///
    /// # Behavior
    ///
    /// - A dedicated channel and an exclusive reply queue are set up for the
    ///   request before it is published, so no response can be missed.
    /// - The receiver yields `Start`, any `Chunk`s and one terminal response,
    ///   then closes. It closes early, without a terminal response, if the
    ///   reply stream breaks.
    /// - Cancelling `cancel`, or dropping the receiver before the terminal
    ///   response, broadcasts a cancellation for the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply queue cannot be set up or the request
    /// cannot be published. Nothing is left behind on the broker in that
    /// case.
    pub async fn request(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<CompletionResponse>> {
        let channel = self.connection.open_channel().await?;

        let replies = match self.submit(&channel, &request).await {
            Ok(replies) => replies,
            Err(e) => {
                if let Err(close) = channel.close().await {
                    tracing::debug!("Failed to close request channel: {close}");
                }
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(self.reply_buffer);
        let span = tracing::info_span!(
            "relay",
            request_id = %request.request_id,
            chat_id = request.chat_id.as_deref().unwrap_or_default(),
        );
        let relay = Relay {
            channel,
            replies,
            request_id: request.request_id,
            cancel_exchange: self.topology.cancel_exchange.clone(),
            tx,
            cancel,
        };
        tokio::spawn(relay.run().instrument(span));

        Ok(rx)
    }

    async fn submit(
        &self,
        channel: &C::Channel,
        request: &CompletionRequest,
    ) -> Result<quill_core::broker::Deliveries> {
        let body = request.encode()?;
        let reply_queue = channel.declare_queue("", QueueKind::Exclusive).await?;
        let replies = channel.consume(&reply_queue).await?;

        let message = Publishing::new(body)
            .with_correlation_id(request.request_id.as_str())
            .with_reply_to(reply_queue.as_str());
        channel
            .publish(DEFAULT_EXCHANGE, &self.topology.work_queue, message)
            .await?;

        tracing::debug!(
            request_id = %request.request_id,
            reply_queue = %reply_queue,
            history = request.chat_history.len(),
            "Request published"
        );
        Ok(replies)
    }

    /// Broadcasts a cancellation for `request_id` to every worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the notice cannot be published.
    pub async fn cancel(&self, request_id: &str) -> Result<()> {
        publish_cancel(&self.publisher, &self.topology.cancel_exchange, request_id).await
    }

    /// Closes the shared publishing channel. Relays in flight keep their own
    /// channels.
    pub async fn close(&self) -> Result<()> {
        self.publisher.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use quill_core::{
        broker::{
            Deliveries,
            memory::{MemoryBroker, MemoryChannel},
        },
        protocol::{CancellationNotice, ResponseType},
    };

    struct Fixture {
        broker: MemoryBroker,
        gateway: CompletionGateway<MemoryBroker>,
        worker: MemoryChannel,
        work: Deliveries,
    }

    async fn fixture() -> Fixture {
        let broker = MemoryBroker::new();
        let gateway = CompletionGateway::new(Arc::new(broker.clone()), Topology::default(), 8)
            .await
            .unwrap();
        let worker = broker.open_channel().await.unwrap();
        let work = worker.consume("llm_q").await.unwrap();
        Fixture {
            broker,
            gateway,
            worker,
            work,
        }
    }

    impl Fixture {
        /// Takes the next request off the work queue, returning it with its
        /// reply queue.
        async fn take(&mut self) -> (CompletionRequest, String) {
            let delivery = self.work.next().await.unwrap().unwrap();
            let request = CompletionRequest::decode(&delivery.body).unwrap();
            assert_eq!(delivery.correlation_id.as_deref(), Some(request.request_id.as_str()));
            let reply_to = delivery.reply_to.clone().unwrap();
            delivery.ack().await.unwrap();
            (request, reply_to)
        }

        async fn reply(&self, queue: &str, response: CompletionResponse) {
            let message = Publishing::new(response.encode().unwrap())
                .with_correlation_id(response.request_id.as_str());
            self.worker
                .publish(DEFAULT_EXCHANGE, queue, message)
                .await
                .unwrap();
        }

        async fn cancel_listener(&self) -> Deliveries {
            let queue = self
                .worker
                .declare_queue("", QueueKind::Exclusive)
                .await
                .unwrap();
            self.worker.bind_queue(&queue, "llm_cancel_ex").await.unwrap();
            self.worker.consume(&queue).await.unwrap()
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<CompletionResponse>) -> Vec<CompletionResponse> {
        let mut responses = Vec::new();
        while let Some(response) = rx.recv().await {
            responses.push(response);
        }
        responses
    }

    async fn expect_broadcast(listener: &mut Deliveries, request_id: &str) {
        let delivery = listener.next().await.unwrap().unwrap();
        assert_eq!(delivery.correlation_id.as_deref(), Some(request_id));
        let notice = CancellationNotice::decode(&delivery.body).unwrap();
        assert_eq!(notice.request_id, request_id);
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn relays_responses_until_terminal() {
        let mut f = fixture().await;
        let mut rx = f
            .gateway
            .request(CompletionRequest::new("r-1", "hi"), CancellationToken::new())
            .await
            .unwrap();

        let (request, reply_to) = f.take().await;
        assert_eq!(request.content, "hi");

        f.reply(&reply_to, CompletionResponse::start("r-1")).await;
        f.reply(&reply_to, CompletionResponse::chunk("r-1", "hel")).await;
        f.reply(&reply_to, CompletionResponse::start("r-1")).await;
        f.reply(&reply_to, CompletionResponse::chunk("r-other", "x")).await;
        f.reply(&reply_to, CompletionResponse::chunk("r-1", "lo")).await;
        f.reply(&reply_to, CompletionResponse::end("r-1")).await;
        f.reply(&reply_to, CompletionResponse::chunk("r-1", "late")).await;

        let responses = drain(&mut rx).await;
        let kinds: Vec<_> = responses.iter().map(|r| r.response_type).collect();
        assert_eq!(
            kinds,
            [
                ResponseType::Start,
                ResponseType::Chunk,
                ResponseType::Start,
                ResponseType::Chunk,
                ResponseType::End
            ]
        );
        assert_eq!(responses[1].content.as_deref(), Some("hel"));
        assert_eq!(responses[3].content.as_deref(), Some("lo"));
        assert!(!f.broker.has_queue(&reply_to));
    }

    #[tokio::test]
    async fn undecodable_reply_is_skipped() {
        let mut f = fixture().await;
        let mut rx = f
            .gateway
            .request(CompletionRequest::new("r-2", "hi"), CancellationToken::new())
            .await
            .unwrap();
        let (_, reply_to) = f.take().await;

        f.worker
            .publish(DEFAULT_EXCHANGE, &reply_to, Publishing::new(b"{oops".to_vec()))
            .await
            .unwrap();
        f.reply(&reply_to, CompletionResponse::start("r-2")).await;
        f.reply(&reply_to, CompletionResponse::error("r-2", "boom")).await;

        let responses = drain(&mut rx).await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].response_type, ResponseType::Error);
        assert_eq!(responses[1].content.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn cancelling_the_token_broadcasts() {
        let mut f = fixture().await;
        let mut listener = f.cancel_listener().await;
        let cancel = CancellationToken::new();
        let mut rx = f
            .gateway
            .request(CompletionRequest::new("r-3", "hi"), cancel.clone())
            .await
            .unwrap();
        let (_, reply_to) = f.take().await;
        f.reply(&reply_to, CompletionResponse::start("r-3")).await;
        assert_eq!(rx.recv().await.unwrap().response_type, ResponseType::Start);

        cancel.cancel();
        expect_broadcast(&mut listener, "r-3").await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_receiver_broadcasts() {
        let mut f = fixture().await;
        let mut listener = f.cancel_listener().await;
        let rx = f
            .gateway
            .request(CompletionRequest::new("r-4", "hi"), CancellationToken::new())
            .await
            .unwrap();
        let _ = f.take().await;

        drop(rx);
        expect_broadcast(&mut listener, "r-4").await;
    }

    #[tokio::test]
    async fn finished_request_does_not_broadcast() {
        let mut f = fixture().await;
        let mut listener = f.cancel_listener().await;
        let cancel = CancellationToken::new();
        let mut rx = f
            .gateway
            .request(CompletionRequest::new("r-5", "hi"), cancel.clone())
            .await
            .unwrap();
        let (_, reply_to) = f.take().await;
        f.reply(&reply_to, CompletionResponse::start("r-5")).await;
        f.reply(&reply_to, CompletionResponse::end("r-5")).await;
        drain(&mut rx).await;

        cancel.cancel();
        f.gateway.cancel("marker").await.unwrap();
        expect_broadcast(&mut listener, "marker").await;
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let f = fixture().await;
        f.broker.set_publish_failure(true);
        let result = f
            .gateway
            .request(CompletionRequest::new("r-6", "hi"), CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert_eq!(f.broker.queue_len("llm_q"), 0);
    }

    #[tokio::test]
    async fn explicit_cancel_matches_the_relay_broadcast() {
        let mut f = fixture().await;
        let mut listener = f.cancel_listener().await;
        let rx = f
            .gateway
            .request(CompletionRequest::new("r-7", "hi"), CancellationToken::new())
            .await
            .unwrap();
        let _ = f.take().await;

        drop(rx);
        let from_relay = listener.next().await.unwrap().unwrap();
        f.gateway.cancel("r-7").await.unwrap();
        let explicit = listener.next().await.unwrap().unwrap();

        assert_eq!(from_relay.body, explicit.body);
        assert_eq!(from_relay.correlation_id, explicit.correlation_id);
        assert_eq!(explicit.correlation_id.as_deref(), Some("r-7"));
        from_relay.ack().await.unwrap();
        explicit.ack().await.unwrap();
    }
}
