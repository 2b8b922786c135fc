use quill_core::{
    Result,
    broker::{BrokerChannel, DEFAULT_EXCHANGE, Publishing},
    protocol::CompletionResponse,
};

/// Publishes the responses of one request to its reply queue.
pub(crate) struct ReplyPublisher<'a, Ch> {
    channel: &'a Ch,
    reply_to: &'a str,
    correlation_id: &'a str,
    request_id: &'a str,
    chat_id: Option<&'a str>,
}

impl<'a, Ch: BrokerChannel> ReplyPublisher<'a, Ch> {
    pub(crate) const fn new(
        channel: &'a Ch,
        reply_to: &'a str,
        correlation_id: &'a str,
        request_id: &'a str,
        chat_id: Option<&'a str>,
    ) -> Self {
        Self {
            channel,
            reply_to,
            correlation_id,
            request_id,
            chat_id,
        }
    }

    async fn send(&self, response: CompletionResponse) -> Result<()> {
        let body = response.with_chat_id(self.chat_id).encode()?;
        self.channel
            .publish(
                DEFAULT_EXCHANGE,
                self.reply_to,
                Publishing::new(body).with_correlation_id(self.correlation_id),
            )
            .await
    }

    pub(crate) async fn start(&self) -> Result<()> {
        self.send(CompletionResponse::start(self.request_id)).await
    }

    pub(crate) async fn chunk(&self, text: String) -> Result<()> {
        self.send(CompletionResponse::chunk(self.request_id, text))
            .await
    }

    pub(crate) async fn end(&self) -> Result<()> {
        self.send(CompletionResponse::end(self.request_id)).await
    }

    pub(crate) async fn error(&self, reason: String) -> Result<()> {
        self.send(CompletionResponse::error(self.request_id, reason))
            .await
    }
}
