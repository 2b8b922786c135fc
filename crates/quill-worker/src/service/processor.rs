//! Handling of a single completion request delivery.

use super::reply::ReplyPublisher;
use crate::{
    engine::GenerationEngine,
    prompt::{ContextWindow, PromptWindowBuilder},
    registry::{CancellationRegistry, Registration},
};
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use quill_core::{
    Result,
    broker::{BrokerChannel, Delivery},
    protocol::CompletionRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Everything a delivery needs to be turned into a response stream.
pub struct Processor<'a, Ch, E> {
    pub channel: &'a Ch,
    pub engine: &'a E,
    pub registry: &'a CancellationRegistry,
    pub window: ContextWindow,
    /// Parent of every request token.
    pub lifecycle: &'a CancellationToken,
}

enum Step {
    Next(Option<Result<Bytes>>),
    Cancelled,
}

impl<Ch: BrokerChannel, E: GenerationEngine> Processor<'_, Ch, E> {
    /// Handles one delivery from the work queue and settles it.
    ///
    /// # Behavior
    ///
    /// - Undecodable bodies and deliveries without a reply address are acked
    ///   and dropped.
    /// - A request id that is already registered (a cancellation arrived
    ///   first) gets `Start` then `End` without generating.
    /// - Otherwise `Start`, one `Chunk` per engine chunk and exactly one
    ///   terminal response are published in order.
    /// - If any publish fails the delivery is requeued once; a delivery that
    ///   was already redelivered is dropped.
    pub async fn handle(&self, delivery: Delivery) {
        let request = match CompletionRequest::decode(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Dropping unusable request: {e}");
                settle(delivery, Ok(())).await;
                return;
            }
        };

        let Some(reply_to) = delivery.reply_to.as_deref() else {
            tracing::warn!(request_id = %request.request_id, "Dropping request without a reply address");
            settle(delivery, Ok(())).await;
            return;
        };

        let correlation_id = delivery
            .correlation_id
            .as_deref()
            .unwrap_or(&request.request_id);
        let reply = ReplyPublisher::new(
            self.channel,
            reply_to,
            correlation_id,
            &request.request_id,
            request.chat_id.as_deref(),
        );

        let span = tracing::info_span!(
            "completion",
            request_id = %request.request_id,
            chat_id = request.chat_id.as_deref().unwrap_or_default(),
            redelivered = delivery.redelivered,
        );
        let outcome = self.process(&request, &reply).instrument(span).await;
        settle(delivery, outcome).await;
    }

    async fn process(&self, request: &CompletionRequest, reply: &ReplyPublisher<'_, Ch>) -> Result<()> {
        let ticket = match self.registry.register(&request.request_id, self.lifecycle) {
            Registration::Fresh(ticket) => ticket,
            Registration::Existing(_) => {
                tracing::debug!("Request already cancelled, skipping generation");
                reply.start().await?;
                return reply.end().await;
            }
        };

        let outcome = self.generate(request, reply, ticket.token()).await;
        self.registry.release(&ticket);
        // Stops the engine if we bailed out early.
        ticket.token().cancel();
        outcome
    }

    async fn generate(
        &self,
        request: &CompletionRequest,
        reply: &ReplyPublisher<'_, Ch>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        reply.start().await?;

        let prompt = match PromptWindowBuilder::new(self.engine, self.window)
            .build(&request.chat_history, &request.content)
        {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!("Cannot build prompt: {e}");
                return reply.error(e.to_string()).await;
            }
        };

        let mut stream = match self
            .engine
            .process(cancel.clone(), prompt, &request.request_id)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Engine failed to start: {e}");
                return reply.error(e.to_string()).await;
            }
        };

        let mut carry = Utf8Carry::default();
        let mut chunks = 0_usize;

        loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                next = stream.next() => Step::Next(next),
            };

            match step {
                Step::Next(Some(Ok(bytes))) => {
                    if let Some(text) = carry.push(&bytes) {
                        reply.chunk(text).await?;
                        chunks += 1;
                    }
                }
                Step::Next(Some(Err(e))) => {
                    tracing::warn!(chunks, "Engine failed mid-stream: {e}");
                    return reply.error(e.to_string()).await;
                }
                Step::Next(None) => break,
                Step::Cancelled => {
                    // Forward what the engine had already produced.
                    while let Some(Some(Ok(bytes))) = stream.next().now_or_never() {
                        if let Some(text) = carry.push(&bytes) {
                            reply.chunk(text).await?;
                            chunks += 1;
                        }
                    }
                    tracing::info!(chunks, "Generation cancelled");
                    break;
                }
            }
        }

        if let Some(text) = carry.finish() {
            reply.chunk(text).await?;
            chunks += 1;
        }
        tracing::debug!(chunks, "Completion finished");
        reply.end().await
    }
}

async fn settle(delivery: Delivery, outcome: Result<()>) {
    let result = match outcome {
        Ok(()) => delivery.ack().await,
        Err(e) => {
            let requeue = !delivery.redelivered;
            tracing::warn!(requeue, "Failed to publish response: {e}");
            delivery.nack(requeue).await
        }
    };
    if let Err(e) = result {
        tracing::error!("Failed to settle delivery: {e}");
    }
}

/// Reassembles UTF-8 text from arbitrarily split byte chunks.
///
/// An incomplete multi-byte sequence at the end of a chunk is held back and
/// prefixed to the next one. Invalid bytes are replaced with U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Appends `bytes` and returns the text decoded so far. Invalid
    /// sequences become U+FFFD; an incomplete trailing character is held
    /// back for the next push.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        let mut rest = self.pending.as_slice();
        loop {
            match core::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();

        (!out.is_empty()).then_some(out)
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let head = core::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&head).into_owned())
    }
}
