//! Generation engine capability.
//!
//! The worker only needs a handful of things from a text-generation backend:
//! a way to start a cancellable, streamed generation, a tokenizer to measure
//! prompts, and optionally a native chat template. Anything that implements
//! [`GenerationEngine`] can be plugged into the worker.
//!
//! ## Chunk streams
//!
//! [`GenerationEngine::process`] returns a lazy, finite [`ChunkStream`]. The
//! stream ending is the completion signal. Engines are expected to produce
//! into a bounded channel (see [`chunk_channel`]) so a slow consumer
//! back-pressures generation, and to check the cancellation token between
//! tokens.

pub mod echo;

use async_trait::async_trait;
use bytes::Bytes;
use core::pin::Pin;
use futures::Stream;
use quill_core::{Result, protocol::ChatMessage};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Raw output of an engine, in production order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[async_trait]
pub trait GenerationEngine: Send + Sync + 'static {
    /// Start generating a completion of `prompt`.
    ///
    /// Production stops at the next checkpoint after `cancel` fires.
    async fn process(
        &self,
        cancel: CancellationToken,
        prompt: String,
        request_id: &str,
    ) -> Result<ChunkStream>;

    /// Engine-side cancellation hook, called for every broadcast whether or
    /// not this process owns the request.
    fn cancel(&self, _request_id: &str) {}

    fn has_chat_template(&self) -> bool {
        false
    }

    /// Render `messages` with the engine's native chat template, ending with
    /// the generation prompt for the assistant turn.
    fn apply_template(&self, messages: &[ChatMessage]) -> Result<String>;

    fn token_count(&self, text: &str) -> Result<usize>;
}

/// Bounded producer/consumer pair for building a [`ChunkStream`].
pub fn chunk_channel(capacity: usize) -> (mpsc::Sender<Result<Bytes>>, ChunkStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, Box::pin(ReceiverStream::new(rx)))
}
