//! Loopback engine that streams the last user turn back word by word.
//!
//! Useful for exercising the full broker topology without a model. The chat
//! template renders one `role: content` line per message followed by an
//! `assistant:` generation prompt, and tokens are whitespace-separated words.

use super::{ChunkStream, GenerationEngine, chunk_channel};
use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use quill_core::{Result, protocol::ChatMessage};
use tokio_util::sync::CancellationToken;

const USER_PREFIX: &str = "user: ";
const GENERATION_PROMPT: &str = "assistant:";

#[derive(Debug, Clone)]
pub struct EchoEngine {
    token_delay: Duration,
    max_tokens: usize,
    buffer: usize,
}

impl EchoEngine {
    pub const fn new(token_delay: Duration, max_tokens: usize, buffer: usize) -> Self {
        Self {
            token_delay,
            max_tokens,
            buffer,
        }
    }
}

fn last_user_turn(prompt: &str) -> &str {
    let start = prompt
        .rfind(USER_PREFIX)
        .map_or(0, |i| i + USER_PREFIX.len());
    let tail = &prompt[start..];
    tail.rfind(GENERATION_PROMPT).map_or(tail, |end| &tail[..end])
}

#[async_trait]
impl GenerationEngine for EchoEngine {
    async fn process(
        &self,
        cancel: CancellationToken,
        prompt: String,
        request_id: &str,
    ) -> Result<ChunkStream> {
        let words: Vec<String> = last_user_turn(&prompt)
            .split_whitespace()
            .take(self.max_tokens)
            .map(|w| format!("{w} "))
            .collect();
        tracing::trace!(request_id, tokens = words.len(), "Echoing prompt");

        let (tx, stream) = chunk_channel(self.buffer);
        let delay = self.token_delay;

        tokio::spawn(async move {
            for word in words {
                if cancel.is_cancelled() {
                    break;
                }
                if !delay.is_zero() {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                if tx.send(Ok(Bytes::from(word))).await.is_err() {
                    break;
                }
            }
        });

        Ok(stream)
    }

    fn has_chat_template(&self) -> bool {
        true
    }

    fn apply_template(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut out = String::new();
        for message in messages {
            out.push_str(message.role.as_str());
            out.push_str(": ");
            out.push_str(&message.content);
            out.push('\n');
        }
        out.push_str(GENERATION_PROMPT);
        Ok(out)
    }

    fn token_count(&self, text: &str) -> Result<usize> {
        Ok(text.split_whitespace().count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(stream: ChunkStream) -> Vec<String> {
        stream
            .map(|chunk| String::from_utf8(chunk.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    #[test]
    fn template_renders_one_line_per_turn() {
        let engine = EchoEngine::new(Duration::ZERO, 16, 4);
        let prompt = engine
            .apply_template(&[ChatMessage::user("hello"), ChatMessage::assistant("hey")])
            .unwrap();
        assert_eq!(prompt, "user: hello\nassistant: hey\nassistant:");
        assert_eq!(engine.token_count(&prompt).unwrap(), 5);
    }

    #[tokio::test]
    async fn echoes_the_last_user_turn() {
        let engine = EchoEngine::new(Duration::ZERO, 16, 4);
        let prompt = engine
            .apply_template(&[
                ChatMessage::user("old words"),
                ChatMessage::assistant("old words"),
                ChatMessage::user("say it back"),
            ])
            .unwrap();
        let stream = engine
            .process(CancellationToken::new(), prompt, "r-1")
            .await
            .unwrap();
        assert_eq!(collect(stream).await, ["say ", "it ", "back "]);
    }

    #[tokio::test]
    async fn output_is_capped_at_max_tokens() {
        let engine = EchoEngine::new(Duration::ZERO, 2, 4);
        let stream = engine
            .process(CancellationToken::new(), "user: a b c d\nassistant:".into(), "r-2")
            .await
            .unwrap();
        assert_eq!(collect(stream).await, ["a ", "b "]);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_producing_once_cancelled() {
        let engine = EchoEngine::new(Duration::from_millis(10), 64, 1);
        let cancel = CancellationToken::new();
        let mut stream = engine
            .process(cancel.clone(), "user: a b c d e f\nassistant:".into(), "r-3")
            .await
            .unwrap();

        assert_eq!(&stream.next().await.unwrap().unwrap()[..], b"a ");
        cancel.cancel();
        let rest = collect(stream).await;
        assert!(rest.len() <= 1, "produced {rest:?} after cancel");
    }
}
