//! # Broker Wire Protocol
//!
//! Payloads exchanged between the gateway and the workers over the broker.
//! Both directions are JSON documents; optional fields are omitted when empty
//! and default when missing so either side can add fields without breaking
//! the other.
//!
//! ## Per-request ordering
//!
//! For a given `request_id` a worker publishes exactly one
//! [`ResponseType::Start`], then zero or more [`ResponseType::Chunk`]s, then
//! exactly one terminal response ([`ResponseType::End`] or
//! [`ResponseType::Error`]). Nothing is published after the terminal response.
//! All responses of one request travel through the same reply queue, so the
//! broker preserves this order end to end.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Content type stamped on every published payload.
pub const CONTENT_TYPE: &str = "application/json";

/// Author of a chat turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A completion work item published to the shared work queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    /// Prior turns, oldest first. The worker fits them into the context
    /// window.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chat_history: Vec<ChatMessage>,
}

impl CompletionRequest {
    pub fn new(request_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            content: content.into(),
            chat_id: None,
            chat_history: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a work item. A request without a `request_id` cannot be
    /// answered and is rejected as invalid.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(bytes)?;
        if request.request_id.is_empty() {
            return Err(Error::InvalidRequest {
                reason: "request_id is required".to_owned(),
            });
        }
        Ok(request)
    }
}

/// Position of a [`CompletionResponse`] within its request's stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Start,
    Chunk,
    End,
    /// Terminal failure; `content` carries the reason.
    Error,
}

impl ResponseType {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Error)
    }
}

/// One step of a streamed completion, published to the request's reply
/// queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub response_type: ResponseType,
}

impl CompletionResponse {
    fn new(request_id: &str, response_type: ResponseType, content: Option<String>) -> Self {
        Self {
            request_id: request_id.to_owned(),
            content,
            chat_id: None,
            response_type,
        }
    }

    pub fn start(request_id: &str) -> Self {
        Self::new(request_id, ResponseType::Start, None)
    }

    pub fn chunk(request_id: &str, content: impl Into<String>) -> Self {
        Self::new(request_id, ResponseType::Chunk, Some(content.into()))
    }

    pub fn end(request_id: &str) -> Self {
        Self::new(request_id, ResponseType::End, None)
    }

    pub fn error(request_id: &str, reason: impl Into<String>) -> Self {
        Self::new(request_id, ResponseType::Error, Some(reason.into()))
    }

    #[must_use]
    pub fn with_chat_id(mut self, chat_id: Option<&str>) -> Self {
        self.chat_id = chat_id.map(str::to_owned);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Body of a cancellation broadcast. The target is also carried as the
/// message correlation id; the body exists for consumers that only see
/// payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationNotice {
    pub request_id: String,
}

impl CancellationNotice {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
