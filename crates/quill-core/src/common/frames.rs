//! WebSocket frames exchanged between a client and the gateway.
//!
//! Client and server frames are two independent tagged unions; they share the
//! `type` field name on the wire but nothing else.

use crate::Result;
use serde::{Deserialize, Serialize};

/// Frames a client may send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Keepalive; answered with [`ServerFrame::Pong`].
    Ping,
    /// Start a completion for a new user turn.
    Completion {
        #[serde(default)]
        content: String,
    },
    /// Cancel the stream in flight.
    Cancel,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Frames the gateway sends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Pong,
    /// The request has been published to the work queue.
    Queued,
    Start,
    Chunk { content: String },
    End,
    Error { content: String },
}

impl ServerFrame {
    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
