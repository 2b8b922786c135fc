//! Error types for the completion relay.
//!
//! This module defines the central `Error` enum shared by the worker and the
//! gateway. Every fallible operation in the broker seam, the wire protocol and
//! the roles built on top of them reports through it.
//!
//! ## Error Cases
//! - `Broker`: The message broker rejected an operation or the connection
//!   failed.
//! - `Decode`: A payload or frame could not be parsed.
//! - `InvalidRequest`: A work item decoded but lacks its `request_id`.
//! - `PromptTooLarge`: Even the newest turn alone exceeds the context budget.
//! - `Generation`: The generation engine failed to start or failed mid-stream.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the completion relay.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// Broker operation failed (declare, consume, publish, ack).
    #[error("Broker error: {context}")]
    Broker { context: String },

    /// A wire payload or client frame could not be decoded.
    #[error("Malformed payload: {reason}")]
    Decode { reason: String },

    /// The request was decoded but cannot be served.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The prompt does not fit the context window even without history.
    #[error("Prompt of {tokens} tokens exceeds the budget of {budget} tokens")]
    PromptTooLarge { tokens: usize, budget: usize },

    /// The generation engine reported a failure.
    #[error("Generation failed: {reason}")]
    Generation { reason: String },
}

impl Error {
    pub fn broker(context: impl Into<String>) -> Self {
        Self::Broker {
            context: context.into(),
        }
    }

    pub fn generation(reason: impl Into<String>) -> Self {
        Self::Generation {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode {
            reason: err.to_string(),
        }
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self::Broker {
            context: err.to_string(),
        }
    }
}
