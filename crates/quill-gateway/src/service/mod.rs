//! # Broker Service Layer
//!
//! Publishes completion requests for workers and streams their responses back
//! to the WebSocket sessions.
//!
//! ## Structure
//!
//! - [`handler`]: the [`handler::CompletionGateway`] that owns the shared
//!   publishing channel and sets up one reply queue per request.
//! - `relay`: the per-request task moving responses from the reply queue to
//!   the session and broadcasting a cancellation when the session gives up.

pub mod handler;
mod relay;
