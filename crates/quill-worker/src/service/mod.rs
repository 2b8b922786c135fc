//! Broker-facing side of the worker.
//!
//! ## Structure
//!
//! - [`handler`] - [`handler::CompletionWorker`], which owns the broker
//!   channels and the consume loop.
//! - [`processor`] - turns one work-queue delivery into a response stream.
//! - [`cancellation`] - applies cancellation broadcasts to the registry.

pub mod cancellation;
pub mod handler;
pub mod processor;
mod reply;
