#![doc = include_str!("../README.md")]

pub mod config;
pub mod engine;
pub mod prompt;
pub mod registry;
pub mod service;

pub use engine::{GenerationEngine, echo::EchoEngine};
pub use prompt::{ContextWindow, PromptWindowBuilder};
pub use registry::{CancellationRegistry, Registration, Ticket};
pub use service::handler::CompletionWorker;
