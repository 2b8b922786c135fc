#![doc = include_str!("../README.md")]

pub mod config;
pub mod service;
pub mod session;

pub use service::handler::CompletionGateway;
pub use session::{
    Inbound, Session, SessionConfig,
    socket::{AppState, router},
};
