pub mod config;
pub mod error;
pub mod frames;
pub mod protocol;

pub use error::{Error, Result};
