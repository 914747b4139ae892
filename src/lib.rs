pub mod api;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod simulation;
pub mod types;

pub use config::Config;
pub use error::{CoordinationError, Result};
pub use types::*;
