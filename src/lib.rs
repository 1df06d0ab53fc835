#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
pub mod connectivity;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod results;
pub mod sync;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
