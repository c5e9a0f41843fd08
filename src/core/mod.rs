//! # Core Module
//!
//! Configuration, the error taxonomy, the shared domain types and the backend
//! connection pools.

pub mod config;
pub mod connection_pool;
pub mod error;
pub mod types;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult, HttpError};
pub use types::*;
