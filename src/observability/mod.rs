//! # Observability Module
//!
//! Structured logging and metrics for the gateway.

pub mod logging;
pub mod metrics;

pub use logging::{LogConfig, LogFormat, RequestId};
