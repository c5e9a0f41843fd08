//! # Middleware Module
//!
//! Layers wrapped around the proxy handler, outermost first: access logging,
//! then route matching.

pub mod request_logging;
pub mod route_matching;

pub use request_logging::{access_log, RequestLoggingMiddleware};
pub use route_matching::match_route;
