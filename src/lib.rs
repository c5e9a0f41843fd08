//! # Endpoint Gateway Library
//!
//! An API gateway that resolves each inbound request to a tenant-configured
//! endpoint, runs the endpoint's JavaScript in a per-request sandbox,
//! orchestrates the endpoint's ordered calls to HTTP, SQL and Redis backends,
//! and assembles the HTTP response.
//!
//! ## Module Layout
//!
//! - `core`: errors, configuration, the configuration data model and the
//!   backend connection pools
//! - `store`: the durable configuration store the proxy reads from, and its
//!   change feed
//! - `caching`: the invalidation-driven configuration cache
//! - `routing`: radix-tree request routing
//! - `backends`: one connection specifier per backend kind
//! - `sandbox`: the per-request script environment
//! - `gateway`: call pipeline, response assembly and the HTTP server
//! - `middleware`: access logging and route matching layers
//! - `observability`: structured logging and metrics

/// Core functionality including error types, configuration, data model and
/// connection pooling
pub mod core;

/// Durable configuration store and change notifications
pub mod store;

/// Configuration cache with notification-driven invalidation
pub mod caching;

/// Request routing system with path matching and parameter extraction
/// Uses efficient data structures (radix trees) for fast route matching
pub mod routing;

/// Backend kinds and their connection specifiers
pub mod backends;

/// Per-request script execution environment
pub mod sandbox;

/// Main gateway server implementation and HTTP handling
pub mod gateway;

/// Middleware layers wrapped around the proxy handler
pub mod middleware;

/// Observability features: structured logging and metrics
pub mod observability;

/// Main error type used throughout the gateway
pub use core::error::{GatewayError, GatewayResult};

/// Main configuration structure for the gateway
pub use core::config::GatewayConfig;

/// Server entry points
pub use gateway::server::{GatewayServer, ProxyServices};

pub use store::{MemoryStore, Store, StoreSeed};
