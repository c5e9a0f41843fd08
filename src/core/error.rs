//! # Error Handling Module
//!
//! This module defines every error the gateway can produce while resolving and
//! executing a proxied request, using the `thiserror` crate to derive `Display`
//! and `Error`.
//!
//! ## Error Taxonomy
//!
//! Not every error terminates a request. The variants fall into three groups:
//!
//! - **Terminal**: `RoutingMiss`, `Sandbox`, `Store`, `Internal` and friends end
//!   the request with an error envelope (see [`HttpError`]).
//! - **Absorbed**: `BackendCall`, `Timeout` and `PoolExhausted` raised while
//!   invoking a remote endpoint are converted into a script-visible value with
//!   [`GatewayError::to_script_value`] and handed to tenant logic.
//! - **Logged**: `NotificationDelivery` and `Configuration` raised while
//!   reacting to change notifications never reach a proxy caller; the cache and
//!   the pools keep serving their previous state.
//!
//! ## The `?` Operator
//!
//! Functions return [`GatewayResult<T>`] and propagate failures with `?`. The
//! `From` implementations at the bottom of this file let third-party errors
//! (`serde_json`, `reqwest`, `sqlx`, `redis`, ...) flow through `?` without
//! manual mapping.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Comprehensive error types for the gateway
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Bad Endpoint/RemoteEndpoint/gateway configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No registered route matched the request
    #[error("No route matched {method} {path}")]
    RoutingMiss { method: String, path: String },

    /// Tenant script failed to compile or threw at runtime
    #[error("Script error: {message}")]
    Sandbox { message: String },

    /// A downstream backend call failed
    #[error("Backend call to {backend} failed: {message}")]
    BackendCall { backend: String, message: String },

    /// A backend call or the request budget ran out of time
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Every connection permitted by a pool's max-open bound is checked out
    #[error("Connection pool for {backend} exhausted after waiting {waited_ms}ms")]
    PoolExhausted { backend: String, waited_ms: u64 },

    /// The client went away before the backend call was issued or finished
    #[error("Backend call to {backend} cancelled")]
    Cancelled { backend: String },

    /// A change notification could not be delivered or applied
    #[error("Notification delivery error: {message}")]
    NotificationDelivery { message: String },

    /// A requested aggregate does not exist in the durable store
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// The durable store failed to answer
    #[error("Store error: {message}")]
    Store { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, network errors, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors when calling HTTP backends
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a script error with a custom message
    pub fn sandbox<S: Into<String>>(message: S) -> Self {
        Self::Sandbox {
            message: message.into(),
        }
    }

    /// Create a backend call error for the named backend
    pub fn backend<B: Into<String>, S: Into<String>>(backend: B, message: S) -> Self {
        Self::BackendCall {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a not found error with a custom message
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a store error with a custom message
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a notification delivery error with a custom message
    pub fn notification<S: Into<String>>(message: S) -> Self {
        Self::NotificationDelivery {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RoutingMiss { .. } => StatusCode::NOT_FOUND,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BackendCall { .. } => StatusCode::BAD_GATEWAY,
            Self::PoolExhausted { .. } => StatusCode::BAD_GATEWAY,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
            Self::Cancelled { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Sandbox { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotificationDelivery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a string representation of the error type
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RoutingMiss { .. } => "routing_miss",
            Self::Sandbox { .. } => "script_error",
            Self::BackendCall { .. } => "backend_error",
            Self::Timeout { .. } => "timeout",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::Cancelled { .. } => "cancelled",
            Self::NotificationDelivery { .. } => "notification_error",
            Self::NotFound { .. } => "not_found",
            Self::Store { .. } => "store_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }

    /// Whether this error is absorbed into tenant-visible state when it is
    /// raised by a backend call, instead of aborting the request.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::BackendCall { .. }
                | Self::Timeout { .. }
                | Self::PoolExhausted { .. }
                | Self::Cancelled { .. }
                | Self::HttpClient { .. }
        )
    }

    /// The error value a tenant script sees on `<call>.error`.
    pub fn to_script_value(&self) -> serde_json::Value {
        json!({
            "kind": self.error_type(),
            "message": self.to_string(),
        })
    }
}

impl From<Infallible> for GatewayError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        Self::BackendCall {
            backend: "sql".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::BackendCall {
            backend: "redis".to_string(),
            message: err.to_string(),
        }
    }
}

/// A terminal error bound to the developer-mode flag of the server that
/// produced it.
///
/// Outside developer mode the body is the generic `Server error` text so that
/// internal detail never reaches the caller; in developer mode the underlying
/// message is echoed. The status is always derived from the error kind.
#[derive(Debug, Clone)]
pub struct HttpError {
    error: GatewayError,
    dev_mode: bool,
}

impl HttpError {
    pub fn new(error: GatewayError, dev_mode: bool) -> Self {
        Self { error, dev_mode }
    }

    pub fn error(&self) -> &GatewayError {
        &self.error
    }

    pub fn status_code(&self) -> StatusCode {
        self.error.status_code()
    }

    /// Body written to the client
    pub fn body(&self) -> String {
        match (&self.error, self.dev_mode) {
            (GatewayError::RoutingMiss { .. }, _) => "404 page not found\n".to_string(),
            (_, true) => format!("{}\n", self.error),
            (_, false) => "Server error\n".to_string(),
        }
    }

    /// First line of the error, used by the `[error]` log line
    pub fn summary(&self) -> String {
        self.error
            .to_string()
            .lines()
            .next()
            .unwrap_or("Unknown Error")
            .to_string()
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = self.body();
        Response::builder()
            .status(self.status_code())
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
