//! # Core Types Module
//!
//! The gateway configuration aggregates that flow from the durable store through
//! the cache into a request's sandbox, plus the change notification that keeps
//! them fresh.
//!
//! ## Ownership
//!
//! Aggregates are immutable once loaded. The cache hands them out as
//! `Arc<Endpoint>` so every request holds a consistent snapshot for as long as
//! it needs it, while a reload swaps in a brand new `Arc` rather than mutating
//! the old one.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier type used for every stored entity
pub type Id = i64;

/// Names of the store tables that appear in change notifications
pub mod tables {
    pub const ACCOUNTS: &str = "accounts";
    pub const APIS: &str = "apis";
    pub const HOSTS: &str = "hosts";
    pub const ENVIRONMENTS: &str = "environments";
    pub const LIBRARIES: &str = "libraries";
    pub const REMOTE_ENDPOINTS: &str = "remote_endpoints";
    pub const PROXY_ENDPOINTS: &str = "proxy_endpoints";
    pub const ROUTES: &str = "proxy_endpoint_routes";
    pub const COMPONENTS: &str = "proxy_endpoint_components";
    pub const CALLS: &str = "proxy_endpoint_calls";
    pub const TRANSFORMATIONS: &str = "proxy_endpoint_transformations";
}

/// Mutation kind carried by a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeAction::Insert => write!(f, "insert"),
            ChangeAction::Update => write!(f, "update"),
            ChangeAction::Delete => write!(f, "delete"),
        }
    }
}

/// Emitted by every committing mutation of the durable store.
///
/// Consumers treat it as a hint of *what* changed, never as the new data:
/// caches and pools always re-read the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: String,
    pub account_id: Id,
    pub user_id: Id,
    pub api_id: Id,
    pub endpoint_id: Id,
    pub target_id: Id,
    pub action: ChangeAction,
}

impl ChangeNotification {
    pub fn new(table: &str, api_id: Id, target_id: Id, action: ChangeAction) -> Self {
        Self {
            table: table.to_string(),
            account_id: 0,
            user_id: 0,
            api_id,
            endpoint_id: 0,
            target_id,
            action,
        }
    }

    pub fn with_endpoint(mut self, endpoint_id: Id) -> Self {
        self.endpoint_id = endpoint_id;
        self
    }

    pub fn with_actor(mut self, account_id: Id, user_id: Id) -> Self {
        self.account_id = account_id;
        self.user_id = user_id;
        self
    }
}

/// CORS policy configured on an API and applied to all of its endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsPolicy {
    pub enabled: bool,
    pub allow_origin: String,
    pub allow_headers: String,
    pub request_headers: String,
    pub allow_credentials: bool,
    pub max_age: u64,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_origin: "*".to_string(),
            allow_headers: "content-type, accept".to_string(),
            request_headers: "*".to_string(),
            allow_credentials: true,
            max_age: 600,
        }
    }
}

/// An API groups endpoints, remote endpoints, libraries and hosts of one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Api {
    pub id: Id,
    #[serde(default)]
    pub account_id: Id,
    pub name: String,
    #[serde(default)]
    pub cors: CorsPolicy,
}

/// A hostname an API is served on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: Id,
    pub api_id: Id,
    pub name: String,
    pub hostname: String,
}

/// Environment-scoped data used to initialize a sandbox's session and `env`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: Id,
    pub api_id: Id,
    pub name: String,
    #[serde(default = "default_session_name")]
    pub session_name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_session_name() -> String {
    "session".to_string()
}

/// Shared script source loaded before an endpoint's own script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    pub id: Id,
    pub api_id: Id,
    pub name: String,
    pub script: String,
}

/// Backend kind tag of a remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Http,
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    Redis,
}

impl BackendKind {
    /// Label used in configuration error messages
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Http => "HTTP",
            BackendKind::Postgres => "Postgres",
            BackendKind::MySql => "MySQL",
            BackendKind::Redis => "Redis",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Pool sizing bounds of a remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSizing {
    pub max_open: usize,
    pub max_idle: usize,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            max_open: 10,
            max_idle: 2,
        }
    }
}

/// A configured backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub id: Id,
    pub api_id: Id,
    /// Codename; also the default sandbox variable name of calls to it
    pub name: String,
    pub kind: BackendKind,
    /// Kind-specific configuration, validated by `Specifier::config`
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub pool: PoolSizing,
}

/// Ordered script step applied to data entering or leaving a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transformation {
    #[serde(default)]
    pub id: Id,
    pub script: String,
}

/// Route definition bound to an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Path pattern (e.g., "/users/{id}")
    pub path: String,

    /// Allowed HTTP methods (stored as strings for serialization)
    #[serde(with = "method_serde")]
    pub methods: Vec<Method>,
}

impl Route {
    pub fn new(path: &str, methods: Vec<Method>) -> Self {
        Self {
            path: path.to_string(),
            methods,
        }
    }

    /// A route that lists OPTIONS answers preflight requests through its own
    /// script; every other route gets a synthesized CORS preflight response.
    pub fn handles_options(&self) -> bool {
        self.methods.contains(&Method::OPTIONS)
    }
}

/// Custom serialization module for HTTP methods
pub mod method_serde {
    use axum::http::Method;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(methods: &[Method], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let method_strings: Vec<String> = methods.iter().map(|m| m.to_string()).collect();
        method_strings.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Method>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let method_strings: Vec<String> = Vec::deserialize(deserializer)?;
        method_strings
            .into_iter()
            .map(|s| Method::from_str(&s.to_uppercase()).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// One pipeline step: a conditionally gated call to a remote endpoint
/// wrapped in before/after transformations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: Id,
    /// Unique within the endpoint; defines execution order
    pub position: i64,
    pub remote_endpoint: RemoteEndpoint,
    pub endpoint_name_override: Option<String>,
    pub conditional: String,
    pub conditional_positive: bool,
    pub before: Vec<Transformation>,
    pub after: Vec<Transformation>,
}

impl Call {
    /// Name of the sandbox variable holding this call's request/response
    pub fn variable_name(&self) -> &str {
        match &self.endpoint_name_override {
            Some(name) if !name.is_empty() => name,
            _ => &self.remote_endpoint.name,
        }
    }

    pub fn has_conditional(&self) -> bool {
        !self.conditional.trim().is_empty()
    }
}

/// Fully resolved endpoint aggregate as served by the config cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Id,
    pub api_id: Id,
    pub name: String,
    pub script: String,
    pub cors: CorsPolicy,
    pub routes: Vec<Route>,
    /// Sorted by ascending position
    pub components: Vec<Call>,
    pub environment: Environment,
    /// Hostnames of the owning API; empty means any host
    pub hosts: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_handles_options_only_when_listed() {
        let plain = Route::new("/users", vec![Method::GET, Method::POST]);
        assert!(!plain.handles_options());

        let explicit = Route::new("/users", vec![Method::GET, Method::OPTIONS]);
        assert!(explicit.handles_options());
    }

    #[test]
    fn test_route_methods_deserialize_case_insensitively() {
        let route: Route =
            serde_json::from_str(r#"{"path": "/a", "methods": ["get", "Post"]}"#).unwrap();
        assert_eq!(route.methods, vec![Method::GET, Method::POST]);
    }

    #[test]
    fn test_backend_kind_serde_tags() {
        let kind: BackendKind = serde_json::from_str(r#""mysql""#).unwrap();
        assert_eq!(kind, BackendKind::MySql);
        assert_eq!(serde_json::to_string(&BackendKind::Postgres).unwrap(), r#""postgres""#);
    }
}
