//! # Backends Module
//!
//! The closed set of backend kinds a remote endpoint can target. Each kind
//! contributes one [`Specifier`] variant that validates the raw stored
//! configuration, opens connections, and executes a call request produced by
//! tenant scripts.
//!
//! Call requests and responses are plain JSON values so they can cross the
//! sandbox boundary unchanged.

pub mod http;
pub mod redis;
pub mod sql;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::BackendKind;
use serde_json::{Map, Value};
use std::time::Duration;

pub use self::http::HttpSpecifier;
pub use self::redis::RedisSpecifier;
pub use self::sql::SqlSpecifier;

/// Validated, kind-specific backend configuration
#[derive(Debug, Clone, PartialEq)]
pub enum Specifier {
    Http(HttpSpecifier),
    Postgres(SqlSpecifier),
    MySql(SqlSpecifier),
    Redis(RedisSpecifier),
}

impl Specifier {
    /// Validate a raw stored configuration for `kind`.
    ///
    /// Errors are `Configuration` errors naming the missing key or the decode
    /// failure, e.g. `Postgres config missing "port" key`.
    pub fn config(kind: BackendKind, raw: &Value) -> GatewayResult<Self> {
        match kind {
            BackendKind::Http => HttpSpecifier::from_config(raw).map(Specifier::Http),
            BackendKind::Postgres => SqlSpecifier::from_config(kind, raw).map(Specifier::Postgres),
            BackendKind::MySql => SqlSpecifier::from_config(kind, raw).map(Specifier::MySql),
            BackendKind::Redis => RedisSpecifier::from_config(raw).map(Specifier::Redis),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Specifier::Http(_) => BackendKind::Http,
            Specifier::Postgres(_) => BackendKind::Postgres,
            Specifier::MySql(_) => BackendKind::MySql,
            Specifier::Redis(_) => BackendKind::Redis,
        }
    }

    /// Reproduce the raw configuration this specifier was validated from
    pub fn to_config(&self) -> Value {
        match self {
            Specifier::Http(spec) => spec.to_config(),
            Specifier::Postgres(spec) | Specifier::MySql(spec) => spec.to_config(),
            Specifier::Redis(spec) => spec.to_config(),
        }
    }

    /// Kind-specific call timeout, if configured
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Specifier::Http(spec) => spec.timeout,
            Specifier::Postgres(spec) | Specifier::MySql(spec) => spec.timeout,
            Specifier::Redis(spec) => spec.timeout,
        }
    }

    /// Initial value of a call's `request` object before transformations run
    pub fn default_request(&self) -> Value {
        match self {
            Specifier::Http(spec) => spec.default_request(),
            Specifier::Postgres(_) | Specifier::MySql(_) => sql::default_request(),
            Specifier::Redis(_) => redis::default_request(),
        }
    }

    /// Open one new connection to the backend
    pub async fn connect(&self) -> GatewayResult<Connection> {
        match self {
            Specifier::Http(spec) => spec.connect().map(Connection::Http),
            Specifier::Postgres(spec) => spec.connect_postgres().await.map(Connection::Postgres),
            Specifier::MySql(spec) => spec.connect_mysql().await.map(Connection::MySql),
            Specifier::Redis(spec) => spec.connect().await.map(Connection::Redis),
        }
    }
}

/// One open backend connection, owned by a pool
pub enum Connection {
    Http(reqwest::Client),
    Postgres(sqlx::PgConnection),
    MySql(sqlx::MySqlConnection),
    Redis(::redis::aio::MultiplexedConnection),
}

impl Connection {
    /// Execute one call request and produce the script-visible response
    pub async fn invoke(&mut self, specifier: &Specifier, request: &Value) -> GatewayResult<Value> {
        match (self, specifier) {
            (Connection::Http(client), Specifier::Http(spec)) => {
                http::invoke(client, spec, request).await
            }
            (Connection::Postgres(conn), Specifier::Postgres(spec)) => {
                sql::invoke_postgres(conn, spec, request).await
            }
            (Connection::MySql(conn), Specifier::MySql(spec)) => {
                sql::invoke_mysql(conn, spec, request).await
            }
            (Connection::Redis(conn), Specifier::Redis(_)) => redis::invoke(conn, request).await,
            (conn, spec) => Err(GatewayError::internal(format!(
                "{} connection used with {} specifier",
                conn.kind(),
                spec.kind()
            ))),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Connection::Http(_) => BackendKind::Http,
            Connection::Postgres(_) => BackendKind::Postgres,
            Connection::MySql(_) => BackendKind::MySql,
            Connection::Redis(_) => BackendKind::Redis,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection({})", self.kind())
    }
}

/// Interpret a raw configuration as a JSON object
fn config_object<'a>(kind: BackendKind, raw: &'a Value) -> GatewayResult<&'a Map<String, Value>> {
    raw.as_object().ok_or_else(|| {
        GatewayError::config(format!(
            "bad JSON for {} config: expected an object, found {}",
            kind.label(),
            type_name(raw)
        ))
    })
}

/// Fail with `<Kind> config missing "<key>" key` on the first absent key
fn require_keys(kind: BackendKind, object: &Map<String, Value>, keys: &[&str]) -> GatewayResult<()> {
    for key in keys {
        if !object.contains_key(*key) {
            return Err(GatewayError::config(format!(
                "{} config missing \"{}\" key",
                kind.label(),
                key
            )));
        }
    }
    Ok(())
}

fn bad_json(kind: BackendKind, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::config(format!("bad JSON for {} config: {}", kind.label(), err))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
