//! SQL backends (PostgreSQL and MySQL) through `sqlx`.
//!
//! Both kinds share one specifier shape. A call request is either a single
//! `{statement, parameters}` or a batch `{queries: [...]}`; batches run inside
//! one transaction when the remote endpoint enables `transactions`.

use super::{bad_json, config_object, require_keys};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::BackendKind;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlRow, MySqlSslMode};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Column, Connection as SqlxConnection, MySql, MySqlConnection, PgConnection, Postgres, Row};
use std::str::FromStr;
use std::time::Duration;

const REQUIRED_KEYS: &[&str] = &["host", "port", "user", "password", "dbname"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sslmode: Option<String>,
    /// Seconds allowed for establishing a connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlSpecifier {
    pub connection: SqlConnectionConfig,
    pub transactions: bool,
    pub timeout: Option<Duration>,
}

#[derive(Deserialize)]
struct RawSqlConfig {
    config: SqlConnectionConfig,
    #[serde(default)]
    transactions: bool,
    #[serde(default)]
    timeout: Option<u64>,
}

impl SqlSpecifier {
    pub fn from_config(kind: BackendKind, raw: &Value) -> GatewayResult<Self> {
        let object = config_object(kind, raw)?;
        require_keys(kind, object, &["config"])?;

        let inner = object
            .get("config")
            .and_then(Value::as_object)
            .ok_or_else(|| bad_json(kind, "\"config\" must be an object"))?;
        require_keys(kind, inner, REQUIRED_KEYS)?;

        let parsed: RawSqlConfig =
            serde_json::from_value(raw.clone()).map_err(|e| bad_json(kind, e))?;

        if let Some(mode) = &parsed.config.sslmode {
            let valid = match kind {
                BackendKind::Postgres => PgSslMode::from_str(mode).is_ok(),
                _ => MySqlSslMode::from_str(mode).is_ok(),
            };
            if !valid {
                return Err(bad_json(kind, format!("unknown sslmode {:?}", mode)));
            }
        }

        Ok(Self {
            connection: parsed.config,
            transactions: parsed.transactions,
            timeout: parsed.timeout.map(Duration::from_secs),
        })
    }

    pub fn to_config(&self) -> Value {
        let mut config = json!({
            "config": self.connection,
            "transactions": self.transactions,
        });
        if let Some(timeout) = self.timeout {
            config["timeout"] = json!(timeout.as_secs());
        }
        config
    }

    pub async fn connect_postgres(&self) -> GatewayResult<PgConnection> {
        let c = &self.connection;
        let mut options = PgConnectOptions::new()
            .host(&c.host)
            .port(c.port)
            .username(&c.user)
            .password(&c.password)
            .database(&c.dbname);
        if let Some(mode) = &c.sslmode {
            let mode = PgSslMode::from_str(mode)
                .map_err(|e| GatewayError::config(format!("bad JSON for Postgres config: {}", e)))?;
            options = options.ssl_mode(mode);
        }

        with_connect_timeout("postgres", c.connect_timeout, PgConnection::connect_with(&options)).await
    }

    pub async fn connect_mysql(&self) -> GatewayResult<MySqlConnection> {
        let c = &self.connection;
        let mut options = MySqlConnectOptions::new()
            .host(&c.host)
            .port(c.port)
            .username(&c.user)
            .password(&c.password)
            .database(&c.dbname);
        if let Some(mode) = &c.sslmode {
            let mode = MySqlSslMode::from_str(mode)
                .map_err(|e| GatewayError::config(format!("bad JSON for MySQL config: {}", e)))?;
            options = options.ssl_mode(mode);
        }

        with_connect_timeout("mysql", c.connect_timeout, MySqlConnection::connect_with(&options)).await
    }
}

async fn with_connect_timeout<C, F>(backend: &str, secs: Option<u64>, connect: F) -> GatewayResult<C>
where
    F: std::future::Future<Output = Result<C, sqlx::Error>>,
{
    let result = match secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), connect)
            .await
            .map_err(|_| GatewayError::backend(backend, format!("connect timed out after {}s", secs)))?,
        None => connect.await,
    };
    result.map_err(|e| GatewayError::backend(backend, e.to_string()))
}

pub(super) fn default_request() -> Value {
    json!({"statement": "", "parameters": []})
}

#[derive(Debug, Deserialize)]
struct SqlStatement {
    statement: String,
    #[serde(default)]
    parameters: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SqlCallRequest {
    Batch { queries: Vec<SqlStatement> },
    Single(SqlStatement),
}

fn parse_request(backend: &str, request: &Value) -> GatewayResult<SqlCallRequest> {
    let parsed: SqlCallRequest = serde_json::from_value(request.clone()).map_err(|_| {
        GatewayError::backend(
            backend,
            "invalid request: expected {statement, parameters} or {queries: [...]}",
        )
    })?;
    if let SqlCallRequest::Single(stmt) = &parsed {
        if stmt.statement.trim().is_empty() {
            return Err(GatewayError::backend(backend, "invalid request: empty statement"));
        }
    }
    Ok(parsed)
}

/// Statements whose results are returned as rows rather than an affected count
fn returns_rows(statement: &str) -> bool {
    let lowered = statement.trim_start().to_ascii_lowercase();
    ["select", "with", "show", "values", "explain", "describe", "table "]
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
        || lowered.contains(" returning ")
}

macro_rules! bind_parameters {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64().unwrap_or_default()),
                },
                Value::String(s) => query.bind(s.clone()),
                other => query.bind(sqlx::types::Json(other.clone())),
            };
        }
        query
    }};
}

/// Decode a column with the first Rust type that accepts it
macro_rules! decode_column {
    ($row:expr, $index:expr, $($ty:ty),+) => {{
        $(
            if let Ok(value) = $row.try_get::<Option<$ty>, _>($index) {
                return value.map(|v| json!(v)).unwrap_or(Value::Null);
            }
        )+
        Value::Null
    }};
}

fn pg_column(row: &PgRow, index: usize) -> Value {
    decode_column!(
        row,
        index,
        i64,
        i32,
        i16,
        f64,
        f32,
        bool,
        String,
        Value,
        uuid::Uuid,
        chrono::DateTime<chrono::Utc>,
        chrono::NaiveDateTime,
        chrono::NaiveDate
    )
}

fn mysql_column(row: &MySqlRow, index: usize) -> Value {
    decode_column!(
        row,
        index,
        i64,
        i32,
        i16,
        i8,
        u64,
        u32,
        f64,
        f32,
        bool,
        String,
        Value,
        chrono::DateTime<chrono::Utc>,
        chrono::NaiveDateTime,
        chrono::NaiveDate
    )
}

fn pg_row(row: &PgRow) -> Value {
    let mut object = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), pg_column(row, index));
    }
    Value::Object(object)
}

fn mysql_row(row: &MySqlRow) -> Value {
    let mut object = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), mysql_column(row, index));
    }
    Value::Object(object)
}

async fn run_postgres(conn: &mut PgConnection, stmt: &SqlStatement) -> GatewayResult<Value> {
    let query: Query<'_, Postgres, PgArguments> =
        bind_parameters!(sqlx::query::<Postgres>(&stmt.statement), &stmt.parameters);
    let err = |e: sqlx::Error| GatewayError::backend("postgres", e.to_string());

    if returns_rows(&stmt.statement) {
        let rows = query.fetch_all(&mut *conn).await.map_err(err)?;
        Ok(json!({ "data": rows.iter().map(pg_row).collect::<Vec<_>>() }))
    } else {
        let result = query.execute(&mut *conn).await.map_err(err)?;
        Ok(json!({ "rowsAffected": result.rows_affected() }))
    }
}

async fn run_mysql(conn: &mut MySqlConnection, stmt: &SqlStatement) -> GatewayResult<Value> {
    let query: Query<'_, MySql, MySqlArguments> =
        bind_parameters!(sqlx::query::<MySql>(&stmt.statement), &stmt.parameters);
    let err = |e: sqlx::Error| GatewayError::backend("mysql", e.to_string());

    if returns_rows(&stmt.statement) {
        let rows = query.fetch_all(&mut *conn).await.map_err(err)?;
        Ok(json!({ "data": rows.iter().map(mysql_row).collect::<Vec<_>>() }))
    } else {
        let result = query.execute(&mut *conn).await.map_err(err)?;
        Ok(json!({ "rowsAffected": result.rows_affected() }))
    }
}

pub(super) async fn invoke_postgres(
    conn: &mut PgConnection,
    spec: &SqlSpecifier,
    request: &Value,
) -> GatewayResult<Value> {
    match parse_request("postgres", request)? {
        SqlCallRequest::Single(stmt) => run_postgres(conn, &stmt).await,
        SqlCallRequest::Batch { queries } if spec.transactions => {
            let mut tx = conn
                .begin()
                .await
                .map_err(|e| GatewayError::backend("postgres", e.to_string()))?;
            let mut results = Vec::with_capacity(queries.len());
            for stmt in &queries {
                results.push(run_postgres(&mut tx, stmt).await?);
            }
            tx.commit()
                .await
                .map_err(|e| GatewayError::backend("postgres", e.to_string()))?;
            Ok(json!({ "results": results }))
        }
        SqlCallRequest::Batch { queries } => {
            let mut results = Vec::with_capacity(queries.len());
            for stmt in &queries {
                results.push(run_postgres(conn, stmt).await?);
            }
            Ok(json!({ "results": results }))
        }
    }
}

pub(super) async fn invoke_mysql(
    conn: &mut MySqlConnection,
    spec: &SqlSpecifier,
    request: &Value,
) -> GatewayResult<Value> {
    match parse_request("mysql", request)? {
        SqlCallRequest::Single(stmt) => run_mysql(conn, &stmt).await,
        SqlCallRequest::Batch { queries } if spec.transactions => {
            let mut tx = conn
                .begin()
                .await
                .map_err(|e| GatewayError::backend("mysql", e.to_string()))?;
            let mut results = Vec::with_capacity(queries.len());
            for stmt in &queries {
                results.push(run_mysql(&mut tx, stmt).await?);
            }
            tx.commit()
                .await
                .map_err(|e| GatewayError::backend("mysql", e.to_string()))?;
            Ok(json!({ "results": results }))
        }
        SqlCallRequest::Batch { queries } => {
            let mut results = Vec::with_capacity(queries.len());
            for stmt in &queries {
                results.push(run_mysql(conn, stmt).await?);
            }
            Ok(json!({ "results": results }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_config() -> Value {
        json!({
            "config": {
                "host": "localhost",
                "port": 5432,
                "user": "gateway",
                "password": "secret",
                "dbname": "app"
            }
        })
    }

    #[test]
    fn test_missing_port_key() {
        let raw = json!({"config": {"host": "localhost"}});
        let err = SqlSpecifier::from_config(BackendKind::Postgres, &raw).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: Postgres config missing \"port\" key"
        );
    }

    #[test]
    fn test_config_not_an_object() {
        let raw = json!({"config": 8});
        let err = SqlSpecifier::from_config(BackendKind::MySql, &raw).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Configuration error: bad JSON for MySQL config:"));
    }

    #[test]
    fn test_wrong_port_type_is_bad_json() {
        let mut raw = full_config();
        raw["config"]["port"] = json!("five");
        let err = SqlSpecifier::from_config(BackendKind::MySql, &raw).unwrap_err();
        assert!(err.to_string().contains("bad JSON for MySQL config"));
    }

    #[test]
    fn test_sslmode_validated_per_kind() {
        let mut raw = full_config();
        raw["config"]["sslmode"] = json!("verify-full");
        assert!(SqlSpecifier::from_config(BackendKind::Postgres, &raw).is_ok());

        raw["config"]["sslmode"] = json!("sometimes");
        assert!(SqlSpecifier::from_config(BackendKind::Postgres, &raw).is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let mut raw = full_config();
        raw["transactions"] = json!(true);
        raw["timeout"] = json!(3);
        let spec = SqlSpecifier::from_config(BackendKind::Postgres, &raw).unwrap();
        assert!(spec.transactions);
        assert_eq!(
            SqlSpecifier::from_config(BackendKind::Postgres, &spec.to_config()).unwrap(),
            spec
        );
    }

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("  SELECT * FROM users"));
        assert!(returns_rows("insert into t (a) values (1) returning id"));
        assert!(!returns_rows("UPDATE users SET name = $1"));
    }

    #[test]
    fn test_parse_request_shapes() {
        let single = parse_request("postgres", &json!({"statement": "select 1"})).unwrap();
        assert!(matches!(single, SqlCallRequest::Single(_)));

        let batch = parse_request(
            "postgres",
            &json!({"queries": [{"statement": "delete from t", "parameters": [1]}]}),
        )
        .unwrap();
        assert!(matches!(batch, SqlCallRequest::Batch { .. }));

        assert!(parse_request("postgres", &default_request()).is_err());
    }
}
