//! # Configuration Tests
//!
//! Loading gateway configuration and store seeds from disk, and the backend
//! configuration round trip for every supported backend kind.

use endpoint_gateway::backends::Specifier;
use endpoint_gateway::core::types::BackendKind;
use endpoint_gateway::observability::LogFormat;
use endpoint_gateway::{GatewayConfig, MemoryStore, Store};
use serde_json::json;
use std::io::Write;
use std::time::Duration;
use tempfile::{Builder, NamedTempFile};

fn write_temp(suffix: &str, content: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_load_yaml_config() {
    let file = write_temp(
        ".yaml",
        r#"
proxy:
  port: 8088
  dev_mode: true
  cache_apis: false
  http_timeout: 15s
  request_budget: 45s
pools:
  acquire_timeout: 2s
sandbox:
  loop_iteration_limit: 5000
  session_ttl: 1h
observability:
  logging:
    level: debug
    format: json
store:
  change_feed_capacity: 32
"#,
    );

    let config = GatewayConfig::load_from_file(file.path()).await.unwrap();
    assert_eq!(config.proxy.port, 8088);
    assert!(config.proxy.dev_mode);
    assert!(!config.proxy.cache_apis);
    assert_eq!(config.proxy.http_timeout, Duration::from_secs(15));
    assert_eq!(config.proxy.request_budget, Duration::from_secs(45));
    assert_eq!(config.pools.acquire_timeout, Duration::from_secs(2));
    assert_eq!(config.sandbox.loop_iteration_limit, 5000);
    assert_eq!(config.sandbox.session_ttl, Duration::from_secs(3600));
    assert_eq!(config.observability.logging.format, LogFormat::Json);
    assert_eq!(config.store.change_feed_capacity, 32);

    // Unset sections keep their defaults
    assert_eq!(config.proxy.host, "0.0.0.0");
    assert_eq!(config.pools.rebuild_retries, 3);
}

#[tokio::test]
async fn test_load_json_config() {
    let file = write_temp(".json", r#"{"proxy": {"port": 7000, "test_mode_header": "x-probe"}}"#);

    let config = GatewayConfig::load_from_file(file.path()).await.unwrap();
    assert_eq!(config.proxy.port, 7000);
    assert_eq!(config.proxy.test_mode_header, "x-probe");
}

#[tokio::test]
async fn test_malformed_config_rejected() {
    let file = write_temp(".yaml", "proxy: [not, a, map]");
    let err = GatewayConfig::load_from_file(file.path()).await.unwrap_err();
    assert!(err.to_string().contains("Failed to parse config"));

    let missing = GatewayConfig::load_from_file("/nonexistent/gateway.yaml").await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn test_load_seed_file() {
    let file = write_temp(
        ".yaml",
        r#"
apis:
  - id: 1
    name: shop
environments:
  - id: 1
    api_id: 1
    name: prod
libraries:
  - id: 1
    api_id: 1
    name: util
    script: "function twice(x) { return x * 2; }"
remote_endpoints:
  - id: 1
    api_id: 1
    name: cache
    kind: redis
    config:
      url: redis://127.0.0.1:6379/0
endpoints:
  - id: 10
    api_id: 1
    name: lookup
    environment_id: 1
    routes:
      - path: /lookup/{key}
        methods: [get]
    components:
      - id: 1
        position: 0
        remote_endpoint_id: 1
"#,
    );

    let store = MemoryStore::load_seed_file(file.path(), 16).await.unwrap();
    let endpoint = store.endpoint(10).await.unwrap();
    assert_eq!(endpoint.routes[0].path, "/lookup/{key}");
    assert_eq!(endpoint.routes[0].methods, vec![axum::http::Method::GET]);
    assert_eq!(endpoint.components[0].variable_name(), "cache");
    assert_eq!(endpoint.environment.session_name, "session");
    assert_eq!(store.libraries(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_seed_with_invalid_backend_config_rejected() {
    let file = write_temp(
        ".json",
        &json!({
            "apis": [{ "id": 1, "name": "shop" }],
            "remote_endpoints": [{
                "id": 1,
                "api_id": 1,
                "name": "db",
                "kind": "postgres",
                "config": { "config": { "host": "localhost", "user": "app", "password": "x", "dbname": "shop" } },
            }],
        })
        .to_string(),
    );

    let err = MemoryStore::load_seed_file(file.path(), 16).await.err().unwrap();
    assert_eq!(
        err.to_string(),
        "Configuration error: Postgres config missing \"port\" key"
    );
}

#[test]
fn test_specifier_round_trip_per_kind() {
    let cases = [
        (
            BackendKind::Http,
            json!({
                "url": "https://api.example.com/v1/users",
                "method": "post",
                "headers": { "authorization": "Bearer t" },
                "query": { "limit": "10" },
                "timeout": 30,
            }),
        ),
        (
            BackendKind::Postgres,
            json!({
                "config": {
                    "host": "db.internal",
                    "port": 5432,
                    "user": "app",
                    "password": "secret",
                    "dbname": "orders",
                    "sslmode": "require",
                },
                "transactions": true,
                "timeout": 10,
            }),
        ),
        (
            BackendKind::MySql,
            json!({
                "config": {
                    "host": "mysql.internal",
                    "port": 3306,
                    "user": "app",
                    "password": "secret",
                    "dbname": "catalog",
                },
            }),
        ),
        (
            BackendKind::Redis,
            json!({ "url": "redis://cache.internal:6379/2", "timeout": 5 }),
        ),
    ];

    for (kind, raw) in cases {
        let specifier = Specifier::config(kind, &raw).unwrap();
        assert_eq!(specifier.kind(), kind);

        let rebuilt = Specifier::config(kind, &specifier.to_config()).unwrap();
        assert_eq!(rebuilt, specifier, "{} specifier changed on round trip", kind);
    }
}

#[test]
fn test_specifier_rejects_missing_keys_before_connecting() {
    let err = Specifier::config(BackendKind::Http, &json!({ "method": "GET" })).unwrap_err();
    assert!(err.to_string().contains("HTTP config missing \"url\" key"));

    let err = Specifier::config(BackendKind::MySql, &json!({ "config": { "host": "h" } })).unwrap_err();
    assert!(err.to_string().contains("MySQL config missing"));

    let err = Specifier::config(BackendKind::Redis, &json!("redis://x")).unwrap_err();
    assert!(err.to_string().starts_with("Configuration error"));
}
