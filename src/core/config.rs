//! # Configuration Module
//!
//! Process-wide settings of the endpoint gateway.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Environment variable override support (`GATEWAY_*`)
//! - Validation that reports every problem at once

use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::logging::{LogConfig, LogFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener and request handling settings
    pub proxy: ProxyConfig,

    /// Backend connection pool settings
    pub pools: PoolConfig,

    /// Script sandbox limits
    pub sandbox: SandboxConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,

    /// Durable store collaborator
    pub store: StoreConfig,
}

impl GatewayConfig {
    /// Load configuration from a file; `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = if is_json(path) {
            serde_json::from_str(&content)
                .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))?
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<FIELD>
    /// For example: GATEWAY_PROXY_PORT=8080
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(host) = env::var("GATEWAY_PROXY_HOST") {
            self.proxy.host = host;
        }

        if let Ok(port) = env::var("GATEWAY_PROXY_PORT") {
            self.proxy.port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_PROXY_PORT: {}", e)))?;
        }

        if let Ok(dev) = env::var("GATEWAY_DEV_MODE") {
            self.proxy.dev_mode = dev
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_DEV_MODE: {}", e)))?;
        }

        if let Ok(cache) = env::var("GATEWAY_CACHE_APIS") {
            self.proxy.cache_apis = cache
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_CACHE_APIS: {}", e)))?;
        }

        if let Ok(timeout) = env::var("GATEWAY_HTTP_TIMEOUT") {
            self.proxy.http_timeout = humantime::parse_duration(&timeout)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_HTTP_TIMEOUT: {}", e)))?;
        }

        if let Ok(budget) = env::var("GATEWAY_REQUEST_BUDGET") {
            self.proxy.request_budget = humantime::parse_duration(&budget)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_REQUEST_BUDGET: {}", e)))?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        if let Ok(seed) = env::var("GATEWAY_STORE_SEED") {
            self.store.seed = Some(PathBuf::from(seed));
        }

        Ok(())
    }

    /// Configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.proxy.host.is_empty() {
            errors.push("proxy.host cannot be empty".to_string());
        }

        if self.proxy.request_id_header.is_empty() {
            errors.push("proxy.request_id_header cannot be empty".to_string());
        }

        if self.proxy.http_timeout.is_zero() {
            errors.push("proxy.http_timeout must be greater than 0".to_string());
        }

        if self.proxy.request_budget.is_zero() {
            errors.push("proxy.request_budget must be greater than 0".to_string());
        }

        if self.proxy.max_body_size == 0 {
            errors.push("proxy.max_body_size must be greater than 0".to_string());
        }

        if self.proxy.enable_test_mode && self.proxy.test_mode_header.is_empty() {
            errors.push("proxy.test_mode_header cannot be empty when test mode is enabled".to_string());
        }

        if self.pools.acquire_timeout.is_zero() {
            errors.push("pools.acquire_timeout must be greater than 0".to_string());
        }

        if self.pools.rebuild_retries == 0 {
            errors.push("pools.rebuild_retries must be at least 1".to_string());
        }

        if self.sandbox.loop_iteration_limit == 0 {
            errors.push("sandbox.loop_iteration_limit must be greater than 0".to_string());
        }

        if self.sandbox.recursion_limit == 0 {
            errors.push("sandbox.recursion_limit must be greater than 0".to_string());
        }

        if self.store.change_feed_capacity == 0 {
            errors.push("store.change_feed_capacity must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Listener and request handling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,

    /// Header carrying an upstream-assigned request id
    pub request_id_header: String,

    /// Developer mode echoes terminal error detail to the client
    pub dev_mode: bool,

    /// Serve configuration through the caching data source
    pub cache_apis: bool,

    /// Default per-call backend timeout
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,

    /// Upper bound on the total work done for one request
    #[serde(with = "humantime_serde")]
    pub request_budget: Duration,

    pub max_body_size: usize,

    pub enable_test_mode: bool,
    pub test_mode_header: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            request_id_header: "x-request-id".to_string(),
            dev_mode: false,
            cache_apis: true,
            http_timeout: Duration::from_secs(60),
            request_budget: Duration::from_secs(120),
            max_body_size: 10 * 1024 * 1024,
            enable_test_mode: false,
            test_mode_header: "x-gateway-test".to_string(),
        }
    }
}

/// Backend connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How long a call waits for a free connection before failing
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// How long `get` waits on an in-progress rebuild before using the old pool
    #[serde(with = "humantime_serde")]
    pub rebuild_wait: Duration,

    pub rebuild_retries: u32,

    #[serde(with = "humantime_serde")]
    pub rebuild_backoff: Duration,

    /// Idle connections older than this are closed instead of reused
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            rebuild_wait: Duration::from_millis(500),
            rebuild_retries: 3,
            rebuild_backoff: Duration::from_millis(200),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Script sandbox limits and session lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,

    /// Sessions untouched for this long are purged
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            loop_iteration_limit: 10_000_000,
            recursion_limit: 512,
            session_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Observability settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub logging: LogConfig,

    /// Prometheus exporter port; disabled when unset
    pub metrics_port: Option<u16>,
}

/// Durable store collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// YAML/JSON seed document loaded into the in-memory store
    pub seed: Option<PathBuf>,

    /// Buffered notifications before a slow subscriber lags
    pub change_feed_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            seed: None,
            change_feed_capacity: 1024,
        }
    }
}
