//! # Metrics
//!
//! Metric names recorded through the `metrics` facade and the optional
//! Prometheus exporter that publishes them.

use crate::core::error::{GatewayError, GatewayResult};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::{Ipv4Addr, SocketAddr};
use tracing::info;

pub const PROXY_REQUESTS: &str = "gateway_proxy_requests_total";
pub const PROXY_REQUEST_DURATION: &str = "gateway_proxy_request_duration_seconds";
pub const ROUTING_MISSES: &str = "gateway_routing_misses_total";
pub const BACKEND_CALLS: &str = "gateway_backend_calls_total";
pub const BACKEND_CALL_ERRORS: &str = "gateway_backend_call_errors_total";
pub const BACKEND_CALL_DURATION: &str = "gateway_backend_call_duration_seconds";
pub const CACHE_HITS: &str = "gateway_config_cache_hits_total";
pub const CACHE_MISSES: &str = "gateway_config_cache_misses_total";
pub const CACHE_RELOADS: &str = "gateway_config_cache_reloads_total";
pub const POOL_CONNECTIONS_CREATED: &str = "gateway_pool_connections_created_total";
pub const POOL_CONNECTIONS_REUSED: &str = "gateway_pool_connections_reused_total";
pub const POOL_EXHAUSTED: &str = "gateway_pool_exhausted_total";
pub const POOL_REBUILDS: &str = "gateway_pool_rebuilds_total";

const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Serve Prometheus metrics on `port` for the lifetime of the process
pub fn install_exporter(port: u16) -> GatewayResult<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), DURATION_BUCKETS)
        .map_err(|e| GatewayError::config(format!("Invalid metrics buckets: {}", e)))?
        .install()
        .map_err(|e| GatewayError::config(format!("Failed to install metrics exporter: {}", e)))?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}
