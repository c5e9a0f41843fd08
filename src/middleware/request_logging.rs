//! Access logging for every request reaching the proxy listener.
//!
//! Assigns the request id (taken from the configured header or generated),
//! makes it available to inner handlers as a [`RequestId`] extension, echoes
//! it on the response and writes one access line per request.

use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::metrics as names;
use crate::observability::RequestId;

pub struct RequestLoggingMiddleware {
    request_id_header: HeaderName,
}

impl RequestLoggingMiddleware {
    pub fn new(request_id_header: &str) -> GatewayResult<Self> {
        let request_id_header = HeaderName::from_bytes(request_id_header.as_bytes()).map_err(|e| {
            GatewayError::config(format!("invalid request id header {:?}: {}", request_id_header, e))
        })?;
        Ok(Self { request_id_header })
    }

    pub fn request_id(&self, request: &Request) -> RequestId {
        RequestId::from_header(
            request
                .headers()
                .get(&self.request_id_header)
                .and_then(|value| value.to_str().ok()),
        )
    }

    pub fn log_request(
        &self,
        request_id: &RequestId,
        method: &Method,
        path: &str,
        status: StatusCode,
        start_time: Instant,
    ) {
        let duration = start_time.elapsed();

        counter!(names::PROXY_REQUESTS, "status" => status.as_u16().to_string()).increment(1);
        histogram!(names::PROXY_REQUEST_DURATION).record(duration.as_secs_f64());

        if status.is_server_error() {
            warn!(
                request_id = %request_id,
                method = %method,
                path = path,
                status = status.as_u16(),
                duration_ms = duration.as_millis() as u64,
                "{} {} {} {}",
                request_id.log_prefix(),
                method,
                path,
                status.as_u16()
            );
        } else {
            info!(
                request_id = %request_id,
                method = %method,
                path = path,
                status = status.as_u16(),
                duration_ms = duration.as_millis() as u64,
                "{} {} {} {}",
                request_id.log_prefix(),
                method,
                path,
                status.as_u16()
            );
        }
    }
}

/// `axum::middleware::from_fn_with_state` entry point
pub async fn access_log(
    State(logger): State<Arc<RequestLoggingMiddleware>>,
    mut request: Request,
    next: Next,
) -> Response {
    let start_time = Instant::now();
    let request_id = logger.request_id(&request);
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    request.extensions_mut().insert(request_id.clone());
    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response
            .headers_mut()
            .insert(logger.request_id_header.clone(), value);
    }
    logger.log_request(&request_id, &method, &path, response.status(), start_time);
    response
}
