//! Resolves each request against the live router before the proxy handler
//! runs. A match is attached to the request as a [`RouteMatch`] extension;
//! anything unmatched ends here with a 404.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use tracing::info;

use crate::core::error::{GatewayError, HttpError};
use crate::gateway::request::request_host;
use crate::gateway::server::ProxyServices;
use crate::observability::metrics as names;
use crate::observability::RequestId;

pub async fn match_route(
    State(services): State<ProxyServices>,
    mut request: Request,
    next: Next,
) -> Response {
    let router = services.router().current();
    let host = request_host(request.headers(), request.uri().host());

    match router.match_request(request.method(), host.as_deref(), request.uri().path()) {
        Some(matched) => {
            request.extensions_mut().insert(matched);
            next.run(request).await
        }
        None => {
            counter!(names::ROUTING_MISSES).increment(1);
            let prefix = request
                .extensions()
                .get::<RequestId>()
                .map(RequestId::log_prefix)
                .unwrap_or_default();
            let error = HttpError::new(
                GatewayError::RoutingMiss {
                    method: request.method().to_string(),
                    path: request.uri().path().to_string(),
                },
                services.config().proxy.dev_mode,
            );
            info!("{} [error] {}", prefix, error.summary());
            error.into_response()
        }
    }
}
