//! # Response Assembly
//!
//! Turns the sandbox's final `response` object into the HTTP response written
//! to the client, and synthesizes CORS preflight answers for routes that do
//! not handle OPTIONS themselves.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::CorsPolicy;

/// The script-side response object
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptResponse {
    #[serde(rename = "statusCode", default = "default_status")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub body: Value,
}

fn default_status() -> u16 {
    200
}

impl ScriptResponse {
    pub fn from_value(value: Value) -> GatewayResult<Self> {
        if !value.is_object() {
            return Err(GatewayError::sandbox("response must be an object"));
        }
        serde_json::from_value(value)
            .map_err(|e| GatewayError::sandbox(format!("invalid response object: {}", e)))
    }

    /// Body bytes as written to the client; non-string bodies are JSON encoded
    pub fn body_text(&self) -> String {
        match &self.body {
            Value::Null => String::new(),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Body written in test mode instead of the raw response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEnvelope {
    pub body: String,
    pub log: String,
}

/// Per-request switches applied while assembling
#[derive(Debug, Default)]
pub struct AssembleOptions<'a> {
    pub cors: Option<&'a CorsPolicy>,
    pub test_mode: bool,
    pub log: &'a [String],
    pub set_cookie: Option<String>,
}

/// Build the concrete response.
///
/// Endpoint CORS headers are applied first so that headers set by the script
/// win. `Content-Length` always reflects the bytes actually written.
pub fn assemble(response: ScriptResponse, options: AssembleOptions<'_>) -> GatewayResult<Response> {
    let status = StatusCode::from_u16(response.status_code).map_err(|_| {
        GatewayError::sandbox(format!("invalid status code {}", response.status_code))
    })?;

    let mut headers = HeaderMap::new();
    if let Some(cors) = options.cors.filter(|cors| cors.enabled) {
        apply_cors(&mut headers, cors);
    }
    apply_script_headers(&mut headers, &response.headers);

    let mut body = response.body_text();
    if options.test_mode {
        let envelope = TestEnvelope {
            body,
            log: options.log.iter().map(|line| format!("{}\n", line)).collect(),
        };
        body = serde_json::to_string(&envelope)?;
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    if let Some(cookie) = options.set_cookie {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.append(header::SET_COOKIE, value);
        }
    }

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

    let mut built = Response::new(Body::from(body));
    *built.status_mut() = status;
    *built.headers_mut() = headers;
    Ok(built)
}

/// Answer a preflight request without running any script.
///
/// `Access-Control-Allow-Methods` lists the route's methods plus OPTIONS.
pub fn preflight(cors: &CorsPolicy, methods: &[Method]) -> Response {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers, cors);

    let mut allowed: Vec<&str> = Vec::with_capacity(methods.len() + 1);
    for method in methods.iter().chain(std::iter::once(&Method::OPTIONS)) {
        if !allowed.contains(&method.as_str()) {
            allowed.push(method.as_str());
        }
    }
    if let Ok(value) = HeaderValue::from_str(&allowed.join(", ")) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0usize));

    let mut response = Response::new(Body::empty());
    *response.headers_mut() = headers;
    response
}

fn apply_cors(headers: &mut HeaderMap, cors: &CorsPolicy) {
    set_header(headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, &cors.allow_origin);
    set_header(headers, header::ACCESS_CONTROL_REQUEST_HEADERS, &cors.request_headers);
    set_header(headers, header::ACCESS_CONTROL_ALLOW_HEADERS, &cors.allow_headers);
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(cors.max_age));
    if cors.allow_credentials {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}

fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if value.is_empty() {
        return;
    }
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "Skipping invalid CORS header value"),
    }
}

/// Copy script headers; arrays become repeated headers. `Content-Length` is
/// dropped and recomputed by the caller.
fn apply_script_headers(headers: &mut HeaderMap, script_headers: &Map<String, Value>) {
    for (name, value) in script_headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "Skipping invalid response header name");
            continue;
        };
        if name == header::CONTENT_LENGTH {
            continue;
        }

        let values: Vec<String> = match value {
            Value::Array(items) => items.iter().map(header_text).collect(),
            Value::Null => continue,
            other => vec![header_text(other)],
        };

        headers.remove(&name);
        for text in values {
            match HeaderValue::from_str(&text) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => warn!(header = %name, "Skipping invalid response header value"),
            }
        }
    }
}

fn header_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn script_response(value: Value) -> ScriptResponse {
        ScriptResponse::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_content_length_ignores_script_value() {
        let response = script_response(json!({
            "statusCode": 201,
            "headers": {"Content-Length": "9999", "X-Custom": ["a", "b"]},
            "body": "héllo"
        }));

        let built = assemble(response, AssembleOptions::default()).unwrap();
        assert_eq!(built.status(), StatusCode::CREATED);
        assert_eq!(built.headers()[header::CONTENT_LENGTH], "6");
        let custom: Vec<_> = built.headers().get_all("x-custom").iter().collect();
        assert_eq!(custom, vec!["a", "b"]);
        assert_eq!(body_of(built).await, "héllo");
    }

    #[tokio::test]
    async fn test_non_string_body_is_json_encoded() {
        let response = script_response(json!({"body": {"ok": true}}));
        let built = assemble(response, AssembleOptions::default()).unwrap();
        assert_eq!(built.status(), StatusCode::OK);
        assert_eq!(body_of(built).await, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_cors_applied_when_enabled_and_script_wins() {
        let cors = CorsPolicy {
            allow_credentials: true,
            ..CorsPolicy::default()
        };
        let response = script_response(json!({
            "headers": {"Access-Control-Allow-Origin": "https://app.example.com"},
            "body": ""
        }));

        let built = assemble(
            response,
            AssembleOptions {
                cors: Some(&cors),
                ..Default::default()
            },
        )
        .unwrap();
        let headers = built.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example.com");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[header::CONTENT_LENGTH], "0");

        let disabled = CorsPolicy {
            enabled: false,
            ..CorsPolicy::default()
        };
        let built = assemble(
            script_response(json!({})),
            AssembleOptions {
                cors: Some(&disabled),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(built.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn test_test_mode_envelope() {
        let log = vec!["first".to_string(), "second".to_string()];
        let built = assemble(
            script_response(json!({"body": "payload"})),
            AssembleOptions {
                test_mode: true,
                log: &log,
                ..Default::default()
            },
        )
        .unwrap();

        let length: usize = built.headers()[header::CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = body_of(built).await;
        assert_eq!(length, body.len());

        let envelope: TestEnvelope = serde_json::from_str(&body).unwrap();
        assert_eq!(envelope.body, "payload");
        assert_eq!(envelope.log, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_preflight_lists_route_methods_plus_options() {
        let response = preflight(&CorsPolicy::default(), &[Method::GET, Method::POST]);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
            "GET, POST, OPTIONS"
        );
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(body_of(response).await, "");
    }

    #[test]
    fn test_invalid_response_objects() {
        assert!(ScriptResponse::from_value(json!("nope")).is_err());

        let response = script_response(json!({"statusCode": 42}));
        assert!(matches!(
            assemble(response, AssembleOptions::default()),
            Err(GatewayError::Sandbox { .. })
        ));
    }
}
