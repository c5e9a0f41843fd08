//! HTTP backends, driven with `reqwest`.

use super::{bad_json, config_object, require_keys};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::BackendKind;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpSpecifier {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Deserialize)]
struct RawHttpConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    query: BTreeMap<String, String>,
    #[serde(default)]
    timeout: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpSpecifier {
    pub fn from_config(raw: &Value) -> GatewayResult<Self> {
        let kind = BackendKind::Http;
        let object = config_object(kind, raw)?;
        require_keys(kind, object, &["url"])?;

        let parsed: RawHttpConfig =
            serde_json::from_value(raw.clone()).map_err(|e| bad_json(kind, e))?;

        let method = parsed.method.to_uppercase();
        Method::from_str(&method).map_err(|_| bad_json(kind, format!("invalid method {:?}", parsed.method)))?;
        reqwest::Url::parse(&parsed.url).map_err(|e| bad_json(kind, format!("invalid url: {}", e)))?;

        Ok(Self {
            url: parsed.url,
            method,
            headers: parsed.headers,
            query: parsed.query,
            timeout: parsed.timeout.map(Duration::from_secs),
        })
    }

    pub fn to_config(&self) -> Value {
        let mut config = json!({
            "url": self.url,
            "method": self.method,
            "headers": self.headers,
            "query": self.query,
        });
        if let Some(timeout) = self.timeout {
            config["timeout"] = json!(timeout.as_secs());
        }
        config
    }

    pub fn default_request(&self) -> Value {
        json!({
            "method": self.method,
            "url": self.url,
            "headers": self.headers,
            "query": self.query,
            "body": null,
        })
    }

    /// One client per pooled connection, each keeping at most one idle
    /// keep-alive socket per host.
    pub fn connect(&self) -> GatewayResult<reqwest::Client> {
        reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()
            .map_err(GatewayError::from)
    }
}

/// Request object as tenant scripts leave it after before-transformations
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HttpCallRequest {
    method: Option<String>,
    url: Option<String>,
    headers: Map<String, Value>,
    query: Map<String, Value>,
    body: Value,
}

pub(super) async fn invoke(
    client: &reqwest::Client,
    spec: &HttpSpecifier,
    request: &Value,
) -> GatewayResult<Value> {
    let call: HttpCallRequest = serde_json::from_value(request.clone())
        .map_err(|e| GatewayError::backend("http", format!("invalid request: {}", e)))?;

    let method_name = call.method.unwrap_or_else(|| spec.method.clone()).to_uppercase();
    let method = Method::from_str(&method_name)
        .map_err(|_| GatewayError::backend("http", format!("invalid method {:?}", method_name)))?;
    let url = call.url.unwrap_or_else(|| spec.url.clone());

    let mut headers = HeaderMap::new();
    for (name, value) in &spec.headers {
        insert_header(&mut headers, name, value)?;
    }
    for (name, value) in &call.headers {
        insert_header(&mut headers, name, &scalar_text(value))?;
    }

    let mut query: Vec<(String, String)> = spec
        .query
        .iter()
        .filter(|(k, _)| !call.query.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    query.extend(call.query.iter().map(|(k, v)| (k.clone(), scalar_text(v))));

    let mut builder = client.request(method, &url).query(&query);
    builder = match call.body {
        Value::Null => builder,
        Value::String(text) => builder.body(text),
        other => {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            builder.body(serde_json::to_vec(&other)?)
        }
    };

    let response = builder
        .headers(headers)
        .send()
        .await
        .map_err(|e| GatewayError::backend("http", e.to_string()))?;

    let status = response.status().as_u16();
    let response_headers = header_object(response.headers());
    let body = response
        .text()
        .await
        .map_err(|e| GatewayError::backend("http", e.to_string()))?;

    let mut result = json!({
        "statusCode": status,
        "headers": response_headers,
        "body": body,
    });
    if let Ok(data) = serde_json::from_str::<Value>(&body) {
        result["data"] = data;
    }
    Ok(result)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> GatewayResult<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| GatewayError::backend("http", format!("invalid header name {:?}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| GatewayError::backend("http", format!("invalid value for header {}: {}", name, e)))?;
    headers.insert(name, value);
    Ok(())
}

fn header_object(headers: &HeaderMap) -> Map<String, Value> {
    let mut object = Map::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        object.insert(name.as_str().to_string(), Value::String(joined));
    }
    object
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
