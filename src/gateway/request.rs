//! The read-only request snapshot handed to tenant scripts as `request`.

use axum::http::{header, request::Parts, HeaderMap, Method};
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::observability::RequestId;

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRequest {
    pub id: String,
    pub method: Method,
    pub uri: String,
    pub path: String,
    pub host: Option<String>,
    pub query: BTreeMap<String, String>,
    /// Header values, repeated headers joined with `", "`
    pub headers: BTreeMap<String, String>,
    /// Path variables captured by the matched route
    pub params: BTreeMap<String, String>,
    pub remote_addr: Option<SocketAddr>,
    /// Body decoded as UTF-8, invalid sequences replaced with U+FFFD
    pub body: String,
    /// Standard base64 of the raw body, present only when it is not UTF-8
    pub body_base64: Option<String>,
}

impl ProxyRequest {
    pub fn from_parts(
        parts: &Parts,
        body: &Bytes,
        request_id: &RequestId,
        params: BTreeMap<String, String>,
    ) -> Self {
        let remote_addr = parts
            .extensions
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        Self {
            id: request_id.as_str().to_string(),
            method: parts.method.clone(),
            uri: parts.uri.to_string(),
            path: parts.uri.path().to_string(),
            host: request_host(&parts.headers, parts.uri.host()),
            query: parts.uri.query().map(extract_query_params).unwrap_or_default(),
            headers: flatten_headers(&parts.headers),
            params,
            remote_addr,
            body: String::from_utf8_lossy(body).into_owned(),
            body_base64: std::str::from_utf8(body)
                .is_err()
                .then(|| general_purpose::STANDARD.encode(body)),
        }
    }

    pub fn to_script_value(&self) -> Value {
        json!({
            "id": self.id,
            "method": self.method.as_str(),
            "uri": self.uri,
            "path": self.path,
            "host": self.host,
            "query": self.query,
            "headers": self.headers,
            "params": self.params,
            "remoteAddress": self.remote_addr.map(|addr| addr.to_string()),
            "body": self.body,
            "bodyBase64": self.body_base64,
        })
    }
}

/// Host the client addressed, from the `Host` header or an absolute URI
pub fn request_host(headers: &HeaderMap, uri_host: Option<&str>) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or(uri_host)
        .map(str::to_string)
}

/// Decode a query string; later duplicates replace earlier ones
pub fn extract_query_params(query: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();

    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        if let Some((key, value)) = pair.split_once('=') {
            if let (Ok(decoded_key), Ok(decoded_value)) = (
                urlencoding::decode(&key.replace('+', " ")),
                urlencoding::decode(&value.replace('+', " ")),
            ) {
                params.insert(decoded_key.into_owned(), decoded_value.into_owned());
            }
        } else if let Ok(decoded_key) = urlencoding::decode(pair) {
            // Flags without a value, e.g. `?verbose`
            params.insert(decoded_key.into_owned(), String::new());
        }
    }

    params
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    flat
}
