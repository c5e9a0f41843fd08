//! Redis backends. A call request is one command as an argument list,
//! e.g. `{"arguments": ["HGETALL", "user:7"]}`.

use super::{bad_json, config_object, require_keys};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::BackendKind;
use redis::aio::MultiplexedConnection;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RedisSpecifier {
    pub url: String,
    pub timeout: Option<Duration>,
}

#[derive(Deserialize)]
struct RawRedisConfig {
    url: String,
    #[serde(default)]
    timeout: Option<u64>,
}

impl RedisSpecifier {
    pub fn from_config(raw: &Value) -> GatewayResult<Self> {
        let kind = BackendKind::Redis;
        let object = config_object(kind, raw)?;
        require_keys(kind, object, &["url"])?;

        let parsed: RawRedisConfig =
            serde_json::from_value(raw.clone()).map_err(|e| bad_json(kind, e))?;
        redis::Client::open(parsed.url.as_str()).map_err(|e| bad_json(kind, e))?;

        Ok(Self {
            url: parsed.url,
            timeout: parsed.timeout.map(Duration::from_secs),
        })
    }

    pub fn to_config(&self) -> Value {
        let mut config = json!({ "url": self.url });
        if let Some(timeout) = self.timeout {
            config["timeout"] = json!(timeout.as_secs());
        }
        config
    }

    pub async fn connect(&self) -> GatewayResult<MultiplexedConnection> {
        let client = redis::Client::open(self.url.as_str())?;
        Ok(client.get_multiplexed_async_connection().await?)
    }
}

pub(super) fn default_request() -> Value {
    json!({ "arguments": [] })
}

pub(super) async fn invoke(conn: &mut MultiplexedConnection, request: &Value) -> GatewayResult<Value> {
    let arguments = request
        .get("arguments")
        .and_then(Value::as_array)
        .filter(|args| !args.is_empty())
        .ok_or_else(|| GatewayError::backend("redis", "invalid request: expected non-empty \"arguments\""))?;

    let name = match &arguments[0] {
        Value::String(name) => name.clone(),
        other => {
            return Err(GatewayError::backend(
                "redis",
                format!("invalid request: command name must be a string, found {}", other),
            ))
        }
    };

    let mut cmd = redis::cmd(&name);
    for argument in &arguments[1..] {
        match argument {
            Value::String(s) => cmd.arg(s.as_str()),
            Value::Number(n) => cmd.arg(n.to_string()),
            Value::Bool(b) => cmd.arg(if *b { "1" } else { "0" }),
            other => cmd.arg(other.to_string()),
        };
    }

    let reply: redis::Value = cmd.query_async(conn).await?;
    Ok(json!({ "data": reply_to_json(reply) }))
}

fn reply_to_json(reply: redis::Value) -> Value {
    match reply {
        redis::Value::Nil => Value::Null,
        redis::Value::Int(i) => json!(i),
        redis::Value::Data(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Value::String(text),
            Err(err) => json!(err.into_bytes()),
        },
        redis::Value::Bulk(items) => Value::Array(items.into_iter().map(reply_to_json).collect()),
        redis::Value::Status(status) => Value::String(status),
        redis::Value::Okay => Value::String("OK".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_url_key() {
        let err = RedisSpecifier::from_config(&json!({})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: Redis config missing \"url\" key"
        );
    }

    #[test]
    fn test_invalid_url_rejected() {
        let err = RedisSpecifier::from_config(&json!({"url": "not a url"})).unwrap_err();
        assert!(err.to_string().contains("bad JSON for Redis config"));
    }

    #[test]
    fn test_reply_conversion() {
        let reply = redis::Value::Bulk(vec![
            redis::Value::Data(b"name".to_vec()),
            redis::Value::Int(3),
            redis::Value::Nil,
            redis::Value::Okay,
        ]);
        assert_eq!(reply_to_json(reply), json!(["name", 3, null, "OK"]));
    }
}
