//! # Proxy VM
//!
//! A thin wrapper over one `boa_engine` [`Context`] holding a single request's
//! script state. Values enter and leave the engine as JSON text, so the rest
//! of the crate only ever deals in `serde_json::Value`.
//!
//! A `Context` is neither `Send` nor `Sync`; a `ProxyVm` must be created, used
//! and dropped on the same thread.

use boa_engine::{Context, JsValue, Source};
use serde_json::Value;
use tracing::debug;

use crate::core::config::SandboxConfig;
use crate::core::error::{GatewayError, GatewayResult};

const PRELUDE: &str = include_str!("prelude.js");

pub struct ProxyVm {
    context: Context,
    log_prefix: String,
}

impl ProxyVm {
    /// Fresh engine with runtime limits applied and the host prelude loaded
    pub fn new(limits: &SandboxConfig, log_prefix: impl Into<String>) -> GatewayResult<Self> {
        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(limits.loop_iteration_limit);
        context
            .runtime_limits_mut()
            .set_recursion_limit(limits.recursion_limit);

        let mut vm = Self {
            context,
            log_prefix: log_prefix.into(),
        };
        vm.run("prelude", PRELUDE)?;
        Ok(vm)
    }

    /// Evaluate a script; `label` names it in error messages
    pub fn run(&mut self, label: &str, script: &str) -> GatewayResult<()> {
        self.eval(label, script).map(|_| ())
    }

    fn eval(&mut self, label: &str, script: &str) -> GatewayResult<JsValue> {
        self.context
            .eval(Source::from_bytes(script))
            .map_err(|err| GatewayError::sandbox(format!("{}: {}", label, err)))
    }

    /// Evaluate `expr` and bring its value back as JSON.
    ///
    /// `undefined` and values `JSON.stringify` cannot represent come back as
    /// `null`.
    pub fn eval_json(&mut self, expr: &str) -> GatewayResult<Value> {
        let script = format!("JSON.stringify(({}))", expr);
        let value = self.eval(expr, &script)?;
        if value.is_undefined() || value.is_null() {
            return Ok(Value::Null);
        }
        let text = value
            .to_string(&mut self.context)
            .map_err(|err| GatewayError::sandbox(format!("{}: {}", expr, err)))?
            .to_std_string_escaped();
        Ok(serde_json::from_str(&text)?)
    }

    /// Truthiness of `expr` under JavaScript rules
    pub fn eval_bool(&mut self, expr: &str) -> GatewayResult<bool> {
        let script = format!("!!({}\n)", expr);
        Ok(self.eval(expr, &script)?.to_boolean())
    }

    /// Assign a JSON value to an existing binding or property path
    pub fn set_json(&mut self, target: &str, value: &Value) -> GatewayResult<()> {
        let script = format!("{} = {};", target, json_literal(value)?);
        self.run(target, &script)
    }

    /// Declare a global variable initialised from JSON
    pub fn define_json(&mut self, name: &str, value: &Value) -> GatewayResult<()> {
        let script = format!("var {} = {};", name, json_literal(value)?);
        self.run(name, &script)
    }

    /// Declare a global the script can read but not replace or mutate
    pub fn define_frozen(&mut self, name: &str, value: &Value) -> GatewayResult<()> {
        let script = format!(
            "Object.defineProperty(globalThis, {name:?}, {{ value: AP.__deepFreeze({json}), writable: false, configurable: false, enumerable: true }});",
            name = name,
            json = json_literal(value)?,
        );
        self.run(name, &script)
    }

    /// Drain everything written to the tenant log since the last call
    pub fn take_log(&mut self) -> Vec<String> {
        match self.eval_json("AP.__log.splice(0, AP.__log.length)") {
            Ok(Value::Array(lines)) => lines
                .into_iter()
                .map(|line| match line {
                    Value::String(line) => line,
                    other => other.to_string(),
                })
                .inspect(|line| debug!("{} [log] {}", self.log_prefix, line))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A JavaScript expression evaluating to `value`.
///
/// The JSON text is embedded as a string literal and parsed inside the
/// engine, so arbitrary content cannot escape into script syntax.
fn json_literal(value: &Value) -> GatewayResult<String> {
    let text = serde_json::to_string(value)?;
    Ok(format!("JSON.parse({})", serde_json::to_string(&text)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vm() -> ProxyVm {
        ProxyVm::new(&SandboxConfig::default(), "[req test]").unwrap()
    }

    #[test]
    fn test_json_round_trip_through_engine() {
        let mut vm = vm();
        vm.define_json("data", &json!({"a": [1, 2, {"b": "</script>\"'"}]}))
            .unwrap();
        vm.run("mutate", "data.a.push(3);").unwrap();
        assert_eq!(
            vm.eval_json("data").unwrap(),
            json!({"a": [1, 2, {"b": "</script>\"'"}, 3]})
        );
        assert_eq!(vm.eval_json("undefined").unwrap(), Value::Null);
    }

    #[test]
    fn test_frozen_global_cannot_change() {
        let mut vm = vm();
        vm.define_frozen("request", &json!({"headers": {"x": "1"}}))
            .unwrap();
        vm.run("attempt", "request.headers.x = '2'; request = null;")
            .unwrap();
        assert_eq!(vm.eval_json("request.headers.x").unwrap(), json!("1"));

        let strict = vm.run("strict", "'use strict'; request.headers.x = '3';");
        assert!(strict.is_err());
    }

    #[test]
    fn test_response_helpers() {
        let mut vm = vm();
        vm.run(
            "script",
            "var response = new AP.HTTP.Response(); response.setJSONBody({ok: true});",
        )
        .unwrap();
        assert_eq!(
            vm.eval_json("response").unwrap(),
            json!({
                "statusCode": 200,
                "headers": {"Content-Type": "application/json"},
                "body": "{\"ok\":true}"
            })
        );
    }

    #[test]
    fn test_console_output_is_collected() {
        let mut vm = vm();
        vm.run(
            "script",
            "console.log('hello', {a: 1}); console.error('bad'); log(42);",
        )
        .unwrap();
        assert_eq!(
            vm.take_log(),
            vec!["hello {\"a\":1}", "[error] bad", "42"]
        );
        assert!(vm.take_log().is_empty());
    }

    #[test]
    fn test_eval_bool_follows_truthiness() {
        let mut vm = vm();
        vm.define_json("user", &json!({"id": null})).unwrap();
        assert!(!vm.eval_bool("user.id != null").unwrap());
        assert!(vm.eval_bool("user").unwrap());
        assert!(!vm.eval_bool("''").unwrap());
    }

    #[test]
    fn test_script_errors_are_sandbox_errors() {
        let mut vm = vm();
        let err = vm.run("endpoint", "this is not javascript").unwrap_err();
        assert!(matches!(err, GatewayError::Sandbox { .. }));

        let err = vm.run("endpoint", "undefinedFunction()").unwrap_err();
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn test_runaway_loop_hits_limit() {
        let limits = SandboxConfig {
            loop_iteration_limit: 1_000,
            recursion_limit: 64,
            ..SandboxConfig::default()
        };
        let mut vm = ProxyVm::new(&limits, "[req test]").unwrap();
        assert!(vm.run("loop", "while (true) {}").is_err());
        assert!(vm.run("recurse", "function f() { return f(); } f();").is_err());
    }
}
