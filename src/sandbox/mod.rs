//! # Execution Sandbox
//!
//! Every proxied request runs its tenant logic in a sandbox built for that
//! request alone and dropped when the response is assembled. Nothing created
//! by one request's scripts is visible to another.
//!
//! ## Globals
//!
//! - `request`: the inbound request snapshot, deep-frozen
//! - `response`: an `AP.HTTP.Response` the scripts fill in
//! - `session`: an `AP.Session` scoped by the Environment's session name
//! - `env`: the Environment's data object
//! - one `AP.Call` per pipeline component, named after its remote endpoint
//! - `console` and `log`, writing to the per-request log
//!
//! Libraries of the endpoint's API load before the endpoint's own script.

pub mod session;
pub mod vm;

use serde_json::{json, Value};

use crate::backends::Specifier;
use crate::core::config::SandboxConfig;
use crate::core::error::GatewayResult;
use crate::core::types::{Call, Endpoint, Library};

pub use session::{cookie_value, SessionHandle, SessionStore};
pub use vm::ProxyVm;

/// What the call pipeline needs from a script engine
pub trait ScriptEngine {
    fn run(&mut self, label: &str, script: &str) -> GatewayResult<()>;

    fn eval_json(&mut self, expr: &str) -> GatewayResult<Value>;

    fn eval_bool(&mut self, expr: &str) -> GatewayResult<bool>;

    fn set_json(&mut self, target: &str, value: &Value) -> GatewayResult<()>;

    fn take_log(&mut self) -> Vec<String>;
}

impl ScriptEngine for ProxyVm {
    fn run(&mut self, label: &str, script: &str) -> GatewayResult<()> {
        ProxyVm::run(self, label, script)
    }

    fn eval_json(&mut self, expr: &str) -> GatewayResult<Value> {
        ProxyVm::eval_json(self, expr)
    }

    fn eval_bool(&mut self, expr: &str) -> GatewayResult<bool> {
        ProxyVm::eval_bool(self, expr)
    }

    fn set_json(&mut self, target: &str, value: &Value) -> GatewayResult<()> {
        ProxyVm::set_json(self, target, value)
    }

    fn take_log(&mut self) -> Vec<String> {
        ProxyVm::take_log(self)
    }
}

/// Everything a sandbox is built from
pub struct SandboxInput<'a> {
    pub request: &'a Value,
    pub endpoint: &'a Endpoint,
    pub libraries: &'a [Library],
    pub session: &'a SessionHandle,
    pub limits: &'a SandboxConfig,
    pub log_prefix: &'a str,
}

/// State read back from a sandbox once all scripts have run
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOutcome {
    pub response: Value,
    pub session_data: Value,
    pub log: Vec<String>,
}

pub struct ExecutionSandbox {
    vm: ProxyVm,
    log: Vec<String>,
}

impl ExecutionSandbox {
    /// Create the request's globals, load libraries, then run the endpoint
    /// script. Any script failure aborts construction.
    pub fn build(input: SandboxInput<'_>) -> GatewayResult<Self> {
        let mut vm = ProxyVm::new(input.limits, input.log_prefix)?;

        vm.define_frozen("request", input.request)?;
        vm.define_json("env", &input.endpoint.environment.data)?;
        vm.run("response", "var response = new AP.HTTP.Response();")?;
        vm.define_json("session", &input.session.script_value())?;
        vm.run(
            "session",
            "session = new AP.Session(session.name, session.id, session.data);",
        )?;

        for call in &input.endpoint.components {
            vm.define_json(call.variable_name(), &default_request(call))?;
            vm.run(
                call.variable_name(),
                &format!(
                    "{name} = new AP.Call({name});",
                    name = call.variable_name()
                ),
            )?;
        }

        for library in input.libraries {
            vm.run(&format!("library {}", library.name), &library.script)?;
        }
        vm.run(&format!("endpoint {}", input.endpoint.name), &input.endpoint.script)?;

        Ok(Self {
            vm,
            log: Vec::new(),
        })
    }

    pub fn engine(&mut self) -> &mut dyn ScriptEngine {
        &mut self.vm
    }

    /// Every tenant log line written so far
    pub fn log_so_far(&mut self) -> Vec<String> {
        self.log.extend(self.vm.take_log());
        self.log.clone()
    }

    /// Read back the response and session, consuming the sandbox
    pub fn finish(mut self) -> GatewayResult<SandboxOutcome> {
        let response = self.vm.eval_json("response")?;
        let session_data = self.vm.eval_json("session.data")?;
        let log = self.log_so_far();
        Ok(SandboxOutcome {
            response,
            session_data,
            log,
        })
    }
}

/// The request a call starts with before any transformation touches it
fn default_request(call: &Call) -> Value {
    Specifier::config(call.remote_endpoint.kind, &call.remote_endpoint.config)
        .map(|specifier| specifier.default_request())
        .unwrap_or_else(|_| json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        BackendKind, CorsPolicy, Environment, PoolSizing, RemoteEndpoint,
    };

    fn endpoint(script: &str, components: Vec<Call>) -> Endpoint {
        Endpoint {
            id: 1,
            api_id: 1,
            name: "widgets".to_string(),
            script: script.to_string(),
            cors: CorsPolicy::default(),
            routes: vec![],
            components,
            environment: Environment {
                id: 1,
                api_id: 1,
                name: "dev".to_string(),
                session_name: "sid".to_string(),
                data: json!({"region": "eu"}),
            },
            hosts: vec![],
        }
    }

    fn call(name: &str) -> Call {
        Call {
            id: 1,
            position: 0,
            remote_endpoint: RemoteEndpoint {
                id: 1,
                api_id: 1,
                name: name.to_string(),
                kind: BackendKind::Http,
                config: json!({"url": "http://backend.local/items", "method": "get"}),
                pool: PoolSizing::default(),
            },
            endpoint_name_override: None,
            conditional: String::new(),
            conditional_positive: true,
            before: vec![],
            after: vec![],
        }
    }

    fn session() -> SessionHandle {
        SessionHandle {
            environment_id: 1,
            name: "sid".to_string(),
            id: "abc".to_string(),
            data: json!({"visits": 1}),
            is_new: false,
        }
    }

    fn build(endpoint: &Endpoint, libraries: &[Library]) -> GatewayResult<ExecutionSandbox> {
        let request = json!({"method": "GET", "path": "/widgets", "params": {"id": "7"}});
        ExecutionSandbox::build(SandboxInput {
            request: &request,
            endpoint,
            libraries,
            session: &session(),
            limits: &SandboxConfig::default(),
            log_prefix: "[req test]",
        })
    }

    #[test]
    fn test_globals_and_script_order() {
        let libraries = vec![Library {
            id: 1,
            api_id: 1,
            name: "helpers".to_string(),
            script: "function greet(id) { return 'widget ' + id; }".to_string(),
        }];
        let endpoint = endpoint(
            "response.body = greet(request.params.id) + ' in ' + env.region; \
             session.set('visits', session.get('visits') + 1); \
             console.log('done');",
            vec![],
        );

        let outcome = build(&endpoint, &libraries).unwrap().finish().unwrap();
        assert_eq!(outcome.response["body"], json!("widget 7 in eu"));
        assert_eq!(outcome.response["statusCode"], json!(200));
        assert_eq!(outcome.session_data, json!({"visits": 2}));
        assert_eq!(outcome.log, vec!["done"]);
    }

    #[test]
    fn test_call_variables_start_with_default_request() {
        let endpoint = endpoint("", vec![call("items")]);
        let mut sandbox = build(&endpoint, &[]).unwrap();
        let engine = sandbox.engine();

        assert_eq!(engine.eval_json("items.request.method").unwrap(), json!("GET"));
        assert_eq!(
            engine.eval_json("items.request.url").unwrap(),
            json!("http://backend.local/items")
        );
        assert_eq!(engine.eval_json("items.response").unwrap(), Value::Null);
        assert_eq!(engine.eval_json("items.error").unwrap(), Value::Null);
    }

    #[test]
    fn test_script_error_aborts_build() {
        let endpoint = endpoint("throw new Error('boom');", vec![]);
        let err = build(&endpoint, &[]).err().unwrap();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_sandboxes_share_nothing() {
        let first = endpoint("var leaked = 1; response.body = 'first';", vec![]);
        build(&first, &[]).unwrap().finish().unwrap();

        let second = endpoint("response.body = typeof leaked;", vec![]);
        let outcome = build(&second, &[]).unwrap().finish().unwrap();
        assert_eq!(outcome.response["body"], json!("undefined"));
    }
}
