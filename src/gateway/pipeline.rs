//! # Call Pipeline
//!
//! Runs an endpoint's components against a live sandbox, strictly one after
//! another in ascending position. For each call:
//!
//! 1. evaluate the conditional; a polarity mismatch skips the call and both of
//!    its transformation lists
//! 2. run the before-transformations
//! 3. send `<call>.request` to the backend through its connection pool
//! 4. store the outcome on `<call>.response`, or on `<call>.error` when the
//!    backend failed
//! 5. run the after-transformations
//!
//! Backend failures never abort the request. Script failures always do.
//!
//! The sandbox is not `Send`, so the pipeline runs on the sandbox's blocking
//! thread and drives each backend call to completion on the runtime handle.

use metrics::{counter, histogram};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::connection_pool::ConnectionPoolManager;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Call, RemoteEndpoint, Transformation};
use crate::observability::metrics as names;
use crate::sandbox::ScriptEngine;

/// Counters gathered while running one pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub calls_made: usize,
    pub calls_skipped: usize,
    pub calls_failed: usize,
    /// Wall time spent waiting on backends
    pub backend_time: Duration,
}

pub struct CallPipeline<'a> {
    pools: &'a ConnectionPoolManager,
    runtime: Handle,
    default_timeout: Duration,
    deadline: Instant,
    cancel: CancellationToken,
    log_prefix: &'a str,
}

impl<'a> CallPipeline<'a> {
    pub fn new(
        pools: &'a ConnectionPoolManager,
        runtime: Handle,
        default_timeout: Duration,
        deadline: Instant,
        cancel: CancellationToken,
        log_prefix: &'a str,
    ) -> Self {
        Self {
            pools,
            runtime,
            default_timeout,
            deadline,
            cancel,
            log_prefix,
        }
    }

    /// Run every call, returning once the last after-transformation finished.
    ///
    /// `stats` is updated as calls complete so the caller can report backend
    /// time even when a script error cuts the pipeline short.
    pub fn run(
        &self,
        engine: &mut dyn ScriptEngine,
        calls: &[Call],
        stats: &mut PipelineStats,
    ) -> GatewayResult<()> {
        let mut ordered: Vec<&Call> = calls.iter().collect();
        ordered.sort_by_key(|call| call.position);

        for call in ordered {
            let name = call.variable_name();

            if call.has_conditional() {
                let value = engine.eval_bool(&call.conditional)?;
                if value != call.conditional_positive {
                    debug!(
                        "{} [call] skipping {} (conditional {:?} is {})",
                        self.log_prefix, name, call.conditional, value
                    );
                    stats.calls_skipped += 1;
                    continue;
                }
            }

            self.transform(engine, name, "before", &call.before)?;

            if self.cancel.is_cancelled() {
                return Err(GatewayError::Cancelled {
                    backend: call.remote_endpoint.name.clone(),
                });
            }

            let request = engine.eval_json(&format!("{}.request", name))?;
            let started = Instant::now();
            let outcome = self.invoke(&call.remote_endpoint, &request);
            let elapsed = started.elapsed();
            stats.backend_time += elapsed;
            stats.calls_made += 1;

            histogram!(names::BACKEND_CALL_DURATION, "kind" => call.remote_endpoint.kind.label())
                .record(elapsed.as_secs_f64());

            match outcome {
                Ok(response) => {
                    engine.set_json(&format!("{}.response", name), &response)?;
                }
                Err(err) => {
                    counter!(names::BACKEND_CALL_ERRORS, "kind" => call.remote_endpoint.kind.label())
                        .increment(1);
                    info!(
                        "{} [call] {} failed after {:?}: {}",
                        self.log_prefix, name, elapsed, err
                    );
                    stats.calls_failed += 1;
                    engine.set_json(&format!("{}.error", name), &err.to_script_value())?;
                }
            }

            self.transform(engine, name, "after", &call.after)?;
        }

        Ok(())
    }

    fn transform(
        &self,
        engine: &mut dyn ScriptEngine,
        name: &str,
        phase: &str,
        steps: &[Transformation],
    ) -> GatewayResult<()> {
        for step in steps {
            engine.run(&format!("{} {} transformation {}", name, phase, step.id), &step.script)?;
        }
        Ok(())
    }

    /// Issue one backend call, bounded by its timeout, the request budget and
    /// client disconnect. Every failure comes back as an `Err` for the script.
    fn invoke(&self, remote: &RemoteEndpoint, request: &Value) -> GatewayResult<Value> {
        counter!(names::BACKEND_CALLS, "kind" => remote.kind.label()).increment(1);

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(GatewayError::Timeout { timeout_ms: 0 });
        }

        self.runtime.block_on(async {
            let work = async {
                let pool = self.pools.pool(remote).await?;
                let timeout = pool
                    .specifier()
                    .timeout()
                    .unwrap_or(self.default_timeout)
                    .min(remaining);

                let call = async {
                    let mut connection = pool.acquire().await?;
                    connection.invoke(request).await
                };
                match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(GatewayError::Cancelled {
                    backend: remote.name.clone(),
                }),
                result = work => result,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{PoolConfig, SandboxConfig};
    use crate::core::types::{BackendKind, PoolSizing};
    use crate::sandbox::ProxyVm;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote(id: i64, name: &str, url: String) -> RemoteEndpoint {
        RemoteEndpoint {
            id,
            api_id: 1,
            name: name.to_string(),
            kind: BackendKind::Http,
            config: json!({ "url": url }),
            pool: PoolSizing::default(),
        }
    }

    fn call(position: i64, remote: RemoteEndpoint) -> Call {
        Call {
            id: position,
            position,
            remote_endpoint: remote,
            endpoint_name_override: None,
            conditional: String::new(),
            conditional_positive: true,
            before: vec![],
            after: vec![],
        }
    }

    fn step(id: i64, script: &str) -> Transformation {
        Transformation {
            id,
            script: script.to_string(),
        }
    }

    fn vm_with_calls(calls: &[Call]) -> ProxyVm {
        let mut vm = ProxyVm::new(&SandboxConfig::default(), "[req test]").unwrap();
        vm.run("response", "var response = new AP.HTTP.Response();").unwrap();
        for call in calls {
            let url = call.remote_endpoint.config["url"].clone();
            vm.define_json(call.variable_name(), &json!({ "method": "GET", "url": url }))
                .unwrap();
            vm.run(
                call.variable_name(),
                &format!("{0} = new AP.Call({0});", call.variable_name()),
            )
            .unwrap();
        }
        vm
    }

    fn run_pipeline(
        calls: &[Call],
        vm: &mut ProxyVm,
        cancel: CancellationToken,
    ) -> GatewayResult<PipelineStats> {
        let pools = ConnectionPoolManager::new(Arc::new(MemoryStore::new()), PoolConfig::default());
        let runtime = Handle::current();
        let calls = calls.to_vec();
        let mut stats = PipelineStats::default();
        tokio::task::block_in_place(|| {
            let pipeline = CallPipeline::new(
                &pools,
                runtime,
                Duration::from_secs(5),
                Instant::now() + Duration::from_secs(10),
                cancel,
                "[req test]",
            );
            pipeline.run(vm, &calls, &mut stats)
        })?;
        Ok(stats)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transformations_wrap_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 9})))
            .expect(1)
            .mount(&server)
            .await;

        let mut users = call(1, remote(1, "users", format!("{}/users", server.uri())));
        users.before = vec![step(1, "users.request.method = 'POST'; users.request.body = {name: 'a'};")];
        users.after = vec![step(2, "response.setJSONBody({created: users.response.data.id});")];

        let mut vm = vm_with_calls(std::slice::from_ref(&users));
        let stats = run_pipeline(&[users], &mut vm, CancellationToken::new()).unwrap();

        assert_eq!(stats.calls_made, 1);
        assert_eq!(stats.calls_failed, 0);
        assert_eq!(vm.eval_json("users.response.statusCode").unwrap(), json!(201));
        assert_eq!(vm.eval_json("response.body").unwrap(), json!("{\"created\":9}"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_backend_failure_becomes_call_error() {
        let dead = remote(1, "dead", "http://127.0.0.1:9/unreachable".to_string());
        let mut failing = call(1, dead);
        failing.after = vec![step(1, "response.body = dead.error ? 'recovered' : 'no error';")];

        let mut vm = vm_with_calls(std::slice::from_ref(&failing));
        let stats = run_pipeline(&[failing], &mut vm, CancellationToken::new()).unwrap();

        assert_eq!(stats.calls_failed, 1);
        assert_eq!(vm.eval_json("dead.response").unwrap(), Value::Null);
        assert_eq!(vm.eval_json("response.body").unwrap(), json!("recovered"));
        assert!(vm.eval_json("dead.error.kind").unwrap().is_string());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_negative_polarity_runs_on_false() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut fallback = call(1, remote(1, "fallback", server.uri()));
        fallback.conditional = "request_ok".to_string();
        fallback.conditional_positive = false;

        let mut vm = vm_with_calls(std::slice::from_ref(&fallback));
        vm.define_json("request_ok", &json!(false)).unwrap();
        let stats = run_pipeline(&[fallback], &mut vm, CancellationToken::new()).unwrap();
        assert_eq!(stats.calls_made, 1);
        assert_eq!(stats.calls_skipped, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_request_stops_before_calling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let only = call(1, remote(1, "only", server.uri()));
        let mut vm = vm_with_calls(std::slice::from_ref(&only));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_pipeline(&[only], &mut vm, cancel).unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conditional_script_error_is_fatal() {
        let mut broken = call(1, remote(1, "broken", "http://127.0.0.1:9".to_string()));
        broken.conditional = "missing.value".to_string();

        let mut vm = vm_with_calls(std::slice::from_ref(&broken));
        let err = run_pipeline(&[broken], &mut vm, CancellationToken::new()).unwrap_err();
        assert!(matches!(err, GatewayError::Sandbox { .. }));
    }
}
