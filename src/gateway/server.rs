//! # HTTP Server Module
//!
//! The proxy listener. Every path and method lands on one catch-all handler;
//! the route-matching middleware has already resolved the endpoint by then.
//!
//! ## Request Flow
//!
//! 1. access logging assigns the request id
//! 2. route matching attaches a [`RouteMatch`] or answers 404
//! 3. the handler loads the endpoint and libraries from the data source
//! 4. preflight matches are answered directly; everything else is executed in
//!    a fresh sandbox on a blocking worker thread
//! 5. the sandbox's `response` is assembled into the HTTP response
//!
//! ## Rust Concepts Used
//!
//! - `Arc<T>` for sharing services across handler tasks
//! - `tokio::task::spawn_blocking` because the script engine is not `Send`
//! - `CancellationToken::drop_guard` so a dropped handler future (client
//!   disconnect) stops the pipeline from issuing further backend calls

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, request::Parts},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::any,
    Router as AxumRouter,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::caching::{
    CachingProxyDataSource, ChangeListener, ChangeSubscriber, PassthroughProxyDataSource,
    ProxyDataSource,
};
use crate::core::config::GatewayConfig;
use crate::core::connection_pool::ConnectionPoolManager;
use crate::core::error::{GatewayError, GatewayResult, HttpError};
use crate::core::types::{ChangeNotification, Endpoint, Library};
use crate::gateway::pipeline::{CallPipeline, PipelineStats};
use crate::gateway::request::ProxyRequest;
use crate::gateway::response::{assemble, preflight, AssembleOptions, ScriptResponse};
use crate::middleware::{access_log, match_route, RequestLoggingMiddleware};
use crate::observability::RequestId;
use crate::routing::{MatchKind, RouteMatch, RouterHandle};
use crate::sandbox::{
    cookie_value, ExecutionSandbox, SandboxInput, SandboxOutcome, SessionHandle, SessionStore,
};
use crate::store::Store;

/// Process-wide state shared by every request handler
#[derive(Clone)]
pub struct ProxyServices {
    inner: Arc<ServicesInner>,
}

struct ServicesInner {
    config: GatewayConfig,
    data: Arc<dyn ProxyDataSource>,
    cache: Option<Arc<CachingProxyDataSource>>,
    pools: ConnectionPoolManager,
    sessions: SessionStore,
    router: Arc<RouterHandle>,
    feed: Mutex<Option<broadcast::Receiver<ChangeNotification>>>,
}

impl ProxyServices {
    /// Build every shared component and the initial router.
    ///
    /// The change feed is subscribed before anything is loaded so no
    /// notification committed during startup is missed.
    pub async fn new(config: GatewayConfig, store: Arc<dyn Store>) -> GatewayResult<Self> {
        let feed = store.subscribe();

        let cache = config
            .proxy
            .cache_apis
            .then(|| Arc::new(CachingProxyDataSource::new(store.clone())));
        let data: Arc<dyn ProxyDataSource> = match &cache {
            Some(cache) => cache.clone(),
            None => Arc::new(PassthroughProxyDataSource::new(store.clone())),
        };

        let pools = ConnectionPoolManager::new(store.clone(), config.pools.clone());
        let router = Arc::new(RouterHandle::load(store).await?);
        let sessions = SessionStore::new(config.sandbox.session_ttl);

        info!(
            cache_apis = config.proxy.cache_apis,
            dev_mode = config.proxy.dev_mode,
            routes = router.current().patterns().len(),
            "Proxy services ready"
        );

        Ok(Self {
            inner: Arc::new(ServicesInner {
                config,
                data,
                cache,
                pools,
                sessions,
                router,
                feed: Mutex::new(Some(feed)),
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn data(&self) -> &Arc<dyn ProxyDataSource> {
        &self.inner.data
    }

    pub fn pools(&self) -> &ConnectionPoolManager {
        &self.inner.pools
    }

    pub fn router(&self) -> &RouterHandle {
        &self.inner.router
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    /// Components that react to change notifications, in delivery order
    pub fn subscribers(&self) -> Vec<Arc<dyn ChangeSubscriber>> {
        let mut subscribers: Vec<Arc<dyn ChangeSubscriber>> = Vec::new();
        if let Some(cache) = &self.inner.cache {
            subscribers.push(cache.clone());
        }
        subscribers.push(self.inner.router.clone());
        subscribers.push(Arc::new(self.inner.pools.clone()));
        subscribers
    }

    /// Start consuming the change feed. Only the first call spawns a
    /// listener.
    pub fn spawn_change_listener(&self) -> Option<JoinHandle<()>> {
        let feed = self.inner.feed.lock().take()?;
        Some(ChangeListener::new(self.subscribers()).spawn(feed))
    }

    /// Purge expired sessions on a fixed interval
    pub fn spawn_session_purger(&self, every: Duration) -> JoinHandle<()> {
        let services = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                services.sessions().purge_expired();
            }
        })
    }

    /// Resolve and execute one matched request
    async fn serve(
        &self,
        parts: &Parts,
        body: Body,
        request_id: &RequestId,
        route: RouteMatch,
        stats: &mut PipelineStats,
    ) -> GatewayResult<Response> {
        let prefix = request_id.log_prefix();
        let endpoint = self.data().endpoint(route.endpoint_id).await?;
        info!("{} [route] {}", prefix, endpoint.name);

        if let MatchKind::Preflight { methods } = &route.kind {
            debug!("{} [preflight] {}", prefix, route.pattern);
            return Ok(preflight(&endpoint.cors, methods));
        }

        let libraries = self.data().libraries(endpoint.api_id).await?;
        let proxy = &self.config().proxy;
        let body = axum::body::to_bytes(body, proxy.max_body_size)
            .await
            .map_err(|e| GatewayError::internal(format!("failed to read request body: {}", e)))?;

        let snapshot = ProxyRequest::from_parts(parts, &body, request_id, route.vars).to_script_value();
        let cookies = parts
            .headers
            .get(header::COOKIE)
            .and_then(|value| value.to_str().ok());
        let environment = &endpoint.environment;
        let mut session = self
            .sessions()
            .open(environment.id, &environment.session_name, cookies);
        let test_mode = proxy.enable_test_mode && parts.headers.contains_key(proxy.test_mode_header.as_str());

        let cancel = CancellationToken::new();
        let _disconnect = cancel.clone().drop_guard();

        let job = ExecutionJob {
            endpoint: endpoint.clone(),
            libraries,
            request: snapshot,
            session: session.clone(),
            services: self.clone(),
            runtime: Handle::current(),
            deadline: Instant::now() + proxy.request_budget,
            cancel: cancel.clone(),
            prefix,
        };

        let execution = tokio::time::timeout(
            proxy.request_budget,
            tokio::task::spawn_blocking(move || job.execute()),
        )
        .await;

        let (outcome, job_stats) = match execution {
            Ok(Ok(done)) => done,
            Ok(Err(join_error)) => {
                return Err(GatewayError::internal(format!("sandbox worker failed: {}", join_error)));
            }
            Err(_) => {
                cancel.cancel();
                return Err(GatewayError::Timeout {
                    timeout_ms: proxy.request_budget.as_millis() as u64,
                });
            }
        };
        *stats = job_stats;
        let outcome = outcome?;

        let response = ScriptResponse::from_value(outcome.response)?;
        let set_cookie = self.keep_session(&mut session, outcome.session_data);

        assemble(
            response,
            AssembleOptions {
                cors: Some(&endpoint.cors),
                test_mode,
                log: &outcome.log,
                set_cookie,
            },
        )
    }

    /// Persist a session the script used; returns the cookie for new ones
    fn keep_session(&self, session: &mut SessionHandle, data: Value) -> Option<String> {
        let empty = data.as_object().map_or(true, |object| object.is_empty());
        if session.is_new && empty {
            return None;
        }
        session.data = data;
        self.sessions().save(session);
        session.is_new.then(|| session.set_cookie())
    }
}

/// Owned inputs of one sandbox execution, moved onto a blocking thread
struct ExecutionJob {
    endpoint: Arc<Endpoint>,
    libraries: Arc<Vec<Library>>,
    request: Value,
    session: SessionHandle,
    services: ProxyServices,
    runtime: Handle,
    deadline: Instant,
    cancel: CancellationToken,
    prefix: String,
}

impl ExecutionJob {
    fn execute(self) -> (GatewayResult<SandboxOutcome>, PipelineStats) {
        let mut stats = PipelineStats::default();
        let config = self.services.config();

        let outcome = ExecutionSandbox::build(SandboxInput {
            request: &self.request,
            endpoint: &self.endpoint,
            libraries: &self.libraries,
            session: &self.session,
            limits: &config.sandbox,
            log_prefix: &self.prefix,
        })
        .and_then(|mut sandbox| {
            let pipeline = CallPipeline::new(
                self.services.pools(),
                self.runtime.clone(),
                config.proxy.http_timeout,
                self.deadline,
                self.cancel.clone(),
                &self.prefix,
            );
            pipeline.run(sandbox.engine(), &self.endpoint.components, &mut stats)?;
            sandbox.finish()
        });

        (outcome, stats)
    }
}

/// Catch-all proxy handler
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn proxy_handler(State(services): State<ProxyServices>, request: Request) -> Response {
    let started = Instant::now();
    let (mut parts, body) = request.into_parts();
    let request_id = parts
        .extensions
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(RequestId::generate);
    let prefix = request_id.log_prefix();
    let dev_mode = services.config().proxy.dev_mode;

    let mut stats = PipelineStats::default();
    let result = match parts.extensions.remove::<RouteMatch>() {
        Some(route) => {
            services
                .serve(&parts, body, &request_id, route, &mut stats)
                .await
        }
        None => Err(GatewayError::RoutingMiss {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
        }),
    };

    let response = match result {
        Ok(response) => response,
        Err(error) => {
            let error = HttpError::new(error, dev_mode);
            info!("{} [error] {}", prefix, error.summary());
            error.into_response()
        }
    };

    log_duration(&prefix, started.elapsed(), &stats);
    response
}

fn log_duration(prefix: &str, total: Duration, stats: &PipelineStats) {
    let requests = stats.backend_time;
    let processing = total.saturating_sub(requests);
    info!(
        calls_made = stats.calls_made,
        calls_skipped = stats.calls_skipped,
        calls_failed = stats.calls_failed,
        "{} [time] {:?} (processing {:?}, requests {:?})",
        prefix,
        total,
        processing,
        requests
    );
}

/// The proxy application: catch-all routes behind access logging and route
/// matching
pub fn build_app(services: ProxyServices) -> GatewayResult<AxumRouter> {
    let logger = Arc::new(RequestLoggingMiddleware::new(
        &services.config().proxy.request_id_header,
    )?);

    Ok(AxumRouter::new()
        .route("/", any(proxy_handler))
        .route("/*path", any(proxy_handler))
        .layer(from_fn_with_state(services.clone(), match_route))
        .layer(from_fn_with_state(logger, access_log))
        .with_state(services))
}

pub struct GatewayServer {
    services: ProxyServices,
    app: AxumRouter,
}

impl GatewayServer {
    pub fn new(services: ProxyServices) -> GatewayResult<Self> {
        let app = build_app(services.clone())?;
        Ok(Self { services, app })
    }

    pub fn services(&self) -> &ProxyServices {
        &self.services
    }

    pub fn bind_addr(&self) -> GatewayResult<SocketAddr> {
        let proxy = &self.services.config().proxy;
        format!("{}:{}", proxy.host, proxy.port)
            .parse()
            .map_err(|e| GatewayError::config(format!("invalid proxy address: {}", e)))
    }

    /// Serve until `shutdown` resolves, then retire every backend pool
    #[instrument(skip_all)]
    pub async fn start<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.bind_addr()?;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind proxy server to {}: {}", bind_addr, e))
        })?;

        let listener_task = self.services.spawn_change_listener();
        let purger = self.services.spawn_session_purger(Duration::from_secs(60));

        info!("Proxy server listening on {}", bind_addr);
        let served = axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        purger.abort();
        if let Some(task) = listener_task {
            task.abort();
        }
        self.services.pools().shutdown();
        info!("Proxy server stopped");

        served.map_err(|e| GatewayError::internal(format!("Proxy server error: {}", e)))
    }
}
