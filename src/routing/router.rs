//! # Router Module
//!
//! Maps an incoming (host, method, path) to the endpoint that serves it, using
//! a radix tree for path lookup.
//!
//! ## Rust Concepts Used
//!
//! - `matchit` crate provides the radix tree implementation for route matching
//! - `Arc<T>` lets in-flight requests keep using a router while a rebuilt one
//!   is swapped in
//! - `parking_lot::RwLock` guards the swap itself, held only long enough to
//!   clone the `Arc`
//!
//! ## Overlaps
//!
//! Several endpoints may register the same pattern. Bindings are kept in
//! registration order and the first whose methods accept the request wins.
//! Host filtering happens before path lookup, by picking the table for the
//! request's host. Patterns that the radix tree refuses (for example two different
//! parameter names at the same position) are logged and skipped.

use async_trait::async_trait;
use axum::http::Method;
use matchit::{Match, Router as RadixRouter};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::caching::invalidation::ChangeSubscriber;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{tables, ChangeNotification, Endpoint, Id, Route};
use crate::store::Store;

/// One endpoint's claim on a path pattern
#[derive(Debug, Clone)]
pub struct RouteBinding {
    pub endpoint_id: Id,
    pub endpoint_name: String,
    pub methods: Vec<Method>,
    pub handles_options: bool,
}

impl RouteBinding {
    fn new(endpoint: &Endpoint, route: &Route) -> Self {
        Self {
            endpoint_id: endpoint.id,
            endpoint_name: endpoint.name.clone(),
            methods: route.methods.clone(),
            handles_options: route.handles_options(),
        }
    }
}

/// How a matched request is to be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKind {
    /// Run the endpoint's pipeline
    Dispatch,
    /// Answer a CORS preflight for a route that does not handle OPTIONS
    /// itself; `methods` are the route's methods
    Preflight { methods: Vec<Method> },
}

/// Result of routing one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub endpoint_id: Id,
    pub endpoint_name: String,
    pub pattern: String,
    /// Path variables extracted by the pattern
    pub vars: BTreeMap<String, String>,
    pub kind: MatchKind,
}

struct PatternEntry {
    pattern: String,
    bindings: Vec<RouteBinding>,
}

/// One radix tree and the bindings behind each of its patterns
struct RouteTable {
    tree: RadixRouter<usize>,
    entries: Vec<PatternEntry>,
    index: HashMap<String, usize>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            tree: RadixRouter::new(),
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl RouteTable {
    fn insert(&mut self, pattern: &str, binding: RouteBinding) -> GatewayResult<()> {
        if let Some(&slot) = self.index.get(pattern) {
            self.entries[slot].bindings.push(binding);
            return Ok(());
        }

        let slot = self.entries.len();
        self.tree
            .insert(pattern.to_string(), slot)
            .map_err(|e| GatewayError::config(format!("Failed to add route {}: {}", pattern, e)))?;
        self.entries.push(PatternEntry {
            pattern: pattern.to_string(),
            bindings: vec![binding],
        });
        self.index.insert(pattern.to_string(), slot);
        Ok(())
    }

    fn lookup(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let Match { value: slot, params } = self.tree.at(path).ok()?;
        let entry = &self.entries[*slot];

        let (binding, kind) = match entry.bindings.iter().find(|b| b.methods.contains(method)) {
            Some(binding) => (binding, MatchKind::Dispatch),
            None if method == Method::OPTIONS => {
                let binding = entry.bindings.iter().find(|b| !b.handles_options)?;
                let methods = binding.methods.clone();
                (binding, MatchKind::Preflight { methods })
            }
            None => return None,
        };

        let vars = params
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        debug!(
            pattern = %entry.pattern,
            endpoint_id = binding.endpoint_id,
            kind = ?kind,
            "Matched route"
        );

        Some(RouteMatch {
            endpoint_id: binding.endpoint_id,
            endpoint_name: binding.endpoint_name.clone(),
            pattern: entry.pattern.clone(),
            vars,
            kind,
        })
    }
}

/// Immutable routing table built from endpoint registrations.
///
/// Every host named by some API gets its own table holding the bindings that
/// accept it: that host's endpoints plus the host-agnostic ones, in
/// registration order. Requests for any other host use the host-agnostic
/// table. A path a host's endpoints don't claim therefore falls through to a
/// host-agnostic pattern instead of missing.
pub struct RequestRouter {
    any_host: RouteTable,
    by_host: HashMap<String, RouteTable>,
    /// Successful host-agnostic registrations, replayed into host tables
    /// created later
    shared: Vec<(String, RouteBinding)>,
    patterns: Vec<String>,
}

impl Default for RequestRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRouter {
    pub fn new() -> Self {
        Self {
            any_host: RouteTable::default(),
            by_host: HashMap::new(),
            shared: Vec::new(),
            patterns: Vec::new(),
        }
    }

    /// Build a router from every endpoint, skipping routes that conflict
    pub fn from_endpoints(endpoints: &[Endpoint]) -> Self {
        let mut router = Self::new();
        let mut skipped = 0usize;
        for endpoint in endpoints {
            for route in &endpoint.routes {
                if let Err(err) = router.add_route(endpoint, route) {
                    skipped += 1;
                    warn!(
                        endpoint = %endpoint.name,
                        path = %route.path,
                        error = %err,
                        "Skipping route"
                    );
                }
            }
        }
        info!(
            patterns = router.patterns.len(),
            hosts = router.by_host.len(),
            endpoints = endpoints.len(),
            skipped,
            "Built request router"
        );
        router
    }

    /// Bind `route` of `endpoint`
    pub fn add_route(&mut self, endpoint: &Endpoint, route: &Route) -> GatewayResult<()> {
        if route.methods.is_empty() {
            return Err(GatewayError::config(format!(
                "route {} of endpoint {} has no methods",
                route.path, endpoint.name
            )));
        }

        let binding = RouteBinding::new(endpoint, route);

        if endpoint.hosts.is_empty() {
            self.any_host.insert(&route.path, binding.clone())?;
            for (host, table) in self.by_host.iter_mut() {
                if let Err(err) = table.insert(&route.path, binding.clone()) {
                    warn!(host = %host, endpoint = %endpoint.name, error = %err, "Route shadowed on host");
                }
            }
            self.shared.push((route.path.clone(), binding));
        } else {
            let mut first_err = None;
            let mut added = false;
            for host in &endpoint.hosts {
                let table = self.host_table(host);
                match table.insert(&route.path, binding.clone()) {
                    Ok(()) => added = true,
                    Err(err) => {
                        warn!(host = %host, endpoint = %endpoint.name, error = %err, "Route conflicts on host");
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                }
            }
            if let (false, Some(err)) = (added, first_err) {
                return Err(err);
            }
        }

        if !self.patterns.contains(&route.path) {
            self.patterns.push(route.path.clone());
        }
        Ok(())
    }

    fn host_table(&mut self, host: &str) -> &mut RouteTable {
        let shared = &self.shared;
        self.by_host.entry(host.to_ascii_lowercase()).or_insert_with(|| {
            let mut table = RouteTable::default();
            for (pattern, binding) in shared {
                if let Err(err) = table.insert(pattern, binding.clone()) {
                    warn!(host = %host, error = %err, "Route shadowed on host");
                }
            }
            table
        })
    }

    /// Route a request.
    ///
    /// An OPTIONS request on a route whose methods don't include OPTIONS
    /// becomes a preflight match; every other unmatched request is `None`.
    pub fn match_request(&self, method: &Method, host: Option<&str>, path: &str) -> Option<RouteMatch> {
        let table = host
            .map(|host| strip_port(host).to_ascii_lowercase())
            .and_then(|host| self.by_host.get(&host))
            .unwrap_or(&self.any_host);
        table.lookup(method, path)
    }

    /// Registered patterns, in registration order
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Drop a `:port` suffix from a Host header value
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Holds the live router and rebuilds it when routing data changes
pub struct RouterHandle {
    current: RwLock<Arc<RequestRouter>>,
    store: Arc<dyn Store>,
}

impl RouterHandle {
    pub async fn load(store: Arc<dyn Store>) -> GatewayResult<Self> {
        let endpoints = store.endpoints().await?;
        Ok(Self {
            current: RwLock::new(Arc::new(RequestRouter::from_endpoints(&endpoints))),
            store,
        })
    }

    pub fn current(&self) -> Arc<RequestRouter> {
        Arc::clone(&self.current.read())
    }

    /// Re-read every endpoint and swap in a freshly built router.
    ///
    /// On failure the previous router keeps serving.
    pub async fn rebuild(&self) -> GatewayResult<()> {
        let endpoints = self.store.endpoints().await?;
        let router = Arc::new(RequestRouter::from_endpoints(&endpoints));
        *self.current.write() = router;
        Ok(())
    }

    async fn rebuild_logged(&self, reason: &str) {
        if let Err(err) = self.rebuild().await {
            warn!(reason, error = %err, "Router rebuild failed, keeping previous routes");
        }
    }
}

/// Tables whose changes can alter routing
fn affects_routing(table: &str) -> bool {
    matches!(
        table,
        tables::PROXY_ENDPOINTS | tables::ROUTES | tables::APIS | tables::HOSTS
    )
}

#[async_trait]
impl ChangeSubscriber for RouterHandle {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn on_change(&self, notification: &ChangeNotification) {
        if affects_routing(&notification.table) {
            self.rebuild_logged(&notification.table).await;
        }
    }

    async fn on_feed_lagged(&self, _missed: u64) {
        self.rebuild_logged("feed lagged").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CorsPolicy, Environment};

    fn endpoint(id: Id, routes: Vec<Route>, hosts: Vec<&str>) -> Endpoint {
        Endpoint {
            id,
            api_id: 1,
            name: format!("endpoint{}", id),
            script: String::new(),
            cors: CorsPolicy::default(),
            routes,
            components: vec![],
            environment: Environment {
                id: 1,
                api_id: 1,
                name: "dev".to_string(),
                session_name: "session".to_string(),
                data: serde_json::Value::Null,
            },
            hosts: hosts.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn test_route_matching_with_vars() {
        let router = RequestRouter::from_endpoints(&[endpoint(
            1,
            vec![Route::new("/users/{id}", vec![Method::GET])],
            vec![],
        )]);

        let matched = router.match_request(&Method::GET, None, "/users/42").unwrap();
        assert_eq!(matched.endpoint_id, 1);
        assert_eq!(matched.kind, MatchKind::Dispatch);
        assert_eq!(matched.vars.get("id"), Some(&"42".to_string()));

        assert!(router.match_request(&Method::GET, None, "/orders/1").is_none());
    }

    #[test]
    fn test_method_not_allowed_is_miss() {
        let router = RequestRouter::from_endpoints(&[endpoint(
            1,
            vec![Route::new("/users", vec![Method::GET])],
            vec![],
        )]);
        assert!(router.match_request(&Method::DELETE, None, "/users").is_none());
    }

    #[test]
    fn test_options_becomes_preflight_unless_route_handles_it() {
        let router = RequestRouter::from_endpoints(&[
            endpoint(1, vec![Route::new("/a", vec![Method::GET, Method::POST])], vec![]),
            endpoint(2, vec![Route::new("/b", vec![Method::GET, Method::OPTIONS])], vec![]),
        ]);

        let a = router.match_request(&Method::OPTIONS, None, "/a").unwrap();
        assert_eq!(
            a.kind,
            MatchKind::Preflight {
                methods: vec![Method::GET, Method::POST]
            }
        );

        let b = router.match_request(&Method::OPTIONS, None, "/b").unwrap();
        assert_eq!(b.kind, MatchKind::Dispatch);
        assert_eq!(b.endpoint_id, 2);
    }

    #[test]
    fn test_first_registered_binding_wins() {
        let router = RequestRouter::from_endpoints(&[
            endpoint(1, vec![Route::new("/same", vec![Method::GET])], vec![]),
            endpoint(2, vec![Route::new("/same", vec![Method::GET, Method::POST])], vec![]),
        ]);

        assert_eq!(router.match_request(&Method::GET, None, "/same").unwrap().endpoint_id, 1);
        assert_eq!(router.match_request(&Method::POST, None, "/same").unwrap().endpoint_id, 2);
        assert_eq!(router.patterns(), vec!["/same".to_string()]);
    }

    #[test]
    fn test_conflicting_pattern_is_skipped() {
        let router = RequestRouter::from_endpoints(&[
            endpoint(1, vec![Route::new("/users/{id}", vec![Method::GET])], vec![]),
            endpoint(2, vec![Route::new("/users/{name}", vec![Method::GET])], vec![]),
        ]);

        assert_eq!(router.patterns(), vec!["/users/{id}".to_string()]);
        assert_eq!(router.match_request(&Method::GET, None, "/users/x").unwrap().endpoint_id, 1);
    }

    #[test]
    fn test_host_filtering() {
        let router = RequestRouter::from_endpoints(&[
            endpoint(1, vec![Route::new("/x", vec![Method::GET])], vec!["a.example.com"]),
            endpoint(2, vec![Route::new("/x", vec![Method::GET])], vec!["b.example.com"]),
        ]);

        let b = router
            .match_request(&Method::GET, Some("b.example.com:8080"), "/x")
            .unwrap();
        assert_eq!(b.endpoint_id, 2);
        assert_eq!(
            router.match_request(&Method::GET, Some("A.Example.com"), "/x").unwrap().endpoint_id,
            1
        );
        assert!(router.match_request(&Method::GET, Some("c.example.com"), "/x").is_none());
        assert!(router.match_request(&Method::GET, None, "/x").is_none());
    }

    #[test]
    fn test_host_rejection_falls_through_to_shared_pattern() {
        let router = RequestRouter::from_endpoints(&[
            endpoint(1, vec![Route::new("/items/featured", vec![Method::GET])], vec!["a.example.com"]),
            endpoint(2, vec![Route::new("/items/{id}", vec![Method::GET])], vec![]),
        ]);

        let own = router
            .match_request(&Method::GET, Some("a.example.com"), "/items/featured")
            .unwrap();
        assert_eq!(own.endpoint_id, 1);

        let other = router
            .match_request(&Method::GET, Some("b.example.com"), "/items/featured")
            .unwrap();
        assert_eq!(other.endpoint_id, 2);
        assert_eq!(other.vars.get("id"), Some(&"featured".to_string()));

        // Host-agnostic routes serve hosts that do have their own endpoints
        let shared = router
            .match_request(&Method::GET, Some("a.example.com"), "/items/7")
            .unwrap();
        assert_eq!(shared.endpoint_id, 2);
    }

    #[test]
    fn test_registration_order_holds_across_host_tables() {
        let router = RequestRouter::from_endpoints(&[
            endpoint(1, vec![Route::new("/same", vec![Method::GET])], vec![]),
            endpoint(2, vec![Route::new("/same", vec![Method::GET, Method::POST])], vec!["a.example.com"]),
        ]);

        let get = router.match_request(&Method::GET, Some("a.example.com"), "/same").unwrap();
        assert_eq!(get.endpoint_id, 1);
        let post = router.match_request(&Method::POST, Some("a.example.com"), "/same").unwrap();
        assert_eq!(post.endpoint_id, 2);
        assert!(router.match_request(&Method::POST, None, "/same").is_none());
    }

    #[test]
    fn test_wildcard_route() {
        let router = RequestRouter::from_endpoints(&[endpoint(
            1,
            vec![Route::new("/static/{*path}", vec![Method::GET])],
            vec![],
        )]);

        let matched = router
            .match_request(&Method::GET, None, "/static/css/site.css")
            .unwrap();
        assert_eq!(matched.vars.get("path"), Some(&"css/site.css".to_string()));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
    }
}
