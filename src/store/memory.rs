//! In-process store seeded from a YAML/JSON document.
//!
//! Every committing mutation emits one [`ChangeNotification`] per affected
//! aggregate after the write lock is released, so a subscriber that re-reads
//! on notification always observes the committed state.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::Store;
use crate::backends::Specifier;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{
    tables, Api, Call, ChangeAction, ChangeNotification, Endpoint, Environment, Host, Id, Library,
    RemoteEndpoint, Route, Transformation,
};

const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Names the sandbox defines itself; a call variable may not shadow them
const RESERVED_NAMES: &[&str] = &["AP", "request", "response", "session", "env", "console", "log"];

/// Stored form of an endpoint; calls reference remote endpoints by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub id: Id,
    pub api_id: Id,
    pub name: String,
    pub environment_id: Id,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub components: Vec<CallRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Id,
    pub position: i64,
    pub remote_endpoint_id: Id,
    #[serde(default)]
    pub endpoint_name_override: Option<String>,
    #[serde(default)]
    pub conditional: String,
    #[serde(default = "default_true")]
    pub conditional_positive: bool,
    #[serde(default)]
    pub before: Vec<Transformation>,
    #[serde(default)]
    pub after: Vec<Transformation>,
}

fn default_true() -> bool {
    true
}

/// Seed document loaded at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSeed {
    pub apis: Vec<Api>,
    pub hosts: Vec<Host>,
    pub environments: Vec<Environment>,
    pub libraries: Vec<Library>,
    pub remote_endpoints: Vec<RemoteEndpoint>,
    pub endpoints: Vec<EndpointRecord>,
}

#[derive(Default)]
struct StoreState {
    apis: BTreeMap<Id, Api>,
    hosts: BTreeMap<Id, Host>,
    environments: BTreeMap<Id, Environment>,
    libraries: BTreeMap<Id, Library>,
    remote_endpoints: BTreeMap<Id, RemoteEndpoint>,
    endpoints: BTreeMap<Id, EndpointRecord>,
}

fn action_for(existed: bool) -> ChangeAction {
    if existed {
        ChangeAction::Update
    } else {
        ChangeAction::Insert
    }
}

fn valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$');
    head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

impl StoreState {
    fn api(&self, api_id: Id) -> GatewayResult<&Api> {
        self.apis
            .get(&api_id)
            .ok_or_else(|| GatewayError::not_found(format!("api {}", api_id)))
    }

    fn notification(&self, table: &str, api_id: Id, target_id: Id, action: ChangeAction) -> ChangeNotification {
        let account_id = self.apis.get(&api_id).map(|api| api.account_id).unwrap_or_default();
        ChangeNotification::new(table, api_id, target_id, action).with_actor(account_id, 0)
    }

    fn resolve(&self, record: &EndpointRecord) -> GatewayResult<Endpoint> {
        let api = self.api(record.api_id)?;

        let environment = self
            .environments
            .get(&record.environment_id)
            .filter(|env| env.api_id == record.api_id)
            .ok_or_else(|| {
                GatewayError::config(format!(
                    "endpoint {} references environment {} outside api {}",
                    record.id, record.environment_id, record.api_id
                ))
            })?;

        let mut positions = BTreeSet::new();
        let mut names = BTreeSet::new();
        let mut components = Vec::with_capacity(record.components.len());
        for call in &record.components {
            if !positions.insert(call.position) {
                return Err(GatewayError::config(format!(
                    "endpoint {} has more than one call at position {}",
                    record.id, call.position
                )));
            }

            let remote = self.remote_endpoints.get(&call.remote_endpoint_id).ok_or_else(|| {
                GatewayError::config(format!(
                    "call {} references missing remote endpoint {}",
                    call.id, call.remote_endpoint_id
                ))
            })?;
            if remote.api_id != record.api_id {
                return Err(GatewayError::config(format!(
                    "remote endpoint {} belongs to api {}, not api {}",
                    remote.id, remote.api_id, record.api_id
                )));
            }

            let resolved = Call {
                id: call.id,
                position: call.position,
                remote_endpoint: remote.clone(),
                endpoint_name_override: call.endpoint_name_override.clone(),
                conditional: call.conditional.clone(),
                conditional_positive: call.conditional_positive,
                before: call.before.clone(),
                after: call.after.clone(),
            };

            let variable = resolved.variable_name().to_string();
            if !valid_variable_name(&variable) || RESERVED_NAMES.contains(&variable.as_str()) {
                return Err(GatewayError::config(format!(
                    "call {} cannot use {:?} as a script variable name",
                    call.id, variable
                )));
            }
            if !names.insert(variable.clone()) {
                return Err(GatewayError::config(format!(
                    "endpoint {} has more than one call named {:?}",
                    record.id, variable
                )));
            }

            components.push(resolved);
        }
        components.sort_by_key(|call| call.position);

        let hosts = self
            .hosts
            .values()
            .filter(|host| host.api_id == record.api_id)
            .map(|host| host.hostname.clone())
            .collect();

        Ok(Endpoint {
            id: record.id,
            api_id: record.api_id,
            name: record.name.clone(),
            script: record.script.clone(),
            cors: api.cors.clone(),
            routes: record.routes.clone(),
            components,
            environment: environment.clone(),
            hosts,
        })
    }

    fn put_api(&mut self, api: Api) -> GatewayResult<Vec<ChangeNotification>> {
        let existed = self.apis.insert(api.id, api.clone()).is_some();
        Ok(vec![self.notification(tables::APIS, api.id, api.id, action_for(existed))])
    }

    fn delete_api(&mut self, api_id: Id) -> GatewayResult<Vec<ChangeNotification>> {
        let notification = self.notification(tables::APIS, api_id, api_id, ChangeAction::Delete);
        self.apis
            .remove(&api_id)
            .ok_or_else(|| GatewayError::not_found(format!("api {}", api_id)))?;
        self.hosts.retain(|_, h| h.api_id != api_id);
        self.environments.retain(|_, e| e.api_id != api_id);
        self.libraries.retain(|_, l| l.api_id != api_id);
        self.remote_endpoints.retain(|_, r| r.api_id != api_id);
        self.endpoints.retain(|_, e| e.api_id != api_id);
        Ok(vec![notification])
    }

    fn put_host(&mut self, host: Host) -> GatewayResult<Vec<ChangeNotification>> {
        self.api(host.api_id)?;
        let existed = self.hosts.insert(host.id, host.clone()).is_some();
        Ok(vec![
            self.notification(tables::HOSTS, host.api_id, host.id, action_for(existed)),
            self.notification(tables::APIS, host.api_id, host.api_id, ChangeAction::Update),
        ])
    }

    fn delete_host(&mut self, host_id: Id) -> GatewayResult<Vec<ChangeNotification>> {
        let host = self
            .hosts
            .remove(&host_id)
            .ok_or_else(|| GatewayError::not_found(format!("host {}", host_id)))?;
        Ok(vec![
            self.notification(tables::HOSTS, host.api_id, host.id, ChangeAction::Delete),
            self.notification(tables::APIS, host.api_id, host.api_id, ChangeAction::Update),
        ])
    }

    fn put_environment(&mut self, environment: Environment) -> GatewayResult<Vec<ChangeNotification>> {
        self.api(environment.api_id)?;
        let (api_id, id) = (environment.api_id, environment.id);
        let existed = self.environments.insert(id, environment).is_some();
        Ok(vec![self.notification(tables::ENVIRONMENTS, api_id, id, action_for(existed))])
    }

    fn put_library(&mut self, library: Library) -> GatewayResult<Vec<ChangeNotification>> {
        self.api(library.api_id)?;
        let (api_id, id) = (library.api_id, library.id);
        let existed = self.libraries.insert(id, library).is_some();
        Ok(vec![self.notification(tables::LIBRARIES, api_id, id, action_for(existed))])
    }

    fn delete_library(&mut self, library_id: Id) -> GatewayResult<Vec<ChangeNotification>> {
        let library = self
            .libraries
            .remove(&library_id)
            .ok_or_else(|| GatewayError::not_found(format!("library {}", library_id)))?;
        Ok(vec![self.notification(tables::LIBRARIES, library.api_id, library.id, ChangeAction::Delete)])
    }

    fn put_remote_endpoint(&mut self, remote: RemoteEndpoint) -> GatewayResult<Vec<ChangeNotification>> {
        self.api(remote.api_id)?;
        Specifier::config(remote.kind, &remote.config)?;
        if !valid_variable_name(&remote.name) {
            return Err(GatewayError::config(format!(
                "remote endpoint codename {:?} is not a valid script variable name",
                remote.name
            )));
        }
        let (api_id, id) = (remote.api_id, remote.id);
        let existed = self.remote_endpoints.insert(id, remote).is_some();
        Ok(vec![self.notification(tables::REMOTE_ENDPOINTS, api_id, id, action_for(existed))])
    }

    fn delete_remote_endpoint(&mut self, remote_endpoint_id: Id) -> GatewayResult<Vec<ChangeNotification>> {
        let in_use = self
            .endpoints
            .values()
            .any(|e| e.components.iter().any(|c| c.remote_endpoint_id == remote_endpoint_id));
        if in_use {
            return Err(GatewayError::config(format!(
                "remote endpoint {} is still used by an endpoint",
                remote_endpoint_id
            )));
        }
        let remote = self
            .remote_endpoints
            .remove(&remote_endpoint_id)
            .ok_or_else(|| GatewayError::not_found(format!("remote endpoint {}", remote_endpoint_id)))?;
        Ok(vec![self.notification(
            tables::REMOTE_ENDPOINTS,
            remote.api_id,
            remote.id,
            ChangeAction::Delete,
        )])
    }

    fn put_endpoint(&mut self, record: EndpointRecord) -> GatewayResult<Vec<ChangeNotification>> {
        self.resolve(&record)?;
        let (api_id, id) = (record.api_id, record.id);
        let existed = self.endpoints.insert(id, record).is_some();
        Ok(vec![self
            .notification(tables::PROXY_ENDPOINTS, api_id, id, action_for(existed))
            .with_endpoint(id)])
    }

    fn delete_endpoint(&mut self, endpoint_id: Id) -> GatewayResult<Vec<ChangeNotification>> {
        let record = self
            .endpoints
            .remove(&endpoint_id)
            .ok_or_else(|| GatewayError::not_found(format!("endpoint {}", endpoint_id)))?;
        Ok(vec![self
            .notification(tables::PROXY_ENDPOINTS, record.api_id, record.id, ChangeAction::Delete)
            .with_endpoint(record.id)])
    }
}

/// Store implementation backed by process memory
pub struct MemoryStore {
    state: RwLock<StoreState>,
    feed: broadcast::Sender<ChangeNotification>,
    reads: AtomicUsize,
    read_delay: Mutex<Duration>,
    reply_delay: Mutex<Duration>,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(StoreState::default()),
            feed,
            reads: AtomicUsize::new(0),
            read_delay: Mutex::new(Duration::ZERO),
            reply_delay: Mutex::new(Duration::ZERO),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Build a store from a seed, validating every record in dependency order
    pub fn from_seed(seed: StoreSeed, feed_capacity: usize) -> GatewayResult<Self> {
        let store = Self::with_feed_capacity(feed_capacity);
        {
            let mut state = store.state.write();
            for api in seed.apis {
                state.put_api(api)?;
            }
            for host in seed.hosts {
                state.put_host(host)?;
            }
            for environment in seed.environments {
                state.put_environment(environment)?;
            }
            for library in seed.libraries {
                state.put_library(library)?;
            }
            for remote in seed.remote_endpoints {
                state.put_remote_endpoint(remote)?;
            }
            for endpoint in seed.endpoints {
                state.put_endpoint(endpoint)?;
            }
            info!(
                apis = state.apis.len(),
                endpoints = state.endpoints.len(),
                remote_endpoints = state.remote_endpoints.len(),
                "Loaded store seed"
            );
        }
        Ok(store)
    }

    /// Load a seed document; `.json` files are parsed as JSON, everything else as YAML
    pub async fn load_seed_file<P: AsRef<Path>>(path: P, feed_capacity: usize) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read store seed: {}", e)))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let seed: StoreSeed = if is_json {
            serde_json::from_str(&content)
                .map_err(|e| GatewayError::config(format!("Failed to parse store seed: {}", e)))?
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| GatewayError::config(format!("Failed to parse store seed: {}", e)))?
        };

        Self::from_seed(seed, feed_capacity)
    }

    fn commit<F>(&self, mutate: F) -> GatewayResult<()>
    where
        F: FnOnce(&mut StoreState) -> GatewayResult<Vec<ChangeNotification>>,
    {
        let notifications = {
            let mut state = self.state.write();
            mutate(&mut state)?
        };
        for notification in notifications {
            self.notify(notification);
        }
        Ok(())
    }

    /// Publish a notification on the change feed
    pub fn notify(&self, notification: ChangeNotification) {
        debug!(
            table = %notification.table,
            api_id = notification.api_id,
            target_id = notification.target_id,
            action = %notification.action,
            "Publishing change notification"
        );
        if self.feed.send(notification).is_err() {
            debug!("No change feed subscribers");
        }
    }

    pub fn put_api(&self, api: Api) -> GatewayResult<()> {
        self.commit(|state| state.put_api(api))
    }

    pub fn delete_api(&self, api_id: Id) -> GatewayResult<()> {
        self.commit(|state| state.delete_api(api_id))
    }

    pub fn put_host(&self, host: Host) -> GatewayResult<()> {
        self.commit(|state| state.put_host(host))
    }

    pub fn delete_host(&self, host_id: Id) -> GatewayResult<()> {
        self.commit(|state| state.delete_host(host_id))
    }

    pub fn put_environment(&self, environment: Environment) -> GatewayResult<()> {
        self.commit(|state| state.put_environment(environment))
    }

    pub fn put_library(&self, library: Library) -> GatewayResult<()> {
        self.commit(|state| state.put_library(library))
    }

    pub fn delete_library(&self, library_id: Id) -> GatewayResult<()> {
        self.commit(|state| state.delete_library(library_id))
    }

    /// Insert or replace a remote endpoint; an invalid backend configuration
    /// is rejected with a `Configuration` error
    pub fn put_remote_endpoint(&self, remote: RemoteEndpoint) -> GatewayResult<()> {
        self.commit(|state| state.put_remote_endpoint(remote))
    }

    pub fn delete_remote_endpoint(&self, remote_endpoint_id: Id) -> GatewayResult<()> {
        self.commit(|state| state.delete_remote_endpoint(remote_endpoint_id))
    }

    pub fn put_endpoint(&self, record: EndpointRecord) -> GatewayResult<()> {
        self.commit(|state| state.put_endpoint(record))
    }

    pub fn delete_endpoint(&self, endpoint_id: Id) -> GatewayResult<()> {
        self.commit(|state| state.delete_endpoint(endpoint_id))
    }

    /// Number of read operations served so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Delay applied to every read, simulating a remote database
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    /// Delay between taking a read snapshot and returning it, so a commit
    /// can land while the reader still holds the old data
    pub fn set_reply_delay(&self, delay: Duration) {
        *self.reply_delay.lock() = delay;
    }

    /// Make every read fail with a `Store` error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    async fn begin_read(&self) -> GatewayResult<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::store("store unavailable"));
        }
        Ok(())
    }

    async fn finish_read<T>(&self, result: GatewayResult<T>) -> GatewayResult<T> {
        let delay = *self.reply_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn endpoint(&self, endpoint_id: Id) -> GatewayResult<Endpoint> {
        self.begin_read().await?;
        let result = {
            let state = self.state.read();
            state
                .endpoints
                .get(&endpoint_id)
                .ok_or_else(|| GatewayError::not_found(format!("endpoint {}", endpoint_id)))
                .and_then(|record| state.resolve(record))
        };
        self.finish_read(result).await
    }

    async fn endpoints(&self) -> GatewayResult<Vec<Endpoint>> {
        self.begin_read().await?;
        let state = self.state.read();
        let mut endpoints = Vec::with_capacity(state.endpoints.len());
        for record in state.endpoints.values() {
            match state.resolve(record) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(err) => warn!(endpoint_id = record.id, error = %err, "Skipping unresolvable endpoint"),
            }
        }
        Ok(endpoints)
    }

    async fn libraries(&self, api_id: Id) -> GatewayResult<Vec<Library>> {
        self.begin_read().await?;
        let libraries: Vec<Library> = self
            .state
            .read()
            .libraries
            .values()
            .filter(|library| library.api_id == api_id)
            .cloned()
            .collect();
        self.finish_read(Ok(libraries)).await
    }

    async fn remote_endpoint(&self, remote_endpoint_id: Id) -> GatewayResult<RemoteEndpoint> {
        self.begin_read().await?;
        let state = self.state.read();
        state
            .remote_endpoints
            .get(&remote_endpoint_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("remote endpoint {}", remote_endpoint_id)))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BackendKind, CorsPolicy, PoolSizing};
    use axum::http::Method;
    use serde_json::json;

    fn seed() -> StoreSeed {
        StoreSeed {
            apis: vec![
                Api { id: 1, account_id: 10, name: "shop".to_string(), cors: CorsPolicy::default() },
                Api { id: 2, account_id: 20, name: "other".to_string(), cors: CorsPolicy::default() },
            ],
            hosts: vec![Host {
                id: 1,
                api_id: 1,
                name: "shop".to_string(),
                hostname: "shop.example.com".to_string(),
            }],
            environments: vec![Environment {
                id: 1,
                api_id: 1,
                name: "dev".to_string(),
                session_name: "session".to_string(),
                data: json!({"tier": "dev"}),
            }],
            libraries: vec![],
            remote_endpoints: vec![
                remote(1, 1, "users"),
                remote(2, 1, "orders"),
                remote(3, 2, "foreign"),
            ],
            endpoints: vec![EndpointRecord {
                id: 1,
                api_id: 1,
                name: "profile".to_string(),
                environment_id: 1,
                script: String::new(),
                routes: vec![Route::new("/profile", vec![Method::GET])],
                components: vec![call(2, 20, 2), call(1, 10, 1)],
            }],
        }
    }

    fn remote(id: Id, api_id: Id, name: &str) -> RemoteEndpoint {
        RemoteEndpoint {
            id,
            api_id,
            name: name.to_string(),
            kind: BackendKind::Http,
            config: json!({"url": "http://localhost:9/"}),
            pool: PoolSizing::default(),
        }
    }

    fn call(id: Id, position: i64, remote_endpoint_id: Id) -> CallRecord {
        CallRecord {
            id,
            position,
            remote_endpoint_id,
            endpoint_name_override: None,
            conditional: String::new(),
            conditional_positive: true,
            before: vec![],
            after: vec![],
        }
    }

    #[tokio::test]
    async fn test_endpoint_aggregate_is_resolved_and_ordered() {
        let store = MemoryStore::from_seed(seed(), 16).unwrap();
        let endpoint = store.endpoint(1).await.unwrap();

        let names: Vec<&str> = endpoint.components.iter().map(|c| c.variable_name()).collect();
        assert_eq!(names, vec!["users", "orders"]);
        assert_eq!(endpoint.hosts, vec!["shop.example.com".to_string()]);
        assert_eq!(endpoint.environment.data["tier"], "dev");
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_not_found() {
        let store = MemoryStore::from_seed(seed(), 16).unwrap();
        assert!(matches!(store.endpoint(99).await, Err(GatewayError::NotFound { .. })));
    }

    #[test]
    fn test_cross_api_call_rejected() {
        let store = MemoryStore::from_seed(seed(), 16).unwrap();
        let mut record = seed().endpoints.remove(0);
        record.components.push(call(3, 30, 3));

        let err = store.put_endpoint(record).unwrap_err();
        assert!(err.to_string().contains("belongs to api 2, not api 1"));
    }

    #[test]
    fn test_duplicate_positions_rejected() {
        let store = MemoryStore::from_seed(seed(), 16).unwrap();
        let mut record = seed().endpoints.remove(0);
        record.components = vec![call(1, 5, 1), call(2, 5, 2)];

        let err = store.put_endpoint(record).unwrap_err();
        assert!(err.to_string().contains("position 5"));
    }

    #[test]
    fn test_invalid_remote_config_surfaces_to_admin() {
        let store = MemoryStore::from_seed(seed(), 16).unwrap();
        let mut bad = remote(4, 1, "db");
        bad.kind = BackendKind::Postgres;
        bad.config = json!({"config": {"host": "localhost"}});

        let err = store.put_remote_endpoint(bad).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: Postgres config missing \"port\" key");
    }

    #[tokio::test]
    async fn test_mutations_emit_one_notification_each() {
        let store = MemoryStore::from_seed(seed(), 16).unwrap();
        let mut feed = store.subscribe();

        let mut record = seed().endpoints.remove(0);
        record.script = "response.body = 'x';".to_string();
        store.put_endpoint(record).unwrap();

        let notification = feed.recv().await.unwrap();
        assert_eq!(notification.table, tables::PROXY_ENDPOINTS);
        assert_eq!(notification.endpoint_id, 1);
        assert_eq!(notification.action, ChangeAction::Update);
        assert_eq!(notification.account_id, 10);
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_host_change_also_notifies_api() {
        let store = MemoryStore::from_seed(seed(), 16).unwrap();
        let mut feed = store.subscribe();

        store.delete_host(1).unwrap();

        assert_eq!(feed.recv().await.unwrap().table, tables::HOSTS);
        let api = feed.recv().await.unwrap();
        assert_eq!(api.table, tables::APIS);
        assert_eq!(api.target_id, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_reads() {
        let store = MemoryStore::from_seed(seed(), 16).unwrap();
        store.set_unavailable(true);
        assert!(matches!(store.endpoint(1).await, Err(GatewayError::Store { .. })));
    }

    #[test]
    fn test_reserved_variable_name_rejected() {
        let store = MemoryStore::from_seed(seed(), 16).unwrap();
        let mut record = seed().endpoints.remove(0);
        record.components[0].endpoint_name_override = Some("request".to_string());

        assert!(store.put_endpoint(record).is_err());
    }
}
