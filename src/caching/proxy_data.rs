//! # Proxy Data Sources
//!
//! Where the request path reads configuration from. The passthrough source
//! hits the store on every request; the caching source keeps endpoint
//! aggregates and library lists in memory and reloads them when the change
//! feed says they are stale.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::coalescing::{CoalescingCache, RefreshOutcome};
use super::invalidation::{targets_for, ChangeSubscriber, InvalidationTarget};
use crate::core::error::GatewayResult;
use crate::core::types::{ChangeNotification, Endpoint, Id, Library};
use crate::store::Store;

#[async_trait]
pub trait ProxyDataSource: Send + Sync {
    async fn endpoint(&self, endpoint_id: Id) -> GatewayResult<Arc<Endpoint>>;

    async fn libraries(&self, api_id: Id) -> GatewayResult<Arc<Vec<Library>>>;
}

/// Reads straight from the store
pub struct PassthroughProxyDataSource {
    store: Arc<dyn Store>,
}

impl PassthroughProxyDataSource {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProxyDataSource for PassthroughProxyDataSource {
    async fn endpoint(&self, endpoint_id: Id) -> GatewayResult<Arc<Endpoint>> {
        self.store.endpoint(endpoint_id).await.map(Arc::new)
    }

    async fn libraries(&self, api_id: Id) -> GatewayResult<Arc<Vec<Library>>> {
        self.store.libraries(api_id).await.map(Arc::new)
    }
}

/// Serves aggregates from memory, loading each at most once per invalidation
pub struct CachingProxyDataSource {
    store: Arc<dyn Store>,
    endpoints: CoalescingCache<Id, Endpoint>,
    libraries: CoalescingCache<Id, Vec<Library>>,
}

impl CachingProxyDataSource {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            endpoints: CoalescingCache::new("endpoints"),
            libraries: CoalescingCache::new("libraries"),
        }
    }

    async fn refresh_endpoint(&self, endpoint_id: Id) -> RefreshOutcome {
        self.endpoints
            .refresh(endpoint_id, || self.store.endpoint(endpoint_id))
            .await
    }

    async fn refresh_libraries(&self, api_id: Id) -> RefreshOutcome {
        self.libraries
            .refresh(api_id, || self.store.libraries(api_id))
            .await
    }

    /// Reload every aggregate a notification affects
    pub async fn apply(&self, notification: &ChangeNotification) {
        for target in targets_for(notification) {
            match target {
                InvalidationTarget::Endpoint(id) => {
                    self.refresh_endpoint(id).await;
                }
                InvalidationTarget::EndpointsOfApi(api_id) => {
                    // A cold load for this API is not in `values` yet
                    self.endpoints.invalidate_loading();
                    for id in self.endpoints.keys_where(|endpoint| endpoint.api_id == api_id) {
                        self.refresh_endpoint(id).await;
                    }
                }
                InvalidationTarget::Libraries(api_id) => {
                    self.refresh_libraries(api_id).await;
                }
                InvalidationTarget::All => self.flush(),
            }
        }
    }

    /// Drop everything; the next request reloads from the store
    pub fn flush(&self) {
        let (endpoints, libraries) = (self.endpoints.len(), self.libraries.len());
        self.endpoints.clear();
        self.libraries.clear();
        info!(endpoints, libraries, "Flushed config cache");
    }

    pub fn cached_endpoints(&self) -> usize {
        self.endpoints.len()
    }
}

#[async_trait]
impl ProxyDataSource for CachingProxyDataSource {
    async fn endpoint(&self, endpoint_id: Id) -> GatewayResult<Arc<Endpoint>> {
        self.endpoints
            .get_or_load(endpoint_id, || self.store.endpoint(endpoint_id))
            .await
    }

    async fn libraries(&self, api_id: Id) -> GatewayResult<Arc<Vec<Library>>> {
        self.libraries
            .get_or_load(api_id, || self.store.libraries(api_id))
            .await
    }
}

#[async_trait]
impl ChangeSubscriber for CachingProxyDataSource {
    fn name(&self) -> &'static str {
        "config_cache"
    }

    async fn on_change(&self, notification: &ChangeNotification) {
        self.apply(notification).await;
    }

    async fn on_feed_lagged(&self, missed: u64) {
        warn!(missed, "Change feed lagged, flushing config cache");
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Api, CorsPolicy, Environment};
    use crate::store::{EndpointRecord, MemoryStore, StoreSeed};
    use serde_json::json;

    fn store() -> Arc<MemoryStore> {
        let seed = StoreSeed {
            apis: vec![Api {
                id: 1,
                account_id: 1,
                name: "api".to_string(),
                cors: CorsPolicy::default(),
            }],
            environments: vec![Environment {
                id: 1,
                api_id: 1,
                name: "dev".to_string(),
                session_name: "session".to_string(),
                data: json!({}),
            }],
            endpoints: vec![record("first")],
            ..Default::default()
        };
        Arc::new(MemoryStore::from_seed(seed, 16).unwrap())
    }

    fn record(script: &str) -> EndpointRecord {
        EndpointRecord {
            id: 1,
            api_id: 1,
            name: "e".to_string(),
            environment_id: 1,
            script: script.to_string(),
            routes: vec![],
            components: vec![],
        }
    }

    #[tokio::test]
    async fn test_passthrough_reads_every_time() {
        let store = store();
        let source = PassthroughProxyDataSource::new(store.clone());
        source.endpoint(1).await.unwrap();
        source.endpoint(1).await.unwrap();
        assert_eq!(store.reads(), 2);
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_reads_from_memory() {
        let store = store();
        let source = CachingProxyDataSource::new(store.clone());
        let a = source.endpoint(1).await.unwrap();
        let b = source.endpoint(1).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn test_notification_reloads_endpoint() {
        let store = store();
        let source = CachingProxyDataSource::new(store.clone());
        let mut feed = store.subscribe();

        let before = source.endpoint(1).await.unwrap();
        store.put_endpoint(record("second")).unwrap();
        source.apply(&feed.recv().await.unwrap()).await;

        let after = source.endpoint(1).await.unwrap();
        assert_eq!(before.script, "first");
        assert_eq!(after.script, "second");
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_previous_entry() {
        let store = store();
        let source = CachingProxyDataSource::new(store.clone());
        let mut feed = store.subscribe();

        source.endpoint(1).await.unwrap();
        store.put_endpoint(record("second")).unwrap();
        store.set_unavailable(true);
        source.apply(&feed.recv().await.unwrap()).await;

        assert_eq!(source.endpoint(1).await.unwrap().script, "first");
    }

    #[tokio::test]
    async fn test_deleted_endpoint_is_evicted() {
        let store = store();
        let source = CachingProxyDataSource::new(store.clone());
        let mut feed = store.subscribe();

        source.endpoint(1).await.unwrap();
        store.delete_endpoint(1).unwrap();
        source.apply(&feed.recv().await.unwrap()).await;

        assert_eq!(source.cached_endpoints(), 0);
        assert!(source.endpoint(1).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_environment_change_during_cold_load_is_not_lost() {
        let store = store();
        let source = Arc::new(CachingProxyDataSource::new(store.clone()));
        let mut feed = store.subscribe();

        store.set_reply_delay(std::time::Duration::from_millis(300));
        let cold = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.endpoint(1).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        store
            .put_environment(Environment {
                id: 1,
                api_id: 1,
                name: "dev".to_string(),
                session_name: "session".to_string(),
                data: json!({ "stage": "new" }),
            })
            .unwrap();
        source.apply(&feed.recv().await.unwrap()).await;

        // The in-flight load read the old environment
        let stale = cold.await.unwrap().unwrap();
        assert_eq!(stale.environment.data, json!({}));

        store.set_reply_delay(std::time::Duration::ZERO);
        let fresh = source.endpoint(1).await.unwrap();
        assert_eq!(fresh.environment.data["stage"], "new");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_during_cold_load_is_not_lost() {
        let store = store();
        let source = Arc::new(CachingProxyDataSource::new(store.clone()));

        store.set_reply_delay(std::time::Duration::from_millis(300));
        let cold = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.endpoint(1).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        store.put_endpoint(record("second")).unwrap();
        source.flush();

        assert_eq!(cold.await.unwrap().unwrap().script, "first");
        store.set_reply_delay(std::time::Duration::ZERO);
        assert_eq!(source.endpoint(1).await.unwrap().script, "second");
    }
}
