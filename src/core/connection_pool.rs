//! # Connection Pool Module
//!
//! Lazily created, per-remote-endpoint connection pools.
//!
//! ## Rust Concepts Used
//!
//! - `DashMap` for the registry of pools keyed by remote endpoint id
//! - `tokio::sync::Semaphore` permits for the max-open bound; an idle
//!   connection keeps its permit so idle plus checked-out never exceeds it
//! - `tokio::sync::watch` to let callers wait on an in-progress rebuild
//! - `Drop` on [`PooledConnection`] to hand connections back to their pool
//!
//! ## Rebuilds
//!
//! A change to a remote endpoint marks its slot as rebuilding and re-reads the
//! store in the background. `get` waits up to `rebuild_wait` for the new pool
//! and otherwise keeps serving from the old one. The old pool is retired once
//! the new one is installed: idle connections close immediately and
//! connections still checked out close when they are returned. A caller that
//! picked up the old pool before the swap can still check out of it; it gets
//! a fresh connection that is closed on return.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backends::{Connection, Specifier};
use crate::caching::invalidation::ChangeSubscriber;
use crate::core::config::PoolConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{tables, ChangeAction, ChangeNotification, Id, PoolSizing, RemoteEndpoint};
use crate::observability::metrics as names;
use crate::store::Store;

struct IdleConnection {
    connection: Connection,
    idle_since: Instant,
    permit: OwnedSemaphorePermit,
}

/// Pool of connections to one remote endpoint
pub struct BackendPool {
    remote_endpoint_id: Id,
    name: String,
    specifier: Specifier,
    sizing: PoolSizing,
    generation: u64,
    idle: Mutex<VecDeque<IdleConnection>>,
    permits: Arc<Semaphore>,
    returned: Notify,
    retired: AtomicBool,
    acquire_timeout: Duration,
    idle_timeout: Duration,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub generation: u64,
    pub idle: usize,
    pub open: usize,
    pub max_open: usize,
    pub retired: bool,
}

impl BackendPool {
    /// Validate the remote endpoint's configuration and create an empty pool
    pub fn new(remote: &RemoteEndpoint, config: &PoolConfig, generation: u64) -> GatewayResult<Self> {
        let specifier = Specifier::config(remote.kind, &remote.config)?;
        let max_open = remote.pool.max_open.max(1);

        Ok(Self {
            remote_endpoint_id: remote.id,
            name: remote.name.clone(),
            specifier,
            sizing: PoolSizing {
                max_open,
                max_idle: remote.pool.max_idle.min(max_open),
            },
            generation,
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(max_open)),
            returned: Notify::new(),
            retired: AtomicBool::new(false),
            acquire_timeout: config.acquire_timeout,
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn specifier(&self) -> &Specifier {
        &self.specifier
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check out a connection, reusing an idle one when possible.
    ///
    /// Waits up to the acquire timeout for capacity and fails with
    /// `PoolExhausted` after that. A retired pool never reuses idle
    /// connections.
    pub async fn acquire(self: &Arc<Self>) -> GatewayResult<PooledConnection> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.acquire_timeout;

        loop {
            let returned = self.returned.notified();

            if self.retired.load(Ordering::Acquire) {
                self.idle.lock().clear();
            } else if let Some(idle) = self.pop_idle() {
                counter!(names::POOL_CONNECTIONS_REUSED).increment(1);
                debug!(remote_endpoint = %self.name, "Reusing idle connection");
                return Ok(self.checked_out(idle.connection, idle.permit));
            }

            tokio::select! {
                permit = self.permits.clone().acquire_owned() => {
                    let permit = permit.map_err(|_| GatewayError::internal("pool semaphore closed"))?;
                    let connection = self.specifier.connect().await?;
                    counter!(names::POOL_CONNECTIONS_CREATED).increment(1);
                    debug!(
                        remote_endpoint = %self.name,
                        generation = self.generation,
                        "Opened new backend connection"
                    );
                    return Ok(self.checked_out(connection, permit));
                }
                _ = returned => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    counter!(names::POOL_EXHAUSTED).increment(1);
                    warn!(
                        remote_endpoint = %self.name,
                        max_open = self.sizing.max_open,
                        "Connection pool exhausted"
                    );
                    return Err(GatewayError::PoolExhausted {
                        backend: self.name.clone(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }
    }

    fn checked_out(self: &Arc<Self>, connection: Connection, permit: OwnedSemaphorePermit) -> PooledConnection {
        PooledConnection {
            connection: Some(connection),
            permit: Some(permit),
            pool: Arc::clone(self),
            broken: false,
        }
    }

    fn pop_idle(&self) -> Option<IdleConnection> {
        let mut idle = self.idle.lock();
        while let Some(candidate) = idle.pop_front() {
            if candidate.idle_since.elapsed() <= self.idle_timeout {
                return Some(candidate);
            }
            debug!(remote_endpoint = %self.name, "Closing expired idle connection");
        }
        None
    }

    fn release(&self, connection: Connection, permit: OwnedSemaphorePermit) {
        if self.retired.load(Ordering::Acquire) {
            return;
        }
        {
            let mut idle = self.idle.lock();
            if idle.len() >= self.sizing.max_idle {
                return;
            }
            idle.push_back(IdleConnection {
                connection,
                idle_since: Instant::now(),
                permit,
            });
        }
        self.returned.notify_one();
    }

    /// Stop handing out connections and close the idle ones
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        let closed = {
            let mut idle = self.idle.lock();
            let count = idle.len();
            idle.clear();
            count
        };
        info!(
            remote_endpoint_id = self.remote_endpoint_id,
            generation = self.generation,
            closed_idle = closed,
            "Retired connection pool"
        );
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            generation: self.generation,
            idle: self.idle.lock().len(),
            open: self.sizing.max_open - self.permits.available_permits(),
            max_open: self.sizing.max_open,
            retired: self.retired.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool")
            .field("remote_endpoint_id", &self.remote_endpoint_id)
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("sizing", &self.sizing)
            .finish()
    }
}

/// A checked-out connection; returns to its pool when dropped.
///
/// A connection dropped in the middle of [`PooledConnection::invoke`] (for
/// example because the call timed out) is closed rather than reused.
pub struct PooledConnection {
    connection: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<BackendPool>,
    broken: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub async fn invoke(&mut self, request: &Value) -> GatewayResult<Value> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| GatewayError::internal("connection already released"))?;

        self.broken = true;
        let result = connection.invoke(&self.pool.specifier, request).await;
        self.broken = result.is_err();
        result
    }

    pub fn generation(&self) -> u64 {
        self.pool.generation
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let (Some(connection), Some(permit)) = (self.connection.take(), self.permit.take()) {
            if !self.broken {
                self.pool.release(connection, permit);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Ready,
    Rebuilding,
}

struct PoolSlot {
    current: RwLock<Arc<BackendPool>>,
    state: watch::Sender<SlotState>,
    latest_rebuild: AtomicU64,
}

impl PoolSlot {
    fn new(pool: Arc<BackendPool>) -> Self {
        let (state, _) = watch::channel(SlotState::Ready);
        Self {
            current: RwLock::new(pool),
            state,
            latest_rebuild: AtomicU64::new(0),
        }
    }
}

struct ManagerInner {
    slots: DashMap<Id, Arc<PoolSlot>>,
    store: Arc<dyn Store>,
    config: PoolConfig,
    generations: AtomicU64,
}

/// Registry of backend pools, created on first use
#[derive(Clone)]
pub struct ConnectionPoolManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionPoolManager {
    pub fn new(store: Arc<dyn Store>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                slots: DashMap::new(),
                store,
                config,
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Check out a connection to `remote`, creating its pool on first use
    pub async fn get(&self, remote: &RemoteEndpoint) -> GatewayResult<PooledConnection> {
        self.pool(remote).await?.acquire().await
    }

    /// The pool currently serving `remote`.
    ///
    /// While a rebuild is in progress this waits up to `rebuild_wait` for it
    /// and then falls back to the previous pool.
    pub async fn pool(&self, remote: &RemoteEndpoint) -> GatewayResult<Arc<BackendPool>> {
        let existing = self.inner.slots.get(&remote.id).map(|slot| Arc::clone(slot.value()));
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let pool = Arc::new(self.build_pool(remote)?);
                let slot = self
                    .inner
                    .slots
                    .entry(remote.id)
                    .or_insert_with(|| Arc::new(PoolSlot::new(pool)));
                Arc::clone(slot.value())
            }
        };

        let mut state = slot.state.subscribe();
        if *state.borrow() == SlotState::Rebuilding {
            let waited =
                tokio::time::timeout(self.inner.config.rebuild_wait, state.wait_for(|s| *s == SlotState::Ready))
                    .await;
            if waited.is_err() {
                warn!(
                    remote_endpoint = %remote.name,
                    "Pool rebuild still in progress, using previous pool"
                );
            }
        }

        let pool = Arc::clone(&slot.current.read());
        Ok(pool)
    }

    fn build_pool(&self, remote: &RemoteEndpoint) -> GatewayResult<BackendPool> {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let pool = BackendPool::new(remote, &self.inner.config, generation)?;
        info!(
            remote_endpoint = %remote.name,
            kind = %remote.kind,
            generation,
            max_open = pool.sizing.max_open,
            max_idle = pool.sizing.max_idle,
            "Created connection pool"
        );
        Ok(pool)
    }

    /// Start a background rebuild of the pool for `remote_endpoint_id`.
    ///
    /// Returns `None` when no pool exists yet; the next `get` creates one from
    /// fresh data anyway.
    pub fn rebuild(&self, remote_endpoint_id: Id) -> Option<JoinHandle<()>> {
        let slot = Arc::clone(self.inner.slots.get(&remote_endpoint_id)?.value());
        let sequence = slot.latest_rebuild.fetch_add(1, Ordering::AcqRel) + 1;
        slot.state.send_replace(SlotState::Rebuilding);

        let manager = self.clone();
        Some(tokio::spawn(async move {
            manager.run_rebuild(remote_endpoint_id, slot, sequence).await;
        }))
    }

    async fn run_rebuild(&self, id: Id, slot: Arc<PoolSlot>, sequence: u64) {
        let config = &self.inner.config;
        counter!(names::POOL_REBUILDS).increment(1);

        for attempt in 1..=config.rebuild_retries {
            let rebuilt = match self.inner.store.remote_endpoint(id).await {
                Ok(remote) => self.build_pool(&remote),
                Err(err) => Err(err),
            };

            if slot.latest_rebuild.load(Ordering::Acquire) != sequence {
                debug!(remote_endpoint_id = id, "Superseded by a newer rebuild");
                return;
            }

            match rebuilt {
                Ok(pool) => {
                    let old = std::mem::replace(&mut *slot.current.write(), Arc::new(pool));
                    old.retire();
                    slot.state.send_replace(SlotState::Ready);
                    info!(remote_endpoint_id = id, attempt, "Swapped in rebuilt connection pool");
                    return;
                }
                Err(GatewayError::NotFound { .. }) => {
                    self.remove(id);
                    slot.state.send_replace(SlotState::Ready);
                    return;
                }
                Err(err) => {
                    warn!(remote_endpoint_id = id, attempt, error = %err, "Pool rebuild attempt failed");
                    if attempt < config.rebuild_retries {
                        tokio::time::sleep(config.rebuild_backoff * attempt).await;
                    }
                }
            }
        }

        error!(
            remote_endpoint_id = id,
            "Giving up on pool rebuild, keeping previous pool"
        );
        slot.state.send_replace(SlotState::Ready);
    }

    /// Drop the pool of a deleted remote endpoint
    pub fn remove(&self, remote_endpoint_id: Id) {
        if let Some((_, slot)) = self.inner.slots.remove(&remote_endpoint_id) {
            slot.current.read().retire();
        }
    }

    pub fn stats(&self, remote_endpoint_id: Id) -> Option<PoolStats> {
        let slot = self.inner.slots.get(&remote_endpoint_id)?;
        let stats = slot.current.read().stats();
        Some(stats)
    }

    /// Retire every pool; used at process shutdown
    pub fn shutdown(&self) {
        for slot in self.inner.slots.iter() {
            slot.current.read().retire();
        }
        self.inner.slots.clear();
    }
}

#[async_trait]
impl ChangeSubscriber for ConnectionPoolManager {
    fn name(&self) -> &'static str {
        "connection_pools"
    }

    async fn on_change(&self, notification: &ChangeNotification) {
        if notification.table != tables::REMOTE_ENDPOINTS {
            return;
        }
        match notification.action {
            ChangeAction::Delete => self.remove(notification.target_id),
            ChangeAction::Insert | ChangeAction::Update => {
                self.rebuild(notification.target_id);
            }
        }
    }

    async fn on_feed_lagged(&self, missed: u64) {
        let ids: Vec<Id> = self.inner.slots.iter().map(|slot| *slot.key()).collect();
        warn!(missed, pools = ids.len(), "Change feed lagged, rebuilding every pool");
        for id in ids {
            self.rebuild(id);
        }
    }
}
