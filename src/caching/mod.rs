//! # Caching Module
//!
//! In-memory caching of configuration aggregates, kept fresh by the store's
//! change feed.

pub mod coalescing;
pub mod invalidation;
pub mod proxy_data;

pub use coalescing::{CoalescingCache, RefreshOutcome};
pub use invalidation::{ChangeListener, ChangeSubscriber, InvalidationTarget};
pub use proxy_data::{CachingProxyDataSource, PassthroughProxyDataSource, ProxyDataSource};
