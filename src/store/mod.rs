//! # Store Module
//!
//! The durable configuration store the gateway reads from, and its change
//! feed. The proxy only ever reads; mutations belong to the administrative
//! side and are announced through [`ChangeNotification`]s.

pub mod memory;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::core::error::GatewayResult;
use crate::core::types::{ChangeNotification, Endpoint, Id, Library, RemoteEndpoint};

pub use memory::{CallRecord, EndpointRecord, MemoryStore, StoreSeed};

#[async_trait]
pub trait Store: Send + Sync {
    /// Load one fully resolved endpoint aggregate.
    ///
    /// Fails with `NotFound` when the endpoint does not exist.
    async fn endpoint(&self, endpoint_id: Id) -> GatewayResult<Endpoint>;

    /// Every endpoint, for route registration
    async fn endpoints(&self) -> GatewayResult<Vec<Endpoint>>;

    /// Libraries of an API, in load order
    async fn libraries(&self, api_id: Id) -> GatewayResult<Vec<Library>>;

    async fn remote_endpoint(&self, remote_endpoint_id: Id) -> GatewayResult<RemoteEndpoint>;

    /// Subscribe to the change feed
    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification>;
}
