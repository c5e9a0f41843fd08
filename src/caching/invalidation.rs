//! # Cache Invalidation Module
//!
//! Maps store change notifications onto the cached aggregates they affect and
//! fans the change feed out to every component that keeps derived state
//! (config cache, router, connection pools).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::core::error::GatewayError;
use crate::core::types::{tables, ChangeNotification, Id};

/// Cached aggregates affected by one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    /// One endpoint aggregate
    Endpoint(Id),

    /// Every cached endpoint of an API
    EndpointsOfApi(Id),

    /// The library list of an API
    Libraries(Id),

    /// Everything
    All,
}

/// Which cached aggregates a notification invalidates.
///
/// Child rows of an endpoint (routes, components, calls, transformations)
/// carry the owning endpoint id; API-wide data fans out to every endpoint of
/// the API.
pub fn targets_for(notification: &ChangeNotification) -> Vec<InvalidationTarget> {
    let api_id = notification.api_id;
    match notification.table.as_str() {
        tables::PROXY_ENDPOINTS => {
            let id = if notification.endpoint_id != 0 {
                notification.endpoint_id
            } else {
                notification.target_id
            };
            vec![InvalidationTarget::Endpoint(id)]
        }
        tables::ROUTES | tables::COMPONENTS | tables::CALLS | tables::TRANSFORMATIONS => {
            vec![InvalidationTarget::Endpoint(notification.endpoint_id)]
        }
        tables::REMOTE_ENDPOINTS | tables::ENVIRONMENTS | tables::HOSTS => {
            vec![InvalidationTarget::EndpointsOfApi(api_id)]
        }
        tables::APIS => vec![
            InvalidationTarget::EndpointsOfApi(api_id),
            InvalidationTarget::Libraries(api_id),
        ],
        tables::LIBRARIES => vec![InvalidationTarget::Libraries(api_id)],
        tables::ACCOUNTS => vec![InvalidationTarget::All],
        _ => Vec::new(),
    }
}

/// A component that keeps state derived from the store
#[async_trait]
pub trait ChangeSubscriber: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_change(&self, notification: &ChangeNotification);

    /// Called when notifications were dropped; subscribers must assume
    /// anything may have changed.
    async fn on_feed_lagged(&self, missed: u64);
}

/// Drives the change feed into a set of subscribers
pub struct ChangeListener {
    subscribers: Vec<Arc<dyn ChangeSubscriber>>,
}

impl ChangeListener {
    pub fn new(subscribers: Vec<Arc<dyn ChangeSubscriber>>) -> Self {
        Self { subscribers }
    }

    /// Deliver one notification to every subscriber, in registration order
    pub async fn process(&self, notification: &ChangeNotification) {
        debug!(
            table = %notification.table,
            api_id = notification.api_id,
            target_id = notification.target_id,
            action = %notification.action,
            "Processing change notification"
        );
        for subscriber in &self.subscribers {
            subscriber.on_change(notification).await;
        }
    }

    pub async fn lagged(&self, missed: u64) {
        let err = GatewayError::notification(format!("change feed dropped {} notifications", missed));
        error!(error = %err, "Flushing all derived state");
        for subscriber in &self.subscribers {
            subscriber.on_feed_lagged(missed).await;
        }
    }

    /// Consume the feed until it closes
    pub fn spawn(self, mut feed: broadcast::Receiver<ChangeNotification>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let names: Vec<&str> = self.subscribers.iter().map(|s| s.name()).collect();
            info!(subscribers = ?names, "Change listener started");
            loop {
                match feed.recv().await {
                    Ok(notification) => self.process(&notification).await,
                    Err(RecvError::Lagged(missed)) => self.lagged(missed).await,
                    Err(RecvError::Closed) => {
                        info!("Change feed closed, listener stopping");
                        break;
                    }
                }
            }
        })
    }
}
