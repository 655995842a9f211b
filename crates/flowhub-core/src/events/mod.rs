//! Event delivery
//!
//! Platforms only expose pull APIs, so each adapter runs one [`EventPoller`]
//! over an [`ExecutionFeed`] and fans the resulting events out to subscriber
//! callbacks.

mod poller;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Event, Execution};

pub use poller::EventPoller;

/// Callback invoked once per delivered event
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Opaque handle returned by subscribe, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of recent executions for a poller.
///
/// Implementations go through the adapter's breaker, so a failing feed
/// counts against platform health.
#[async_trait]
pub trait ExecutionFeed: Send + Sync {
    /// Up to `limit` recent executions per agent, in any order
    async fn recent_executions(&self, limit: u32) -> Result<Vec<Execution>>;
}
