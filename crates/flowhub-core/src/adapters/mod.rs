//! Platform adapters
//!
//! Every supported workflow platform implements [`PlatformAdapter`]. Network
//! access runs through the adapter's own [`AdapterCore`] pipeline (timeout,
//! retry, circuit breaker) over an injected [`Transport`].

pub mod base;
pub mod make;
pub mod n8n;
pub mod transport;

use async_trait::async_trait;

use crate::config::{PlatformConfig, PlatformType};
use crate::error::{Error, Result};
use crate::events::{EventCallback, SubscriptionId};
use crate::models::{Agent, AuthResult, ConnectionStatus, ExecutionResult, HealthCheckResult};
use crate::resilience::BreakerStats;

pub use base::AdapterCore;
pub use make::MakeAdapter;
pub use n8n::N8nAdapter;
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};

/// Uniform contract over a workflow-automation platform
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Authenticate, then probe reachability. Failures are reported, not raised.
    async fn connect(&self) -> ConnectionStatus;

    /// Validate the configured credentials against the platform
    async fn authenticate(&self) -> AuthResult;

    /// List every workflow/scenario as a canonical agent
    async fn discover_agents(&self) -> Result<Vec<Agent>>;

    /// Refetch one agent by canonical or native id
    async fn get_agent_status(&self, agent_id: &str) -> Result<Agent>;

    /// Trigger an agent run with `input`
    async fn execute_agent(
        &self,
        agent_id: &str,
        input: serde_json::Value,
    ) -> Result<ExecutionResult>;

    /// One probe through the breaker; an open breaker reports unhealthy without a call
    async fn health_check(&self) -> HealthCheckResult;

    /// Register an event callback; the first subscriber starts polling
    fn subscribe_to_events(&self, callback: EventCallback) -> Result<SubscriptionId>;

    /// Remove a callback; returns false when the id was unknown
    fn unsubscribe_from_events(&self, id: SubscriptionId) -> bool;

    /// Stop polling, drop cached tokens and mark the adapter disconnected
    async fn disconnect(&self);

    fn platform_config(&self) -> &PlatformConfig;

    fn breaker_stats(&self) -> BreakerStats;

    fn is_connected(&self) -> bool;
}

/// Build the adapter for `config.platform_type` using the default transport
pub fn create_adapter(config: PlatformConfig) -> Result<Box<dyn PlatformAdapter>> {
    match config.platform_type {
        PlatformType::N8n => Ok(Box::new(N8nAdapter::new(config)?)),
        PlatformType::Make => Ok(Box::new(MakeAdapter::new(config)?)),
        PlatformType::Zapier => Err(Error::Configuration(format!(
            "No adapter available for platform type '{}'",
            config.platform_type
        ))),
    }
}
