//! Flowhub Core Library
//!
//! This crate provides the adapter layer between Flowhub and third-party
//! workflow-automation platforms, including:
//! - A uniform `PlatformAdapter` contract (n8n and Make.com implementations)
//! - Canonical Agent / Execution models
//! - Resilience (circuit breaker + bounded exponential retry)
//! - Event polling that turns pull-only APIs into pushed events
//! - File-backed configuration

pub mod adapters;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod resilience;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::adapters::{PlatformAdapter, create_adapter};
    pub use crate::config::{Config, Credentials, PlatformConfig, PlatformType};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventCallback, SubscriptionId};
    pub use crate::models::{Agent, AgentStatus, Event, EventType, Execution, ExecutionStatus};
}
