//! Canonical, platform-agnostic models
//!
//! Every adapter translates its platform's native objects into these types.
//! They serialize in camelCase for the dashboard and broadcaster collaborators.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PlatformType;

/// Lifecycle status of a canonical agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
    Error,
    Maintenance,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Inactive => write!(f, "inactive"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Health classification shared by agents and adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health snapshot attached to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthState,
    pub last_check: DateTime<Utc>,
    /// Milliseconds
    pub response_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn healthy(response_time: u64) -> Self {
        Self {
            status: HealthState::Healthy,
            last_check: Utc::now(),
            response_time,
            error: None,
        }
    }
}

/// Platform-agnostic representation of a workflow / scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Stable id derived from the native identifier
    pub id: String,
    pub name: String,
    pub platform_id: String,
    pub platform_type: PlatformType,
    pub status: AgentStatus,
    pub capabilities: BTreeSet<String>,
    pub configuration: BTreeMap<String, serde_json::Value>,
    pub health_status: HealthStatus,
}

/// Status of a canonical execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Error => write!(f, "error"),
        }
    }
}

/// One run of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub agent_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    /// Placeholder for an execution the platform runs asynchronously
    pub fn running(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            stopped_at: None,
            data: None,
            error: None,
        }
    }
}

/// Outcome of triggering an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<Execution>,
}

impl ExecutionResult {
    pub fn started(execution: Execution, data: Option<serde_json::Value>) -> Self {
        Self {
            success: execution.status != ExecutionStatus::Error,
            timestamp: Utc::now(),
            data,
            error: execution.error.clone(),
            execution: Some(execution),
        }
    }
}

/// Result of `connect()`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of `authenticate()`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthResult {
    pub fn ok(token: Option<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            success: true,
            token,
            expires_at,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            token: None,
            expires_at: None,
            error: Some(error.into()),
        }
    }
}

/// Result of `health_check()`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub status: HealthState,
    /// Milliseconds
    pub response_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Aggregates over a list of executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    /// Milliseconds
    pub average_execution_time: f64,
    pub error_rate: f64,
}

/// Kind of pushed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCompleted,
    ErrorOccurred,
    HealthChanged,
}

/// Event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    /// Event for a finished execution
    pub fn from_execution(execution: &Execution) -> Self {
        let event_type = match execution.status {
            ExecutionStatus::Error => EventType::ErrorOccurred,
            _ => EventType::TaskCompleted,
        };
        Self {
            event_type,
            agent_id: execution.agent_id.clone(),
            timestamp: execution.stopped_at.unwrap_or(execution.started_at),
            payload: serde_json::to_value(execution).unwrap_or(serde_json::Value::Null),
        }
    }
}
