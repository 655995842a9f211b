//! n8n adapter
//!
//! Talks to the n8n public REST API (`/api/v1`). Workflows map to agents and
//! executions are observed by polling `/executions` once per tracked workflow.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::base::{self, AdapterCore, TrackedIds, id_string};
use super::transport::{HttpRequest, HttpResponse, Transport};
use super::PlatformAdapter;
use crate::config::{Credentials, PlatformConfig, PlatformType};
use crate::error::{Error, Result};
use crate::events::{EventCallback, EventPoller, ExecutionFeed, SubscriptionId};
use crate::models::{
    Agent, AgentStatus, AuthResult, ConnectionStatus, Execution, ExecutionResult,
    ExecutionStatus, HealthCheckResult, HealthStatus,
};
use crate::resilience::BreakerStats;

const API_KEY_HEADER: &str = "X-N8N-API-KEY";
const WORKFLOW_PAGE_LIMIT: u32 = 100;
const MAX_WORKFLOW_PAGES: usize = 50;

// ---------------------------------------------------------------------------
// Native payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct N8nWorkflow {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub nodes: Vec<N8nNode>,
    #[serde(default)]
    pub tags: Vec<N8nTag>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct N8nNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct N8nTag {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct N8nExecution {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub workflow_id: String,
    #[serde(default)]
    pub finished: Option<bool>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct N8nPage<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    next_cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Node type without its package prefix (`n8n-nodes-base.httpRequest` -> `httpRequest`)
fn node_capability(node_type: &str) -> &str {
    node_type.rsplit('.').next().unwrap_or(node_type)
}

/// Canonical agent for a workflow
pub fn map_workflow(workflow: &N8nWorkflow, platform_id: &str, response_time: u64) -> Agent {
    let capabilities: BTreeSet<String> = workflow
        .nodes
        .iter()
        .map(|node| node_capability(&node.node_type).to_string())
        .filter(|name| !name.is_empty())
        .collect();

    let mut configuration = BTreeMap::new();
    configuration.insert("workflowId".to_string(), json!(workflow.id));
    configuration.insert("nodeCount".to_string(), json!(workflow.nodes.len()));
    configuration.insert(
        "tags".to_string(),
        json!(workflow.tags.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()),
    );
    if let Some(created) = workflow.created_at {
        configuration.insert("createdAt".to_string(), json!(created));
    }
    if let Some(updated) = workflow.updated_at {
        configuration.insert("updatedAt".to_string(), json!(updated));
    }

    Agent {
        id: base::canonical_id(PlatformType::N8n, &workflow.id),
        name: workflow.name.clone(),
        platform_id: platform_id.to_string(),
        platform_type: PlatformType::N8n,
        status: if workflow.active {
            AgentStatus::Active
        } else {
            AgentStatus::Inactive
        },
        capabilities,
        configuration,
        health_status: HealthStatus::healthy(response_time),
    }
}

/// Canonical status for an n8n execution
pub fn map_execution_status(execution: &N8nExecution) -> ExecutionStatus {
    match execution.status.as_deref() {
        Some("success") => ExecutionStatus::Success,
        Some("error" | "crashed" | "failed" | "canceled") => ExecutionStatus::Error,
        Some("running" | "waiting" | "new") => ExecutionStatus::Running,
        _ => match (execution.finished, execution.stopped_at) {
            (Some(true), _) => ExecutionStatus::Success,
            (_, Some(_)) => ExecutionStatus::Error,
            _ => ExecutionStatus::Running,
        },
    }
}

/// Canonical execution for an n8n execution
pub fn map_execution(execution: &N8nExecution) -> Execution {
    let status = map_execution_status(execution);
    let error = match status {
        ExecutionStatus::Error => Some(
            execution
                .data
                .as_ref()
                .and_then(|d| d.pointer("/resultData/error/message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    format!("Execution {}", execution.status.as_deref().unwrap_or("failed"))
                }),
        ),
        _ => None,
    };

    Execution {
        id: execution.id.clone(),
        agent_id: base::canonical_id(PlatformType::N8n, &execution.workflow_id),
        status,
        started_at: execution.started_at,
        stopped_at: execution.stopped_at,
        data: execution.mode.as_ref().map(|mode| json!({ "mode": mode })),
        error,
    }
}

/// Unwrap `{ "data": {...} }` envelopes some n8n versions use for single entities
fn unwrap_entity(value: Value) -> Value {
    match value {
        Value::Object(mut map) if !map.contains_key("id") && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Execution id from a trigger response, whichever shape the server used
fn execution_id_from(body: &Value) -> Option<String> {
    ["/data/executionId", "/executionId", "/data/id", "/id"]
        .iter()
        .find_map(|path| body.pointer(path))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct N8nClient {
    core: AdapterCore,
    /// Bearer token from `/login`, cached until disconnect
    session: Mutex<Option<String>>,
    workflows: TrackedIds,
}

impl N8nClient {
    fn uses_login(&self) -> bool {
        matches!(self.core.config().credentials, Credentials::Login { .. })
    }

    async fn login(&self, email: &str, password: &str) -> Result<String> {
        debug!(platform = %self.core.config().id, "Logging in to n8n");
        let response = self
            .core
            .dispatch(
                HttpRequest::post(self.core.url("/login"))
                    .json(json!({ "email": email, "password": password })),
            )
            .await?;
        let body: Value = response.json()?;
        body.pointer("/data/token")
            .or_else(|| body.get("token"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Authentication("login response did not include a token".into()))
    }

    async fn auth_header(&self) -> Result<(String, String)> {
        match &self.core.config().credentials {
            Credentials::ApiToken { api_token } => {
                Ok((API_KEY_HEADER.to_string(), api_token.clone()))
            }
            Credentials::Login { email, password } => {
                let mut session = self.session.lock().await;
                let token = match session.as_ref() {
                    Some(token) => token.clone(),
                    None => {
                        let token = self.login(email, password).await?;
                        *session = Some(token.clone());
                        token
                    }
                };
                Ok(("Authorization".to_string(), format!("Bearer {}", token)))
            }
            other => Err(Error::Configuration(format!(
                "n8n does not support {} credentials",
                other.kind()
            ))),
        }
    }

    /// One authenticated attempt. A rejected login session is renewed once.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let (key, value) = self.auth_header().await?;
        let result = self.core.dispatch(request.clone().header(key, value)).await;

        let rejected = matches!(result, Err(Error::Authentication(_)));
        if rejected && self.uses_login() && self.clear_session().await {
            debug!(platform = %self.core.config().id, "Session rejected, logging in again");
            let (key, value) = self.auth_header().await?;
            return self.core.dispatch(request.clone().header(key, value)).await;
        }
        result
    }

    async fn clear_session(&self) -> bool {
        self.session.lock().await.take().is_some()
    }

    async fn request(&self, label: &str, request: HttpRequest) -> Result<HttpResponse> {
        let request = &request;
        self.core.execute(label, || self.send(request)).await
    }

    async fn list_workflows(&self) -> Result<Vec<N8nWorkflow>> {
        let mut workflows = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_WORKFLOW_PAGES {
            let mut request =
                HttpRequest::get(self.core.url("/workflows")).query("limit", WORKFLOW_PAGE_LIMIT);
            if let Some(cursor) = &cursor {
                request = request.query("cursor", cursor);
            }

            let page: N8nPage<N8nWorkflow> =
                self.request("discover_agents", request).await?.json()?;
            workflows.extend(page.data);

            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => {
                    self.track(&workflows);
                    return Ok(workflows);
                }
            }
        }

        warn!(
            platform = %self.core.config().id,
            pages = MAX_WORKFLOW_PAGES,
            "Workflow listing truncated at page limit"
        );
        self.track(&workflows);
        Ok(workflows)
    }

    fn track(&self, workflows: &[N8nWorkflow]) {
        self.workflows
            .replace(workflows.iter().map(|wf| wf.id.clone()).collect());
    }

    async fn workflow_executions(&self, workflow_id: &str, limit: u32) -> Result<Vec<Execution>> {
        let request = HttpRequest::get(self.core.url("/executions"))
            .query("workflowId", workflow_id)
            .query("limit", limit)
            .query("includeData", false);
        let page: N8nPage<N8nExecution> = self.request("poll_executions", request).await?.json()?;
        Ok(page.data.iter().map(map_execution).collect())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<N8nWorkflow> {
        let request = HttpRequest::get(self.core.url(&format!("/workflows/{}", workflow_id)));
        let body: Value = self
            .request("get_agent_status", request)
            .await
            .map_err(|e| workflow_not_found(e, workflow_id))?
            .json()?;
        Ok(serde_json::from_value(unwrap_entity(body))?)
    }
}

fn workflow_not_found(err: Error, workflow_id: &str) -> Error {
    match err {
        Error::NotFound { .. } => Error::not_found("Workflow", workflow_id),
        other => other,
    }
}

#[async_trait]
impl ExecutionFeed for N8nClient {
    async fn recent_executions(&self, limit: u32) -> Result<Vec<Execution>> {
        if self.workflows.is_stale() {
            self.list_workflows().await?;
        }

        self.workflows
            .fetch_each(&self.core.config().id, |workflow_id| async move {
                self.workflow_executions(&workflow_id, limit).await
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Adapter for an n8n instance
pub struct N8nAdapter {
    client: Arc<N8nClient>,
    poller: EventPoller,
}

impl std::fmt::Debug for N8nAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("N8nAdapter")
            .field("core", &self.client.core)
            .field("poller", &self.poller)
            .finish()
    }
}

impl N8nAdapter {
    /// Build an adapter using the default HTTP transport
    pub fn new(config: PlatformConfig) -> Result<Self> {
        Self::check_credentials(&config)?;
        Self::from_core(AdapterCore::new(config)?)
    }

    /// Build an adapter over an injected transport
    pub fn with_transport(config: PlatformConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::check_credentials(&config)?;
        Self::from_core(AdapterCore::with_transport(config, transport)?)
    }

    /// Build an adapter around a prepared core
    pub fn from_core(core: AdapterCore) -> Result<Self> {
        Self::check_credentials(core.config())?;
        let config = core.config().clone();
        let client = Arc::new(N8nClient {
            core,
            session: Mutex::new(None),
            workflows: TrackedIds::new(config.poll_interval),
        });
        let poller = EventPoller::new(
            config.id.clone(),
            client.clone(),
            config.poll_interval,
            config.poll_page_size,
        );
        Ok(Self { client, poller })
    }

    fn check_credentials(config: &PlatformConfig) -> Result<()> {
        if config.platform_type != PlatformType::N8n {
            return Err(Error::Configuration(format!(
                "Platform '{}' is type '{}', not n8n",
                config.id, config.platform_type
            )));
        }
        match config.credentials {
            Credentials::ApiToken { .. } | Credentials::Login { .. } => Ok(()),
            ref other => Err(Error::Configuration(format!(
                "n8n requires an API key or email/password login, got {} credentials",
                other.kind()
            ))),
        }
    }

    fn core(&self) -> &AdapterCore {
        &self.client.core
    }
}

#[async_trait]
impl PlatformAdapter for N8nAdapter {
    async fn connect(&self) -> ConnectionStatus {
        let auth = self.authenticate().await;
        if !auth.success {
            self.core().mark_disconnected();
            return ConnectionStatus {
                connected: false,
                last_connected: self.core().last_connected(),
                error: auth.error,
            };
        }

        let probe = HttpRequest::get(self.core().url("/executions")).query("limit", 1);
        match self.client.request("connect", probe).await {
            Ok(_) => ConnectionStatus {
                connected: true,
                last_connected: Some(self.core().mark_connected()),
                error: None,
            },
            Err(e) => {
                warn!(platform = %self.core().config().id, error = %e, "Connectivity probe failed");
                self.core().mark_disconnected();
                ConnectionStatus {
                    connected: false,
                    last_connected: self.core().last_connected(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn authenticate(&self) -> AuthResult {
        let client = &self.client;
        let result = if client.uses_login() {
            client.clear_session().await;
            client
                .core
                .execute("authenticate", || async move {
                    client.auth_header().await?;
                    Ok::<_, Error>(client.session.lock().await.clone())
                })
                .await
        } else {
            let request = HttpRequest::get(client.core.url("/workflows")).query("limit", 1);
            client.request("authenticate", request).await.map(|_| None)
        };

        match result {
            Ok(token) => AuthResult::ok(token, None),
            Err(e) => {
                warn!(platform = %client.core.config().id, error = %e, "Authentication failed");
                AuthResult::failed(e.to_string())
            }
        }
    }

    async fn discover_agents(&self) -> Result<Vec<Agent>> {
        let started = Instant::now();
        let workflows = self.client.list_workflows().await?;
        let response_time = started.elapsed().as_millis() as u64;
        let platform_id = &self.core().config().id;

        let agents: Vec<Agent> = workflows
            .iter()
            .map(|workflow| map_workflow(workflow, platform_id, response_time))
            .collect();
        info!(platform = %platform_id, count = agents.len(), "Discovered n8n workflows");
        Ok(agents)
    }

    async fn get_agent_status(&self, agent_id: &str) -> Result<Agent> {
        let workflow_id = base::native_id(PlatformType::N8n, agent_id);
        let started = Instant::now();
        let workflow = self.client.get_workflow(workflow_id).await?;
        Ok(map_workflow(
            &workflow,
            &self.core().config().id,
            started.elapsed().as_millis() as u64,
        ))
    }

    async fn execute_agent(&self, agent_id: &str, input: Value) -> Result<ExecutionResult> {
        let workflow_id = base::native_id(PlatformType::N8n, agent_id);
        let request = HttpRequest::post(
            self.core()
                .url(&format!("/workflows/{}/execute", workflow_id)),
        )
        .json(input);

        let body: Value = self
            .client
            .request("execute_agent", request)
            .await
            .map_err(|e| workflow_not_found(e, workflow_id))?
            .json()?;

        let execution_id = execution_id_from(&body)
            .unwrap_or_else(|| format!("pending-{}", uuid::Uuid::new_v4()));
        info!(
            platform = %self.core().config().id,
            workflow = workflow_id,
            execution = %execution_id,
            "Triggered n8n workflow"
        );

        let execution = Execution::running(
            execution_id,
            base::canonical_id(PlatformType::N8n, workflow_id),
        );
        Ok(ExecutionResult::started(execution, Some(body)))
    }

    async fn health_check(&self) -> HealthCheckResult {
        let client = &self.client;
        let probe = HttpRequest::get(client.core.url("/workflows")).query("limit", 1);
        let probe = &probe;
        let (result, event) = client.core.health_check(|| client.send(probe)).await;
        if let Some(event) = event {
            self.poller.emit(&event);
        }
        result
    }

    fn subscribe_to_events(&self, callback: EventCallback) -> Result<SubscriptionId> {
        self.poller.subscribe(callback)
    }

    fn unsubscribe_from_events(&self, id: SubscriptionId) -> bool {
        self.poller.unsubscribe(id)
    }

    async fn disconnect(&self) {
        self.poller.shutdown();
        self.client.clear_session().await;
        self.core().mark_disconnected();
    }

    fn platform_config(&self) -> &PlatformConfig {
        self.core().config()
    }

    fn breaker_stats(&self) -> BreakerStats {
        self.core().breaker_stats()
    }

    fn is_connected(&self) -> bool {
        self.core().is_connected()
    }
}
