//! Make.com adapter
//!
//! Scenarios map to agents. Execution history per scenario drives status,
//! metrics and the event feed. OAuth credentials are refreshed through a
//! [`TokenManager`]; API tokens are sent as `Authorization: Token <t>`.

mod mapping;
mod token;
mod types;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::PlatformAdapter;
use super::base::{self, AdapterCore, TrackedIds};
use super::transport::{HttpRequest, HttpResponse, Transport};
use crate::config::{Credentials, PlatformConfig, PlatformType};
use crate::error::{Error, Result};
use crate::events::{EventCallback, EventPoller, ExecutionFeed, SubscriptionId};
use crate::models::{
    Agent, AuthResult, ConnectionStatus, Execution, ExecutionResult, HealthCheckResult,
};
use crate::resilience::BreakerStats;

pub use mapping::{
    ERROR_STATUS_THRESHOLD, calculate_agent_metrics, determine_agent_status,
    extract_capabilities, map_execution, map_execution_status, map_scenario,
};
pub use token::{EXPIRY_SKEW_SECS, TokenManager};
pub use types::{
    MakeBlueprint, MakeExecution, MakeExecutionStatus, MakeModule, MakeScenario, MakeScheduling,
};

use types::{ExecutionList, RunResponse, ScenarioEnvelope, ScenarioList};

const SCENARIO_PAGE_LIMIT: usize = 100;
const MAX_SCENARIO_PAGES: usize = 50;

/// Default OAuth token endpoint for a Make API base URL
pub fn default_token_url(base_url: &str) -> Result<String> {
    let url = reqwest::Url::parse(base_url).map_err(|e| {
        Error::Configuration(format!("Invalid Make base URL '{}': {}", base_url, e))
    })?;
    Ok(format!("{}/oauth/v2/token", url.origin().ascii_serialization()))
}

struct MakeClient {
    core: AdapterCore,
    tokens: Option<TokenManager>,
    scenarios: TrackedIds,
}

impl MakeClient {
    fn team_id(&self) -> Option<&str> {
        match &self.core.config().credentials {
            Credentials::TeamToken { team_id, .. } => Some(team_id),
            _ => None,
        }
    }

    fn scoped(&self, request: HttpRequest) -> HttpRequest {
        match self.team_id() {
            Some(team) => request.query("teamId", team),
            None => request,
        }
    }

    /// Attach credentials; also returns the bearer token used, if any
    async fn authorize(&self, request: HttpRequest) -> Result<(HttpRequest, Option<String>)> {
        match (&self.core.config().credentials, &self.tokens) {
            (Credentials::ApiToken { api_token }, _)
            | (Credentials::TeamToken { api_token, .. }, _) => Ok((
                request.header("Authorization", format!("Token {}", api_token)),
                None,
            )),
            (Credentials::OAuth { .. }, Some(tokens)) => {
                let token = tokens.access_token(self.core.transport()).await?;
                Ok((
                    request.header("Authorization", format!("Bearer {}", token)),
                    Some(token),
                ))
            }
            (other, _) => Err(Error::Configuration(format!(
                "Make does not support {} credentials",
                other.kind()
            ))),
        }
    }

    /// One authenticated attempt. A 401 on an OAuth call refreshes and replays once.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let (authorized, bearer) = self.authorize(request.clone()).await?;
        let result = self.core.dispatch(authorized).await;

        match (result, bearer, &self.tokens) {
            (Err(Error::Authentication(_)), Some(rejected), Some(tokens)) => {
                debug!(platform = %self.core.config().id, "Access token rejected, refreshing");
                let token = tokens
                    .force_refresh(self.core.transport(), &rejected)
                    .await?;
                self.core
                    .dispatch(
                        request
                            .clone()
                            .header("Authorization", format!("Bearer {}", token)),
                    )
                    .await
            }
            (result, _, _) => result,
        }
    }

    async fn request(&self, label: &str, request: HttpRequest) -> Result<HttpResponse> {
        let request = &self.scoped(request);
        self.core.execute(label, || self.send(request)).await
    }

    async fn list_scenarios(&self) -> Result<Vec<MakeScenario>> {
        let mut scenarios = Vec::new();

        for page in 0..MAX_SCENARIO_PAGES {
            let request = HttpRequest::get(self.core.url("/scenarios"))
                .query("pg[limit]", SCENARIO_PAGE_LIMIT)
                .query("pg[offset]", page * SCENARIO_PAGE_LIMIT);
            let list: ScenarioList = self.request("discover_agents", request).await?.json()?;
            let fetched = list.scenarios.len();
            scenarios.extend(list.scenarios);
            if fetched < SCENARIO_PAGE_LIMIT {
                break;
            }
        }

        self.scenarios
            .replace(scenarios.iter().map(|s| s.id.clone()).collect());
        Ok(scenarios)
    }

    async fn get_scenario(&self, scenario_id: &str) -> Result<MakeScenario> {
        let request = HttpRequest::get(self.core.url(&format!("/scenarios/{}", scenario_id)));
        let envelope: ScenarioEnvelope = self
            .request("get_agent_status", request)
            .await
            .map_err(|e| scenario_not_found(e, scenario_id))?
            .json()?;
        Ok(envelope.scenario)
    }

    async fn scenario_executions(&self, scenario_id: &str, limit: u32) -> Result<Vec<MakeExecution>> {
        let request = HttpRequest::get(
            self.core
                .url(&format!("/scenarios/{}/executions", scenario_id)),
        )
        .query("pg[limit]", limit)
        .query("pg[sortDir]", "desc");
        let list: ExecutionList = self
            .request("scenario_executions", request)
            .await
            .map_err(|e| scenario_not_found(e, scenario_id))?
            .json()?;
        Ok(list.executions)
    }
}

fn scenario_not_found(err: Error, scenario_id: &str) -> Error {
    match err {
        Error::NotFound { .. } => Error::not_found("Scenario", scenario_id),
        other => other,
    }
}

#[async_trait]
impl ExecutionFeed for MakeClient {
    async fn recent_executions(&self, limit: u32) -> Result<Vec<Execution>> {
        if self.scenarios.is_stale() {
            self.list_scenarios().await?;
        }

        self.scenarios
            .fetch_each(&self.core.config().id, |scenario_id| async move {
                let history = self.scenario_executions(&scenario_id, limit).await?;
                Ok::<_, Error>(
                    history
                        .iter()
                        .map(|e| map_execution(e, &scenario_id))
                        .collect(),
                )
            })
            .await
    }
}

/// Adapter for a Make.com organization or team
pub struct MakeAdapter {
    client: Arc<MakeClient>,
    poller: EventPoller,
}

impl std::fmt::Debug for MakeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MakeAdapter")
            .field("core", &self.client.core)
            .field("tokens", &self.client.tokens)
            .field("poller", &self.poller)
            .finish()
    }
}

impl MakeAdapter {
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
        let config = core.config().clone();
        Self::check_credentials(&config)?;

        let tokens = match &config.credentials {
            Credentials::OAuth {
                client_id,
                client_secret,
                access_token,
                refresh_token,
            } => {
                let token_url = match &config.oauth_token_url {
                    Some(url) => url.clone(),
                    None => default_token_url(&config.base_url)?,
                };
                Some(TokenManager::new(
                    client_id.clone(),
                    client_secret.clone(),
                    token_url,
                    access_token.clone(),
                    refresh_token.clone(),
                ))
            }
            _ => None,
        };

        let client = Arc::new(MakeClient {
            core,
            tokens,
            scenarios: TrackedIds::new(config.poll_interval),
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
        if config.platform_type != PlatformType::Make {
            return Err(Error::Configuration(format!(
                "Platform '{}' is type '{}', not make",
                config.id, config.platform_type
            )));
        }
        match config.credentials {
            Credentials::Login { .. } => Err(Error::Configuration(
                "Make requires an API token, team token, or OAuth client; login credentials are not supported"
                    .to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn core(&self) -> &AdapterCore {
        &self.client.core
    }

    /// OAuth token manager, when configured with OAuth credentials
    pub fn token_manager(&self) -> Option<&TokenManager> {
        self.client.tokens.as_ref()
    }
}

#[async_trait]
impl PlatformAdapter for MakeAdapter {
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

        let probe = HttpRequest::get(self.core().url("/scenarios")).query("pg[limit]", 1);
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
        let request = HttpRequest::get(self.core().url("/users/me"));
        match self.client.request("authenticate", request).await {
            Ok(_) => match &self.client.tokens {
                Some(tokens) => {
                    let token = tokens.access_token(self.core().transport()).await.ok();
                    AuthResult::ok(token, tokens.expires_at().await)
                }
                None => AuthResult::ok(None, None),
            },
            Err(e) => {
                warn!(platform = %self.core().config().id, error = %e, "Authentication failed");
                AuthResult::failed(e.to_string())
            }
        }
    }

    async fn discover_agents(&self) -> Result<Vec<Agent>> {
        let started = Instant::now();
        let scenarios = self.client.list_scenarios().await?;
        let response_time = started.elapsed().as_millis() as u64;
        let window = self.core().config().poll_page_size;

        let client = &self.client;
        let histories = join_all(scenarios.iter().map(|scenario| async move {
            match client.scenario_executions(&scenario.id, window).await {
                Ok(list) => Some(list),
                Err(e) => {
                    warn!(
                        platform = %client.core.config().id,
                        scenario = %scenario.id,
                        error = %e,
                        "Execution history unavailable"
                    );
                    None
                }
            }
        }))
        .await;

        let platform_id = &self.core().config().id;
        let agents: Vec<Agent> = scenarios
            .iter()
            .zip(histories.iter())
            .map(|(scenario, history)| {
                map_scenario(scenario, history.as_deref(), platform_id, response_time)
            })
            .collect();
        info!(platform = %platform_id, count = agents.len(), "Discovered Make scenarios");
        Ok(agents)
    }

    async fn get_agent_status(&self, agent_id: &str) -> Result<Agent> {
        let scenario_id = base::native_id(PlatformType::Make, agent_id);
        let started = Instant::now();
        let scenario = self.client.get_scenario(scenario_id).await?;
        let response_time = started.elapsed().as_millis() as u64;

        let history = match self
            .client
            .scenario_executions(scenario_id, self.core().config().poll_page_size)
            .await
        {
            Ok(list) => Some(list),
            Err(e) => {
                warn!(scenario = %scenario_id, error = %e, "Execution history unavailable");
                None
            }
        };
        Ok(map_scenario(
            &scenario,
            history.as_deref(),
            &self.core().config().id,
            response_time,
        ))
    }

    async fn execute_agent(&self, agent_id: &str, input: Value) -> Result<ExecutionResult> {
        let scenario_id = base::native_id(PlatformType::Make, agent_id);
        let request = HttpRequest::post(
            self.core()
                .url(&format!("/scenarios/{}/run", scenario_id)),
        )
        .json(json!({ "data": input, "responsive": true }));

        let body: Value = self
            .client
            .request("execute_agent", request)
            .await
            .map_err(|e| scenario_not_found(e, scenario_id))?
            .json()?;
        let run: RunResponse = serde_json::from_value(body.clone())?;

        let execution_id = run
            .execution_id
            .clone()
            .unwrap_or_else(|| format!("pending-{}", uuid::Uuid::new_v4()));
        let mut execution =
            Execution::running(execution_id, base::canonical_id(PlatformType::Make, scenario_id));

        let status = match (run.status, &run.outputs) {
            (Some(status), _) => map_execution_status(status),
            (None, Some(_)) => map_execution_status(MakeExecutionStatus::Success),
            (None, None) => execution.status,
        };
        if status.is_finished() {
            execution.status = status;
            execution.stopped_at = Some(chrono::Utc::now());
            execution.data = run.outputs.clone();
            if status == crate::models::ExecutionStatus::Error {
                execution.error = Some("Scenario run failed".to_string());
            }
        }

        info!(
            platform = %self.core().config().id,
            scenario = scenario_id,
            execution = %execution.id,
            status = %execution.status,
            "Triggered Make scenario"
        );
        Ok(ExecutionResult::started(execution, Some(body)))
    }

    async fn health_check(&self) -> HealthCheckResult {
        let client = &self.client;
        let probe = client.scoped(HttpRequest::get(client.core.url("/scenarios")).query("pg[limit]", 1));
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
        if let Some(tokens) = &self.client.tokens {
            tokens.clear().await;
        }
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
