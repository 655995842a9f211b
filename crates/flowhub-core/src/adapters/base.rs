//! Shared adapter base
//!
//! `AdapterCore` carries everything the platform adapters have in common:
//! validated config, the injected transport, the breaker and retry policy,
//! connection bookkeeping and the health-check pipeline.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::{debug, info, warn};

use super::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use crate::config::{PlatformConfig, PlatformType};
use crate::error::{Error, Result};
use crate::models::{Event, EventType, Execution, HealthCheckResult, HealthState};
use crate::resilience::{BreakerStats, CircuitBreaker, CircuitState, RetryPolicy};

pub struct AdapterCore {
    config: PlatformConfig,
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    connected: AtomicBool,
    last_connected: Mutex<Option<DateTime<Utc>>>,
    last_health: Mutex<Option<HealthState>>,
}

impl std::fmt::Debug for AdapterCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterCore")
            .field("platform", &self.config.id)
            .field("type", &self.config.platform_type)
            .field("base_url", &self.config.base_url)
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl AdapterCore {
    /// Validate `config` and build a core around the default `reqwest` transport
    pub fn new(config: PlatformConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(ReqwestTransport::new(config.timeout)?);
        Self::with_transport(config, transport)
    }

    /// Validate `config` and build a core around an injected transport
    pub fn with_transport(config: PlatformConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let breaker = CircuitBreaker::new(
            config.id.clone(),
            config.circuit_breaker_threshold,
            config.circuit_breaker_reset,
        );
        let retry = RetryPolicy::new(config.retry_attempts);

        Ok(Self {
            config,
            transport,
            breaker,
            retry,
            connected: AtomicBool::new(false),
            last_connected: Mutex::new(None),
            last_health: Mutex::new(None),
        })
    }

    /// Replace the retry policy (tests use zero-delay backoff)
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    /// Absolute URL for an API path
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base(), path.trim_start_matches('/'))
    }

    /// Run one logical operation: per-attempt timeout, retry, then breaker.
    ///
    /// `op` may be invoked several times by the retry policy.
    pub async fn execute<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.timeout;
        let op = &op;
        self.breaker
            .call(|| {
                self.retry.run(label, || async move {
                    match tokio::time::timeout(timeout, op()).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::TransientNetwork(format!(
                            "{} timed out after {}ms",
                            label,
                            timeout.as_millis()
                        ))),
                    }
                })
            })
            .await
    }

    /// Send a request and classify non-2xx responses.
    ///
    /// Only call this from inside an [`AdapterCore::execute`] operation.
    pub async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.transport.send(request).await?;
        match response.error_for_status() {
            Ok(response) => Ok(response),
            Err(err) => {
                if let Error::Unknown(raw) = &err {
                    warn!(platform = %self.config.id, payload = %raw, "Unclassified platform response");
                }
                Err(err)
            }
        }
    }

    /// The transport itself, for collaborators that run inside `execute`
    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        *self
            .last_connected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mark_connected(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.connected.store(true, Ordering::SeqCst);
        *self
            .last_connected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(now);
        info!(platform = %self.config.id, "Connected");
        now
    }

    pub fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(platform = %self.config.id, "Disconnected");
        }
    }

    /// Run `probe` through the resilience pipeline and classify the outcome.
    ///
    /// Returns the result plus a `health_changed` event when the state moved.
    pub async fn health_check<F, Fut>(&self, probe: F) -> (HealthCheckResult, Option<Event>)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<HttpResponse>>,
    {
        let started = Instant::now();
        let outcome = self.execute("health_check", probe).await;
        let response_time = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(_) => {
                let slow = response_time > (self.config.timeout.as_millis() as u64) / 2;
                HealthCheckResult {
                    status: if slow {
                        HealthState::Degraded
                    } else {
                        HealthState::Healthy
                    },
                    response_time,
                    error: None,
                    details: Some(self.breaker_details(None)),
                }
            }
            Err(Error::CircuitOpen(_)) => HealthCheckResult {
                status: HealthState::Unhealthy,
                response_time: 0,
                error: Some("Circuit breaker is open".to_string()),
                details: Some(self.breaker_details(Some(CircuitState::Open))),
            },
            Err(Error::RateLimited { retry_after_secs }) => {
                let mut details = self.breaker_details(None);
                details["rateLimited"] = json!(true);
                if let Some(secs) = retry_after_secs {
                    details["retryAfterSecs"] = json!(secs);
                }
                HealthCheckResult {
                    status: HealthState::Unhealthy,
                    response_time,
                    error: Some(Error::RateLimited { retry_after_secs }.to_string()),
                    details: Some(details),
                }
            }
            Err(err) => HealthCheckResult {
                status: HealthState::Unhealthy,
                response_time,
                error: Some(err.to_string()),
                details: Some(self.breaker_details(None)),
            },
        };

        debug!(
            platform = %self.config.id,
            status = %result.status,
            response_ms = result.response_time,
            "Health check complete"
        );

        let event = self.record_health(&result);
        (result, event)
    }

    fn breaker_details(&self, state: Option<CircuitState>) -> serde_json::Value {
        let stats = self.breaker.stats();
        json!({
            "circuitBreakerState": state.unwrap_or(stats.state).as_str(),
            "failureCount": stats.failure_count,
            "platformType": self.config.platform_type.as_str(),
        })
    }

    fn record_health(&self, result: &HealthCheckResult) -> Option<Event> {
        let mut last = self
            .last_health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = last.replace(result.status);
        if previous == Some(result.status) {
            return None;
        }

        info!(
            platform = %self.config.id,
            from = ?previous,
            to = %result.status,
            "Platform health changed"
        );
        Some(Event {
            event_type: EventType::HealthChanged,
            agent_id: self.config.id.clone(),
            timestamp: Utc::now(),
            payload: json!({
                "platformId": self.config.id,
                "previous": previous.map(|s| s.to_string()),
                "current": result.status.to_string(),
                "error": result.error,
                "details": result.details,
            }),
        })
    }
}

/// Poll ticks between re-listings of the tracked workflows or scenarios
pub const RELIST_EVERY_TICKS: u32 = 5;

#[derive(Debug, Default)]
struct TrackedState {
    ids: Vec<String>,
    listed_at: Option<tokio::time::Instant>,
}

/// Native ids an execution feed polls one by one.
///
/// The set goes stale `max_age` after the last full listing so entities
/// created after subscribing are picked up.
#[derive(Debug)]
pub(crate) struct TrackedIds {
    max_age: Duration,
    state: Mutex<TrackedState>,
}

impl TrackedIds {
    pub(crate) fn new(poll_interval: Duration) -> Self {
        Self {
            max_age: poll_interval.saturating_mul(RELIST_EVERY_TICKS),
            state: Mutex::new(TrackedState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.lock()
            .listed_at
            .is_none_or(|at| at.elapsed() >= self.max_age)
    }

    /// Record a full listing
    pub(crate) fn replace(&self, ids: Vec<String>) {
        let mut state = self.lock();
        state.ids = ids;
        state.listed_at = Some(tokio::time::Instant::now());
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.lock().ids.clone()
    }

    pub(crate) fn forget(&self, id: &str) {
        self.lock().ids.retain(|known| known != id);
    }

    /// Fetch every tracked id concurrently.
    ///
    /// Ids the platform answers 404 for are dropped; any other error fails the whole fetch.
    pub(crate) async fn fetch_each<F, Fut>(&self, platform: &str, fetch: F) -> Result<Vec<Execution>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Vec<Execution>>>,
    {
        let fetches = self.ids().into_iter().map(|id| {
            let pending = fetch(id.clone());
            async move { (id, pending.await) }
        });

        let mut executions = Vec::new();
        for (id, result) in join_all(fetches).await {
            match result {
                Ok(list) => executions.extend(list),
                Err(Error::NotFound { .. }) => {
                    info!(platform = %platform, id = %id, "No longer exists, dropping from poll set");
                    self.forget(&id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(executions)
    }
}

/// Canonical agent id for a native identifier
pub fn canonical_id(platform: PlatformType, native_id: &str) -> String {
    format!("{}_{}", platform.as_str(), native_id)
}

/// Native identifier behind a canonical id; bare native ids pass through
pub fn native_id(platform: PlatformType, id: &str) -> &str {
    id.strip_prefix(platform.as_str())
        .and_then(|rest| rest.strip_prefix('_'))
        .unwrap_or(id)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

/// Deserialize an identifier that platforms send as either a string or a number
pub(crate) fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

/// Like [`id_string`], for identifiers that may be absent or null
pub(crate) fn optional_id_string<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct StatusTransport {
        calls: AtomicU32,
        status: u16,
    }

    #[async_trait]
    impl Transport for StatusTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(self.status, "{}"))
        }
    }

    fn core_with(status: u16, threshold: u32) -> (AdapterCore, Arc<StatusTransport>) {
        let transport = Arc::new(StatusTransport {
            calls: AtomicU32::new(0),
            status,
        });
        let config = PlatformConfig::new(
            "n8n-test",
            "Test",
            PlatformType::N8n,
            "https://n8n.test/api/v1/",
            Credentials::ApiToken {
                api_token: "k".into(),
            },
        )
        .with_retry_attempts(0)
        .with_circuit_breaker_threshold(threshold);
        let core = AdapterCore::with_transport(config, transport.clone()).unwrap();
        (core, transport)
    }

    #[test]
    fn test_url_joins_cleanly() {
        let (core, _) = core_with(200, 3);
        assert_eq!(core.url("/workflows"), "https://n8n.test/api/v1/workflows");
        assert_eq!(core.url("executions"), "https://n8n.test/api/v1/executions");
    }

    #[test]
    fn test_canonical_ids() {
        assert_eq!(canonical_id(PlatformType::Make, "42"), "make_42");
        assert_eq!(native_id(PlatformType::Make, "make_42"), "42");
        assert_eq!(native_id(PlatformType::Make, "42"), "42");
        assert_eq!(native_id(PlatformType::N8n, "n8n_abc"), "abc");
    }

    #[tokio::test]
    async fn test_health_check_transitions_emit_once() {
        let (core, _) = core_with(200, 3);
        let probe = || core.dispatch(HttpRequest::get(core.url("/workflows")));

        let (result, event) = core.health_check(probe).await;
        assert_eq!(result.status, HealthState::Healthy);
        assert_eq!(
            result.details.as_ref().unwrap()["circuitBreakerState"],
            "closed"
        );
        let event = event.expect("first check is a transition");
        assert_eq!(event.event_type, EventType::HealthChanged);

        let (_, event) = core.health_check(probe).await;
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits_health() {
        let (core, transport) = core_with(503, 2);
        let probe = || core.dispatch(HttpRequest::get(core.url("/workflows")));

        for _ in 0..2 {
            let (result, _) = core.health_check(probe).await;
            assert_eq!(result.status, HealthState::Unhealthy);
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        let (result, _) = core.health_check(probe).await;
        assert_eq!(result.status, HealthState::Unhealthy);
        assert_eq!(result.details.unwrap()["circuitBreakerState"], "open");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out_as_transient() {
        struct SlowTransport;

        #[async_trait]
        impl Transport for SlowTransport {
            async fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(HttpResponse::new(200, "{}"))
            }
        }

        let config = PlatformConfig::new(
            "slow",
            "Slow",
            PlatformType::N8n,
            "https://n8n.test",
            Credentials::ApiToken {
                api_token: "k".into(),
            },
        )
        .with_timeout(Duration::from_millis(100))
        .with_retry_attempts(0);
        let core = AdapterCore::with_transport(config, Arc::new(SlowTransport)).unwrap();

        let result = core
            .execute("slow", || core.dispatch(HttpRequest::get(core.url("/x"))))
            .await;
        assert!(matches!(result, Err(Error::TransientNetwork(_))));
        assert_eq!(core.breaker_stats().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracked_ids_go_stale_after_relist_window() {
        let tracked = TrackedIds::new(Duration::from_secs(30));
        assert!(tracked.is_stale());

        tracked.replace(vec!["1".into(), "2".into()]);
        assert!(!tracked.is_stale());
        tokio::time::advance(Duration::from_secs(30 * RELIST_EVERY_TICKS as u64 - 1)).await;
        assert!(!tracked.is_stale());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(tracked.is_stale());
    }

    #[tokio::test]
    async fn test_fetch_each_drops_missing_and_fails_on_other_errors() {
        let tracked = TrackedIds::new(Duration::from_secs(30));
        tracked.replace(vec!["1".into(), "2".into()]);

        let executions = tracked
            .fetch_each("test", |id| async move {
                match id.as_str() {
                    "1" => Ok(vec![Execution::running("e1", "n8n_1")]),
                    _ => Err(Error::not_found("Workflow", id.clone())),
                }
            })
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(tracked.ids(), vec!["1".to_string()]);

        let failed = tracked
            .fetch_each("test", |_| async {
                Err::<Vec<Execution>, _>(Error::TransientNetwork("down".into()))
            })
            .await;
        assert!(matches!(failed, Err(Error::TransientNetwork(_))));
        assert_eq!(tracked.ids(), vec!["1".to_string()]);
    }
}
