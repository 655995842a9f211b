mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MAKE_BASE, MockTransport, recorder};
use flowhub_core::adapters::MakeAdapter;
use flowhub_core::adapters::transport::{Body, Method};
use flowhub_core::config::{Credentials, PlatformConfig, PlatformType};
use flowhub_core::models::{AgentStatus, ExecutionStatus, HealthState};
use flowhub_core::resilience::CircuitState;
use flowhub_core::prelude::*;
use serde_json::json;

const TOKEN_PATH: &str = "/oauth/v2/token";

fn config(credentials: Credentials) -> PlatformConfig {
    PlatformConfig::new("make-eu", "Make EU", PlatformType::Make, MAKE_BASE, credentials)
        .with_retry_attempts(0)
}

fn team_token() -> Credentials {
    Credentials::TeamToken {
        api_token: "tok".into(),
        team_id: "12".into(),
    }
}

fn oauth(access: Option<&str>, refresh: Option<&str>) -> Credentials {
    Credentials::OAuth {
        client_id: "client".into(),
        client_secret: "secret".into(),
        access_token: access.map(String::from),
        refresh_token: refresh.map(String::from),
    }
}

fn adapter(transport: &Arc<MockTransport>, credentials: Credentials) -> MakeAdapter {
    MakeAdapter::with_transport(config(credentials), transport.clone()).unwrap()
}

fn scenario_list() -> &'static str {
    r#"{"scenarios":[
        {"id":1,"name":"CRM sync","isActive":true,"isLocked":false,
         "blueprint":{"flow":[{"module":"gateway:CustomWebHook"},{"module":"http:ActionSendData"}]},
         "scheduling":{"type":"indefinitely","interval":900}},
        {"id":2,"name":"Archive","isActive":true,"isLocked":true}
    ]}"#
}

#[tokio::test]
async fn test_team_token_header_and_scope() {
    let transport = MockTransport::new();
    transport.on(Method::Get, "/api/v2/users/me", 200, r#"{"authUser":{"id":1}}"#);
    let adapter = adapter(&transport, team_token());

    let auth = adapter.authenticate().await;
    assert!(auth.success);

    let sent = transport.last_request_to(Method::Get, "/api/v2/users/me").unwrap();
    assert_eq!(sent.header_value("Authorization"), Some("Token tok"));
    assert_eq!(sent.query_value("teamId"), Some("12"));
}

#[tokio::test]
async fn test_discover_maps_status_capabilities_and_metrics() {
    let transport = MockTransport::new();
    transport.on(Method::Get, "/api/v2/scenarios", 200, scenario_list());
    transport.on(
        Method::Get,
        "/api/v2/scenarios/1/executions",
        200,
        r#"{"executions":[
            {"id":"a","status":1,"executionTime":400,"timestamp":"2024-05-01T10:00:00Z"},
            {"id":"b","status":3,"executionTime":200,"timestamp":"2024-05-01T10:01:00Z"}
        ]}"#,
    );
    transport.on(Method::Get, "/api/v2/scenarios/2/executions", 503, "busy");
    let adapter = adapter(&transport, team_token());

    let agents = adapter.discover_agents().await.unwrap();
    assert_eq!(agents.len(), 2);

    let crm = &agents[0];
    assert_eq!(crm.id, "make_1");
    assert_eq!(crm.status, AgentStatus::Active);
    let caps: Vec<&str> = crm.capabilities.iter().map(String::as_str).collect();
    assert_eq!(caps, vec!["active", "gateway", "http", "scheduling:indefinitely"]);
    assert_eq!(crm.configuration["metrics"]["tasksCompleted"], 2);
    assert_eq!(crm.configuration["metrics"]["averageExecutionTime"], 300.0);
    assert_eq!(crm.configuration["metrics"]["errorRate"], 0.5);
    assert_eq!(crm.health_status.status, HealthState::Healthy);

    let archive = &agents[1];
    assert_eq!(archive.status, AgentStatus::Maintenance);
    assert_eq!(archive.health_status.status, HealthState::Degraded);
}

#[tokio::test]
async fn test_expired_token_refreshed_once_for_concurrent_calls() {
    let transport = MockTransport::new();
    transport.on(
        Method::Post,
        TOKEN_PATH,
        200,
        r#"{"access_token":"fresh","refresh_token":"r2","expires_in":3600}"#,
    );
    transport.on(Method::Get, "/api/v2/scenarios", 200, r#"{"scenarios":[]}"#);
    let adapter = adapter(&transport, oauth(None, Some("r1")));

    let (a, b, c) = tokio::join!(
        adapter.discover_agents(),
        adapter.discover_agents(),
        adapter.discover_agents()
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(transport.calls_to(Method::Post, TOKEN_PATH), 1);

    let refresh = transport.last_request_to(Method::Post, TOKEN_PATH).unwrap();
    match refresh.body {
        Some(Body::Form(fields)) => {
            assert!(fields.contains(&("grant_type".to_string(), "refresh_token".to_string())));
            assert!(fields.contains(&("refresh_token".to_string(), "r1".to_string())));
        }
        other => panic!("expected form body, got {:?}", other),
    }
    let listed = transport.last_request_to(Method::Get, "/api/v2/scenarios").unwrap();
    assert_eq!(listed.header_value("Authorization"), Some("Bearer fresh"));
}

#[tokio::test]
async fn test_rejected_access_token_forces_one_refresh_and_replay() {
    let transport = MockTransport::new();
    transport.on(
        Method::Post,
        TOKEN_PATH,
        200,
        r#"{"access_token":"fresh","expires_in":3600}"#,
    );
    transport.on_sequence(
        Method::Get,
        "/api/v2/scenarios",
        &[(401, "token expired"), (200, r#"{"scenarios":[]}"#)],
    );
    let adapter = adapter(&transport, oauth(Some("stale"), Some("r1")));

    adapter.discover_agents().await.unwrap();
    assert_eq!(transport.calls_to(Method::Post, TOKEN_PATH), 1);
    assert_eq!(transport.calls_to(Method::Get, "/api/v2/scenarios"), 2);
    assert_eq!(adapter.token_manager().unwrap().refresh_count(), 1);
}

#[tokio::test]
async fn test_refresh_failure_surfaces_as_authentication_error() {
    let transport = MockTransport::new();
    transport.on(Method::Post, TOKEN_PATH, 401, r#"{"error":"invalid_client"}"#);
    let adapter = adapter(&transport, oauth(None, Some("revoked")));

    let auth = adapter.authenticate().await;
    assert!(!auth.success);
    assert!(auth.error.unwrap().contains("Authentication failed"));

    let err = adapter.discover_agents().await.unwrap_err();
    assert!(matches!(err, Error::Authentication(_)));
    assert_eq!(transport.calls_to(Method::Get, "/api/v2/scenarios"), 0);
}

#[tokio::test]
async fn test_execute_posts_responsive_run() {
    let transport = MockTransport::new();
    transport.on(
        Method::Post,
        "/api/v2/scenarios/1/run",
        200,
        r#"{"executionId":"exec-9","outputs":{"ok":true}}"#,
    );
    let adapter = adapter(&transport, team_token());

    let result = adapter
        .execute_agent("make_1", json!({"email": "a@b.c"}))
        .await
        .unwrap();
    let execution = result.execution.unwrap();
    assert_eq!(execution.id, "exec-9");
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.data, Some(json!({"ok": true})));

    let sent = transport
        .last_request_to(Method::Post, "/api/v2/scenarios/1/run")
        .unwrap();
    assert_eq!(
        sent.body,
        Some(Body::Json(json!({"data": {"email": "a@b.c"}, "responsive": true})))
    );
}

#[tokio::test]
async fn test_unknown_scenario_is_not_found() {
    let transport = MockTransport::new();
    let adapter = adapter(&transport, team_token());

    let err = adapter.get_agent_status("make_9").await.unwrap_err();
    assert_eq!(err.to_string(), "Scenario not found: 9");
    assert_eq!(adapter.breaker_stats().failure_count, 0);
}

#[tokio::test]
async fn test_connect_and_disconnect() {
    let transport = MockTransport::new();
    transport.on(Method::Get, "/api/v2/users/me", 200, "{}");
    transport.on(Method::Get, "/api/v2/scenarios", 200, r#"{"scenarios":[]}"#);
    let adapter = adapter(&transport, team_token());

    assert!(adapter.connect().await.connected);
    assert!(adapter.is_connected());
    adapter.disconnect().await;
    assert!(!adapter.is_connected());
}

fn polling(credentials: Credentials) -> PlatformConfig {
    config(credentials)
        .with_poll_interval(Duration::from_secs(30))
        .with_circuit_breaker_threshold(3)
        .with_circuit_breaker_reset(Duration::from_secs(3600))
}

const ONE_RUN: &str =
    r#"{"executions":[{"id":"a","status":1,"executionTime":400,"timestamp":"2024-05-01T10:00:00Z"}]}"#;

#[tokio::test(start_paused = true)]
async fn test_poller_picks_up_scenarios_created_after_subscribing() {
    let transport = MockTransport::new();
    transport.on(
        Method::Get,
        "/api/v2/scenarios",
        200,
        r#"{"scenarios":[{"id":1,"name":"CRM sync"}]}"#,
    );
    transport.on(Method::Get, "/api/v2/scenarios/1/executions", 200, ONE_RUN);
    let adapter = MakeAdapter::with_transport(polling(team_token()), transport.clone()).unwrap();
    let (callback, events) = recorder();
    adapter.subscribe_to_events(callback).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    transport.on(
        Method::Get,
        "/api/v2/scenarios",
        200,
        r#"{"scenarios":[{"id":1,"name":"CRM sync"},{"id":2,"name":"Invoices"}]}"#,
    );
    transport.on(
        Method::Get,
        "/api/v2/scenarios/2/executions",
        200,
        r#"{"executions":[{"id":"b","status":3,"timestamp":"2024-05-01T11:00:00Z","error":"Module failed"}]}"#,
    );
    tokio::time::sleep(Duration::from_secs(180)).await;

    assert_eq!(transport.calls_to(Method::Get, "/api/v2/scenarios"), 2);
    assert!(transport.calls_to(Method::Get, "/api/v2/scenarios/2/executions") >= 1);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].agent_id, "make_2");
    assert_eq!(events[0].payload["error"], "Module failed");
    drop(events);
    adapter.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_poller_drops_deleted_scenarios() {
    let transport = MockTransport::new();
    transport.on(
        Method::Get,
        "/api/v2/scenarios",
        200,
        r#"{"scenarios":[{"id":1,"name":"CRM sync"},{"id":2,"name":"Gone"}]}"#,
    );
    transport.on(Method::Get, "/api/v2/scenarios/1/executions", 200, ONE_RUN);
    transport.on(Method::Get, "/api/v2/scenarios/2/executions", 404, "not found");
    let adapter = MakeAdapter::with_transport(polling(team_token()), transport.clone()).unwrap();
    let (callback, _events) = recorder();
    adapter.subscribe_to_events(callback).unwrap();

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(transport.calls_to(Method::Get, "/api/v2/scenarios/1/executions"), 3);
    assert_eq!(transport.calls_to(Method::Get, "/api/v2/scenarios/2/executions"), 1);

    let sent = transport
        .last_request_to(Method::Get, "/api/v2/scenarios/1/executions")
        .unwrap();
    assert_eq!(sent.query_value("pg[limit]"), Some("20"));
    assert_eq!(sent.query_value("teamId"), Some("12"));
    assert_eq!(adapter.breaker_stats().failure_count, 0);
    adapter.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_poll_ticks_open_the_breaker() {
    let transport = MockTransport::new();
    transport.on(
        Method::Get,
        "/api/v2/scenarios",
        200,
        r#"{"scenarios":[{"id":1,"name":"CRM sync"}]}"#,
    );
    transport.on(Method::Get, "/api/v2/scenarios/1/executions", 503, "busy");
    let adapter = MakeAdapter::with_transport(polling(team_token()), transport.clone()).unwrap();
    let (callback, events) = recorder();
    adapter.subscribe_to_events(callback).unwrap();

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(adapter.breaker_stats().state, CircuitState::Open);
    let calls = transport.calls();
    assert_eq!(calls, 4);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(transport.calls(), calls);
    assert!(events.lock().unwrap().is_empty());
    adapter.disconnect().await;
}

#[test]
fn test_create_adapter_for_make() {
    let adapter = create_adapter(config(team_token())).unwrap();
    assert_eq!(adapter.platform_config().id, "make-eu");
}
