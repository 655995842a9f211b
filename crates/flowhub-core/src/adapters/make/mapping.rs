//! Pure mapping from Make.com payloads to canonical models

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use super::types::{MakeExecution, MakeExecutionStatus, MakeScenario};
use crate::adapters::base::canonical_id;
use crate::config::PlatformType;
use crate::models::{
    Agent, AgentMetrics, AgentStatus, Execution, ExecutionStatus, HealthState, HealthStatus,
};

/// Recent errors at or above which a scenario is reported as `error`
pub const ERROR_STATUS_THRESHOLD: usize = 5;

fn is_error(execution: &MakeExecution) -> bool {
    execution.status == MakeExecutionStatus::Error
}

/// Status precedence: locked, then recent errors, then the active flag
pub fn determine_agent_status(
    scenario: &MakeScenario,
    executions: &[MakeExecution],
) -> AgentStatus {
    if scenario.is_locked {
        return AgentStatus::Maintenance;
    }
    if executions.iter().filter(|e| is_error(e)).count() >= ERROR_STATUS_THRESHOLD {
        return AgentStatus::Error;
    }
    if scenario.is_active {
        AgentStatus::Active
    } else {
        AgentStatus::Inactive
    }
}

/// App name of a module reference (`http:ActionSendData` -> `http`)
fn module_app(module: &str) -> &str {
    module.split(':').next().unwrap_or(module).trim()
}

pub fn extract_capabilities(scenario: &MakeScenario) -> BTreeSet<String> {
    let mut capabilities: BTreeSet<String> = scenario
        .blueprint
        .iter()
        .flat_map(|bp| bp.flow.iter())
        .map(|m| module_app(&m.module))
        .filter(|app| !app.is_empty())
        .map(str::to_string)
        .collect();

    if let Some(kind) = scenario
        .scheduling
        .as_ref()
        .and_then(|s| s.schedule_type.as_deref())
    {
        capabilities.insert(format!("scheduling:{}", kind));
    }

    capabilities.insert(if scenario.is_active { "active" } else { "inactive" }.to_string());
    capabilities
}

/// Aggregate metrics; an empty window yields all zeros
pub fn calculate_agent_metrics(executions: &[MakeExecution]) -> AgentMetrics {
    if executions.is_empty() {
        return AgentMetrics {
            tasks_completed: 0,
            average_execution_time: 0.0,
            error_rate: 0.0,
        };
    }

    let timed: Vec<f64> = executions.iter().filter_map(|e| e.execution_time).collect();
    let average_execution_time = if timed.is_empty() {
        0.0
    } else {
        timed.iter().sum::<f64>() / timed.len() as f64
    };
    let errors = executions.iter().filter(|e| is_error(e)).count();

    AgentMetrics {
        tasks_completed: executions.len() as u64,
        average_execution_time,
        error_rate: errors as f64 / executions.len() as f64,
    }
}

pub fn map_execution_status(status: MakeExecutionStatus) -> ExecutionStatus {
    match status {
        MakeExecutionStatus::Success | MakeExecutionStatus::Warning => ExecutionStatus::Success,
        MakeExecutionStatus::Error => ExecutionStatus::Error,
        MakeExecutionStatus::Running => ExecutionStatus::Running,
    }
}

pub fn map_execution(execution: &MakeExecution, scenario_id: &str) -> Execution {
    let status = map_execution_status(execution.status);
    let started_at = execution.timestamp.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let stopped_at = match (status.is_finished(), execution.execution_time) {
        (true, Some(ms)) => Some(
            Duration::try_milliseconds(ms.round() as i64)
                .and_then(|elapsed| started_at.checked_add_signed(elapsed))
                .unwrap_or(started_at),
        ),
        (true, None) => Some(started_at),
        (false, _) => None,
    };

    Execution {
        id: execution.id.clone(),
        agent_id: canonical_id(PlatformType::Make, scenario_id),
        status,
        started_at,
        stopped_at,
        data: Some(json!({
            "operations": execution.operations,
            "transfer": execution.transfer,
            "executionTime": execution.execution_time,
        })),
        error: match status {
            ExecutionStatus::Error => execution
                .error_message()
                .or_else(|| Some("Scenario execution failed".to_string())),
            _ => None,
        },
    }
}

/// Canonical agent for a scenario and its recent executions.
///
/// `executions` is `None` when the execution history could not be fetched.
pub fn map_scenario(
    scenario: &MakeScenario,
    executions: Option<&[MakeExecution]>,
    platform_id: &str,
    response_time: u64,
) -> Agent {
    let window = executions.unwrap_or(&[]);
    let metrics = calculate_agent_metrics(window);

    let mut configuration = BTreeMap::new();
    configuration.insert("scenarioId".to_string(), json!(scenario.id));
    if let Some(team) = &scenario.team_id {
        configuration.insert("teamId".to_string(), team.clone());
    }
    if let Some(description) = &scenario.description {
        configuration.insert("description".to_string(), json!(description));
    }
    if let Some(scheduling) = &scenario.scheduling {
        configuration.insert(
            "scheduling".to_string(),
            json!({ "type": scheduling.schedule_type, "interval": scheduling.interval }),
        );
    }
    if let Some(edited) = scenario.last_edit {
        configuration.insert("lastEdit".to_string(), json!(edited));
    }
    configuration.insert("isPaused".to_string(), json!(scenario.is_paused));
    configuration.insert("metrics".to_string(), json!(metrics));

    let health_status = match executions {
        Some(_) => HealthStatus::healthy(response_time),
        None => HealthStatus {
            status: HealthState::Degraded,
            last_check: Utc::now(),
            response_time,
            error: Some("Execution history unavailable".to_string()),
        },
    };

    Agent {
        id: canonical_id(PlatformType::Make, &scenario.id),
        name: scenario.name.clone(),
        platform_id: platform_id.to_string(),
        platform_type: PlatformType::Make,
        status: determine_agent_status(scenario, window),
        capabilities: extract_capabilities(scenario),
        configuration,
        health_status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::make::types::{MakeBlueprint, MakeModule, MakeScheduling};

    fn execution(status: MakeExecutionStatus, ms: Option<f64>) -> MakeExecution {
        MakeExecution {
            id: "e".into(),
            imt_id: None,
            status,
            execution_time: ms,
            timestamp: None,
            operations: None,
            transfer: None,
            error: None,
        }
    }

    fn module(name: &str) -> MakeModule {
        MakeModule {
            id: None,
            module: name.to_string(),
        }
    }

    #[test]
    fn test_metrics_empty_never_divides() {
        assert_eq!(
            calculate_agent_metrics(&[]),
            AgentMetrics {
                tasks_completed: 0,
                average_execution_time: 0.0,
                error_rate: 0.0,
            }
        );
    }

    #[test]
    fn test_metrics_mean_and_error_rate() {
        let metrics = calculate_agent_metrics(&[
            execution(MakeExecutionStatus::Success, Some(100.0)),
            execution(MakeExecutionStatus::Error, Some(300.0)),
            execution(MakeExecutionStatus::Success, None),
            execution(MakeExecutionStatus::Warning, Some(200.0)),
        ]);
        assert_eq!(metrics.tasks_completed, 4);
        assert_eq!(metrics.average_execution_time, 200.0);
        assert_eq!(metrics.error_rate, 0.25);
    }

    #[test]
    fn test_locked_scenario_is_maintenance() {
        let scenario = MakeScenario {
            is_active: true,
            is_locked: true,
            ..Default::default()
        };
        assert_eq!(
            determine_agent_status(&scenario, &[]),
            AgentStatus::Maintenance
        );
    }

    #[test]
    fn test_error_threshold_overrides_active() {
        let scenario = MakeScenario {
            is_active: true,
            ..Default::default()
        };
        let mut window = vec![execution(MakeExecutionStatus::Error, None); 4];
        assert_eq!(determine_agent_status(&scenario, &window), AgentStatus::Active);

        window.push(execution(MakeExecutionStatus::Error, None));
        assert_eq!(determine_agent_status(&scenario, &window), AgentStatus::Error);

        let inactive = MakeScenario::default();
        assert_eq!(determine_agent_status(&inactive, &[]), AgentStatus::Inactive);
    }

    #[test]
    fn test_capabilities_from_modules_and_schedule() {
        let scenario = MakeScenario {
            is_active: true,
            blueprint: Some(MakeBlueprint {
                flow: vec![module("webhook"), module("http"), module("email")],
            }),
            scheduling: Some(MakeScheduling {
                schedule_type: Some("indefinitely".into()),
                interval: Some(900),
            }),
            ..Default::default()
        };
        let expected: BTreeSet<String> =
            ["webhook", "http", "email", "scheduling:indefinitely", "active"]
                .into_iter()
                .map(String::from)
                .collect();
        assert_eq!(extract_capabilities(&scenario), expected);
    }

    #[test]
    fn test_capabilities_normalize_module_names() {
        let scenario = MakeScenario {
            blueprint: Some(MakeBlueprint {
                flow: vec![
                    module("http:ActionSendData"),
                    module("http:ActionGetFile"),
                    module("google-sheets:addRow"),
                ],
            }),
            ..Default::default()
        };
        let caps: Vec<String> = extract_capabilities(&scenario).into_iter().collect();
        assert_eq!(caps, vec!["google-sheets", "http", "inactive"]);
    }

    #[test]
    fn test_map_execution_times_and_errors() {
        let mut failed = execution(MakeExecutionStatus::Error, Some(1500.0));
        failed.timestamp = Some(DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(60));
        let mapped = map_execution(&failed, "925");

        assert_eq!(mapped.agent_id, "make_925");
        assert_eq!(mapped.status, ExecutionStatus::Error);
        assert_eq!(
            mapped.stopped_at,
            Some(DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(61_500))
        );
        assert_eq!(mapped.error.as_deref(), Some("Scenario execution failed"));

        let running = map_execution(&execution(MakeExecutionStatus::Running, None), "925");
        assert!(running.stopped_at.is_none());
    }

    #[test]
    fn test_map_execution_clamps_oversized_duration() {
        let mut huge = execution(MakeExecutionStatus::Success, Some(1e20));
        huge.timestamp = Some(DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(60));
        let mapped = map_execution(&huge, "925");
        assert_eq!(mapped.stopped_at, huge.timestamp);

        let late = MakeExecution {
            timestamp: Some(DateTime::<Utc>::MAX_UTC),
            ..execution(MakeExecutionStatus::Success, Some(5_000.0))
        };
        assert_eq!(map_execution(&late, "925").stopped_at, Some(DateTime::<Utc>::MAX_UTC));
    }

    #[test]
    fn test_map_scenario_without_history_is_degraded() {
        let scenario = MakeScenario {
            id: "7".into(),
            name: "Invoices".into(),
            is_active: true,
            ..Default::default()
        };
        let agent = map_scenario(&scenario, None, "make-eu", 80);
        assert_eq!(agent.id, "make_7");
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.health_status.status, HealthState::Degraded);
        assert_eq!(agent.configuration["metrics"]["tasksCompleted"], 0);
    }
}
