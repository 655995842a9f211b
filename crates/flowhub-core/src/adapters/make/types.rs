//! Native Make.com payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::adapters::base::{id_string, optional_id_string};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MakeScenario {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub team_id: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub blueprint: Option<MakeBlueprint>,
    #[serde(default)]
    pub scheduling: Option<MakeScheduling>,
    #[serde(default)]
    pub last_edit: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MakeBlueprint {
    #[serde(default)]
    pub flow: Vec<MakeModule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MakeModule {
    #[serde(default)]
    pub id: Option<Value>,
    pub module: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MakeScheduling {
    #[serde(rename = "type", default)]
    pub schedule_type: Option<String>,
    #[serde(default)]
    pub interval: Option<u64>,
}

/// Outcome of a Make execution; the API reports it as a code or a word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeExecutionStatus {
    Success,
    Warning,
    Error,
    Running,
}

impl MakeExecutionStatus {
    fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Success,
            2 => Self::Warning,
            3 => Self::Error,
            _ => Self::Running,
        }
    }

    fn from_word(word: &str) -> Self {
        match word.to_ascii_lowercase().as_str() {
            "success" | "1" => Self::Success,
            "warning" | "2" => Self::Warning,
            "error" | "failed" | "3" => Self::Error,
            _ => Self::Running,
        }
    }
}

impl<'de> Deserialize<'de> for MakeExecutionStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Code(i64),
            Word(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Code(code) => Self::from_code(code),
            Raw::Word(word) => Self::from_word(&word),
        })
    }
}

/// One scenario run. Log payloads carry `imtId` next to (or instead of) `id`.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawExecution")]
pub struct MakeExecution {
    pub id: String,
    pub imt_id: Option<String>,
    pub status: MakeExecutionStatus,
    /// Milliseconds
    pub execution_time: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub operations: Option<u64>,
    pub transfer: Option<u64>,
    pub error: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExecution {
    #[serde(default, deserialize_with = "optional_id_string")]
    id: Option<String>,
    #[serde(default, deserialize_with = "optional_id_string")]
    imt_id: Option<String>,
    status: MakeExecutionStatus,
    #[serde(default, alias = "duration")]
    execution_time: Option<f64>,
    #[serde(default, alias = "startedAt")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    operations: Option<u64>,
    #[serde(default)]
    transfer: Option<u64>,
    #[serde(default)]
    error: Option<Value>,
}

impl TryFrom<RawExecution> for MakeExecution {
    type Error = String;

    fn try_from(raw: RawExecution) -> std::result::Result<Self, Self::Error> {
        let id = raw
            .id
            .or_else(|| raw.imt_id.clone())
            .ok_or_else(|| "execution has neither `id` nor `imtId`".to_string())?;
        Ok(Self {
            id,
            imt_id: raw.imt_id,
            status: raw.status,
            execution_time: raw.execution_time,
            timestamp: raw.timestamp,
            operations: raw.operations,
            transfer: raw.transfer,
            error: raw.error,
        })
    }
}

impl MakeExecution {
    /// Human-readable error message, if the execution reported one
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScenarioList {
    #[serde(default)]
    pub scenarios: Vec<MakeScenario>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScenarioEnvelope {
    pub scenario: MakeScenario,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExecutionList {
    #[serde(default)]
    pub executions: Vec<MakeExecution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunResponse {
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub status: Option<MakeExecutionStatus>,
    #[serde(default)]
    pub outputs: Option<Value>,
}
