use std::path::PathBuf;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExecutionState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionState::Running)
    }
}

/// An image the engine produced, copied into the local output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputImage {
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
    pub folder_type: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Returned as soon as the engine accepted a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionHandle {
    pub execution_id: String,
    pub prompt_id: Option<String>,
    pub status: ExecutionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionStatus {
    pub execution_id: String,
    pub prompt_id: Option<String>,
    pub status: ExecutionState,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub images: Vec<OutputImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionStatus {
    pub fn running(execution_id: impl Into<String>, prompt_id: Option<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            prompt_id,
            status: ExecutionState::Running,
            started_at: Utc::now(),
            finished_at: None,
            images: Vec::new(),
            error: None,
        }
    }

    /// Moves a running execution to `state`. Terminal states are final, so
    /// this returns `false` and changes nothing once one is reached.
    pub fn finish(&mut self, state: ExecutionState, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = state;
        self.error = error;
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn handle(&self) -> ExecutionHandle {
        ExecutionHandle {
            execution_id: self.execution_id.clone(),
            prompt_id: self.prompt_id.clone(),
            status: self.status,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthState {
    Connected,
    Disconnected,
    Error,
    Unknown,
}

/// Reachability of the workflow engine behind an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EngineHealth {
    pub status: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineHealth {
    pub fn connected(response_time_ms: f64) -> Self {
        Self {
            status: HealthState::Connected,
            response_time_ms: Some(response_time_ms),
            error: None,
        }
    }

    pub fn disconnected(error: impl Into<String>) -> Self {
        Self {
            status: HealthState::Disconnected,
            response_time_ms: None,
            error: Some(error.into()),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: HealthState::Error,
            response_time_ms: None,
            error: Some(error.into()),
        }
    }

    pub fn unknown() -> Self {
        Self {
            status: HealthState::Unknown,
            response_time_ms: None,
            error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == HealthState::Connected
    }
}
