use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::ValueMap;
use crate::error::ConductorError;

/// Lifecycle of a workflow execution.
///
/// `Draft → Ready → Running ⇄ Paused → Completed | Failed | Cancelled`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkflowStatus {
    #[serde(rename = "DRAFT")]
    Draft,
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(Self::Draft),
            "READY" => Some(Self::Ready),
            "RUNNING" => Some(Self::Running),
            "PAUSED" => Some(Self::Paused),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StepStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "SKIPPED")]
    Skipped,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Run record of one step within one workflow execution.
///
/// Retried attempts update this record (attempts, retry count, logs) rather
/// than creating new ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepExecution {
    pub id: String,
    pub workflow_execution_id: String,
    pub step_id: String,
    pub agent_id: String,
    pub status: StepStatus,
    /// Completed without running because its execution condition was false.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub input_data: ValueMap,
    #[serde(default)]
    pub output_data: ValueMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Dispatch attempts made (initial + retries).
    #[serde(default)]
    pub attempts: u32,
    /// Retries consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl WorkflowStepExecution {
    pub fn pending(execution_id: &str, step_id: &str, agent_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            agent_id: agent_id.to_string(),
            status: StepStatus::Pending,
            skipped: false,
            input_data: ValueMap::new(),
            output_data: ValueMap::new(),
            start_time: None,
            end_time: None,
            error_message: None,
            attempts: 0,
            retry_count: 0,
            logs: Vec::new(),
        }
    }

    /// Whether the step ever started running.
    pub fn was_started(&self) -> bool {
        self.start_time.is_some()
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), line.into()));
    }
}

/// Run record of a whole workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub input_data: ValueMap,
    #[serde(default)]
    pub output_data: ValueMap,
    /// In plan order.
    #[serde(default)]
    pub step_executions: Vec<WorkflowStepExecution>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub executed_by: String,
    #[serde(default)]
    pub context: ValueMap,
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: &str,
        input_data: ValueMap,
        executed_by: &str,
        context: ValueMap,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::Ready,
            input_data,
            output_data: ValueMap::new(),
            step_executions: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            error_message: None,
            logs: Vec::new(),
            executed_by: executed_by.to_string(),
            context,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStepExecution> {
        self.step_executions.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut WorkflowStepExecution> {
        self.step_executions.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), line.into()));
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    /// The finished record, or the error that ended it. A failure caused by
    /// a step deadline is reported as `Timeout`.
    pub fn into_result(self) -> Result<WorkflowExecution, ConductorError> {
        let message = self
            .error_message
            .clone()
            .unwrap_or_else(|| format!("Execution {} {}", self.id, self.status.as_str()));
        match self.status {
            WorkflowStatus::Completed => Ok(self),
            WorkflowStatus::Cancelled => Err(ConductorError::Cancelled(message)),
            WorkflowStatus::Failed => {
                let timed_out = self.step_executions.iter().any(|s| {
                    s.status == StepStatus::Failed
                        && s.error_message.as_deref().is_some_and(|m| m.contains("timed out"))
                });
                if timed_out {
                    Err(ConductorError::Timeout(message))
                } else {
                    Err(ConductorError::Handler(message))
                }
            }
            other => Err(ConductorError::Validation(format!(
                "Execution {} has not finished ({})",
                self.id,
                other.as_str()
            ))),
        }
    }
}
