use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::{Value, ValueMap};

/// Advisory priority. It is recorded on the command but never preempts work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CommandPriority {
    #[serde(rename = "LOW")]
    Low,
    #[default]
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl CommandPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// A typed unit of work submitted to one agent. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCommand {
    pub id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub parameters: ValueMap,
    #[serde(default)]
    pub priority: CommandPriority,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub context: ValueMap,
}

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

impl AgentCommand {
    pub fn new(agent_id: impl Into<String>, command_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            command_type: command_type.into(),
            parameters: ValueMap::new(),
            priority: CommandPriority::Normal,
            timeout_seconds: DEFAULT_COMMAND_TIMEOUT_SECS,
            created_at: Utc::now(),
            context: ValueMap::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: ValueMap) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Zero is clamped to one second.
    pub fn with_timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs.max(1);
        self
    }

    pub fn with_context(mut self, context: ValueMap) -> Self {
        self.context = context;
        self
    }
}

/// Outcome of one command attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExecutionResult {
    pub execution_id: String,
    pub agent_id: String,
    pub command_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_data: Option<ValueMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl AgentExecutionResult {
    /// A result that has started but not yet finished.
    pub fn started(command: &AgentCommand) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            agent_id: command.agent_id.clone(),
            command_id: command.id.clone(),
            success: false,
            output_data: None,
            error_message: None,
            start_time: Utc::now(),
            end_time: None,
            logs: Vec::new(),
        }
    }

    /// A failed result for a command that was never executed.
    pub fn rejected(command: &AgentCommand, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut result = Self::started(command);
        result.logs.push(format!("rejected: {}", message));
        result.error_message = Some(message);
        result.end_time = Some(result.start_time);
        result
    }

    pub fn succeed(&mut self, output: ValueMap) {
        self.success = true;
        self.output_data = Some(output);
        self.error_message = None;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.success = false;
        self.error_message = Some(message.into());
    }

    pub fn finish(&mut self) {
        self.end_time = Some(Utc::now());
    }

    /// Elapsed time, if the result has been finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}
