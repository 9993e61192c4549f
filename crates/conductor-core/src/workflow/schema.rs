//! Schema types for workflow definitions.
//!
//! A workflow definition is a graph of steps, each bound to an agent:
//!
//! ```yaml
//! id: "review-flow"
//! name: "Review Flow"
//! version: "1.0"
//! executionMode: PARALLEL
//!
//! inputParameters:
//!   - name: document
//!     type: string
//!     required: true
//!
//! steps:
//!   - id: summarize
//!     name: "Summarize"
//!     order: 1
//!     agentId: summarizer
//!     inputMapping:
//!       document: text          # workflow data key -> step input key
//!     outputMapping:
//!       summary: summary        # step output key -> workflow data key
//!     timeoutSeconds: 60
//!     retryCount: 2
//!
//!   - id: publish
//!     name: "Publish"
//!     order: 2
//!     agentId: publisher
//!     dependencies: [summarize]
//!     executionCondition: "summary != ''"
//!     inputMapping:
//!       summary: body
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConductorError;
use crate::models::command::CommandPriority;
use crate::models::value::{Value, ValueMap};

/// How the engine walks the execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// One step at a time in dependency order.
    #[default]
    Sequential,
    /// Every ready layer is dispatched concurrently.
    Parallel,
    /// Sequential, with execution conditions deciding which steps run.
    Conditional,
    /// Sequential order over a mix of conditional and unconditional steps.
    Mixed,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "SEQUENTIAL",
            Self::Parallel => "PARALLEL",
            Self::Conditional => "CONDITIONAL",
            Self::Mixed => "MIXED",
        }
    }

    /// Whether steps of one layer may run concurrently.
    pub fn is_layered(&self) -> bool {
        matches!(self, Self::Parallel)
    }
}

/// Declared input or output parameter of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    pub name: String,
    /// Informational type tag: string, number, bool, list, map.
    #[serde(rename = "type", default)]
    pub param_type: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Top-level workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    /// Steps in declaration order.
    pub steps: Vec<WorkflowStep>,

    #[serde(default)]
    pub input_parameters: Vec<ParameterSpec>,

    #[serde(default)]
    pub output_parameters: Vec<ParameterSpec>,

    #[serde(default)]
    pub created_by: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// One node of the workflow's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Unique within the definition.
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Tie-break hint; dependencies always win.
    #[serde(default)]
    pub order: i32,

    pub agent_id: String,

    /// Type tag carried by the commands this step dispatches.
    #[serde(default = "default_command_type")]
    pub command_type: String,

    /// Advisory priority stamped on every dispatched command.
    #[serde(default)]
    pub priority: CommandPriority,

    /// Static parameters merged under the mapped inputs.
    #[serde(default)]
    pub configuration: ValueMap,

    /// workflow-data-key -> step-input-key
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,

    /// step-output-key -> workflow-data-key
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,

    /// Predicate over accumulated workflow data; the step is skipped when false.
    #[serde(default)]
    pub execution_condition: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Re-attempts after the first failure.
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

fn default_command_type() -> String {
    "execute".to_string()
}

fn default_timeout() -> u64 {
    300
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            order: 0,
            agent_id: agent_id.into(),
            command_type: default_command_type(),
            priority: CommandPriority::Normal,
            configuration: ValueMap::new(),
            input_mapping: BTreeMap::new(),
            output_mapping: BTreeMap::new(),
            execution_condition: None,
            timeout_seconds: default_timeout(),
            retry_count: 0,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.insert(step_id.into());
        self
    }

    pub fn with_priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.execution_condition = Some(condition.into());
        self
    }

    pub fn map_input(
        mut self,
        workflow_key: impl Into<String>,
        step_key: impl Into<String>,
    ) -> Self {
        self.input_mapping.insert(workflow_key.into(), step_key.into());
        self
    }

    pub fn map_output(
        mut self,
        step_key: impl Into<String>,
        workflow_key: impl Into<String>,
    ) -> Self {
        self.output_mapping.insert(step_key.into(), workflow_key.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: default_version(),
            execution_mode: mode,
            steps: Vec::new(),
            input_parameters: Vec::new(),
            output_parameters: Vec::new(),
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Parse a workflow definition from a YAML (or JSON) string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConductorError> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConductorError::Validation(format!("Failed to parse workflow YAML: {}", e))
        })
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, ConductorError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Validation(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_workflow() {
        let yaml = r#"
id: "flow"
name: "Test Flow"
steps:
  - id: "step1"
    agentId: "echo"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.name, "Test Flow");
        assert_eq!(wf.version, "1.0");
        assert_eq!(wf.execution_mode, ExecutionMode::Sequential);
        assert_eq!(wf.steps.len(), 1);
        assert_eq!(wf.steps[0].agent_id, "echo");
        assert_eq!(wf.steps[0].command_type, "execute");
        assert_eq!(wf.steps[0].timeout_seconds, 300);
        assert_eq!(wf.steps[0].retry_count, 0);
    }

    #[test]
    fn test_parse_full_workflow() {
        let yaml = r#"
id: "review"
name: "Review Flow"
version: "2.0"
executionMode: PARALLEL
inputParameters:
  - name: document
    type: string
    required: true
  - name: language
    default: "en"
outputParameters:
  - name: summary
steps:
  - id: summarize
    name: "Summarize"
    order: 1
    agentId: summarizer
    priority: HIGH
    configuration:
      style: short
      maxWords: 50
    inputMapping:
      document: text
    outputMapping:
      summary: summary
    timeoutSeconds: 60
    retryCount: 2
  - id: publish
    order: 2
    agentId: publisher
    dependencies: [summarize]
    executionCondition: "summary != ''"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.version, "2.0");
        assert_eq!(wf.execution_mode, ExecutionMode::Parallel);
        assert_eq!(wf.input_parameters.len(), 2);
        assert!(wf.input_parameters[0].required);
        assert_eq!(wf.input_parameters[1].default, Some(Value::from("en")));
        let summarize = wf.step("summarize").unwrap();
        assert_eq!(summarize.configuration["maxWords"], Value::Int(50));
        assert_eq!(summarize.input_mapping["document"], "text");
        assert_eq!(summarize.retry_count, 2);
        assert_eq!(summarize.priority, CommandPriority::High);
        let publish = wf.step("publish").unwrap();
        assert!(publish.dependencies.contains("summarize"));
        assert!(publish.execution_condition.is_some());
    }

    #[test]
    fn test_from_file_reports_missing_file() {
        let err = WorkflowDefinition::from_file("/nonexistent/flow.yaml").unwrap_err();
        assert!(matches!(err, ConductorError::Validation(_)));
    }

    #[test]
    fn test_from_file_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(&path, "id: f\nname: F\nsteps: []\n").unwrap();
        let wf = WorkflowDefinition::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(wf.id, "f");
        assert!(wf.steps.is_empty());
    }
}
