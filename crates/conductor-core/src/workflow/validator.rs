//! Workflow definition validation.
//!
//! Errors block a definition from being stored or executed; warnings are
//! reported alongside but never block.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::registry::AgentRegistry;
use crate::workflow::condition::Condition;
use crate::workflow::resolver;
use crate::workflow::schema::{ExecutionMode, WorkflowDefinition, WorkflowStep};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// All errors joined into one line.
    pub fn error_summary(&self) -> String {
        self.errors.join("; ")
    }
}

/// Checks definitions against the agents known to a registry.
pub struct WorkflowValidator<'a> {
    registry: &'a AgentRegistry,
    max_retry_warning: u32,
}

impl<'a> WorkflowValidator<'a> {
    pub fn new(registry: &'a AgentRegistry, max_retry_warning: u32) -> Self {
        Self {
            registry,
            max_retry_warning,
        }
    }

    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if definition.id.trim().is_empty() {
            errors.push("Workflow id must not be empty".to_string());
        }
        if definition.steps.is_empty() {
            errors.push("Workflow must contain at least one step".to_string());
            return ValidationResult::from_parts(errors, warnings);
        }

        for param in definition.input_parameters.iter().chain(&definition.output_parameters) {
            if param.name.trim().is_empty() {
                errors.push("Parameter names must not be empty".to_string());
            }
        }

        let mut seen = HashSet::new();
        let mut graph_ok = true;
        for step in &definition.steps {
            if step.id.trim().is_empty() {
                errors.push("Step id must not be empty".to_string());
                graph_ok = false;
            } else if !seen.insert(step.id.as_str()) {
                errors.push(format!("Duplicate step id '{}'", step.id));
                graph_ok = false;
            }
        }

        for step in &definition.steps {
            self.check_step(step, &seen, &mut errors, &mut graph_ok);
        }

        let plan = if graph_ok {
            match resolver::resolve(definition) {
                Ok(plan) => Some(plan),
                Err(e) => {
                    errors.push(e.to_string());
                    None
                }
            }
        } else {
            None
        };

        self.collect_warnings(definition, plan.as_ref(), &mut warnings);
        ValidationResult::from_parts(errors, warnings)
    }

    fn check_step(
        &self,
        step: &WorkflowStep,
        step_ids: &HashSet<&str>,
        errors: &mut Vec<String>,
        graph_ok: &mut bool,
    ) {
        let label = if step.id.is_empty() { "<unnamed>" } else { step.id.as_str() };

        if step.agent_id.trim().is_empty() {
            errors.push(format!("Step '{}' has no agent id", label));
        } else if !self.registry.contains(&step.agent_id) {
            errors.push(format!(
                "Step '{}' references unknown agent '{}'",
                label, step.agent_id
            ));
        }

        if step.timeout_seconds == 0 {
            errors.push(format!("Step '{}' must have a timeout greater than zero", label));
        }

        for dep in &step.dependencies {
            if !step_ids.contains(dep.as_str()) {
                errors.push(format!("Step '{}' depends on unknown step '{}'", label, dep));
                *graph_ok = false;
            }
        }

        for (from, to) in &step.input_mapping {
            if from.trim().is_empty() || to.trim().is_empty() {
                errors.push(format!("Step '{}' has an empty input mapping key", label));
            }
        }
        for (from, to) in &step.output_mapping {
            if from.trim().is_empty() || to.trim().is_empty() {
                errors.push(format!("Step '{}' has an empty output mapping key", label));
            }
        }

        if let Some(cond) = step.execution_condition.as_deref() {
            if !cond.trim().is_empty() {
                if let Err(e) = Condition::parse(cond) {
                    errors.push(format!("Step '{}': {}", label, e));
                }
            }
        }
    }

    fn collect_warnings(
        &self,
        definition: &WorkflowDefinition,
        plan: Option<&resolver::ExecutionPlan>,
        warnings: &mut Vec<String>,
    ) {
        if !definition.execution_mode.is_layered() {
            let mut by_order: BTreeMap<i32, Vec<&str>> = BTreeMap::new();
            for step in &definition.steps {
                by_order.entry(step.order).or_default().push(&step.id);
            }
            for (order, ids) in by_order.iter().filter(|(_, ids)| ids.len() > 1) {
                warnings.push(format!(
                    "Steps {} share order {}; declaration order breaks the tie",
                    ids.join(", "),
                    order
                ));
            }
        }

        let mut output_targets: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for step in &definition.steps {
            if step.retry_count > self.max_retry_warning {
                warnings.push(format!(
                    "Step '{}' retries {} times (more than {})",
                    step.id, step.retry_count, self.max_retry_warning
                ));
            }
            for target in step.output_mapping.values() {
                output_targets.entry(target.as_str()).or_default().push(&step.id);
            }
            if definition.execution_mode == ExecutionMode::Sequential {
                for dep in &step.dependencies {
                    if let Some(target) = definition.step(dep) {
                        if target.order > step.order {
                            warnings.push(format!(
                                "Step '{}' (order {}) depends on '{}' with higher order {}",
                                step.id, step.order, target.id, target.order
                            ));
                        }
                    }
                }
            }
        }
        for (key, ids) in output_targets.iter().filter(|(_, ids)| ids.len() > 1) {
            warnings.push(format!(
                "Steps {} all write workflow key '{}'; the last one to finish wins",
                ids.join(", "),
                key
            ));
        }

        if let Some(plan) = plan {
            if definition.execution_mode == ExecutionMode::Parallel
                && plan.step_count() > 1
                && plan.layers.iter().all(|layer| layer.len() == 1)
            {
                let note = "Parallel workflow has no independent steps; it will run sequentially";
                warnings.push(note.to_string());
            }
        }
    }
}
