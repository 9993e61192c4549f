//! Dependency resolver — turns a step graph into an execution plan.
//!
//! Pure function over the steps of a definition. It only reasons about graph
//! shape: whether referenced agents exist is the validator's concern.
//!
//! Layering uses Kahn's algorithm: every step with no unresolved dependency
//! forms one layer, its dependents' in-degrees are decremented, repeat. Ties
//! inside a layer (and in the sequential order) break on ascending `order`,
//! then declaration position.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ConductorError;
use crate::workflow::schema::{ExecutionMode, WorkflowDefinition, WorkflowStep};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("dependency cycle detected: {}", .steps.join(" -> "))]
    Cycle { steps: Vec<String> },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),
}

impl From<ResolveError> for ConductorError {
    fn from(e: ResolveError) -> Self {
        ConductorError::Validation(e.to_string())
    }
}

/// A validated schedule: layers run in order; steps inside a layer may run
/// concurrently when the mode is layered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub mode: ExecutionMode,
    pub layers: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Flattened step order.
    pub fn order(&self) -> Vec<String> {
        self.layers.iter().flatten().cloned().collect()
    }

    pub fn step_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

}

/// Resolve a definition into a plan for its execution mode.
pub fn resolve(definition: &WorkflowDefinition) -> Result<ExecutionPlan, ResolveError> {
    resolve_steps(&definition.steps, definition.execution_mode)
}

pub fn resolve_steps(
    steps: &[WorkflowStep],
    mode: ExecutionMode,
) -> Result<ExecutionPlan, ResolveError> {
    let index = index_steps(steps)?;

    for step in steps {
        for dep in &step.dependencies {
            if !index.contains_key(dep.as_str()) {
                return Err(ResolveError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(steps, &index) {
        return Err(ResolveError::Cycle { steps: cycle });
    }

    let layers = if mode.is_layered() {
        kahn_layers(steps, &index)
    } else {
        topological_order(steps, &index)
            .into_iter()
            .map(|id| vec![id])
            .collect()
    };

    Ok(ExecutionPlan { mode, layers })
}

/// Step id -> declaration position.
fn index_steps(steps: &[WorkflowStep]) -> Result<HashMap<&str, usize>, ResolveError> {
    let mut index = HashMap::with_capacity(steps.len());
    for (pos, step) in steps.iter().enumerate() {
        if index.insert(step.id.as_str(), pos).is_some() {
            return Err(ResolveError::DuplicateStep(step.id.clone()));
        }
    }
    Ok(index)
}

/// Sort key used for every tie-break.
fn rank(steps: &[WorkflowStep], pos: usize) -> (i32, usize) {
    (steps[pos].order, pos)
}

fn dependents_and_in_degree(
    steps: &[WorkflowStep],
    index: &HashMap<&str, usize>,
) -> (Vec<Vec<usize>>, Vec<usize>) {
    let mut dependents = vec![Vec::new(); steps.len()];
    let mut in_degree = vec![0usize; steps.len()];
    for (pos, step) in steps.iter().enumerate() {
        for dep in &step.dependencies {
            if let Some(&dep_pos) = index.get(dep.as_str()) {
                dependents[dep_pos].push(pos);
                in_degree[pos] += 1;
            }
        }
    }
    (dependents, in_degree)
}

fn kahn_layers(steps: &[WorkflowStep], index: &HashMap<&str, usize>) -> Vec<Vec<String>> {
    let (dependents, mut in_degree) = dependents_and_in_degree(steps, index);
    let mut ready: Vec<usize> = (0..steps.len()).filter(|&p| in_degree[p] == 0).collect();
    let mut layers = Vec::new();

    while !ready.is_empty() {
        ready.sort_by_key(|&p| rank(steps, p));
        let mut next = Vec::new();
        for &pos in &ready {
            for &dependent in &dependents[pos] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        layers.push(ready.iter().map(|&p| steps[p].id.clone()).collect());
        ready = next;
    }
    layers
}

/// Total order: Kahn's algorithm extracting the lowest-ranked ready step each round.
fn topological_order(steps: &[WorkflowStep], index: &HashMap<&str, usize>) -> Vec<String> {
    let (dependents, mut in_degree) = dependents_and_in_degree(steps, index);
    let mut ready: BTreeSet<(i32, usize)> = (0..steps.len())
        .filter(|&p| in_degree[p] == 0)
        .map(|p| rank(steps, p))
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(next) = ready.pop_first() {
        let pos = next.1;
        order.push(steps[pos].id.clone());
        for &dependent in &dependents[pos] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(rank(steps, dependent));
            }
        }
    }
    order
}

/// Depth-first search for a cycle; returns the path `a -> b -> ... -> a`.
fn find_cycle(steps: &[WorkflowStep], index: &HashMap<&str, usize>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut on_stack = Vec::new();

    for pos in 0..steps.len() {
        if !visited.contains(&pos) {
            if let Some(cycle) = dfs_cycle(pos, steps, index, &mut visited, &mut on_stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle(
    pos: usize,
    steps: &[WorkflowStep],
    index: &HashMap<&str, usize>,
    visited: &mut HashSet<usize>,
    on_stack: &mut Vec<usize>,
) -> Option<Vec<String>> {
    visited.insert(pos);
    on_stack.push(pos);

    for dep in &steps[pos].dependencies {
        let Some(&dep_pos) = index.get(dep.as_str()) else {
            continue;
        };
        if let Some(start) = on_stack.iter().position(|&p| p == dep_pos) {
            let mut cycle: Vec<String> = on_stack[start..]
                .iter()
                .map(|&p| steps[p].id.clone())
                .collect();
            cycle.push(steps[dep_pos].id.clone());
            return Some(cycle);
        }
        if !visited.contains(&dep_pos) {
            if let Some(cycle) = dfs_cycle(dep_pos, steps, index, visited, on_stack) {
                return Some(cycle);
            }
        }
    }

    on_stack.pop();
    None
}
