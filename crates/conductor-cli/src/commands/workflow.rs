//! `conductor workflow` — Define, run and inspect workflows.

use conductor_core::models::{ValueMap, WorkflowExecution};
use conductor_core::state::AppState;
use conductor_core::workflow::{resolve, ExecutionPlan, WorkflowDefinition};

use super::{describe, parse_inputs, print_record, rule, truncate};

fn load(workflow_file: &str) -> Result<WorkflowDefinition, String> {
    WorkflowDefinition::from_file(workflow_file).map_err(describe)
}

/// Run a workflow from a YAML file without storing its definition.
pub async fn run(
    state: &AppState,
    workflow_file: &str,
    inputs: &[String],
    executed_by: &str,
) -> Result<(), String> {
    let workflow = load(workflow_file)?;
    let input = parse_inputs(inputs)?;

    println!("📄 Loaded workflow: {} ({})", workflow.name, workflow_file);
    println!(
        "   {} step(s), mode: {}",
        workflow.steps.len(),
        workflow.execution_mode.as_str()
    );
    println!();

    let execution = state
        .workflows
        .execute_definition(&workflow, input, executed_by, ValueMap::new())
        .await
        .map_err(describe)?;
    report(&execution)
}

/// Run a stored workflow.
pub async fn start(
    state: &AppState,
    workflow_id: &str,
    inputs: &[String],
    executed_by: &str,
) -> Result<(), String> {
    let input = parse_inputs(inputs)?;
    let execution = state
        .workflows
        .execute(workflow_id, input, executed_by, ValueMap::new())
        .await
        .map_err(describe)?;
    report(&execution)
}

fn report(execution: &WorkflowExecution) -> Result<(), String> {
    print!("{}", render_steps(execution));
    println!();
    println!("Execution: {} ({})", execution.id, execution.status.as_str());
    println!("Output:");
    print_record(&execution.output_data)?;

    execution.clone().into_result().map_err(describe)?;
    println!("\n🎉 Workflow completed successfully!");
    Ok(())
}

/// Validate a workflow YAML file against the registered agents.
pub async fn validate(state: &AppState, workflow_file: &str) -> Result<(), String> {
    let workflow = load(workflow_file)?;
    let result = state.workflows.validate(&workflow);

    for warning in &result.warnings {
        println!("⚠️  {}", warning);
    }
    if !result.is_valid {
        for error in &result.errors {
            println!("❌ {}", error);
        }
        return Err(format!("Workflow '{}' is invalid", workflow.id));
    }

    println!("✅ Workflow '{}' is valid", workflow.name);
    println!("   Version: {}", workflow.version);
    println!("   Mode: {}", workflow.execution_mode.as_str());
    println!("   Steps: {}", workflow.steps.len());
    Ok(())
}

/// Print the execution layers of a workflow YAML file.
pub async fn plan(workflow_file: &str) -> Result<(), String> {
    let workflow = load(workflow_file)?;
    let plan = resolve(&workflow).map_err(|e| describe(e.into()))?;
    print!("{}", render_plan(&plan));
    Ok(())
}

/// Store a workflow definition.
pub async fn create(state: &AppState, workflow_file: &str) -> Result<(), String> {
    let workflow = load(workflow_file)?;
    let created = state
        .workflows
        .create(workflow)
        .await
        .map_err(describe)?;
    println!("✅ Created workflow '{}' ({})", created.id, created.name);
    Ok(())
}

pub async fn list(state: &AppState) -> Result<(), String> {
    let workflows = state
        .workflows
        .list_definitions()
        .await
        .map_err(describe)?;
    if workflows.is_empty() {
        println!("No workflows stored.");
        return Ok(());
    }
    print!("{}", render_definitions(&workflows));
    Ok(())
}

pub async fn delete(state: &AppState, workflow_id: &str) -> Result<(), String> {
    state
        .workflows
        .delete(workflow_id)
        .await
        .map_err(describe)?;
    println!("🗑️  Deleted workflow '{}'", workflow_id);
    Ok(())
}

pub async fn executions(state: &AppState, workflow_id: Option<&str>) -> Result<(), String> {
    let executions = state
        .workflows
        .list_executions(workflow_id)
        .await
        .map_err(describe)?;
    if executions.is_empty() {
        println!("No executions recorded.");
        return Ok(());
    }
    print!("{}", render_executions(&executions));
    Ok(())
}

pub async fn execution(state: &AppState, execution_id: &str) -> Result<(), String> {
    let execution = state
        .workflows
        .get_execution(execution_id)
        .await
        .map_err(describe)?;
    print_record(&execution)
}

// ─── Rendering ─────────────────────────────────────────────────────────────

pub fn render_plan(plan: &ExecutionPlan) -> String {
    let mut out = format!(
        "Mode: {} ({} step(s) in {} layer(s))\n",
        plan.mode.as_str(),
        plan.step_count(),
        plan.layers.len()
    );
    for (i, layer) in plan.layers.iter().enumerate() {
        out.push_str(&format!("  {}. {}\n", i + 1, layer.join(", ")));
    }
    out
}

pub fn render_steps(execution: &WorkflowExecution) -> String {
    let mut out = String::new();
    let widths = [16, 10, 8, 28];
    out.push_str(&rule('┌', '┬', '┐', &widths));
    out.push_str("│ Step             │ Status     │ Attempts │ Note                         │\n");
    out.push_str(&rule('├', '┼', '┤', &widths));
    for step in &execution.step_executions {
        let note = if step.skipped {
            "condition false".to_string()
        } else {
            step.error_message.clone().unwrap_or_default()
        };
        out.push_str(&format!(
            "│ {:<16} │ {:<10} │ {:<8} │ {:<28} │\n",
            truncate(&step.step_id, 16),
            step.status.as_str(),
            step.attempts,
            truncate(&note, 28)
        ));
    }
    out.push_str(&rule('└', '┴', '┘', &widths));
    out
}

fn render_definitions(workflows: &[WorkflowDefinition]) -> String {
    let mut out = String::new();
    let widths = [16, 20, 11, 5];
    out.push_str(&rule('┌', '┬', '┐', &widths));
    out.push_str("│ ID               │ Name                 │ Mode        │ Steps │\n");
    out.push_str(&rule('├', '┼', '┤', &widths));
    for wf in workflows {
        out.push_str(&format!(
            "│ {:<16} │ {:<20} │ {:<11} │ {:<5} │\n",
            truncate(&wf.id, 16),
            truncate(&wf.name, 20),
            wf.execution_mode.as_str(),
            wf.steps.len()
        ));
    }
    out.push_str(&rule('└', '┴', '┘', &widths));
    out
}

fn render_executions(executions: &[WorkflowExecution]) -> String {
    let mut out = String::new();
    let widths = [36, 16, 9, 23];
    out.push_str(&rule('┌', '┬', '┐', &widths));
    out.push_str(&format!(
        "│ {:<36} │ {:<16} │ {:<9} │ {:<23} │\n",
        "Execution", "Workflow", "Status", "Started"
    ));
    out.push_str(&rule('├', '┼', '┤', &widths));
    for e in executions {
        out.push_str(&format!(
            "│ {:<36} │ {:<16} │ {:<9} │ {:<23} │\n",
            e.id,
            truncate(&e.workflow_id, 16),
            e.status.as_str(),
            e.start_time.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    out.push_str(&rule('└', '┴', '┘', &widths));
    out
}
