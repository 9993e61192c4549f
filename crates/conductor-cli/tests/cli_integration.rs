//! Integration tests for the conductor-cli commands.
//!
//! These tests exercise the same code paths as the binary against a
//! temporary SQLite database and the builtin agents.

use std::path::Path;

use conductor_cli::commands;
use conductor_core::models::{StepStatus, Value, WorkflowStatus};
use conductor_core::state::AppState;
use conductor_core::workflow::resolve;
use conductor_core::workflow::WorkflowDefinition;

const PIPELINE: &str = r#"
id: greet
name: Greeting Pipeline
executionMode: PARALLEL
inputParameters:
  - name: who
    default: world
steps:
  - id: hello
    agentId: template
    configuration:
      template: "hello ${who}"
    inputMapping:
      who: who
    outputMapping:
      text: greeting
  - id: shout
    agentId: echo
    dependencies: [hello]
    inputMapping:
      greeting: message
  - id: side
    agentId: echo
    configuration:
      note: independent
"#;

async fn test_state(dir: &Path) -> AppState {
    let db = dir.join("conductor.db");
    commands::init_state(db.to_str(), None)
        .await
        .expect("Failed to initialize state")
}

fn write_file(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().to_string()
}

#[tokio::test]
async fn test_init_state_registers_builtin_agents() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let ids: Vec<String> = state.registry.list_info().into_iter().map(|a| a.id).collect();
    for kind in ["delay", "echo", "template"] {
        assert!(ids.contains(&kind.to_string()), "missing agent {}", kind);
    }
    commands::agent::list(&state).await.unwrap();
    commands::agent::health(&state).await.unwrap();
}

#[tokio::test]
async fn test_init_state_uses_config_agents() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(
        dir.path(),
        "conductor.yaml",
        r#"
engine:
  defaultStepTimeoutSecs: 30
agents:
  - id: writer
    handler: template
    capabilities:
      maxConcurrentTasks: 2
"#,
    );
    let db = dir.path().join("c.db");
    let state = commands::init_state(db.to_str(), Some(&config)).await.unwrap();
    assert!(state.registry.contains("writer"));
    assert!(!state.registry.contains("echo"));
    assert_eq!(state.config.engine.default_step_timeout_secs, 30);

    let bad = write_file(
        dir.path(),
        "bad.yaml",
        "agents:\n  - id: x\n    handler: nope\n",
    );
    assert!(commands::init_state(db.to_str(), Some(&bad)).await.is_err());
}

#[tokio::test]
async fn test_run_file_records_execution() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let file = write_file(dir.path(), "greet.yaml", PIPELINE);

    commands::workflow::run(&state, &file, &["who=conductor".to_string()], "tester")
        .await
        .unwrap();

    let executions = state.workflows.list_executions(Some("greet")).await.unwrap();
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(execution.executed_by, "tester");
    assert_eq!(
        execution.output_data.get("greeting"),
        Some(&Value::String("hello conductor".into()))
    );
    let shout = execution.step("shout").unwrap();
    assert_eq!(shout.status, StepStatus::Completed);
    assert_eq!(
        shout.input_data.get("message"),
        Some(&Value::String("hello conductor".into()))
    );

    commands::workflow::execution(&state, &execution.id).await.unwrap();
    commands::workflow::executions(&state, None).await.unwrap();
}

#[tokio::test]
async fn test_validate_and_plan() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let good = write_file(dir.path(), "greet.yaml", PIPELINE);
    commands::workflow::validate(&state, &good).await.unwrap();
    commands::workflow::plan(&good).await.unwrap();

    let plan = resolve(&WorkflowDefinition::from_file(&good).unwrap()).unwrap();
    let rendered = commands::workflow::render_plan(&plan);
    assert!(rendered.starts_with("Mode: PARALLEL (3 step(s) in 2 layer(s))"));
    assert!(rendered.contains("1. hello, side"));
    assert!(rendered.contains("2. shout"));

    let cyclic = write_file(
        dir.path(),
        "cycle.yaml",
        r#"
id: loop
name: Loop
steps:
  - id: a
    agentId: echo
    dependencies: [b]
  - id: b
    agentId: echo
    dependencies: [a]
"#,
    );
    assert!(commands::workflow::validate(&state, &cyclic).await.is_err());
    assert!(commands::workflow::plan(&cyclic).await.is_err());

    let unknown_agent = write_file(
        dir.path(),
        "ghost.yaml",
        "id: ghost\nname: Ghost\nsteps:\n  - id: a\n    agentId: nobody\n",
    );
    assert!(commands::workflow::validate(&state, &unknown_agent).await.is_err());
}

#[tokio::test]
async fn test_create_start_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let file = write_file(dir.path(), "greet.yaml", PIPELINE);

    commands::workflow::create(&state, &file).await.unwrap();
    assert!(commands::workflow::create(&state, &file).await.is_err());
    commands::workflow::list(&state).await.unwrap();

    commands::workflow::start(&state, "greet", &[], "cli").await.unwrap();
    let executions = state.workflows.list_executions(Some("greet")).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(
        executions[0].output_data.get("greeting"),
        Some(&Value::String("hello world".into()))
    );

    commands::workflow::delete(&state, "greet").await.unwrap();
    assert!(commands::workflow::delete(&state, "greet").await.is_err());
    assert!(commands::workflow::start(&state, "greet", &[], "cli").await.is_err());
    // History outlives the definition.
    assert_eq!(state.workflows.list_executions(Some("greet")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_run_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let file = write_file(
        dir.path(),
        "broken.yaml",
        r#"
id: broken
name: Broken
steps:
  - id: render
    agentId: template
  - id: after
    agentId: echo
    order: 2
    dependencies: [render]
"#,
    );

    let err = commands::workflow::run(&state, &file, &[], "cli").await.unwrap_err();
    assert!(err.contains("Step 'render' failed"), "unexpected error: {}", err);

    let execution = &state.workflows.list_executions(Some("broken")).await.unwrap()[0];
    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert_eq!(execution.step("render").unwrap().status, StepStatus::Failed);
    assert_eq!(execution.step("after").unwrap().status, StepStatus::Skipped);
}
