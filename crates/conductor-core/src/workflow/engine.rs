//! Workflow engine — runs a definition's plan against the agent registry.
//!
//! Each execution is owned by one run loop. The loop walks the plan layer by
//! layer: every step of a layer is spawned, and the layer must drain before
//! the next one starts. Pause and cancel are cooperative. The loop polls its
//! `ExecutionControl` before each layer and steps poll it before each retry,
//! so work already handed to an agent always runs to completion.
//!
//! Readers get snapshots of the live record at any time through
//! `get_execution` / `list_executions`.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::agent::panic_message;
use crate::config::EngineConfig;
use crate::error::ConductorError;
use crate::events::{EventBus, WorkflowEvent, WorkflowEventType};
use crate::models::command::{AgentCommand, AgentExecutionResult};
use crate::models::execution::{
    StepStatus, WorkflowExecution, WorkflowStatus, WorkflowStepExecution,
};
use crate::models::value::{lookup_path, Value, ValueMap};
use crate::registry::AgentRegistry;
use crate::workflow::condition::Condition;
use crate::workflow::resolver::{self, ExecutionPlan};
use crate::workflow::schema::{WorkflowDefinition, WorkflowStep};

// ─── Execution control ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Paused,
    Cancelled,
}

/// Cooperative pause/cancel signal shared by a run loop and its steps.
#[derive(Clone)]
pub struct ExecutionControl {
    tx: Arc<watch::Sender<ControlState>>,
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::Running);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ControlState::Cancelled
    }

    /// Running -> Paused. Returns the current state when it is anything else.
    pub fn pause(&self) -> Result<(), ControlState> {
        self.transition(ControlState::Running, ControlState::Paused)
    }

    /// Paused -> Running. Returns the current state when it is anything else.
    pub fn resume(&self) -> Result<(), ControlState> {
        self.transition(ControlState::Paused, ControlState::Running)
    }

    /// Returns false if cancellation was already requested.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == ControlState::Cancelled {
                false
            } else {
                *state = ControlState::Cancelled;
                true
            }
        })
    }

    fn transition(&self, from: ControlState, to: ControlState) -> Result<(), ControlState> {
        let mut current = from;
        let changed = self.tx.send_if_modified(|state| {
            current = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            Ok(())
        } else {
            Err(current)
        }
    }

    /// Block while paused. Returns `Running` or `Cancelled`.
    pub async fn wait_while_paused(&self) -> ControlState {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != ControlState::Paused {
                return state;
            }
            if rx.changed().await.is_err() {
                return ControlState::Cancelled;
            }
        }
    }
}

// ─── Live executions ───────────────────────────────────────────────────────

/// A live execution record plus its control signal.
pub struct ExecutionHandle {
    record: RwLock<WorkflowExecution>,
    control: ExecutionControl,
}

impl ExecutionHandle {
    fn new(execution: WorkflowExecution) -> Self {
        Self {
            record: RwLock::new(execution),
            control: ExecutionControl::new(),
        }
    }

    pub fn snapshot(&self) -> WorkflowExecution {
        self.read().clone()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.read().status
    }

    pub fn control(&self) -> &ExecutionControl {
        &self.control
    }

    fn read(&self) -> RwLockReadGuard<'_, WorkflowExecution> {
        self.record.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, WorkflowExecution> {
        self.record.write().unwrap_or_else(|e| e.into_inner())
    }

    fn update<R>(&self, f: impl FnOnce(&mut WorkflowExecution) -> R) -> R {
        f(&mut self.write())
    }

    fn update_step(&self, step_id: &str, f: impl FnOnce(&mut WorkflowStepExecution)) {
        if let Some(step) = self.write().step_mut(step_id) {
            f(step);
        }
    }
}

/// A submitted execution whose run loop is still going.
pub struct RunningExecution {
    pub id: String,
    pub workflow_id: String,
    join: JoinHandle<WorkflowExecution>,
}

impl RunningExecution {
    /// Wait for the run loop and return the final record.
    pub async fn wait(self) -> Result<WorkflowExecution, ConductorError> {
        let RunningExecution { id, join, .. } = self;
        join.await.map_err(|e| {
            ConductorError::Internal(format!("Run loop of execution {} failed: {}", id, e))
        })
    }
}

// ─── Engine ────────────────────────────────────────────────────────────────

struct EngineInner {
    registry: Arc<AgentRegistry>,
    config: EngineConfig,
    events: EventBus,
    executions: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
}

/// Interprets workflow definitions. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

enum StepOutcome {
    /// Carries the workflow data entries produced by the step.
    Completed(ValueMap),
    Skipped,
    Failed(String),
    Cancelled,
}

enum AttemptError {
    /// Not worth retrying (unknown agent).
    Fatal(String),
    Retryable(String),
}

impl WorkflowEngine {
    pub fn new(registry: Arc<AgentRegistry>, config: EngineConfig, events: EventBus) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                config,
                events,
                executions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Start an execution in the background.
    ///
    /// Fails with `Validation` before anything is created when the step graph
    /// cannot be planned or a required input is missing.
    pub async fn submit(
        &self,
        definition: &WorkflowDefinition,
        input: ValueMap,
        executed_by: &str,
        context: ValueMap,
    ) -> Result<RunningExecution, ConductorError> {
        let plan = resolver::resolve(definition)?;
        let input = apply_input_defaults(definition, input)?;

        let mut execution = WorkflowExecution::new(&definition.id, input, executed_by, context);
        execution.status = WorkflowStatus::Running;
        for step_id in plan.order() {
            if let Some(step) = definition.step(&step_id) {
                execution
                    .step_executions
                    .push(WorkflowStepExecution::pending(&execution.id, &step.id, &step.agent_id));
            }
        }
        execution.log(format!(
            "Execution started by '{}': {} step(s) in {} layer(s), mode {}",
            executed_by,
            plan.step_count(),
            plan.layers.len(),
            plan.mode.as_str()
        ));

        let id = execution.id.clone();
        let handle = Arc::new(ExecutionHandle::new(execution));
        self.executions_mut().insert(id.clone(), handle.clone());

        tracing::info!(
            "[Engine] Starting execution {} of workflow '{}' ({} steps)",
            id,
            definition.id,
            plan.step_count()
        );
        self.emit(WorkflowEvent::new(WorkflowEventType::ExecutionStarted, &id, &definition.id))
            .await;

        let engine = self.clone();
        let definition = Arc::new(definition.clone());
        let workflow_id = definition.id.clone();
        let join = tokio::spawn(async move { engine.run(definition, plan, handle).await });

        Ok(RunningExecution {
            id,
            workflow_id,
            join,
        })
    }

    /// Run an execution to its end and return the final record.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: ValueMap,
        executed_by: &str,
        context: ValueMap,
    ) -> Result<WorkflowExecution, ConductorError> {
        self.submit(definition, input, executed_by, context)
            .await?
            .wait()
            .await
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.handle(execution_id).ok().map(|h| h.snapshot())
    }

    /// Snapshots of known executions, oldest first.
    pub fn list_executions(&self, workflow_id: Option<&str>) -> Vec<WorkflowExecution> {
        let handles: Vec<Arc<ExecutionHandle>> = self.executions().values().cloned().collect();
        let mut list: Vec<WorkflowExecution> = handles
            .iter()
            .map(|h| h.snapshot())
            .filter(|e| workflow_id.map_or(true, |w| e.workflow_id == w))
            .collect();
        list.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        list
    }

    /// Drop one execution from the live table whatever its state, returning
    /// its last snapshot. Callers do this once the final record is stored.
    pub fn forget(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.executions_mut()
            .remove(execution_id)
            .map(|h| h.snapshot())
    }

    /// Stop starting new steps; dispatched steps keep running.
    pub async fn pause(&self, execution_id: &str) -> Result<(), ConductorError> {
        let handle = self.handle(execution_id)?;
        let workflow_id = handle.update(|e| {
            ensure_not_terminal(e)?;
            handle.control.pause().map_err(|state| match state {
                ControlState::Paused => {
                    ConductorError::Validation(format!("Execution {} is already paused", e.id))
                }
                _ => ConductorError::Validation(format!("Execution {} is being cancelled", e.id)),
            })?;
            e.status = WorkflowStatus::Paused;
            e.log("Execution paused");
            Ok::<_, ConductorError>(e.workflow_id.clone())
        })?;

        tracing::info!("[Engine] Paused execution {}", execution_id);
        let event =
            WorkflowEvent::new(WorkflowEventType::ExecutionPaused, execution_id, &workflow_id);
        self.emit(event).await;
        Ok(())
    }

    pub async fn resume(&self, execution_id: &str) -> Result<(), ConductorError> {
        let handle = self.handle(execution_id)?;
        let workflow_id = handle.update(|e| {
            ensure_not_terminal(e)?;
            handle.control.resume().map_err(|state| match state {
                ControlState::Cancelled => {
                    ConductorError::Validation(format!("Execution {} is being cancelled", e.id))
                }
                _ => ConductorError::Validation(format!("Execution {} is not paused", e.id)),
            })?;
            e.status = WorkflowStatus::Running;
            e.log("Execution resumed");
            Ok::<_, ConductorError>(e.workflow_id.clone())
        })?;

        tracing::info!("[Engine] Resumed execution {}", execution_id);
        let event =
            WorkflowEvent::new(WorkflowEventType::ExecutionResumed, execution_id, &workflow_id);
        self.emit(event).await;
        Ok(())
    }

    /// Request cancellation. In-flight steps finish, nothing new starts, and
    /// the execution ends `Cancelled`. Repeated requests are accepted.
    pub async fn cancel(&self, execution_id: &str) -> Result<(), ConductorError> {
        let handle = self.handle(execution_id)?;
        handle.update(|e| {
            ensure_not_terminal(e)?;
            if handle.control.cancel() {
                e.log("Cancellation requested");
            }
            Ok::<_, ConductorError>(())
        })?;
        tracing::info!("[Engine] Cancellation requested for execution {}", execution_id);
        Ok(())
    }

    // ── internals ──────────────────────────────────────────────────────

    fn executions(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<ExecutionHandle>>> {
        self.inner.executions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn executions_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<ExecutionHandle>>> {
        self.inner.executions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, execution_id: &str) -> Result<Arc<ExecutionHandle>, ConductorError> {
        self.executions()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| ConductorError::NotFound(format!("Execution '{}'", execution_id)))
    }

    async fn emit(&self, event: WorkflowEvent) {
        self.inner.events.emit(event).await;
    }

    async fn run(
        self,
        definition: Arc<WorkflowDefinition>,
        plan: ExecutionPlan,
        handle: Arc<ExecutionHandle>,
    ) -> WorkflowExecution {
        let (execution_id, mut data, context) = {
            let record = handle.read();
            (record.id.clone(), record.input_data.clone(), record.context.clone())
        };
        let total = plan.layers.len();
        let mut failures: Vec<(String, String)> = Vec::new();

        for (idx, layer) in plan.layers.iter().enumerate() {
            if handle.control.wait_while_paused().await == ControlState::Cancelled {
                break;
            }
            handle.update(|e| e.log(format!("Layer {}/{}: {}", idx + 1, total, layer.join(", "))));

            let mut running = JoinSet::new();
            for step_id in layer {
                let Some(step) = definition.step(step_id).cloned() else {
                    continue;
                };
                let run = StepRun {
                    engine: self.clone(),
                    handle: handle.clone(),
                    step,
                    data: data.clone(),
                    execution_id: execution_id.clone(),
                    workflow_id: definition.id.clone(),
                    context: context.clone(),
                };
                let step_id = step_id.clone();
                running.spawn(async move {
                    let outcome = AssertUnwindSafe(run.run())
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            let message = panic_message(panic.as_ref());
                            StepOutcome::Failed(format!("step panicked: {}", message))
                        });
                    (step_id, outcome)
                });
            }

            while let Some(joined) = running.join_next().await {
                match joined {
                    Ok((_, StepOutcome::Completed(produced))) => data.extend(produced),
                    Ok((_, StepOutcome::Skipped)) | Ok((_, StepOutcome::Cancelled)) => {}
                    Ok((step_id, StepOutcome::Failed(message))) => {
                        handle.update_step(&step_id, |s| {
                            if s.status != StepStatus::Failed {
                                s.status = StepStatus::Failed;
                                s.end_time = Some(Utc::now());
                                s.error_message = Some(message.clone());
                            }
                        });
                        failures.push((step_id, message));
                    }
                    Err(e) => {
                        tracing::error!(
                            "[Engine] Step task of execution {} was lost: {}",
                            execution_id,
                            e
                        );
                        failures.push(("<unknown>".to_string(), e.to_string()));
                    }
                }
            }

            handle.update(|e| e.output_data = data.clone());
            if !failures.is_empty() || handle.control.is_cancelled() {
                break;
            }
        }

        self.finish(&definition, &handle, data, failures).await
    }

    async fn finish(
        &self,
        definition: &WorkflowDefinition,
        handle: &ExecutionHandle,
        data: ValueMap,
        failures: Vec<(String, String)>,
    ) -> WorkflowExecution {
        let mut skipped = Vec::new();
        let finished = handle.update(|e| {
            let status = if handle.control.is_cancelled() {
                WorkflowStatus::Cancelled
            } else if !failures.is_empty() {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Completed
            };

            // Steps that never started get a terminal record.
            let mut blocked: HashSet<String> = failures.iter().map(|(id, _)| id.clone()).collect();
            for record in e.step_executions.iter_mut() {
                if record.status != StepStatus::Pending {
                    continue;
                }
                if status == WorkflowStatus::Cancelled {
                    record.status = StepStatus::Cancelled;
                    record.error_message = Some("execution cancelled".to_string());
                    continue;
                }
                let depends_on_failure = definition
                    .step(&record.step_id)
                    .is_some_and(|s| s.dependencies.iter().any(|d| blocked.contains(d)));
                let reason = if depends_on_failure {
                    blocked.insert(record.step_id.clone());
                    "dependency failed"
                } else {
                    "workflow failed"
                };
                record.status = StepStatus::Skipped;
                record.error_message = Some(reason.to_string());
                skipped.push((record.step_id.clone(), reason));
            }

            e.status = status;
            e.end_time = Some(Utc::now());
            e.output_data = restrict_outputs(definition, &data);
            e.error_message = match status {
                WorkflowStatus::Failed => Some(
                    failures
                        .iter()
                        .map(|(id, msg)| format!("Step '{}' failed: {}", id, msg))
                        .collect::<Vec<_>>()
                        .join("; "),
                ),
                WorkflowStatus::Cancelled => Some("Execution cancelled".to_string()),
                _ => None,
            };
            e.log(format!("Execution {}", status.as_str().to_lowercase()));
            let step_lines: Vec<String> = e
                .step_executions
                .iter()
                .flat_map(|s| s.logs.iter().map(move |line| format!("[{}] {}", s.step_id, line)))
                .collect();
            e.logs.extend(step_lines);
            e.clone()
        });

        for (step_id, reason) in skipped {
            let mut payload = ValueMap::new();
            payload.insert("reason".to_string(), Value::from(reason));
            self.emit(
                WorkflowEvent::new(
                    WorkflowEventType::StepSkipped,
                    &finished.id,
                    &finished.workflow_id,
                )
                    .for_step(&step_id)
                    .with_data(payload),
            )
            .await;
        }

        let event_type = match finished.status {
            WorkflowStatus::Completed => WorkflowEventType::ExecutionCompleted,
            WorkflowStatus::Cancelled => WorkflowEventType::ExecutionCancelled,
            _ => WorkflowEventType::ExecutionFailed,
        };
        match finished.status {
            WorkflowStatus::Completed => {
                tracing::info!("[Engine] Execution {} completed", finished.id)
            }
            status => tracing::warn!(
                "[Engine] Execution {} ended {}: {}",
                finished.id,
                status.as_str(),
                finished.error_message.as_deref().unwrap_or("")
            ),
        }
        self.emit(WorkflowEvent::new(event_type, &finished.id, &finished.workflow_id))
            .await;
        finished
    }

    /// Dispatch on a separate task raced against the deadline. On expiry the
    /// task is detached: the agent finishes and cleans up on its own and the
    /// late result is dropped.
    async fn dispatch_with_timeout(
        &self,
        command: &AgentCommand,
        timeout_secs: u64,
    ) -> Result<AgentExecutionResult, AttemptError> {
        let registry = self.inner.registry.clone();
        let agent_id = command.agent_id.clone();
        let cmd = command.clone();
        let task = tokio::spawn(async move { registry.dispatch(&agent_id, &cmd).await });

        match tokio::time::timeout(Duration::from_secs(timeout_secs), task).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e @ ConductorError::NotFound(_)))) => Err(AttemptError::Fatal(e.to_string())),
            Ok(Ok(Err(e))) => Err(AttemptError::Retryable(e.to_string())),
            Ok(Err(e)) => Err(AttemptError::Retryable(format!("dispatch task failed: {}", e))),
            Err(_) => Err(AttemptError::Retryable(format!(
                "timed out after {}s",
                timeout_secs
            ))),
        }
    }
}

fn ensure_not_terminal(execution: &WorkflowExecution) -> Result<(), ConductorError> {
    if execution.status.is_terminal() {
        return Err(ConductorError::Validation(format!(
            "Execution {} is already {}",
            execution.id,
            execution.status.as_str()
        )));
    }
    Ok(())
}

// ─── Steps ─────────────────────────────────────────────────────────────────

struct StepRun {
    engine: WorkflowEngine,
    handle: Arc<ExecutionHandle>,
    step: WorkflowStep,
    /// Workflow data as of the start of the step's layer.
    data: ValueMap,
    execution_id: String,
    workflow_id: String,
    context: ValueMap,
}

impl StepRun {
    async fn run(self) -> StepOutcome {
        if let Some(source) = self
            .step
            .execution_condition
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        {
            match Condition::parse(source) {
                Ok(condition) if !condition.evaluate(&self.data) => {
                    self.handle.update_step(&self.step.id, |s| {
                        s.status = StepStatus::Completed;
                        s.skipped = true;
                        s.end_time = Some(Utc::now());
                        s.log(format!("Skipped: condition '{}' not met", condition.source()));
                    });
                    let mut payload = ValueMap::new();
                    payload.insert("reason".to_string(), Value::from("condition not met"));
                    self.emit(WorkflowEventType::StepSkipped, payload).await;
                    return StepOutcome::Skipped;
                }
                Ok(_) => {}
                Err(e) => return self.fail(e.to_string()).await,
            }
        }

        let input = map_input(&self.step, &self.data);
        self.handle.update_step(&self.step.id, |s| {
            s.status = StepStatus::Running;
            s.start_time = Some(Utc::now());
            s.input_data = input.clone();
        });
        self.emit(WorkflowEventType::StepStarted, ValueMap::new()).await;

        let config = self.engine.config().clone();
        let timeout_secs = if self.step.timeout_seconds == 0 {
            config.default_step_timeout_secs
        } else {
            self.step.timeout_seconds
        };

        let mut last_error = String::from("no attempt was made");
        for attempt in 0..=self.step.retry_count {
            if attempt > 0 {
                if config.retry_backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(config.retry_backoff_ms)).await;
                }
                if self.handle.control.wait_while_paused().await == ControlState::Cancelled {
                    self.handle.update_step(&self.step.id, |s| {
                        s.status = StepStatus::Cancelled;
                        s.end_time = Some(Utc::now());
                        s.error_message =
                            Some(format!("cancelled before retry; last error: {}", last_error));
                    });
                    return StepOutcome::Cancelled;
                }
            }

            let command = self.command(&input, timeout_secs);
            self.handle.update_step(&self.step.id, |s| {
                s.attempts = attempt + 1;
                s.retry_count = attempt;
                s.log(format!("Attempt {} dispatched as command {}", attempt + 1, command.id));
            });

            match self.engine.dispatch_with_timeout(&command, timeout_secs).await {
                Ok(result) if result.success => {
                    let elapsed = result.duration().map(|d| d.num_milliseconds()).unwrap_or(0);
                    let output = result.output_data.unwrap_or_default();
                    let produced = map_output(&self.step, &output);
                    self.handle.update_step(&self.step.id, |s| {
                        s.logs.extend(result.logs);
                        s.log(format!("Completed in {}ms", elapsed));
                        s.status = StepStatus::Completed;
                        s.output_data = output;
                        s.end_time = Some(Utc::now());
                        s.error_message = None;
                    });
                    tracing::debug!(
                        "[Engine] Step {} of {} completed",
                        self.step.id,
                        self.execution_id
                    );
                    self.emit(WorkflowEventType::StepCompleted, ValueMap::new()).await;
                    return StepOutcome::Completed(produced);
                }
                Ok(result) => {
                    last_error = result
                        .error_message
                        .unwrap_or_else(|| "agent reported failure".to_string());
                    self.note_failure(attempt, &last_error, result.logs);
                }
                Err(AttemptError::Fatal(message)) => {
                    last_error = message;
                    self.note_failure(attempt, &last_error, Vec::new());
                    break;
                }
                Err(AttemptError::Retryable(message)) => {
                    last_error = message;
                    self.note_failure(attempt, &last_error, Vec::new());
                }
            }
        }

        self.fail(last_error).await
    }

    fn command(&self, input: &ValueMap, timeout_secs: u64) -> AgentCommand {
        let mut context = self.context.clone();
        context.insert("workflowExecutionId".to_string(), Value::from(self.execution_id.as_str()));
        context.insert("workflowId".to_string(), Value::from(self.workflow_id.as_str()));
        context.insert("stepId".to_string(), Value::from(self.step.id.as_str()));

        AgentCommand::new(&self.step.agent_id, &self.step.command_type)
            .with_parameters(input.clone())
            .with_priority(self.step.priority)
            .with_timeout_seconds(timeout_secs)
            .with_context(context)
    }

    fn note_failure(&self, attempt: u32, message: &str, logs: Vec<String>) {
        tracing::warn!(
            "[Engine] Step {} attempt {}/{} failed: {}",
            self.step.id,
            attempt + 1,
            self.step.retry_count + 1,
            message
        );
        self.handle.update_step(&self.step.id, |s| {
            s.logs.extend(logs);
            s.log(format!("Attempt {} failed: {}", attempt + 1, message));
        });
    }

    async fn fail(&self, message: String) -> StepOutcome {
        self.handle.update_step(&self.step.id, |s| {
            let now = Utc::now();
            s.start_time.get_or_insert(now);
            s.status = StepStatus::Failed;
            s.end_time = Some(now);
            s.error_message = Some(message.clone());
        });
        let mut payload = ValueMap::new();
        payload.insert("error".to_string(), Value::from(message.as_str()));
        self.emit(WorkflowEventType::StepFailed, payload).await;
        StepOutcome::Failed(message)
    }

    async fn emit(&self, event_type: WorkflowEventType, data: ValueMap) {
        self.engine
            .emit(
                WorkflowEvent::new(event_type, &self.execution_id, &self.workflow_id)
                    .for_step(&self.step.id)
                    .with_data(data),
            )
            .await;
    }
}

// ─── Data mapping ──────────────────────────────────────────────────────────

/// Step parameters: the step's configuration overlaid with mapped workflow data.
fn map_input(step: &WorkflowStep, data: &ValueMap) -> ValueMap {
    let mut input = step.configuration.clone();
    for (workflow_key, step_key) in &step.input_mapping {
        if let Some(value) = lookup_path(data, workflow_key) {
            input.insert(step_key.clone(), value.clone());
        }
    }
    input
}

/// Workflow data produced by a step: the whole output under the step id, plus
/// every mapped output key.
fn map_output(step: &WorkflowStep, output: &ValueMap) -> ValueMap {
    let mut produced = ValueMap::new();
    produced.insert(step.id.clone(), Value::Map(output.clone()));
    for (step_key, workflow_key) in &step.output_mapping {
        if let Some(value) = lookup_path(output, step_key) {
            produced.insert(workflow_key.clone(), value.clone());
        }
    }
    produced
}

/// Fill declared defaults and reject missing required inputs.
pub fn apply_input_defaults(
    definition: &WorkflowDefinition,
    mut input: ValueMap,
) -> Result<ValueMap, ConductorError> {
    for param in &definition.input_parameters {
        if input.contains_key(&param.name) {
            continue;
        }
        match (&param.default, param.required) {
            (Some(default), _) => {
                input.insert(param.name.clone(), default.clone());
            }
            (None, true) => {
                return Err(ConductorError::Validation(format!(
                    "Missing required input '{}'",
                    param.name
                )))
            }
            (None, false) => {}
        }
    }
    Ok(input)
}

/// The declared output parameters, or all workflow data when none are declared.
fn restrict_outputs(definition: &WorkflowDefinition, data: &ValueMap) -> ValueMap {
    if definition.output_parameters.is_empty() {
        return data.clone();
    }
    let mut out = ValueMap::new();
    for param in &definition.output_parameters {
        if let Some(value) = lookup_path(data, &param.name).or(param.default.as_ref()) {
            out.insert(param.name.clone(), value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::handler::EchoHandler;
    use crate::agent::{builtin_handler, handler_fn, Agent, CommandHandler};
    use crate::error::HandlerError;
    use crate::events::EventSubscription;
    use crate::models::agent::AgentCapabilities;
    use crate::value_map;
    use crate::workflow::schema::{ExecutionMode, ParameterSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    fn engine_with(agents: Vec<(&str, Arc<dyn CommandHandler>, usize)>) -> WorkflowEngine {
        let registry = AgentRegistry::new();
        for (id, handler, slots) in agents {
            registry
                .register(Arc::new(Agent::new(
                    id,
                    id,
                    AgentCapabilities::default().with_max_concurrent_tasks(slots),
                    handler,
                )))
                .unwrap();
        }
        WorkflowEngine::new(Arc::new(registry), EngineConfig::default(), EventBus::new())
    }

    fn builtin_engine() -> WorkflowEngine {
        engine_with(
            ["echo", "delay", "template"]
                .into_iter()
                .map(|kind| (kind, builtin_handler(kind).unwrap(), 4))
                .collect(),
        )
    }

    /// Handler that records `start:<step>` / `end:<step>` around a short sleep.
    fn tracing_handler(log: Arc<Mutex<Vec<String>>>) -> Arc<dyn CommandHandler> {
        handler_fn("trace", move |cmd: AgentCommand| {
            let log = log.clone();
            async move {
                let step = cmd
                    .context
                    .get("stepId")
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_string();
                log.lock().unwrap().push(format!("start:{}", step));
                tokio::time::sleep(Duration::from_millis(30)).await;
                log.lock().unwrap().push(format!("end:{}", step));
                Ok(ValueMap::new())
            }
        })
    }

    fn delayed(id: &str, ms: i64) -> WorkflowStep {
        WorkflowStep::new(id, "delay").with_config("delayMs", ms)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sequential_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(vec![("trace", tracing_handler(log.clone()), 4)]);
        let def = WorkflowDefinition::new("seq", "Seq", ExecutionMode::Sequential)
            .with_step(WorkflowStep::new("b", "trace").with_order(2))
            .with_step(WorkflowStep::new("a", "trace").with_order(1));

        let execution =
            engine.execute(&def, ValueMap::new(), "test", ValueMap::new()).await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["start:a", "end:a", "start:b", "end:b"]);
        let ids: Vec<&str> = execution.step_executions.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_steps_run_concurrently() {
        // Both handlers wait on the same barrier: completing at all proves
        // both were running at the same time.
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let make = |barrier: Arc<tokio::sync::Barrier>| {
            handler_fn("barrier", move |_cmd: AgentCommand| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok(ValueMap::new())
                }
            })
        };
        let engine = engine_with(vec![
            ("left", make(barrier.clone()), 1),
            ("right", make(barrier.clone()), 1),
        ]);
        let def = WorkflowDefinition::new("par", "Par", ExecutionMode::Parallel)
            .with_step(WorkflowStep::new("l", "left").with_timeout(5))
            .with_step(WorkflowStep::new("r", "right").with_timeout(5));

        let execution =
            engine.execute(&def, ValueMap::new(), "test", ValueMap::new()).await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Completed, "{:?}", execution.error_message);
    }

    #[tokio::test]
    async fn test_retries_then_skips_dependents() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let failing = handler_fn("fail", move |_cmd: AgentCommand| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::new("boom"))
            }
        });
        let engine = engine_with(vec![
            ("fail", failing, 1),
            ("echo", builtin_handler("echo").unwrap(), 1),
        ]);
        let def = WorkflowDefinition::new("retry", "Retry", ExecutionMode::Sequential)
            .with_step(WorkflowStep::new("step1", "fail").with_order(1).with_retries(2))
            .with_step(WorkflowStep::new("step2", "echo").with_order(2).depends_on("step1"))
            .with_step(WorkflowStep::new("step3", "echo").with_order(3));

        let execution =
            engine.execute(&def, ValueMap::new(), "test", ValueMap::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(execution.status, WorkflowStatus::Failed);
        assert!(execution.error_message.as_deref().unwrap().contains("step1"));

        let step1 = execution.step("step1").unwrap();
        assert_eq!(step1.status, StepStatus::Failed);
        assert_eq!(step1.attempts, 3);
        assert_eq!(step1.retry_count, 2);
        assert_eq!(step1.error_message.as_deref(), Some("boom"));

        let step2 = execution.step("step2").unwrap();
        assert_eq!(step2.status, StepStatus::Skipped);
        assert!(!step2.was_started());
        assert_eq!(step2.attempts, 0);
        assert_eq!(step2.error_message.as_deref(), Some("dependency failed"));

        let step3 = execution.step("step3").unwrap();
        assert_eq!(step3.status, StepStatus::Skipped);
        assert_eq!(step3.error_message.as_deref(), Some("workflow failed"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_lets_layer_finish() {
        let engine = builtin_engine();
        let def = WorkflowDefinition::new("cancel", "Cancel", ExecutionMode::Parallel)
            .with_step(delayed("slow", 300))
            .with_step(delayed("slow2", 200))
            .with_step(WorkflowStep::new("next", "echo").depends_on("slow"));

        let running = engine
            .submit(&def, ValueMap::new(), "test", ValueMap::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.cancel(&running.id).await.unwrap();
        let execution = running.wait().await.unwrap();

        assert_eq!(execution.status, WorkflowStatus::Cancelled);
        assert_eq!(execution.step("slow").unwrap().status, StepStatus::Completed);
        assert_eq!(execution.step("slow2").unwrap().status, StepStatus::Completed);
        let next = execution.step("next").unwrap();
        assert_eq!(next.status, StepStatus::Cancelled);
        assert!(!next.was_started());

        assert!(matches!(
            engine.cancel(&execution.id).await,
            Err(ConductorError::Validation(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pause_and_resume() {
        let engine = builtin_engine();
        engine
            .events()
            .subscribe(EventSubscription::new("watch").with_types(vec![
                WorkflowEventType::ExecutionPaused,
                WorkflowEventType::ExecutionResumed,
            ]))
            .await;
        let def = WorkflowDefinition::new("pause", "Pause", ExecutionMode::Sequential)
            .with_step(delayed("a", 200).with_order(1))
            .with_step(WorkflowStep::new("b", "echo").with_order(2));

        let running = engine
            .submit(&def, ValueMap::new(), "test", ValueMap::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.pause(&running.id).await.unwrap();
        assert!(matches!(
            engine.pause(&running.id).await,
            Err(ConductorError::Validation(_))
        ));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let snapshot = engine.get_execution(&running.id).unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Paused);
        assert_eq!(snapshot.step("a").unwrap().status, StepStatus::Completed);
        assert_eq!(snapshot.step("b").unwrap().status, StepStatus::Pending);

        engine.resume(&running.id).await.unwrap();
        let execution = running.wait().await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.step("b").unwrap().status, StepStatus::Completed);

        let events = engine.events().drain_pending_events("watch").await;
        let types: Vec<WorkflowEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![WorkflowEventType::ExecutionPaused, WorkflowEventType::ExecutionResumed]
        );
    }

    #[tokio::test]
    async fn test_timeout_fails_attempt() {
        let engine = builtin_engine();
        let def = WorkflowDefinition::new("slow", "Slow", ExecutionMode::Sequential)
            .with_step(delayed("sleepy", 3_000).with_timeout(1));

        let started = Instant::now();
        let execution =
            engine.execute(&def, ValueMap::new(), "test", ValueMap::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(2_500));
        assert_eq!(execution.status, WorkflowStatus::Failed);
        let step = execution.step("sleepy").unwrap();
        assert!(step.error_message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_retried() {
        let engine = builtin_engine();
        let def = WorkflowDefinition::new("ghost", "Ghost", ExecutionMode::Sequential)
            .with_step(WorkflowStep::new("a", "ghost").with_retries(3));
        let execution =
            engine.execute(&def, ValueMap::new(), "test", ValueMap::new()).await.unwrap();
        let step = execution.step("a").unwrap();
        assert_eq!(step.attempts, 1);
        assert!(step.error_message.as_deref().unwrap().contains("Not found"));
    }

    #[tokio::test]
    async fn test_step_priority_and_context_reach_the_command() {
        let seen = handler_fn("spy", |cmd: AgentCommand| async move {
            let mut out = ValueMap::new();
            out.insert("priority".to_string(), Value::from(cmd.priority.as_str()));
            if let Some(step) = cmd.context.get("stepId") {
                out.insert("step".to_string(), step.clone());
            }
            Ok(out)
        });
        let engine = engine_with(vec![("spy", seen, 1)]);
        let def = WorkflowDefinition::new("prio", "Prio", ExecutionMode::Sequential)
            .with_step(
                WorkflowStep::new("urgent", "spy")
                    .with_priority(crate::models::command::CommandPriority::Critical)
                    .map_output("priority", "urgentPriority"),
            )
            .with_step(
                WorkflowStep::new("plain", "spy")
                    .with_order(1)
                    .map_output("priority", "plainPriority"),
            );

        let execution =
            engine.execute(&def, ValueMap::new(), "test", ValueMap::new()).await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.output_data["urgentPriority"], Value::from("CRITICAL"));
        assert_eq!(execution.output_data["plainPriority"], Value::from("NORMAL"));
        assert_eq!(
            execution.step("urgent").unwrap().output_data.get("step"),
            Some(&Value::from("urgent"))
        );
    }

    #[tokio::test]
    async fn test_conditions_and_mappings() {
        let engine = builtin_engine();
        let mut def = WorkflowDefinition::new("cond", "Cond", ExecutionMode::Conditional)
            .with_step(
                WorkflowStep::new("seed", "echo")
                    .with_order(1)
                    .map_input("start", "value")
                    .map_output("value", "answer"),
            )
            .with_step(
                WorkflowStep::new("render", "template")
                    .with_order(2)
                    .with_condition("answer > 40")
                    .with_config("template", "answer is ${answer}")
                    .map_input("answer", "answer")
                    .map_output("text", "summary"),
            )
            .with_step(
                WorkflowStep::new("never", "echo")
                    .with_order(3)
                    .with_condition("${answer} < 0")
                    .map_output("value", "summary"),
            );
        def.input_parameters.push(ParameterSpec {
            name: "start".into(),
            param_type: Some("number".into()),
            required: false,
            default: Some(Value::Int(42)),
            description: None,
        });
        def.output_parameters.push(ParameterSpec {
            name: "summary".into(),
            param_type: None,
            required: false,
            default: None,
            description: None,
        });

        let execution =
            engine.execute(&def, ValueMap::new(), "test", ValueMap::new()).await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.input_data.get("start"), Some(&Value::Int(42)));
        assert_eq!(execution.output_data, value_map! { "summary" => "answer is 42" });

        let never = execution.step("never").unwrap();
        assert_eq!(never.status, StepStatus::Completed);
        assert!(never.skipped);
        assert!(!never.was_started());
        assert_eq!(
            execution.step("render").unwrap().input_data.get("answer"),
            Some(&Value::Int(42))
        );
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let engine = builtin_engine();
        let mut def = WorkflowDefinition::new("req", "Req", ExecutionMode::Sequential)
            .with_step(WorkflowStep::new("a", "echo"));
        def.input_parameters.push(ParameterSpec {
            name: "repo".into(),
            param_type: None,
            required: true,
            default: None,
            description: None,
        });
        let err = engine
            .submit(&def, ValueMap::new(), "test", ValueMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConductorError::Validation(_)));
        assert!(engine.list_executions(None).is_empty());

        let cyclic = WorkflowDefinition::new("cyc", "Cyc", ExecutionMode::Sequential)
            .with_step(WorkflowStep::new("a", "echo").depends_on("b"))
            .with_step(WorkflowStep::new("b", "echo").depends_on("a"));
        assert!(matches!(
            engine.execute(&cyclic, ValueMap::new(), "test", ValueMap::new()).await,
            Err(ConductorError::Validation(_))
        ));

        assert!(matches!(engine.pause("nope").await, Err(ConductorError::NotFound(_))));
        assert!(matches!(engine.resume("nope").await, Err(ConductorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_context_reaches_agents_and_snapshots_are_listed() {
        let registry = AgentRegistry::new();
        registry
            .register(Arc::new(Agent::new(
                "secure",
                "Secure",
                AgentCapabilities::default().requiring_authentication(),
                Arc::new(EchoHandler),
            )))
            .unwrap();
        let engine =
            WorkflowEngine::new(Arc::new(registry), EngineConfig::default(), EventBus::new());
        let def = WorkflowDefinition::new("auth", "Auth", ExecutionMode::Sequential)
            .with_step(WorkflowStep::new("a", "secure"));

        let denied = engine.execute(&def, ValueMap::new(), "test", ValueMap::new()).await.unwrap();
        assert_eq!(denied.status, WorkflowStatus::Failed);

        let allowed = engine
            .execute(&def, ValueMap::new(), "test", value_map! { "authorization" => "token" })
            .await
            .unwrap();
        assert_eq!(allowed.status, WorkflowStatus::Completed);

        assert_eq!(engine.list_executions(Some("auth")).len(), 2);
        assert!(engine.list_executions(Some("other")).is_empty());
        let forgotten = engine.forget(&allowed.id).unwrap();
        assert_eq!(forgotten.status, WorkflowStatus::Completed);
        assert!(engine.get_execution(&allowed.id).is_none());
        assert!(engine.forget(&allowed.id).is_none());
        assert_eq!(engine.list_executions(Some("auth")).len(), 1);
    }

    #[tokio::test]
    async fn test_control_transitions() {
        let control = ExecutionControl::new();
        assert_eq!(control.resume(), Err(ControlState::Running));
        control.pause().unwrap();
        assert_eq!(control.pause(), Err(ControlState::Paused));

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(control.cancel());
        assert!(!control.cancel());
        assert_eq!(waiter.await.unwrap(), ControlState::Cancelled);
    }
}
