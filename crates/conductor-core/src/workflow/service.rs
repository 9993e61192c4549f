//! Workflow service — definition management and execution on top of the
//! engine and the stores.
//!
//! The engine knows nothing about persistence; this layer stores definitions,
//! writes each execution record when it starts and again when it ends, and
//! answers history queries from live snapshots first, then from storage.

use chrono::Utc;

use crate::error::ConductorError;
use crate::models::execution::{WorkflowExecution, WorkflowStatus};
use crate::models::value::ValueMap;
use crate::store::{WorkflowDefinitionStore, WorkflowExecutionStore};
use crate::workflow::engine::{RunningExecution, WorkflowEngine};
use crate::workflow::schema::WorkflowDefinition;
use crate::workflow::validator::{ValidationResult, WorkflowValidator};

#[derive(Clone)]
pub struct WorkflowService {
    engine: WorkflowEngine,
    definitions: WorkflowDefinitionStore,
    executions: WorkflowExecutionStore,
}

impl WorkflowService {
    pub fn new(
        engine: WorkflowEngine,
        definitions: WorkflowDefinitionStore,
        executions: WorkflowExecutionStore,
    ) -> Self {
        Self {
            engine,
            definitions,
            executions,
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    // ─── Definitions ────────────────────────────────────────────────────

    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationResult {
        WorkflowValidator::new(self.engine.registry(), self.engine.config().max_retry_warning)
            .validate(definition)
    }

    fn ensure_valid(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<ValidationResult, ConductorError> {
        let result = self.validate(definition);
        if !result.is_valid {
            return Err(ConductorError::Validation(format!(
                "Workflow '{}' is invalid: {}",
                definition.id,
                result.error_summary()
            )));
        }
        for warning in &result.warnings {
            tracing::warn!("[Workflow] {}: {}", definition.id, warning);
        }
        Ok(result)
    }

    pub async fn create(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, ConductorError> {
        self.ensure_valid(&definition)?;
        if self.definitions.get(&definition.id).await?.is_some() {
            return Err(ConductorError::Conflict(format!(
                "Workflow '{}' already exists",
                definition.id
            )));
        }

        let now = Utc::now();
        let mut definition = definition;
        definition.created_at = now;
        definition.updated_at = now;
        self.definitions.save(&definition).await?;
        tracing::info!(
            "[Workflow] Created workflow '{}' ({} steps)",
            definition.id,
            definition.steps.len()
        );
        Ok(definition)
    }

    pub async fn update(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, ConductorError> {
        let existing = self.get(&definition.id).await?;
        self.ensure_valid(&definition)?;

        let mut definition = definition;
        definition.created_at = existing.created_at;
        definition.updated_at = Utc::now();
        self.definitions.save(&definition).await?;
        tracing::info!("[Workflow] Updated workflow '{}'", definition.id);
        Ok(definition)
    }

    /// Remove a definition. Its execution history is kept.
    pub async fn delete(&self, workflow_id: &str) -> Result<(), ConductorError> {
        if !self.definitions.delete(workflow_id).await? {
            return Err(ConductorError::NotFound(format!("Workflow '{}'", workflow_id)));
        }
        tracing::info!("[Workflow] Deleted workflow '{}'", workflow_id);
        Ok(())
    }

    pub async fn get(&self, workflow_id: &str) -> Result<WorkflowDefinition, ConductorError> {
        self.definitions
            .get(workflow_id)
            .await?
            .ok_or_else(|| ConductorError::NotFound(format!("Workflow '{}'", workflow_id)))
    }

    pub async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, ConductorError> {
        self.definitions.list().await
    }

    // ─── Executions ─────────────────────────────────────────────────────

    /// Run a stored workflow to completion.
    pub async fn execute(
        &self,
        workflow_id: &str,
        input: ValueMap,
        executed_by: &str,
        context: ValueMap,
    ) -> Result<WorkflowExecution, ConductorError> {
        let definition = self.get(workflow_id).await?;
        self.execute_definition(&definition, input, executed_by, context).await
    }

    /// Run a definition that is not necessarily stored (e.g. loaded from a file).
    pub async fn execute_definition(
        &self,
        definition: &WorkflowDefinition,
        input: ValueMap,
        executed_by: &str,
        context: ValueMap,
    ) -> Result<WorkflowExecution, ConductorError> {
        let running = self.start(definition, input, executed_by, context).await?;
        self.finish(running).await
    }

    /// Start a stored workflow in the background and return the execution id.
    pub async fn submit(
        &self,
        workflow_id: &str,
        input: ValueMap,
        executed_by: &str,
        context: ValueMap,
    ) -> Result<String, ConductorError> {
        let definition = self.get(workflow_id).await?;
        let running = self.start(&definition, input, executed_by, context).await?;
        let id = running.id.clone();

        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.finish(running).await {
                tracing::error!("[Workflow] {}", e);
            }
        });
        Ok(id)
    }

    /// Once the engine has accepted an execution it runs to the end, so a
    /// failure to store the initial record is only logged.
    async fn start(
        &self,
        definition: &WorkflowDefinition,
        input: ValueMap,
        executed_by: &str,
        context: ValueMap,
    ) -> Result<RunningExecution, ConductorError> {
        self.ensure_valid(definition)?;
        let running = self.engine.submit(definition, input, executed_by, context).await?;
        if let Some(initial) = self.engine.get_execution(&running.id) {
            if let Err(e) = self.executions.save(&initial).await {
                tracing::error!(
                    "[Workflow] Failed to store initial record of execution {}: {}",
                    running.id,
                    e
                );
            }
        }
        Ok(running)
    }

    /// Wait for the run loop, store the final record and release the live one.
    ///
    /// A run loop that died without finishing is stored as Failed so history
    /// never shows it running forever.
    async fn finish(&self, running: RunningExecution) -> Result<WorkflowExecution, ConductorError> {
        let id = running.id.clone();
        let outcome = running.wait().await;
        let record = match &outcome {
            Ok(finished) => finished.clone(),
            Err(e) => match self.engine.get_execution(&id) {
                Some(mut lost) => {
                    lost.status = WorkflowStatus::Failed;
                    lost.end_time = Some(Utc::now());
                    lost.error_message = Some(e.to_string());
                    lost.log(format!("Execution lost: {}", e));
                    lost
                }
                None => return outcome,
            },
        };

        self.executions.save(&record).await?;
        self.engine.forget(&id);
        outcome
    }

    /// Live snapshot if the execution is known to the engine, stored record otherwise.
    pub async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<WorkflowExecution, ConductorError> {
        if let Some(live) = self.engine.get_execution(execution_id) {
            return Ok(live);
        }
        self.executions
            .get(execution_id)
            .await?
            .ok_or_else(|| ConductorError::NotFound(format!("Execution '{}'", execution_id)))
    }

    /// Stored history overlaid with live snapshots, oldest first.
    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>, ConductorError> {
        let mut list = self.executions.list(workflow_id).await?;
        for live in self.engine.list_executions(workflow_id) {
            match list.iter_mut().find(|e| e.id == live.id) {
                Some(slot) => *slot = live,
                None => list.push(live),
            }
        }
        list.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(list)
    }

    pub async fn pause(&self, execution_id: &str) -> Result<(), ConductorError> {
        let result = self.engine.pause(execution_id).await;
        self.explain_missing(execution_id, result).await
    }

    pub async fn resume(&self, execution_id: &str) -> Result<(), ConductorError> {
        let result = self.engine.resume(execution_id).await;
        self.explain_missing(execution_id, result).await
    }

    pub async fn cancel(&self, execution_id: &str) -> Result<(), ConductorError> {
        let result = self.engine.cancel(execution_id).await;
        self.explain_missing(execution_id, result).await
    }

    /// An execution unknown to the engine but present in storage has finished.
    async fn explain_missing(
        &self,
        execution_id: &str,
        result: Result<(), ConductorError>,
    ) -> Result<(), ConductorError> {
        match result {
            Err(ConductorError::NotFound(msg)) => match self.executions.get(execution_id).await? {
                Some(stored) => Err(ConductorError::Validation(format!(
                    "Execution {} is already {}",
                    execution_id,
                    stored.status.as_str()
                ))),
                None => Err(ConductorError::NotFound(msg)),
            },
            other => other,
        }
    }
}
