use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::ConductorError;
use crate::models::execution::WorkflowExecution;

/// Execution history. Records are written when an execution starts and again
/// when it reaches a terminal status.
#[derive(Clone)]
pub struct WorkflowExecutionStore {
    db: Database,
}

impl WorkflowExecutionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, execution: &WorkflowExecution) -> Result<(), ConductorError> {
        let e = execution.clone();
        let json = serde_json::to_string(&e)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_executions
                       (id, workflow_id, status, executed_by, record, start_time, end_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                       status = excluded.status,
                       record = excluded.record,
                       end_time = excluded.end_time",
                    rusqlite::params![
                        e.id,
                        e.workflow_id,
                        e.status.as_str(),
                        e.executed_by,
                        json,
                        e.start_time.timestamp_millis(),
                        e.end_time.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, ConductorError> {
        let id = execution_id.to_string();
        let json = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT record FROM workflow_executions WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;
        json.map(|j| decode(&j)).transpose()
    }

    /// Executions oldest first, optionally for one workflow.
    pub async fn list(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>, ConductorError> {
        let workflow_id = workflow_id.map(str::to_string);
        let rows = self
            .db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT record FROM workflow_executions
                     WHERE ?1 IS NULL OR workflow_id = ?1
                     ORDER BY start_time ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![workflow_id], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter().map(|j| decode(j)).collect()
    }

    /// Remove the history of a workflow. Returns the number of rows removed.
    pub async fn delete_by_workflow(&self, workflow_id: &str) -> Result<usize, ConductorError> {
        let id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM workflow_executions WHERE workflow_id = ?1",
                    rusqlite::params![id],
                )
            })
            .await
    }
}

fn decode(json: &str) -> Result<WorkflowExecution, ConductorError> {
    serde_json::from_str(json)
        .map_err(|e| ConductorError::Database(format!("Corrupt execution record: {}", e)))
}
