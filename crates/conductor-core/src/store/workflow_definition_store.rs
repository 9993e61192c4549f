use rusqlite::{OptionalExtension, Row};

use crate::db::Database;
use crate::error::ConductorError;
use crate::workflow::schema::WorkflowDefinition;

/// Last-write-wins storage for workflow definitions.
#[derive(Clone)]
pub struct WorkflowDefinitionStore {
    db: Database,
}

impl WorkflowDefinitionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a definition.
    pub async fn save(&self, definition: &WorkflowDefinition) -> Result<(), ConductorError> {
        let d = definition.clone();
        let json = serde_json::to_string(&d)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_definitions
                       (id, name, version, execution_mode, definition, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       version = excluded.version,
                       execution_mode = excluded.execution_mode,
                       definition = excluded.definition,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        d.id,
                        d.name,
                        d.version,
                        d.execution_mode.as_str(),
                        json,
                        d.created_at.timestamp_millis(),
                        d.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, ConductorError> {
        let id = workflow_id.to_string();
        let json = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT definition FROM workflow_definitions WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;
        json.map(|j| decode(&j)).transpose()
    }

    /// All definitions, ordered by name.
    pub async fn list(&self) -> Result<Vec<WorkflowDefinition>, ConductorError> {
        let rows = self
            .db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT definition FROM workflow_definitions ORDER BY name, id",
                )?;
                let rows = stmt
                    .query_map([], |row| row_to_json(row))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter().map(|j| decode(j)).collect()
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, workflow_id: &str) -> Result<bool, ConductorError> {
        let id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "DELETE FROM workflow_definitions WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_json(row: &Row<'_>) -> Result<String, rusqlite::Error> {
    row.get(0)
}

fn decode(json: &str) -> Result<WorkflowDefinition, ConductorError> {
    serde_json::from_str(json)
        .map_err(|e| ConductorError::Database(format!("Corrupt workflow definition: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::{ExecutionMode, WorkflowStep};

    #[tokio::test]
    async fn test_save_get_list_delete() {
        let store = WorkflowDefinitionStore::new(Database::open_in_memory().unwrap());
        let mut def = WorkflowDefinition::new("wf-1", "Build", ExecutionMode::Parallel)
            .with_step(WorkflowStep::new("a", "echo").with_config("msg", "hi"));
        store.save(&def).await.unwrap();
        store
            .save(&WorkflowDefinition::new("wf-0", "Audit", ExecutionMode::Sequential))
            .await
            .unwrap();

        let loaded = store.get("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.execution_mode, ExecutionMode::Parallel);
        assert_eq!(loaded.steps[0].configuration, def.steps[0].configuration);

        def.name = "Build v2".to_string();
        store.save(&def).await.unwrap();
        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["Audit", "Build v2"]);

        assert!(store.delete("wf-1").await.unwrap());
        assert!(!store.delete("wf-1").await.unwrap());
        assert!(store.get("wf-1").await.unwrap().is_none());
    }
}
