//! SQLite persistence for workflow definitions and execution history.
//!
//! One connection is shared behind a mutex; async callers hop onto the
//! blocking pool before touching it.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::ConductorError;

/// Definitions are stored as JSON documents with a few columns pulled out
/// for listing; executions likewise keep the whole record in `record`.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS workflow_definitions (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    version         TEXT NOT NULL DEFAULT '1.0',
    execution_mode  TEXT NOT NULL,
    definition      TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_executions (
    id              TEXT PRIMARY KEY,
    workflow_id     TEXT NOT NULL,
    status          TEXT NOT NULL,
    executed_by     TEXT NOT NULL DEFAULT '',
    record          TEXT NOT NULL,
    start_time      INTEGER NOT NULL,
    end_time        INTEGER
);

CREATE INDEX IF NOT EXISTS idx_executions_by_workflow
    ON workflow_executions(workflow_id);
CREATE INDEX IF NOT EXISTS idx_executions_by_status
    ON workflow_executions(status);
";

const FILE_PRAGMAS: &str = "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;";
const MEMORY_PRAGMAS: &str = "PRAGMA foreign_keys=ON;";

/// Cloneable handle onto the shared connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the database file at `db_path`, creating parent directories and
    /// the schema as needed.
    pub fn open(db_path: &str) -> Result<Self, ConductorError> {
        if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConductorError::Database(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(db_path)?;
        let db = Self::bootstrap(conn, FILE_PRAGMAS)?;
        tracing::info!("[Db] Opened {}", db_path);
        Ok(db)
    }

    /// Private database that disappears with the handle.
    pub fn open_in_memory() -> Result<Self, ConductorError> {
        Self::bootstrap(Connection::open_in_memory()?, MEMORY_PRAGMAS)
    }

    fn bootstrap(conn: Connection, pragmas: &str) -> Result<Self, ConductorError> {
        conn.execute_batch(pragmas)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the current thread.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ConductorError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let guard = match self.conn.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return Err(ConductorError::Database(
                    "connection poisoned by an earlier panic".to_string(),
                ))
            }
        };
        Ok(f(&guard)?)
    }

    /// [`with_conn`](Self::with_conn) on the blocking pool.
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, ConductorError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.clone();
        match tokio::task::spawn_blocking(move || handle.with_conn(f)).await {
            Ok(result) => result,
            Err(e) => Err(ConductorError::Internal(format!("database task failed: {}", e))),
        }
    }
}
