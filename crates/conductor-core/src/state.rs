//! Shared application state for the CLI and embedders.

use std::sync::Arc;

use crate::config::ConductorConfig;
use crate::db::Database;
use crate::error::ConductorError;
use crate::events::EventBus;
use crate::registry::AgentRegistry;
use crate::store::{WorkflowDefinitionStore, WorkflowExecutionStore};
use crate::workflow::{WorkflowEngine, WorkflowService};

/// Everything a front end needs, wired once at startup.
pub struct AppStateInner {
    pub db: Database,
    pub config: ConductorConfig,
    pub definition_store: WorkflowDefinitionStore,
    pub execution_store: WorkflowExecutionStore,
    pub registry: Arc<AgentRegistry>,
    pub event_bus: EventBus,
    pub engine: WorkflowEngine,
    pub workflows: WorkflowService,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    /// Build the state, registering every agent the config declares.
    pub fn new(db: Database, config: ConductorConfig) -> Result<Self, ConductorError> {
        let registry = Arc::new(config.build_registry()?);
        let event_bus = EventBus::new();
        let engine =
            WorkflowEngine::new(registry.clone(), config.engine.clone(), event_bus.clone());
        let definition_store = WorkflowDefinitionStore::new(db.clone());
        let execution_store = WorkflowExecutionStore::new(db.clone());
        let workflows = WorkflowService::new(
            engine.clone(),
            definition_store.clone(),
            execution_store.clone(),
        );

        Ok(Self {
            db,
            config,
            definition_store,
            execution_store,
            registry,
            event_bus,
            engine,
            workflows,
        })
    }
}
