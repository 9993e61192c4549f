pub mod workflow_definition_store;
pub mod workflow_execution_store;

pub use workflow_definition_store::WorkflowDefinitionStore;
pub use workflow_execution_store::WorkflowExecutionStore;
