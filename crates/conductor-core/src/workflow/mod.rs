//! Workflow orchestration — definitions, planning, validation and execution.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► WorkflowDefinition ──► WorkflowValidator
//!                                              │
//!                        resolver ──► ExecutionPlan (layers)
//!                                              │
//!                                       WorkflowEngine ──► AgentRegistry ──► Agent
//!                                              │
//!                                    WorkflowService ──► stores (SQLite)
//! ```

pub mod condition;
pub mod engine;
pub mod resolver;
pub mod schema;
pub mod service;
pub mod validator;

pub use condition::{Condition, ConditionError};
pub use engine::{ControlState, ExecutionControl, RunningExecution, WorkflowEngine};
pub use resolver::{resolve, ExecutionPlan, ResolveError};
pub use schema::{ExecutionMode, ParameterSpec, WorkflowDefinition, WorkflowStep};
pub use service::WorkflowService;
pub use validator::{ValidationResult, WorkflowValidator};
