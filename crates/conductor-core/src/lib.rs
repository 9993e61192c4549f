//! Conductor Core — agent dispatch and workflow orchestration.
//!
//! This crate contains the execution engine and everything it needs:
//!
//! - `agent` / `registry` — concurrency-gated agents and the registry that
//!   routes commands to them
//! - `workflow` — definitions, dependency resolution, validation, the engine
//!   and the service that persists its results
//! - `db` / `store` — SQLite persistence for definitions and execution history
//! - `events` — fire-and-forget status notifications
//!
//! It has no front end of its own; `conductor-cli` drives it from the shell.

pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod registry;
pub mod state;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use agent::Agent;
pub use config::{ConductorConfig, EngineConfig};
pub use db::Database;
pub use error::ConductorError;
pub use registry::AgentRegistry;
pub use state::{AppState, AppStateInner};
