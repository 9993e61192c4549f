//! Command layer of the Conductor CLI, shared by the binary and its tests.

pub mod commands;
