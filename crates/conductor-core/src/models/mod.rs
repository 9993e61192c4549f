pub mod agent;
pub mod command;
pub mod execution;
pub mod value;

pub use agent::*;
pub use command::*;
pub use execution::*;
pub use value::{lookup_path, Value, ValueMap};
