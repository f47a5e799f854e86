//! Command execution
//!
//! - [`CommandQueue`]: commands run one at a time against a single entity
//! - [`CommandChain`]: sets of commands run in parallel, sets in sequence

pub mod chain;
pub mod queue;

pub use chain::{
    AsyncCommand, CommandChain, CommandErrorInfo, CommandExecutionError, CommandSet, CommandSetHandle, SetOutcome,
};
pub use queue::{Command, CommandQueue};
