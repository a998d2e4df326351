//! Side effects: configuration, persistence, the sandbox, the model endpoint
//! and operator input.

pub mod config;
pub mod fsutil;
pub mod hitl;
pub mod init;
pub mod iteration_log;
pub mod model;
pub mod process;
pub mod prompt;
pub mod run_state;
pub mod sandbox;
