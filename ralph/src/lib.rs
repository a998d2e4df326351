//! Iteration-control engine for an autonomous coding agent.
//!
//! A run repeatedly asks a language model for its next action, executes that
//! action inside a sandboxed workspace, and feeds the observation back. The
//! engine keeps the context small and stable across long runs, recovers from
//! malformed model output and stops when the agent stagnates.
//!
//! - **[`core`]**: Pure, deterministic logic (parsing, loop detection, context
//!   assembly, dedup). No I/O, fully testable in isolation.
//! - **[`io`]**: Side effects (config, persistence, sandbox, model endpoint,
//!   operator input). Isolated behind traits so tests can script them.
//!
//! Orchestration modules ([`step`], [`looping`], [`historian`], [`critique`],
//! [`status`]) coordinate core logic with I/O.

pub mod core;
pub mod critique;
pub mod error;
pub mod exit_codes;
pub mod historian;
pub mod io;
pub mod logging;
pub mod looping;
pub mod status;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
