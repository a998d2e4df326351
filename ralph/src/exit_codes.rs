//! Stable exit codes for `ralph` commands.

/// The run finished with the model signalling completion, or the command succeeded.
pub const DONE: i32 = 0;
/// Plumbing failure (unwritable state, unreadable config, ...).
pub const ERROR: i32 = 1;
/// Invalid input: bad config, missing goal, unknown run.
pub const INVALID: i32 = 2;
/// The loop detector killed the run.
pub const KILLED: i32 = 3;
/// The iteration budget ran out before completion.
pub const BUDGET_EXHAUSTED: i32 = 4;
/// The operator quit.
pub const QUIT: i32 = 5;
