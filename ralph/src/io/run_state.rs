//! Run state storage (`.ralph/state/<run_id>.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::dedup::ResponseCache;
use crate::core::types::{
    DegradeEvent, LoopType, Observation, Plan, RchMetrics, Termination, Turn,
};

const WARNING_LIMIT: usize = 20;

/// Complete persisted state of one agent run.
///
/// Owned by the orchestrator and mutated only between iterations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub run_id: String,
    pub goal: String,
    /// Completed iterations.
    pub iteration: u32,
    /// Set once the run stops; `None` while it can continue.
    pub termination: Option<Termination>,
    pub last_error: Option<String>,
    pub plan: Plan,
    /// Recent observations shown to the model; older ones are folded into `history_summary`.
    pub observations: Vec<Observation>,
    /// Unfolded trail of recent observations for loop detection and compression.
    pub iteration_log: Vec<Observation>,
    pub history_summary: String,
    pub stagnation_count: u32,
    pub loop_type: Option<LoopType>,
    /// Set once stagnation reaches 2; disables synopsis replacement.
    #[serde(default)]
    pub full_fidelity: bool,
    pub rch_metrics: RchMetrics,
    pub message_history: Vec<Turn>,
    pub response_cache: ResponseCache,
    #[serde(default)]
    pub degrade_events: Vec<DegradeEvent>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, goal: impl Into<String>, plan: Plan, cache_capacity: usize) -> Self {
        Self {
            run_id: run_id.into(),
            goal: goal.into(),
            iteration: 0,
            termination: None,
            last_error: None,
            plan,
            observations: Vec::new(),
            iteration_log: Vec::new(),
            history_summary: String::new(),
            stagnation_count: 0,
            loop_type: None,
            full_fidelity: false,
            rch_metrics: RchMetrics::default(),
            message_history: Vec::new(),
            response_cache: ResponseCache::new(cache_capacity),
            degrade_events: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_some()
    }

    pub fn last_observation(&self) -> Option<&Observation> {
        self.iteration_log.last()
    }

    /// Record a non-fatal warning, keeping only the most recent ones.
    pub fn warn(&mut self, message: impl Into<String>) {
        crate::core::folding::push_bounded(&mut self.warnings, message.into(), WARNING_LIMIT);
    }

    /// A stopped run that may continue: budget exhaustion, quit, or a plumbing error.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.termination,
            None | Some(Termination::BudgetExhausted | Termination::Quit | Termination::Error)
        )
    }

    /// Re-open a resumable run so it can continue.
    pub fn reopen(&mut self) {
        if self.is_resumable() {
            self.termination = None;
            self.last_error = None;
        }
    }
}

/// Load run state from disk.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(run_id = %state.run_id, iteration = state.iteration, "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), run_id = %state.run_id, iteration = state.iteration, "writing run state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    super::fsutil::write_atomic(path, &buf)
}
