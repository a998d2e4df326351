//! `ralph status`: report on a persisted run without invoking the engine.

use std::fmt;
use std::fs;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};

use crate::core::goal::run_id;
use crate::core::types::{LoopType, Observation, TaskStatus, Termination};
use crate::io::init::RalphPaths;
use crate::io::run_state::{RunState, load_run_state};

const RECENT_OBSERVATIONS: usize = 5;

/// Which persisted run to report on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusQuery {
    Goal(String),
    RunId(String),
    /// Most recently written state file.
    Latest,
}

/// Locate and load the RunState matching `query`.
pub fn find_run(paths: &RalphPaths, query: &StatusQuery) -> Result<RunState> {
    let run_id = match query {
        StatusQuery::Goal(goal) => run_id(goal),
        StatusQuery::RunId(id) => id.clone(),
        StatusQuery::Latest => latest_run_id(paths)?,
    };
    let path = paths.run_state_path(&run_id);
    if !path.is_file() {
        return Err(anyhow!("no saved run with id {run_id}"));
    }
    load_run_state(&path)
}

fn latest_run_id(paths: &RalphPaths) -> Result<String> {
    let entries = fs::read_dir(&paths.state_dir)
        .with_context(|| format!("read directory {}", paths.state_dir.display()))?;
    let mut latest: Option<(SystemTime, String)> = None;
    for entry in entries {
        let entry = entry.with_context(|| format!("read directory {}", paths.state_dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .with_context(|| format!("stat {}", path.display()))?;
        if latest.as_ref().is_none_or(|(seen, _)| modified > *seen) {
            latest = Some((modified, stem.to_string()));
        }
    }
    latest
        .map(|(_, id)| id)
        .ok_or_else(|| anyhow!("no saved runs in {}", paths.state_dir.display()))
}

/// Human-readable view of a RunState.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub run_id: String,
    pub iteration: u32,
    pub termination: Option<Termination>,
    pub last_error: Option<String>,
    pub current_task: Option<String>,
    pub tasks_done: usize,
    pub tasks_total: usize,
    pub stagnation: u32,
    pub loop_type: Option<LoopType>,
    pub compressions: u32,
    pub tokens_saved: u64,
    pub last_compression_ratio: f64,
    pub summary_chars: usize,
    pub degrade_events: usize,
    pub recent: Vec<Observation>,
}

impl StatusReport {
    pub fn from_state(state: &RunState) -> Self {
        let recent_start = state.iteration_log.len().saturating_sub(RECENT_OBSERVATIONS);
        Self {
            run_id: state.run_id.clone(),
            iteration: state.iteration,
            termination: state.termination,
            last_error: state.last_error.clone(),
            current_task: state
                .plan
                .current()
                .map(|task| format!("{}: {}", task.id, task.description)),
            tasks_done: state.plan.count(TaskStatus::Done),
            tasks_total: state.plan.tasks.len(),
            stagnation: state.stagnation_count,
            loop_type: state.loop_type,
            compressions: state.rch_metrics.compressions,
            tokens_saved: state.rch_metrics.tokens_saved,
            last_compression_ratio: state.rch_metrics.last_compression_ratio,
            summary_chars: state.history_summary.chars().count(),
            degrade_events: state.degrade_events.len(),
            recent: state.iteration_log[recent_start..].to_vec(),
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run:          {}", self.run_id)?;
        writeln!(f, "iteration:    {}", self.iteration)?;
        let state = self.termination.map_or("running", Termination::as_str);
        match &self.last_error {
            Some(reason) => writeln!(f, "state:        {state} ({reason})")?,
            None => writeln!(f, "state:        {state}")?,
        }
        writeln!(
            f,
            "task:         {} [{}/{} done]",
            self.current_task.as_deref().unwrap_or("none"),
            self.tasks_done,
            self.tasks_total
        )?;
        writeln!(
            f,
            "stagnation:   {} ({})",
            self.stagnation,
            self.loop_type.map_or("none", LoopType::as_str)
        )?;
        writeln!(
            f,
            "history:      {} compressions, ~{} tokens saved, last ratio {:.1}%, summary {} chars",
            self.compressions, self.tokens_saved, self.last_compression_ratio, self.summary_chars
        )?;
        if self.degrade_events > 0 {
            writeln!(f, "degraded:     {} critique fallbacks", self.degrade_events)?;
        }
        if self.recent.is_empty() {
            return Ok(());
        }
        writeln!(f, "recent:")?;
        for obs in &self.recent {
            let mark = if obs.success { "ok" } else { "failed" };
            let outcome = obs.outcome.lines().next().unwrap_or_default();
            writeln!(f, "  #{} {} [{mark}] {outcome}", obs.iteration, obs.action)?;
        }
        Ok(())
    }
}
