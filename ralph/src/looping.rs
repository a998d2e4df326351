//! Run lifecycle: `Init → Iterating → Terminated`.

use anyhow::Result;
use tracing::{error, info, warn};

use crate::core::goal::{needs_full_spec, run_id};
use crate::core::types::{Plan, Termination};
use crate::io::hitl::HitlSource;
use crate::io::model::ModelClient;
use crate::io::run_state::{RunState, load_run_state};
use crate::io::sandbox::WriteOutcome;
use crate::step::{Engine, StepOutcome, run_step};

/// Workspace file holding a long goal verbatim.
pub const FULL_SPEC_FILE: &str = "_full_spec.md";

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The model signalled completion.
    Done,
    /// Stagnation reached the kill threshold.
    Killed { reason: String },
    /// The iteration budget ran out.
    BudgetExhausted { max_iterations: u32 },
    /// The operator quit.
    Quit,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub started_at_iter: u32,
    pub steps_executed: u32,
    pub stop: LoopStop,
}

/// Load the saved state for `goal`, or create a fresh one.
///
/// A saved state is resumed only when its stored goal matches and it did not
/// finish as done or killed. Fresh states are seeded from `tasks` and persisted.
pub fn init_run(engine: &Engine, goal: &str, tasks: &[String]) -> Result<RunState> {
    let run_id = run_id(goal);
    let path = engine.paths.run_state_path(&run_id);

    if path.exists() {
        let mut saved = load_run_state(&path)?;
        if saved.goal == goal && saved.is_resumable() {
            info!(run_id = %run_id, iteration = saved.iteration, "resuming run");
            saved.reopen();
            return Ok(saved);
        }
        info!(
            run_id = %run_id,
            termination = saved.termination.map(Termination::as_str),
            "saved state not resumable, starting fresh"
        );
    }

    let state = RunState::new(
        run_id.clone(),
        goal,
        Plan::seeded(tasks),
        engine.config.dedup.capacity,
    );
    if needs_full_spec(goal) {
        match engine.sandbox.write(FULL_SPEC_FILE, goal)? {
            WriteOutcome::Written(bytes) => info!(bytes, "wrote full goal to workspace"),
            WriteOutcome::Unchanged => {}
        }
    }
    engine.persist(&state)?;
    info!(run_id = %run_id, tasks = tasks.len(), "created run");
    Ok(state)
}

/// Iterate until the run terminates or the iteration budget is spent.
///
/// A plumbing error inside a step restores the last completed iteration,
/// marks the run as errored, persists it and returns the error.
pub fn run_loop<M, H, F>(
    engine: &Engine,
    state: &mut RunState,
    model: &M,
    hitl: &mut H,
    mut on_step: F,
) -> Result<LoopOutcome>
where
    M: ModelClient + ?Sized,
    H: HitlSource + ?Sized,
    F: FnMut(&StepOutcome),
{
    let started_at_iter = state.iteration;
    let max_iterations = engine.config.max_iterations;
    let mut steps_executed = 0u32;

    loop {
        let stop = match state.termination {
            Some(Termination::Done) => Some(LoopStop::Done),
            Some(Termination::Killed) => Some(LoopStop::Killed {
                reason: state.last_error.clone().unwrap_or_default(),
            }),
            Some(Termination::Quit) => Some(LoopStop::Quit),
            Some(Termination::BudgetExhausted) => Some(LoopStop::BudgetExhausted { max_iterations }),
            Some(Termination::Error) | None => None,
        };
        if let Some(stop) = stop {
            info!(stop = ?stop, steps_executed, "run stopped");
            return Ok(LoopOutcome {
                run_id: state.run_id.clone(),
                started_at_iter,
                steps_executed,
                stop,
            });
        }

        if state.iteration >= max_iterations {
            warn!(max_iterations, "iteration budget exhausted");
            state.termination = Some(Termination::BudgetExhausted);
            engine.persist(state)?;
            continue;
        }

        let checkpoint = state.clone();
        match run_step(engine, state, model, hitl) {
            Ok(step) => {
                steps_executed += 1;
                on_step(&step);
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "iteration failed");
                *state = checkpoint;
                state.termination = Some(Termination::Error);
                state.last_error = Some(format!("{err:#}"));
                if let Err(persist_err) = engine.persist(state) {
                    error!(err = %format!("{persist_err:#}"), "could not persist error state");
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::hitl::NoHitl;
    use crate::step::run_step;
    use crate::test_support::{ScriptedModel, TestWorkspace};

    #[test]
    fn budget_exhaustion_stops_the_run() {
        let ws = TestWorkspace::with_config(|cfg| cfg.max_iterations = 2);
        let engine = ws.engine();
        let mut state = init_run(&engine, "explore", &[]).expect("init");
        let model = ScriptedModel::new();
        model.push_reply(r#"{"chat":"a","execute":{"type":"list","path":"."}}"#);
        model.push_reply(r#"{"chat":"b","execute":{"type":"write","path":"b.txt","content":"b"}}"#);

        let outcome = run_loop(&engine, &mut state, &model, &mut NoHitl, |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::BudgetExhausted { max_iterations: 2 });
        assert_eq!(outcome.steps_executed, 2);
        assert_eq!(state.termination, Some(Termination::BudgetExhausted));
    }

    /// Verifies a budget-exhausted run resumes from its saved iteration.
    #[test]
    fn init_resumes_matching_goal() {
        let ws = TestWorkspace::with_config(|cfg| cfg.max_iterations = 1);
        let engine = ws.engine();
        let mut state = init_run(&engine, "explore", &["look around".to_string()]).expect("init");
        let model = ScriptedModel::new();
        model.push_reply(r#"{"chat":"a","execute":{"type":"list","path":"."}}"#);
        run_loop(&engine, &mut state, &model, &mut NoHitl, |_| {}).expect("loop");

        let resumed = init_run(&engine, "explore", &[]).expect("resume");

        assert_eq!(resumed.iteration, 1);
        assert_eq!(resumed.termination, None);
        assert_eq!(resumed.plan.tasks.len(), 1);

        let other = init_run(&engine, "something else", &[]).expect("fresh");
        assert_eq!(other.iteration, 0);
        assert_ne!(other.run_id, resumed.run_id);
    }

    #[test]
    fn long_goal_is_written_to_workspace() {
        let ws = TestWorkspace::new();
        let engine = ws.engine();
        let goal = format!("# App\n\n{}", "Build a todo app with sqlite storage.\n".repeat(40));

        init_run(&engine, &goal, &[]).expect("init");

        assert_eq!(ws.read_workspace(FULL_SPEC_FILE), goal);
    }

    #[test]
    fn finished_runs_start_over() {
        let ws = TestWorkspace::new();
        let engine = ws.engine();
        let mut state = init_run(&engine, "say hi", &[]).expect("init");
        let model = ScriptedModel::new();
        model.push_reply(r#"{"chat":"hi","done":true}"#);

        let outcome = run_loop(&engine, &mut state, &model, &mut NoHitl, |_| {}).expect("loop");
        assert_eq!(outcome.stop, LoopStop::Done);

        let again = init_run(&engine, "say hi", &[]).expect("init again");
        assert_eq!(again.iteration, 0);
        assert_eq!(again.termination, None);
    }

    /// Verifies a failed step leaves the last completed iteration on disk and resumes from it.
    #[test]
    fn plumbing_error_restores_last_completed_iteration() {
        let ws = TestWorkspace::new();
        let engine = ws.engine();
        let mut state = init_run(&engine, "explore", &[]).expect("init");
        let model = ScriptedModel::new();
        model.push_reply(r#"{"chat":"a","execute":{"type":"list","path":"."}}"#);
        model.push_reply(r#"{"chat":"b","execute":{"type":"write","path":"b.txt","content":"b"}}"#);
        run_step(&engine, &mut state, &model, &mut NoHitl).expect("first step");

        let iterations_dir = &engine.paths.iterations_dir;
        std::fs::remove_dir_all(iterations_dir).expect("remove iterations dir");
        std::fs::write(iterations_dir, "not a directory").expect("block iterations dir");

        let err = run_loop(&engine, &mut state, &model, &mut NoHitl, |_| {}).expect_err("plumbing");

        assert!(format!("{err:#}").contains("write iteration artifacts"));
        assert_eq!(state.iteration, 1);
        assert_eq!(state.iteration_log.len(), 1);
        assert_eq!(state.termination, Some(Termination::Error));
        let saved = load_run_state(&engine.paths.run_state_path(&state.run_id)).expect("load");
        assert_eq!(saved.iteration, 1);
        assert_eq!(saved.termination, Some(Termination::Error));
        assert!(saved.last_error.is_some());

        let resumed = init_run(&engine, "explore", &[]).expect("resume");
        assert_eq!(resumed.iteration, 1);
        assert_eq!(resumed.termination, None);
        assert_eq!(resumed.last_error, None);
        assert_eq!(resumed.iteration_log, state.iteration_log);
    }
}
