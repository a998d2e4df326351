//! Orchestration for a single iteration of the agent loop.
//!
//! One call to [`run_step`] performs, in order: observation folding, history
//! compression, loop detection, operator directives, context assembly, the
//! model call (optionally through the critique pass), parsing, deduplication,
//! sandboxed execution and persistence.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::board::{StateSnapshot, render_current_state, render_task_board};
use crate::core::context::{clear_conversation, ensure_system, push_turn, thin};
use crate::core::dedup::signature;
use crate::core::directive::{Directive, classify};
use crate::core::folding::{fold_observations, push_bounded};
use crate::core::goal::{brief_goal, needs_full_spec};
use crate::core::loop_detector::{apply_verdict, detect, remediation};
use crate::core::parser::{ParseTier, Parsed, parse_envelope};
use crate::core::text::truncate_ellipsis;
use crate::core::types::{FailureKind, Observation, Role, TaskStatus, Termination, Turn};
use crate::critique::{CritiqueParams, CritiqueReport, deliberate, should_critique};
use crate::error::{ConfigError, ParseError};
use crate::historian::{ModelHistorian, compress, should_compress};
use crate::io::config::EngineConfig;
use crate::io::hitl::HitlSource;
use crate::io::init::{RalphPaths, ensure_dirs};
use crate::io::iteration_log::{IterationMeta, write_iteration};
use crate::io::model::{ChatMessage, ModelClient, ModelRequest, complete_with_retry};
use crate::io::prompt::{PromptEngine, StateTurnInput};
use crate::io::run_state::{RunState, write_run_state};
use crate::io::sandbox::Sandbox;

/// Stagnation level at which synopsis replacement is disabled for the rest of the run.
const FULL_FIDELITY_STAGNATION: u32 = 2;
const DEGRADE_LIMIT: usize = 20;
const CHAT_OUTCOME_CHARS: usize = 300;
const NO_REPLY_PLACEHOLDER: &str = "(no reply: model call failed)";

/// Long-lived collaborators shared by every iteration of a run.
pub struct Engine {
    pub config: EngineConfig,
    pub paths: RalphPaths,
    pub sandbox: Sandbox,
    pub prompts: PromptEngine,
}

impl Engine {
    /// Validate config, create state directories and pin the workspace.
    ///
    /// The state directory and the engine's own sources are protected from the
    /// agent; a workspace inside the engine's sources is rejected up front.
    pub fn new(paths: RalphPaths, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let workspace = paths.workspace(&config);
        let engine_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        check_workspace_layout(&workspace, engine_dir)?;
        ensure_dirs(&paths)?;
        let sandbox = Sandbox::new(&workspace, config.sandbox.clone())?
            .protect(&paths.ralph_dir)
            .protect(engine_dir);
        Ok(Self {
            config,
            paths,
            sandbox,
            prompts: PromptEngine::new()?,
        })
    }

    /// Write the run state atomically to its durable location.
    pub fn persist(&self, state: &RunState) -> Result<()> {
        write_run_state(&self.paths.run_state_path(&state.run_id), state)
    }
}

/// Reject a workspace that lies inside `engine_dir`, where every action would be refused.
fn check_workspace_layout(workspace: &Path, engine_dir: &Path) -> Result<(), ConfigError> {
    let workspace = real_location(workspace);
    let engine_dir = real_location(engine_dir);
    if workspace.starts_with(&engine_dir) {
        return Err(ConfigError(format!(
            "workspace {} lies inside the engine sources at {}; choose a workspace outside it",
            workspace.display(),
            engine_dir.display()
        )));
    }
    Ok(())
}

/// Canonical form of `path`, resolving its longest existing ancestor.
fn real_location(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(real) = fs::canonicalize(existing) {
            return missing.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

/// Result of a single iteration.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Iteration number (1-indexed).
    pub iter: u32,
    pub task_id: Option<String>,
    /// `None` when the run stopped before the model was called.
    pub observation: Option<Observation>,
    pub termination: Option<Termination>,
}

/// Execute one iteration against `state`.
///
/// Non-fatal conditions (network failure, unparseable output, refused actions)
/// become observations. Errors are returned only for plumbing failures such as
/// an unwritable state directory.
#[instrument(skip_all, fields(run_id = %state.run_id, iteration = state.iteration + 1))]
pub fn run_step<M, H>(
    engine: &Engine,
    state: &mut RunState,
    model: &M,
    hitl: &mut H,
) -> Result<StepOutcome>
where
    M: ModelClient + ?Sized,
    H: HitlSource + ?Sized,
{
    let started = Instant::now();
    let started_at = Utc::now();
    let cfg = &engine.config;
    state.iteration += 1;
    let iter = state.iteration;
    info!("iteration started");

    let folded = fold_observations(
        &mut state.observations,
        &mut state.history_summary,
        &cfg.observations,
        cfg.history.max_summary_chars,
    );
    if folded > 0 {
        debug!(folded, "folded observations into history summary");
    }

    if should_compress(state, cfg) {
        let historian = ModelHistorian::new(model, &engine.prompts, &cfg.history, &cfg.retry);
        compress(&historian, state, cfg);
    }

    let verdict = detect(&state.iteration_log, &cfg.loop_detector);
    let (stagnation, loop_type) = apply_verdict(verdict, state.stagnation_count, state.loop_type);
    if stagnation > state.stagnation_count {
        warn!(
            stagnation,
            loop_type = loop_type.map(|l| l.as_str()),
            "stagnation increased"
        );
    }
    state.stagnation_count = stagnation;
    state.loop_type = loop_type;
    if stagnation >= FULL_FIDELITY_STAGNATION {
        state.full_fidelity = true;
    }

    if stagnation >= cfg.loop_detector.kill_threshold {
        let reason = format!(
            "loop detected ({}): stagnation {stagnation} reached kill threshold {}",
            loop_type.map_or("repeated responses", |l| l.as_str()),
            cfg.loop_detector.kill_threshold
        );
        warn!(reason = %reason, "safety kill");
        return stop(engine, state, Termination::Killed, Some(reason));
    }

    let directive = match hitl.poll(state)? {
        Some(line) => classify(&line),
        None => Directive::Proceed,
    };
    if directive == Directive::Quit {
        info!("operator quit");
        return stop(engine, state, Termination::Quit, None);
    }
    apply_directive(state, &directive);
    let note = directive.prompt_note();

    let system = engine
        .prompts
        .system_prompt(&brief_goal(&state.goal), needs_full_spec(&state.goal))?;
    ensure_system(&mut state.message_history, &system);

    let warn_at = cfg.loop_detector.warn_threshold;
    let remediation_text =
        (state.stagnation_count >= warn_at).then(|| remediation(state.loop_type, state.stagnation_count));
    let duplicate_last = state.last_observation().is_some_and(|obs| obs.duplicate);
    let state_turn = engine.prompts.state_turn(
        &StateTurnInput {
            iteration: iter,
            max_iterations: cfg.max_iterations,
            directive: note.as_deref(),
            remediation: remediation_text.as_deref(),
            plan: &state.plan,
            history_summary: &state.history_summary,
            observations: &state.observations,
            duplicate: duplicate_last,
        },
        cfg.context.state_turn_budget_bytes,
    )?;
    push_turn(&mut state.message_history, Turn::user(state_turn), cfg.context.max_turns);
    let thinned = thin(&mut state.message_history, &cfg.context, state.full_fidelity);
    if thinned > 0 {
        debug!(thinned, "replaced old assistant turns with synopses");
    }

    let request = ModelRequest::from_history(
        &state.message_history,
        cfg.model.temperature,
        cfg.model.max_tokens,
    );
    let mut record = IterationRecord {
        started,
        started_at,
        task_id: state.plan.current_task_id.clone(),
        parse_tier: None,
        critique: None,
        response: String::new(),
    };

    let reply = if should_critique(cfg.critique.mode, state) {
        let deliberation = deliberate(
            model,
            &engine.prompts,
            &request,
            &CritiqueParams {
                goal: &brief_goal(&state.goal),
                iteration: iter,
                draft_max_tokens: cfg.critique.draft_max_tokens,
                retry: &cfg.retry,
            },
        );
        if let Some(event) = deliberation.degrade {
            push_bounded(&mut state.degrade_events, event, DEGRADE_LIMIT);
        }
        record.critique = Some(deliberation.report);
        deliberation.reply
    } else {
        complete_with_retry(model, &request, &cfg.retry)
    };

    let raw = match reply {
        Ok(raw) => raw,
        Err(err) => {
            warn!(err = %err, "model call failed after retries");
            // User and assistant turns must keep alternating.
            push_turn(
                &mut state.message_history,
                Turn::assistant(NO_REPLY_PLACEHOLDER),
                cfg.context.max_turns,
            );
            let obs = failed_observation(
                iter,
                &record.task_id,
                "model call",
                format!("Model call failed: {err}"),
                FailureKind::Network,
            );
            return finish(engine, state, obs, record, false);
        }
    };

    let parsed = match parse_reply(engine, model, &request, &raw) {
        Ok((parsed, text)) => {
            record.response = text;
            parsed
        }
        Err(err) => {
            warn!(reason = %err.reason, excerpt = %err.excerpt(), "could not parse model output");
            record.response = raw.clone();
            push_turn(&mut state.message_history, Turn::assistant(raw), cfg.context.max_turns);
            let obs = failed_observation(
                iter,
                &record.task_id,
                "parse reply",
                format!("Could not understand output ({}): {}", err.reason, err.excerpt()),
                FailureKind::Parse,
            );
            return finish(engine, state, obs, record, false);
        }
    };
    record.parse_tier = Some(parsed.tier);
    if parsed.tier != ParseTier::Strict {
        debug!(tier = ?parsed.tier, "reply recovered by tolerant parsing");
    }
    if parsed.dropped_actions > 0 {
        warn!(dropped = parsed.dropped_actions, "only the first action of the reply runs");
        state.warn(format!(
            "iteration {iter}: dropped {} extra actions",
            parsed.dropped_actions
        ));
    }
    push_turn(
        &mut state.message_history,
        Turn::assistant(record.response.clone()),
        cfg.context.max_turns,
    );

    let envelope = parsed.envelope;
    let duplicate = state
        .response_cache
        .check_and_insert(&signature(&envelope), Utc::now());
    if duplicate {
        warn!("reply duplicates a recent response");
    }

    if let Some(update) = &envelope.plan_update {
        state.plan.apply_update(update);
        debug!(current = ?state.plan.current_task_id, tasks = state.plan.tasks.len(), "plan updated");
    }
    record.task_id = state.plan.current_task_id.clone();

    let mut obs = match &envelope.execute {
        Some(action) => engine.sandbox.execute(action, iter, record.task_id.as_deref()),
        None => Observation {
            iteration: iter,
            task_id: record.task_id.clone(),
            action: "chat".to_string(),
            action_key: None,
            outcome: chat_outcome(&envelope.chat),
            success: true,
            failure: None,
            duplicate: false,
            at: Utc::now(),
        },
    };
    obs.duplicate = duplicate;

    finish(engine, state, obs, record, envelope.done)
}

/// Everything `meta.json` needs that is not on RunState.
struct IterationRecord {
    started: Instant,
    started_at: chrono::DateTime<Utc>,
    task_id: Option<String>,
    parse_tier: Option<ParseTier>,
    critique: Option<CritiqueReport>,
    response: String,
}

/// Parse `raw`, asking once more with a stricter instruction when allowed.
///
/// Returns the parsed envelope and the text that produced it.
fn parse_reply<M: ModelClient + ?Sized>(
    engine: &Engine,
    model: &M,
    request: &ModelRequest,
    raw: &str,
) -> Result<(Parsed, String), ParseError> {
    let err = match parse_envelope(raw) {
        Ok(parsed) => return Ok((parsed, raw.to_string())),
        Err(err) => err,
    };
    if !engine.config.parser.strict_retry {
        return Err(err);
    }

    let Ok(instruction) = engine.prompts.strict_retry(&err.reason) else {
        return Err(err);
    };
    let mut retry = request.clone();
    retry.messages.push(ChatMessage {
        role: Role::Assistant,
        content: raw.to_string(),
    });
    retry.messages.push(ChatMessage {
        role: Role::User,
        content: instruction,
    });
    info!(reason = %err.reason, "retrying with strict instruction");
    match complete_with_retry(model, &retry, &engine.config.retry) {
        Ok(text) => parse_envelope(&text).map(|parsed| (parsed, text)),
        Err(model_err) => {
            warn!(err = %model_err, "strict retry call failed");
            Err(err)
        }
    }
}

/// Apply an operator directive before the context is built.
fn apply_directive(state: &mut RunState, directive: &Directive) {
    match directive {
        Directive::Proceed | Directive::Say(_) | Directive::Quit => {}
        Directive::Reset | Directive::Frustrated(_) => {
            state.stagnation_count = 0;
            state.loop_type = None;
            state.full_fidelity = false;
            state.observations.clear();
            state.iteration_log.clear();
            state.response_cache.clear();
        }
        Directive::Replan => state.plan.current_task_id = None,
        Directive::Skip => {
            let current = state.plan.current_task_id.clone();
            if let Some(task) = current.as_deref().and_then(|id| state.plan.get_mut(id)) {
                task.status = TaskStatus::Skipped;
            }
            let next = state
                .plan
                .tasks
                .iter_mut()
                .find(|task| task.status == TaskStatus::Pending);
            state.plan.current_task_id = next.map(|task| {
                task.status = TaskStatus::Active;
                task.id.clone()
            });
        }
        Directive::Clear => clear_conversation(&mut state.message_history),
    }
    if directive != &Directive::Proceed {
        info!(directive = ?directive, "applied operator directive");
    }
}

fn failed_observation(
    iteration: u32,
    task_id: &Option<String>,
    action: &str,
    outcome: String,
    failure: FailureKind,
) -> Observation {
    Observation {
        iteration,
        task_id: task_id.clone(),
        action: action.to_string(),
        action_key: None,
        outcome,
        success: false,
        failure: Some(failure),
        duplicate: false,
        at: Utc::now(),
    }
}

fn chat_outcome(chat: &str) -> String {
    let chat = chat.trim();
    if chat.is_empty() {
        return "No action requested".to_string();
    }
    format!("Chat: {}", truncate_ellipsis(chat, CHAT_OUTCOME_CHARS))
}

/// Stop before the model call and persist the final state.
fn stop(
    engine: &Engine,
    state: &mut RunState,
    termination: Termination,
    reason: Option<String>,
) -> Result<StepOutcome> {
    let iter = state.iteration;
    // The iteration never reached the model, so it does not count as completed.
    state.iteration -= 1;
    state.termination = Some(termination);
    state.last_error = reason;
    engine.persist(state)?;
    Ok(StepOutcome {
        iter,
        task_id: state.plan.current_task_id.clone(),
        observation: None,
        termination: Some(termination),
    })
}

/// Record the observation, write artifacts and persist.
fn finish(
    engine: &Engine,
    state: &mut RunState,
    obs: Observation,
    record: IterationRecord,
    done: bool,
) -> Result<StepOutcome> {
    let cfg = &engine.config;
    if let Some(turn) = state.message_history.last_mut()
        && turn.role == Role::Assistant
    {
        turn.outcome = Some(truncate_ellipsis(&obs.outcome, cfg.context.synopsis_outcome_chars));
    }

    info!(
        action = %obs.action,
        success = obs.success,
        duplicate = obs.duplicate,
        "iteration finished"
    );
    state.observations.push(obs.clone());
    push_bounded(&mut state.iteration_log, obs.clone(), cfg.observations.trail_limit);
    if done {
        info!("model signalled completion");
        state.termination = Some(Termination::Done);
    }

    let meta = IterationMeta {
        run_id: state.run_id.clone(),
        iter: state.iteration,
        task_id: record.task_id.clone(),
        action: Some(obs.action.clone()),
        success: obs.success,
        duplicate: obs.duplicate,
        parse_tier: record.parse_tier,
        critique: record.critique,
        stagnation: state.stagnation_count,
        loop_type: state.loop_type,
        started_at: record.started_at.to_rfc3339(),
        duration_ms: record.started.elapsed().as_millis() as u64,
    };
    write_iteration(&engine.paths.iterations_dir, &meta, &record.response)
        .context("write iteration artifacts")?;

    if cfg.task_board {
        write_task_board(engine, state);
    }
    engine.persist(state)?;

    Ok(StepOutcome {
        iter: state.iteration,
        task_id: record.task_id,
        observation: Some(obs),
        termination: state.termination,
    })
}

/// Render `todo.md` and `current.state.md` into the workspace. Failures are warnings.
fn write_task_board(engine: &Engine, state: &mut RunState) {
    let board = render_task_board(&state.plan);
    let current = render_current_state(&StateSnapshot {
        iteration: state.iteration,
        plan: &state.plan,
        stagnation: state.stagnation_count,
        loop_type: state.loop_type,
        last: state.last_observation(),
    });
    for (path, contents) in [("todo.md", board), ("current.state.md", current)] {
        if let Err(err) = engine.sandbox.write(path, &contents) {
            warn!(path, err = %err, "task board write failed");
            state.warn(format!("iteration {}: {path}: {err}", state.iteration));
        }
    }
}
