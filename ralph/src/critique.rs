//! Internal Critique Engine (RLM): draft, critique, refine.
//!
//! Three sequential model calls over an accumulating conversation. Any phase
//! failure degrades to one direct call for the iteration.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::parser::parse_envelope;
use crate::core::types::{DegradeEvent, Role};
use crate::error::ModelError;
use crate::io::config::{CritiqueMode, RetryConfig};
use crate::io::model::{ChatMessage, ModelClient, ModelRequest, complete_with_retry};
use crate::io::prompt::PromptEngine;
use crate::io::run_state::RunState;

/// Per-phase latency of one critique pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CritiqueReport {
    pub draft_ms: Option<u64>,
    pub critique_ms: Option<u64>,
    pub refine_ms: Option<u64>,
    /// Phase that failed, when the pass fell back to a direct call.
    pub degraded: Option<String>,
}

/// Final reply text plus what happened along the way.
#[derive(Debug)]
pub struct Deliberation {
    pub reply: Result<String, ModelError>,
    pub report: CritiqueReport,
    pub degrade: Option<DegradeEvent>,
}

/// Confusion signals: a loop type is set, stagnation is non-zero, or the last action failed.
pub fn is_confused(state: &RunState) -> bool {
    state.loop_type.is_some()
        || state.stagnation_count > 0
        || state.last_observation().is_some_and(|obs| obs.is_error())
}

pub fn should_critique(mode: CritiqueMode, state: &RunState) -> bool {
    match mode {
        CritiqueMode::Off => false,
        CritiqueMode::Always => true,
        CritiqueMode::OnConfusion => is_confused(state),
    }
}

/// Settings shared by the three phases.
pub struct CritiqueParams<'a> {
    pub goal: &'a str,
    pub iteration: u32,
    pub draft_max_tokens: u32,
    pub retry: &'a RetryConfig,
}

/// Run draft → critique → refine over `request`.
pub fn deliberate<M: ModelClient + ?Sized>(
    model: &M,
    prompts: &PromptEngine,
    request: &ModelRequest,
    params: &CritiqueParams<'_>,
) -> Deliberation {
    let mut report = CritiqueReport::default();
    match run_phases(model, prompts, request, params, &mut report) {
        Ok(text) => {
            info!(
                draft_ms = report.draft_ms,
                critique_ms = report.critique_ms,
                refine_ms = report.refine_ms,
                "critique pass finished"
            );
            Deliberation {
                reply: Ok(text),
                report,
                degrade: None,
            }
        }
        Err((phase, reason)) => {
            warn!(phase, reason = %reason, "critique phase failed, falling back to direct call");
            report.degraded = Some(phase.to_string());
            let degrade = DegradeEvent {
                iteration: params.iteration,
                phase: phase.to_string(),
                reason,
            };
            Deliberation {
                reply: complete_with_retry(model, request, params.retry),
                report,
                degrade: Some(degrade),
            }
        }
    }
}

type PhaseError = (&'static str, String);

fn run_phases<M: ModelClient + ?Sized>(
    model: &M,
    prompts: &PromptEngine,
    request: &ModelRequest,
    params: &CritiqueParams<'_>,
    report: &mut CritiqueReport,
) -> Result<String, PhaseError> {
    let mut messages = request.messages.clone();

    let draft = timed_call(model, &messages, request, params, Some(params.draft_max_tokens))
        .map_err(|(err, _)| ("draft", err.to_string()))
        .map(|(text, ms)| {
            report.draft_ms = Some(ms);
            text
        })?;
    debug!(chars = draft.len(), "draft produced");

    let critique_prompt = prompts
        .critique(params.goal)
        .map_err(|err| ("critique", format!("{err:#}")))?;
    messages.push(message(Role::Assistant, draft));
    messages.push(message(Role::User, critique_prompt));
    let critique = timed_call(model, &messages, request, params, None)
        .map_err(|(err, _)| ("critique", err.to_string()))
        .map(|(text, ms)| {
            report.critique_ms = Some(ms);
            text
        })?;
    debug!(chars = critique.len(), "critique produced");

    let refine_prompt = prompts
        .refine()
        .map_err(|err| ("refine", format!("{err:#}")))?;
    messages.push(message(Role::Assistant, critique));
    messages.push(message(Role::User, refine_prompt));
    let refined = timed_call(model, &messages, request, params, Some(params.draft_max_tokens))
        .map_err(|(err, _)| ("refine", err.to_string()))
        .map(|(text, ms)| {
            report.refine_ms = Some(ms);
            text
        })?;

    if let Err(err) = parse_envelope(&refined) {
        return Err(("refine", err.to_string()));
    }
    Ok(refined)
}

fn timed_call<M: ModelClient + ?Sized>(
    model: &M,
    messages: &[ChatMessage],
    base: &ModelRequest,
    params: &CritiqueParams<'_>,
    max_tokens: Option<u32>,
) -> Result<(String, u64), (ModelError, u64)> {
    let request = ModelRequest {
        messages: messages.to_vec(),
        temperature: base.temperature,
        max_tokens: max_tokens.unwrap_or(base.max_tokens),
    };
    let started = Instant::now();
    let result = complete_with_retry(model, &request, params.retry);
    let elapsed = started.elapsed().as_millis() as u64;
    match result {
        Ok(text) => Ok((text, elapsed)),
        Err(err) => Err((err, elapsed)),
    }
}

fn message(role: Role, content: String) -> ChatMessage {
    ChatMessage { role, content }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{LoopType, Plan};
    use crate::test_support::{ScriptedModel, observation};

    const FINAL: &str = r#"{"chat":"write it","execute":{"type":"write","path":"a.py","content":"x"}}"#;

    fn params(retry: &RetryConfig) -> CritiqueParams<'_> {
        CritiqueParams {
            goal: "build a.py",
            iteration: 4,
            draft_max_tokens: 2000,
            retry,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        }
    }

    fn request() -> ModelRequest {
        ModelRequest::single("system", "state", 0.7, 4096)
    }

    /// Verifies the three phases share an accumulating conversation.
    #[test]
    fn phases_accumulate_context() {
        let model = ScriptedModel::new();
        model.push_reply("draft reply");
        model.push_reply("1. the path is wrong");
        model.push_reply(FINAL);
        let prompts = PromptEngine::new().expect("prompts");
        let retry = fast_retry();

        let out = deliberate(&model, &prompts, &request(), &params(&retry));

        assert_eq!(out.reply.expect("reply"), FINAL);
        assert!(out.degrade.is_none());
        assert!(out.report.draft_ms.is_some() && out.report.refine_ms.is_some());
        let requests = model.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].messages.len(), 2);
        assert_eq!(requests[0].max_tokens, 2000);
        assert_eq!(requests[1].messages.len(), 4);
        assert_eq!(requests[1].messages[2].content, "draft reply");
        assert!(requests[1].messages[3].content.starts_with("CRITIQUE:"));
        assert_eq!(requests[2].messages.len(), 6);
        assert_eq!(requests[2].messages[4].content, "1. the path is wrong");
    }

    #[test]
    fn failed_phase_degrades_to_direct_call() {
        let model = ScriptedModel::new();
        model.push_reply("draft reply");
        model.push_error(ModelError::Network("reset".to_string()));
        model.push_reply(FINAL);
        let prompts = PromptEngine::new().expect("prompts");
        let retry = fast_retry();

        let out = deliberate(&model, &prompts, &request(), &params(&retry));

        assert_eq!(out.reply.expect("reply"), FINAL);
        let degrade = out.degrade.expect("degrade event");
        assert_eq!(degrade.phase, "critique");
        assert_eq!(degrade.iteration, 4);
        assert_eq!(out.report.degraded.as_deref(), Some("critique"));
        let requests = model.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2], request());
    }

    #[test]
    fn unparseable_refinement_degrades() {
        let model = ScriptedModel::new();
        model.push_reply("draft");
        model.push_reply("critique");
        model.push_reply("I think we should write the file.");
        model.push_reply(FINAL);
        let prompts = PromptEngine::new().expect("prompts");
        let retry = fast_retry();

        let out = deliberate(&model, &prompts, &request(), &params(&retry));

        assert_eq!(out.report.degraded.as_deref(), Some("refine"));
        assert_eq!(out.reply.expect("reply"), FINAL);
    }

    #[test]
    fn confusion_signals() {
        let mut state = RunState::new("r", "g", Plan::default(), 4);
        assert!(!should_critique(CritiqueMode::OnConfusion, &state));
        assert!(should_critique(CritiqueMode::Always, &state));

        state
            .iteration_log
            .push(observation(1, "read x", Some("read:x"), "Error: not found", false));
        assert!(should_critique(CritiqueMode::OnConfusion, &state));

        state.iteration_log.clear();
        state.loop_type = Some(LoopType::Alternation);
        assert!(is_confused(&state));
        assert!(!should_critique(CritiqueMode::Off, &state));
    }
}
