//! Bounded, prefix-stable conversation history.
//!
//! `message_history` is always the single system turn followed by a contiguous
//! suffix of the real turn sequence. Turns are only ever appended at the end
//! or dropped from the front, so whatever prefix the serving backend already
//! processed stays valid for as long as possible. Synopsis replacement of old
//! assistant turns only happens once the retained context exceeds its char
//! budget, oldest first, and never touches the newest `keep_verbatim` turns.

use serde::{Deserialize, Serialize};

use super::parser::parse_envelope;
use super::text::{collapse_whitespace, truncate_ellipsis};
use super::types::{Role, Turn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Non-system turns retained in `message_history`.
    pub max_turns: usize,
    /// Character budget of the retained history before synopses kick in.
    pub max_context_chars: usize,
    /// Newest turns that are never synopsized.
    pub keep_verbatim: usize,
    pub synopsis_reasoning_chars: usize,
    pub synopsis_outcome_chars: usize,
    /// Byte budget of the rendered state turn.
    pub state_turn_budget_bytes: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_context_chars: 100_000,
            keep_verbatim: 6,
            synopsis_reasoning_chars: 200,
            synopsis_outcome_chars: 300,
            state_turn_budget_bytes: 24_000,
        }
    }
}

const SYNOPSIS_PREFIX: &str = "[synopsis]";

/// Make sure the history starts with exactly one system turn carrying `prompt`.
pub fn ensure_system(history: &mut Vec<Turn>, prompt: &str) {
    match history.first_mut() {
        Some(first) if first.role == Role::System => {
            first.content = prompt.to_string();
        }
        _ => history.insert(0, Turn::system(prompt)),
    }
}

/// Append `turn` and drop the oldest turns beyond `max_turns`.
pub fn push_turn(history: &mut Vec<Turn>, turn: Turn, max_turns: usize) {
    history.push(turn);
    enforce_window(history, max_turns);
}

/// Drop the oldest non-system turns so at most `max_turns` remain.
pub fn enforce_window(history: &mut Vec<Turn>, max_turns: usize) {
    let offset = system_offset(history);
    let retained = history.len() - offset;
    if retained > max_turns {
        history.drain(offset..offset + (retained - max_turns));
    }
}

/// Keep only the system turn.
pub fn clear_conversation(history: &mut Vec<Turn>) {
    let offset = system_offset(history);
    history.truncate(offset);
}

fn system_offset(history: &[Turn]) -> usize {
    usize::from(history.first().is_some_and(|turn| turn.role == Role::System))
}

pub fn context_chars(history: &[Turn]) -> usize {
    history.iter().map(|turn| turn.content.chars().count()).sum()
}

/// Replace old assistant turns with synopses until the history fits its budget.
///
/// Returns the number of turns replaced. Disabled when `full_fidelity` is set.
pub fn thin(history: &mut [Turn], config: &ContextConfig, full_fidelity: bool) -> usize {
    if full_fidelity {
        return 0;
    }
    let mut total = context_chars(history);
    if total <= config.max_context_chars {
        return 0;
    }

    let offset = system_offset(history);
    let protected_from = history.len().saturating_sub(config.keep_verbatim).max(offset);
    let mut replaced = 0;
    for turn in &mut history[offset..protected_from] {
        if total <= config.max_context_chars {
            break;
        }
        if turn.role != Role::Assistant || turn.synopsized {
            continue;
        }
        let before = turn.content.chars().count();
        turn.content = synopsis(turn, config);
        turn.synopsized = true;
        total = total - before + turn.content.chars().count();
        replaced += 1;
    }
    replaced
}

/// Deterministic one-line summary of an assistant turn.
pub fn synopsis(turn: &Turn, config: &ContextConfig) -> String {
    let mut parts = Vec::new();

    let parsed = parse_envelope(&turn.content).ok();
    let reasoning = match turn.content.find('{') {
        Some(idx) if idx > 0 => collapse_whitespace(&turn.content[..idx]),
        _ => parsed
            .as_ref()
            .map(|p| collapse_whitespace(&p.envelope.chat))
            .unwrap_or_default(),
    };
    let reasoning = reasoning.trim_end_matches("```json").trim_end_matches("```").trim();
    if !reasoning.is_empty() {
        parts.push(truncate_ellipsis(reasoning, config.synopsis_reasoning_chars));
    }

    if let Some(action) = parsed.as_ref().and_then(|p| p.envelope.execute.as_ref()) {
        parts.push(format!("Action: {action}"));
    }
    if let Some(outcome) = &turn.outcome {
        let outcome = collapse_whitespace(outcome);
        parts.push(format!(
            "Result: {}",
            truncate_ellipsis(&outcome, config.synopsis_outcome_chars)
        ));
    }

    if parts.is_empty() {
        return format!("{SYNOPSIS_PREFIX} no significant action");
    }
    format!("{SYNOPSIS_PREFIX} {}", parts.join(" | "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(idx: usize) -> Turn {
        if idx % 2 == 0 {
            Turn::user(format!("user turn {idx}"))
        } else {
            Turn::assistant(format!("assistant turn {idx}"))
        }
    }

    /// Verifies that after every one of 40 turns the retained history is the
    /// exact suffix of the full sequence, capped at 25 turns.
    #[test]
    fn window_keeps_exact_suffix() {
        let mut history = vec![Turn::system("sys")];
        let mut full = Vec::new();

        for idx in 0..40 {
            let turn = numbered(idx);
            full.push(turn.clone());
            push_turn(&mut history, turn, 25);

            assert_eq!(history[0], Turn::system("sys"));
            let expected_len = full.len().min(25);
            let retained = &history[1..];
            assert_eq!(retained.len(), expected_len);
            assert_eq!(retained, &full[full.len() - expected_len..]);
        }
    }

    #[test]
    fn ensure_system_inserts_or_replaces() {
        let mut history = vec![Turn::user("u")];
        ensure_system(&mut history, "sys");
        assert_eq!(history.len(), 2);
        ensure_system(&mut history, "sys2");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "sys2");
    }

    #[test]
    fn clear_keeps_only_system() {
        let mut history = vec![Turn::system("s"), Turn::user("u"), Turn::assistant("a")];
        clear_conversation(&mut history);
        assert_eq!(history, vec![Turn::system("s")]);
    }

    /// Verifies synopses replace the oldest assistant turns only, never the newest ones.
    #[test]
    fn thin_synopsizes_old_assistant_turns() {
        let config = ContextConfig {
            max_context_chars: 600,
            keep_verbatim: 2,
            ..ContextConfig::default()
        };
        let body = format!(
            "Let me look around first. {{\"chat\":\"{}\",\"execute\":{{\"type\":\"run\",\"cmd\":\"ls\"}}}}",
            "x".repeat(200)
        );
        let mut history = vec![Turn::system("sys")];
        for _ in 0..4 {
            history.push(Turn::user("state"));
            let mut turn = Turn::assistant(body.clone());
            turn.outcome = Some("Exit 0\nsrc".to_string());
            history.push(turn);
        }
        let newest = history[history.len() - 1].clone();

        let replaced = thin(&mut history, &config, false);

        assert!(replaced >= 1);
        assert!(history[2].synopsized);
        assert!(history[2].content.starts_with("[synopsis] Let me look around first."));
        assert!(history[2].content.contains("Action: run `ls`"));
        assert!(history[2].content.contains("Result: Exit 0 src"));
        assert_eq!(history[history.len() - 1], newest);
        assert!(history.iter().all(|t| t.role != Role::User || t.content == "state"));
    }

    #[test]
    fn full_fidelity_disables_thinning() {
        let config = ContextConfig {
            max_context_chars: 10,
            keep_verbatim: 0,
            ..ContextConfig::default()
        };
        let mut history = vec![Turn::system("sys"), Turn::assistant("a".repeat(100))];
        assert_eq!(thin(&mut history, &config, true), 0);
        assert!(!history[1].synopsized);
    }

    #[test]
    fn synopsis_of_prose_has_fallback() {
        let turn = Turn::assistant("");
        assert_eq!(
            synopsis(&turn, &ContextConfig::default()),
            "[synopsis] no significant action"
        );
    }
}
