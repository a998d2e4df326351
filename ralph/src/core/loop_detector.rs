//! Repetition and no-progress detection over the recent action trail.
//!
//! The detector is pure: it inspects a slice of observations (oldest first)
//! and returns a [`Verdict`]. Applying the verdict to the stagnation counter is
//! a separate step so the orchestrator decides when state changes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::types::{FailureKind, LoopType, Observation};

/// Detector thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectorConfig {
    /// Observations examined for every pattern except no-progress.
    pub window: usize,
    /// Repeat count (T) for exact repetition, near duplicates and recurring errors.
    pub repeat_threshold: usize,
    /// Bigram similarity at or above which two outcomes count as the same.
    pub similarity_threshold: f64,
    /// Observations that must share one task pointer to count as no progress.
    pub no_progress_window: usize,
    /// Stagnation level at which a "change approach" directive is injected.
    pub warn_threshold: u32,
    /// Stagnation level at which the run is killed.
    pub kill_threshold: u32,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            window: 5,
            repeat_threshold: 3,
            similarity_threshold: 0.95,
            no_progress_window: 8,
            warn_threshold: 2,
            kill_threshold: 5,
        }
    }
}

/// Result of scanning the trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A loop pattern matched.
    Loop(LoopType),
    /// No pattern, but the latest response was a duplicate or the model was unreachable.
    Stalled,
    /// No pattern and the latest action succeeded.
    Progress,
    /// No pattern; the latest action failed in an ordinary way.
    Neutral,
}

/// Scan `trail` (oldest first) for loop patterns.
pub fn detect(trail: &[Observation], config: &LoopDetectorConfig) -> Verdict {
    let Some(latest) = trail.last() else {
        return Verdict::Neutral;
    };
    let window = tail(trail, config.window);

    if let Some(loop_type) = exact_repetition(window, config)
        .or_else(|| recurring_error(window, config))
        .or_else(|| alternation(window))
        .or_else(|| near_duplicate(window, config))
        .or_else(|| no_progress(tail(trail, config.no_progress_window), config))
    {
        return Verdict::Loop(loop_type);
    }

    if latest.duplicate || latest.failure == Some(FailureKind::Network) {
        Verdict::Stalled
    } else if latest.success {
        Verdict::Progress
    } else {
        Verdict::Neutral
    }
}

/// Stagnation counter and loop type after applying `verdict`.
pub fn apply_verdict(
    verdict: Verdict,
    stagnation: u32,
    loop_type: Option<LoopType>,
) -> (u32, Option<LoopType>) {
    match verdict {
        Verdict::Loop(kind) => (stagnation.saturating_add(1), Some(kind)),
        Verdict::Stalled => (stagnation.saturating_add(1), loop_type),
        Verdict::Progress => (0, None),
        Verdict::Neutral => (stagnation, loop_type),
    }
}

fn tail<T>(items: &[T], len: usize) -> &[T] {
    &items[items.len().saturating_sub(len)..]
}

fn exact_repetition(window: &[Observation], config: &LoopDetectorConfig) -> Option<LoopType> {
    let threshold = config.repeat_threshold.max(2);
    let recent = tail(window, threshold);
    if recent.len() < threshold {
        return None;
    }
    let first = recent[0].action_key.as_deref()?;
    recent
        .iter()
        .all(|obs| obs.action_key.as_deref() == Some(first))
        .then_some(LoopType::ExactRepetition)
}

fn recurring_error(window: &[Observation], config: &LoopDetectorConfig) -> Option<LoopType> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for obs in window.iter().filter(|obs| obs.is_error()) {
        *counts.entry(obs.outcome.trim()).or_default() += 1;
    }
    counts
        .values()
        .any(|count| *count >= config.repeat_threshold.max(2))
        .then_some(LoopType::RecurringError)
}

fn alternation(window: &[Observation]) -> Option<LoopType> {
    let recent = tail(window, 4);
    if recent.len() < 4 {
        return None;
    }
    let keys: Vec<&str> = recent
        .iter()
        .map(|obs| obs.action_key.as_deref())
        .collect::<Option<Vec<_>>>()?;
    let cycles = keys[0] != keys[1] && keys[0] == keys[2] && keys[1] == keys[3];
    cycles.then_some(LoopType::Alternation)
}

fn near_duplicate(window: &[Observation], config: &LoopDetectorConfig) -> Option<LoopType> {
    let (latest, earlier) = window.split_last()?;
    let similar = earlier
        .iter()
        .filter(|obs| similarity(&obs.outcome, &latest.outcome) >= config.similarity_threshold)
        .count();
    (similar + 1 >= config.repeat_threshold.max(2)).then_some(LoopType::NearDuplicate)
}

fn no_progress(window: &[Observation], config: &LoopDetectorConfig) -> Option<LoopType> {
    if window.len() < config.no_progress_window.max(2) {
        return None;
    }
    let task = window[0].task_id.as_deref()?;
    let stuck = window
        .iter()
        .all(|obs| obs.action_key.is_some() && obs.task_id.as_deref() == Some(task));
    stuck.then_some(LoopType::NoProgress)
}

/// Sørensen–Dice coefficient over character bigrams of the normalised texts.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a == b {
        return 1.0;
    }
    let a_grams = bigrams(&a);
    let b_grams = bigrams(&b);
    if a_grams.is_empty() || b_grams.is_empty() {
        return 0.0;
    }

    let mut remaining: HashMap<(char, char), usize> = HashMap::new();
    for gram in &b_grams {
        *remaining.entry(*gram).or_default() += 1;
    }
    let mut shared = 0usize;
    for gram in &a_grams {
        if let Some(count) = remaining.get_mut(gram)
            && *count > 0
        {
            *count -= 1;
            shared += 1;
        }
    }
    (2 * shared) as f64 / (a_grams.len() + b_grams.len()) as f64
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn bigrams(text: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).map(|pair| (pair[0], pair[1])).collect()
}

/// Remediation text injected once stagnation reaches the warn threshold.
pub fn remediation(loop_type: Option<LoopType>, stagnation: u32) -> String {
    let advice = match loop_type {
        Some(LoopType::ExactRepetition) => {
            "You keep issuing the same action with the same parameters. Do not repeat it; its result will not change."
        }
        Some(LoopType::NearDuplicate) => {
            "Your recent actions keep producing the same output. Try a different tool, file or command."
        }
        Some(LoopType::Alternation) => {
            "You are cycling between two actions. Break the cycle: decide, then move to the next task."
        }
        Some(LoopType::NoProgress) => {
            "The current task has not advanced. Finish it, mark it done or skipped, or update the plan."
        }
        Some(LoopType::RecurringError) => {
            "The same error keeps recurring. Read the error message, fix its cause, then retry once."
        }
        None => "Your recent responses were repeats. Produce a new, different next step.",
    };
    format!(
        "CRITICAL: you are stagnant (stagnation level {stagnation}). YOU MUST CHANGE YOUR APPROACH IMMEDIATELY.\n{advice}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::observation;

    fn run(cmd: &str) -> Observation {
        observation(1, "run", Some(&format!("run:{cmd}")), &format!("Exit 0\n{cmd} output"), true)
    }

    /// Verifies five identical `ls -la` runs flag exact repetition and raise stagnation.
    #[test]
    fn identical_runs_flag_exact_repetition() {
        let trail: Vec<Observation> = (0..5).map(|_| run("ls -la")).collect();
        let config = LoopDetectorConfig::default();

        let verdict = detect(&trail, &config);

        assert_eq!(verdict, Verdict::Loop(LoopType::ExactRepetition));
        let (stagnation, loop_type) = apply_verdict(verdict, 0, None);
        assert_eq!(stagnation, 1);
        assert_eq!(loop_type, Some(LoopType::ExactRepetition));
    }

    /// Verifies five distinct successful actions produce no flag and reset stagnation.
    #[test]
    fn distinct_actions_reset_stagnation() {
        let trail = vec![
            run("ls -la"),
            observation(2, "write a.py", Some("write:a.py:1"), "Wrote 10 bytes to a.py", true),
            observation(3, "read b.txt", Some("read:b.txt"), "hello from b", true),
            run("python a.py"),
            observation(5, "list src", Some("list:src:false"), "main.rs\nlib.rs", true),
        ];
        let verdict = detect(&trail, &LoopDetectorConfig::default());

        assert_eq!(verdict, Verdict::Progress);
        assert_eq!(
            apply_verdict(verdict, 3, Some(LoopType::Alternation)),
            (0, None)
        );
    }

    #[test]
    fn alternating_actions_flag_alternation() {
        let trail = vec![
            observation(1, "read a", Some("read:a"), "aaa", true),
            observation(2, "read b", Some("read:b"), "bbbbbbbbbbb", true),
            observation(3, "read a", Some("read:a"), "aaa", true),
            observation(4, "read b", Some("read:b"), "bbbbbbbbbbb", true),
        ];
        assert_eq!(
            detect(&trail, &LoopDetectorConfig::default()),
            Verdict::Loop(LoopType::Alternation)
        );
    }

    #[test]
    fn recurring_error_is_flagged() {
        let err = |iter: u32, cmd: &str| {
            observation(iter, "run", Some(&format!("run:{cmd}")), "Exit 1\nModuleNotFoundError: flask", false)
        };
        let trail = vec![err(1, "python app.py"), err(2, "python3 app.py"), err(3, "python -m app")];
        assert_eq!(
            detect(&trail, &LoopDetectorConfig::default()),
            Verdict::Loop(LoopType::RecurringError)
        );
    }

    #[test]
    fn near_duplicate_outcomes_are_flagged() {
        let trail = vec![
            observation(1, "test", Some("test:pytest"), "Ran 3 tests in 0.012s FAILED (failures=1)", false),
            observation(2, "test", Some("test:pytest -q"), "Ran 3 tests in 0.013s FAILED (failures=1)", false),
            observation(3, "test", Some("test:pytest -x"), "Ran 3 tests in 0.012s FAILED (failures=1) ", false),
        ];
        let config = LoopDetectorConfig {
            similarity_threshold: 0.9,
            ..LoopDetectorConfig::default()
        };
        assert_eq!(detect(&trail, &config), Verdict::Loop(LoopType::NearDuplicate));
    }

    #[test]
    fn unchanged_task_pointer_is_no_progress() {
        let config = LoopDetectorConfig {
            no_progress_window: 4,
            ..LoopDetectorConfig::default()
        };
        let trail: Vec<Observation> = (0..4)
            .map(|idx| {
                let mut obs = observation(
                    idx,
                    "write",
                    Some(&format!("write:f{idx}.py:x")),
                    &format!("Wrote {} bytes to module_{idx}_file.py", idx * 37 + 5),
                    true,
                );
                obs.task_id = Some("T1".to_string());
                obs
            })
            .collect();
        assert_eq!(detect(&trail, &config), Verdict::Loop(LoopType::NoProgress));
    }

    #[test]
    fn duplicate_response_stalls() {
        let mut latest = run("pwd");
        latest.duplicate = true;
        let trail = vec![run("ls"), latest];
        let verdict = detect(&trail, &LoopDetectorConfig::default());
        assert_eq!(verdict, Verdict::Stalled);
        assert_eq!(apply_verdict(verdict, 1, None), (2, None));
    }

    #[test]
    fn ordinary_failure_keeps_counter() {
        let trail = vec![observation(1, "run", Some("run:make"), "Exit 2\nno rule", false)];
        let verdict = detect(&trail, &LoopDetectorConfig::default());
        assert_eq!(verdict, Verdict::Neutral);
        assert_eq!(
            apply_verdict(verdict, 2, Some(LoopType::Alternation)),
            (2, Some(LoopType::Alternation))
        );
    }

    #[test]
    fn similarity_bounds() {
        assert!((similarity("abc", "abc") - 1.0).abs() < f64::EPSILON);
        assert!(similarity("abcdef", "uvwxyz") < 0.1);
        assert!(similarity("wrote 12 bytes to a.py", "wrote 12 bytes to b.py") < 0.95);
    }
}
