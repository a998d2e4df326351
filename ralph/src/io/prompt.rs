//! Prompt rendering for the system turn, state turns and the helper phases.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::text::truncate_ellipsis;
use crate::core::types::{Observation, Plan, Task};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const STATE_TEMPLATE: &str = include_str!("prompts/state.md");
const HISTORIAN_TEMPLATE: &str = include_str!("prompts/historian.md");
const CRITIQUE_TEMPLATE: &str = include_str!("prompts/critique.md");
const REFINE_TEMPLATE: &str = include_str!("prompts/refine.md");
const STRICT_RETRY_TEMPLATE: &str = include_str!("prompts/strict_retry.md");

/// Droppable state sections, least important first.
const DROP_ORDER: &[&str] = &["observations", "history", "plan"];

static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap());

/// Everything a state turn shows the model.
#[derive(Debug, Clone)]
pub struct StateTurnInput<'a> {
    pub iteration: u32,
    pub max_iterations: u32,
    /// Operator directive note, if one was applied this iteration.
    pub directive: Option<&'a str>,
    /// Change-approach block once stagnation reaches the warn threshold.
    pub remediation: Option<&'a str>,
    pub plan: &'a Plan,
    pub history_summary: &'a str,
    pub observations: &'a [Observation],
    /// The previous reply was flagged by the dedup cache.
    pub duplicate: bool,
}

/// One line of the historian's iteration log.
#[derive(Debug, Clone, Serialize)]
struct LogLine {
    iteration: u32,
    task: String,
    summary: String,
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Template engine over the bundled prompt files.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)?;
        env.add_template("state", STATE_TEMPLATE)?;
        env.add_template("historian", HISTORIAN_TEMPLATE)?;
        env.add_template("critique", CRITIQUE_TEMPLATE)?;
        env.add_template("refine", REFINE_TEMPLATE)?;
        env.add_template("strict_retry", STRICT_RETRY_TEMPLATE)?;
        Ok(Self { env })
    }

    /// The fixed first turn of every conversation. Identical for the whole run.
    pub fn system_prompt(&self, brief_goal: &str, full_spec: bool) -> Result<String> {
        let rendered = self.env.get_template("system")?.render(context! {
            brief_goal => brief_goal.trim(),
            full_spec => full_spec,
        })?;
        Ok(rendered.trim().to_string())
    }

    /// Render a state turn and fit it into `budget_bytes`.
    pub fn state_turn(&self, input: &StateTurnInput<'_>, budget_bytes: usize) -> Result<String> {
        let last = input.observations.last();
        let rendered = self.env.get_template("state")?.render(context! {
            iteration => input.iteration,
            max_iterations => input.max_iterations,
            directive => input.directive,
            remediation => input.remediation,
            current_task => input.plan.current().map(TaskView::from),
            duplicate => input.duplicate,
            last => last,
            plan => input.plan,
            history => (!input.history_summary.trim().is_empty()).then(|| input.history_summary.trim()),
            observations => input.observations,
        })?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, budget_bytes);
        Ok(render_sections(&sections))
    }

    pub fn historian(
        &self,
        max_chars: usize,
        summary: &str,
        observations: &[Observation],
        logs: &[Observation],
    ) -> Result<String> {
        let logs: Vec<LogLine> = logs
            .iter()
            .map(|obs| LogLine {
                iteration: obs.iteration,
                task: obs.task_id.clone().unwrap_or_else(|| "-".to_string()),
                summary: truncate_ellipsis(&format!("{}: {}", obs.action, obs.outcome), 200),
            })
            .collect();
        let rendered = self.env.get_template("historian")?.render(context! {
            max_chars => max_chars,
            summary => summary.trim(),
            observations => observations,
            logs => logs,
        })?;
        Ok(rendered.trim().to_string())
    }

    pub fn critique(&self, goal: &str) -> Result<String> {
        let rendered = self
            .env
            .get_template("critique")?
            .render(context! { goal => goal.trim() })?;
        Ok(rendered.trim().to_string())
    }

    pub fn refine(&self) -> Result<String> {
        let rendered = self.env.get_template("refine")?.render(context! {})?;
        Ok(rendered.trim().to_string())
    }

    pub fn strict_retry(&self, reason: &str) -> Result<String> {
        let rendered = self
            .env
            .get_template("strict_retry")?
            .render(context! { reason => reason })?;
        Ok(rendered.trim().to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
struct TaskView {
    id: String,
    description: String,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
        }
    }
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
/// Empty sections are dropped.
fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps[1].to_string(),
                &caps[2] == "required",
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (idx, (_, body_start, key, required)) in markers.iter().enumerate() {
        let body_end = markers
            .get(idx + 1)
            .map(|next| next.0)
            .unwrap_or(rendered.len());
        let content = rendered[*body_start..body_end].trim();
        if content.is_empty() {
            continue;
        }
        sections.push(Section {
            key: key.clone(),
            required: *required,
            content: content.to_string(),
        });
    }
    sections
}

/// Length of the rendered output, separators included.
fn total_len(sections: &[Section]) -> usize {
    let separators = sections.len().saturating_sub(1) * 2;
    sections.iter().map(|s| s.content.len()).sum::<usize>() + separators
}

/// Drop droppable sections in `DROP_ORDER`, then cut the largest remaining section.
fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(largest) = sections
        .iter_mut()
        .max_by_key(|s| s.content.len())
    else {
        return;
    };
    let marker = "\n[truncated]";
    let allowed = largest
        .content
        .len()
        .saturating_sub(total - budget)
        .saturating_sub(marker.len());
    let mut cut = allowed;
    while cut > 0 && !largest.content.is_char_boundary(cut) {
        cut -= 1;
    }
    let before_len = largest.content.len();
    largest.content.truncate(cut);
    largest.content.push_str(marker);
    debug!(
        section = %largest.key,
        before_len,
        after_len = largest.content.len(),
        "truncated section for budget"
    );
}

fn render_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::observation;

    fn engine() -> PromptEngine {
        PromptEngine::new().expect("templates")
    }

    fn plan() -> Plan {
        Plan::seeded(&["write hello.py".to_string(), "run it".to_string()])
    }

    #[test]
    fn system_prompt_carries_goal_and_contract() {
        let prompt = engine().system_prompt("Build a CLI", true).expect("render");
        assert!(prompt.contains("<contract>"));
        assert!(prompt.contains("<goal>\nBuild a CLI\n</goal>"));
        assert!(prompt.contains("_full_spec.md"));

        let short = engine().system_prompt("Say hi", false).expect("render");
        assert!(!short.contains("_full_spec.md"));
    }

    /// Verifies state sections appear in a fixed order.
    #[test]
    fn state_turn_orders_sections() {
        let plan = plan();
        let observations = vec![
            observation(1, "list .", Some("list:.:false"), "(empty directory)", true),
            observation(2, "run `python3 hello.py`", Some("run:python3 hello.py"), "Exit 2", false),
        ];
        let input = StateTurnInput {
            iteration: 3,
            max_iterations: 10,
            directive: Some("### USER DIRECTIVE ###\nuse python3\n######################"),
            remediation: None,
            plan: &plan,
            history_summary: "- Iter 1-2: scaffolding",
            observations: &observations,
            duplicate: true,
        };

        let text = engine().state_turn(&input, 10_000).expect("render");

        let directive = text.find("### USER DIRECTIVE ###").expect("directive");
        let status = text.find("### Iteration 3 of 10").expect("status");
        let last = text.find("### Last Result").expect("last");
        let plan_pos = text.find("### Plan").expect("plan");
        let history = text.find("### History").expect("history");
        let recent = text.find("### Recent Observations").expect("observations");
        assert!(directive < status && status < last && last < plan_pos);
        assert!(plan_pos < history && history < recent);
        assert!(text.contains("Current task: T1: write hello.py"));
        assert!(text.contains("run `python3 hello.py` [failed]\nExit 2"));
        assert!(text.contains("- [active] T1: write hello.py"));
        assert!(text.contains("identical to a recent one"));
        assert!(!text.contains("section:"));
    }

    /// Verifies droppable sections go first and required ones survive a tight budget.
    #[test]
    fn budget_drops_droppable_sections() {
        let plan = plan();
        let observations: Vec<_> = (1..=20)
            .map(|i| observation(i, "read big.txt", Some("read:big.txt"), &"x".repeat(200), true))
            .collect();
        let input = StateTurnInput {
            iteration: 21,
            max_iterations: 50,
            directive: None,
            remediation: Some("CRITICAL: you are stagnant"),
            plan: &plan,
            history_summary: &"h".repeat(2000),
            observations: &observations,
            duplicate: false,
        };

        let text = engine().state_turn(&input, 600).expect("render");

        assert!(!text.contains("### Recent Observations"));
        assert!(!text.contains("### History"));
        assert!(text.contains("CRITICAL: you are stagnant"));
        assert!(text.contains("### Iteration 21 of 50"));
        assert!(text.contains("### Last Result"));
    }

    #[test]
    fn oversized_required_section_is_truncated() {
        let plan = Plan::default();
        let observations = vec![observation(1, "read big", None, &"é".repeat(3000), true)];
        let input = StateTurnInput {
            iteration: 2,
            max_iterations: 5,
            directive: None,
            remediation: None,
            plan: &plan,
            history_summary: "",
            observations: &observations,
            duplicate: false,
        };

        let text = engine().state_turn(&input, 1000).expect("render");

        assert!(text.len() <= 1000);
        assert!(text.contains("[truncated]"));
    }

    #[test]
    fn historian_prompt_lists_inputs() {
        let observations = vec![observation(4, "write a.py", Some("write:a.py:x"), "Wrote 10 bytes to a.py", true)];
        let text = engine()
            .historian(2000, "", &observations, &observations)
            .expect("render");
        assert!(text.contains("at most 2000 characters"));
        assert!(text.contains("(no previous summary)"));
        assert!(text.contains("- Iter 4: write a.py [ok]: Wrote 10 bytes to a.py"));
        assert!(text.contains("Iter 4: Task - - write a.py: Wrote 10 bytes to a.py"));
        assert!(text.ends_with("COMPRESSED SUMMARY:"));
    }
}
