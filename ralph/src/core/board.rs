//! Markdown renderings of the plan for the agent's workspace.

use super::text::truncate_ellipsis;
use super::types::{LoopType, Observation, Plan, TaskStatus};

fn icon(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Done => "✅",
        TaskStatus::Active => "⏳",
        TaskStatus::Pending => "⚪",
        TaskStatus::Skipped => "⏭",
    }
}

/// `todo.md`: one line per task in plan order.
pub fn render_task_board(plan: &Plan) -> String {
    let mut out = String::from("# Task Board\n\n");
    if plan.tasks.is_empty() {
        out.push_str("_No tasks yet._\n");
        return out;
    }
    for task in &plan.tasks {
        let marker = if plan.current_task_id.as_deref() == Some(task.id.as_str()) {
            " (current)"
        } else {
            ""
        };
        out.push_str(&format!(
            "- {} {}: {}{marker}\n",
            icon(task.status),
            task.id,
            task.description
        ));
    }
    out.push_str(&format!(
        "\nDone {}/{} · skipped {}\n",
        plan.count(TaskStatus::Done),
        plan.tasks.len(),
        plan.count(TaskStatus::Skipped)
    ));
    out
}

/// Snapshot of the loop for `current.state.md`.
pub struct StateSnapshot<'a> {
    pub iteration: u32,
    pub plan: &'a Plan,
    pub stagnation: u32,
    pub loop_type: Option<LoopType>,
    pub last: Option<&'a Observation>,
}

/// `current.state.md`.
pub fn render_current_state(snapshot: &StateSnapshot<'_>) -> String {
    let task = snapshot
        .plan
        .current()
        .map(|task| format!("{}: {}", task.id, task.description))
        .unwrap_or_else(|| "none".to_string());
    let loop_type = snapshot.loop_type.map_or("none", LoopType::as_str);
    let mut out = format!(
        "# Current State\n\n- Iteration: {}\n- Active task: {task}\n- Stagnation: {} ({loop_type})\n",
        snapshot.iteration, snapshot.stagnation
    );
    if let Some(obs) = snapshot.last {
        let status = if obs.success { "ok" } else { "failed" };
        out.push_str(&format!(
            "\n## Last action\n\n{} [{status}]\n\n```\n{}\n```\n",
            obs.action,
            truncate_ellipsis(&obs.outcome, 800)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_board_marks_status_and_current() {
        let mut plan = Plan::seeded(&["scaffold".to_string(), "tests".to_string()]);
        plan.tasks[0].status = TaskStatus::Done;
        plan.current_task_id = Some("T2".to_string());
        plan.tasks[1].status = TaskStatus::Active;

        let board = render_task_board(&plan);

        assert!(board.contains("- ✅ T1: scaffold\n"));
        assert!(board.contains("- ⏳ T2: tests (current)\n"));
        assert!(board.contains("Done 1/2"));
    }

    #[test]
    fn current_state_without_observation() {
        let plan = Plan::default();
        let text = render_current_state(&StateSnapshot {
            iteration: 3,
            plan: &plan,
            stagnation: 1,
            loop_type: Some(LoopType::Alternation),
            last: None,
        });
        assert!(text.contains("- Iteration: 3"));
        assert!(text.contains("- Active task: none"));
        assert!(text.contains("- Stagnation: 1 (alternation)"));
    }
}
