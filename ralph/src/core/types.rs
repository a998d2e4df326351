//! Shared deterministic types for the iteration engine.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::text::short_digest;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of `message_history`.
///
/// `outcome` is engine-side metadata (the result of the action this assistant
/// turn requested) and is never sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synopsized: bool,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            outcome: None,
            synopsized: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Lifecycle of a plan task. Tasks are never deleted, only transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[serde(alias = "todo", alias = "open")]
    Pending,
    #[serde(alias = "in_progress", alias = "in-progress", alias = "current")]
    Active,
    #[serde(alias = "complete", alias = "completed", alias = "finished")]
    Done,
    #[serde(alias = "skip")]
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Done => "done",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
}

/// Ordered task list plus the current-task pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<Task>,
    pub current_task_id: Option<String>,
}

impl Plan {
    /// Seed a plan from task descriptions (`T1..Tn`); the first task becomes active.
    pub fn seeded(descriptions: &[String]) -> Self {
        let tasks: Vec<Task> = descriptions
            .iter()
            .enumerate()
            .map(|(idx, description)| Task {
                id: format!("T{}", idx + 1),
                description: description.clone(),
                status: if idx == 0 {
                    TaskStatus::Active
                } else {
                    TaskStatus::Pending
                },
            })
            .collect();
        let current_task_id = tasks.first().map(|task| task.id.clone());
        Self {
            tasks,
            current_task_id,
        }
    }

    pub fn current(&self) -> Option<&Task> {
        let id = self.current_task_id.as_deref()?;
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Merge a plan update: new ids are appended, known ids are updated in place.
    pub fn apply_update(&mut self, update: &PlanUpdate) {
        for incoming in &update.tasks {
            match self.get_mut(&incoming.id) {
                Some(existing) => {
                    if let Some(description) = &incoming.description
                        && !description.trim().is_empty()
                    {
                        existing.description = description.clone();
                    }
                    if let Some(status) = incoming.status {
                        existing.status = status;
                    }
                }
                None => self.tasks.push(Task {
                    id: incoming.id.clone(),
                    description: incoming.description.clone().unwrap_or_default(),
                    status: incoming.status.unwrap_or(TaskStatus::Pending),
                }),
            }
        }

        if let Some(id) = &update.current_task_id
            && let Some(task) = self.get_mut(id)
        {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Active;
            }
            self.current_task_id = Some(id.clone());
        }
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|task| task.status == status).count()
    }
}

/// Task entry inside a model plan update. Missing fields leave the task unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    pub id: String,
    #[serde(default, alias = "desc", alias = "title", alias = "task")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanUpdate {
    #[serde(default)]
    pub tasks: Vec<TaskPatch>,
    #[serde(default, alias = "current_task", alias = "current")]
    pub current_task_id: Option<String>,
}

/// Sandboxed action requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    Read {
        path: String,
    },
    Write {
        path: String,
        content: String,
    },
    Run {
        cmd: String,
    },
    Test {
        #[serde(default)]
        cmd: Option<String>,
    },
    List {
        #[serde(default = "default_list_path")]
        path: String,
        #[serde(default)]
        recursive: bool,
    },
}

fn default_list_path() -> String {
    ".".to_string()
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Run { .. } => "run",
            Self::Test { .. } => "test",
            Self::List { .. } => "list",
        }
    }

    /// Stable key over kind + parameters. Write content is folded into a digest.
    pub fn key(&self) -> String {
        match self {
            Self::Read { path } => format!("read:{path}"),
            Self::Write { path, content } => format!("write:{path}:{}", short_digest(content)),
            Self::Run { cmd } => format!("run:{cmd}"),
            Self::Test { cmd } => format!("test:{}", cmd.as_deref().unwrap_or("")),
            Self::List { path, recursive } => format!("list:{path}:{recursive}"),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path } => write!(f, "read {path}"),
            Self::Write { path, content } => write!(f, "write {path} ({} bytes)", content.len()),
            Self::Run { cmd } => write!(f, "run `{cmd}`"),
            Self::Test { cmd: Some(cmd) } => write!(f, "test `{cmd}`"),
            Self::Test { cmd: None } => write!(f, "test"),
            Self::List { path, recursive: true } => write!(f, "list -R {path}"),
            Self::List { path, recursive: false } => write!(f, "list {path}"),
        }
    }
}

/// The parsed unit of model intent for one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    #[serde(default)]
    pub chat: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_update: Option<PlanUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<Action>,
    #[serde(default)]
    pub done: bool,
}

/// Why an observation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PathViolation,
    CommandBlocked,
    MissingTarget,
    Io,
    NonZeroExit,
    Timeout,
    Redundant,
    Network,
    Parse,
}

/// Recorded outcome of one iteration's action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub iteration: u32,
    #[serde(default)]
    pub task_id: Option<String>,
    /// Human-readable description of the attempted action.
    pub action: String,
    /// Kind + parameters key; `None` when no sandbox action ran.
    #[serde(default)]
    pub action_key: Option<String>,
    pub outcome: String,
    pub success: bool,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub duplicate: bool,
    pub at: DateTime<Utc>,
}

impl Observation {
    pub fn is_error(&self) -> bool {
        !self.success
    }
}

/// Loop pattern classes recognised by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    ExactRepetition,
    NearDuplicate,
    Alternation,
    NoProgress,
    RecurringError,
}

impl LoopType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExactRepetition => "exact_repetition",
            Self::NearDuplicate => "near_duplicate",
            Self::Alternation => "alternation",
            Self::NoProgress => "no_progress",
            Self::RecurringError => "recurring_error",
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Done,
    Killed,
    Error,
    BudgetExhausted,
    Quit,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Killed => "killed",
            Self::Error => "error",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Quit => "quit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendSample {
    pub iteration: u32,
    pub size: usize,
}

/// History Compressor bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RchMetrics {
    pub compressions: u32,
    pub total_chars_before: u64,
    pub total_chars_after: u64,
    pub tokens_saved: u64,
    /// Post-size as a percentage of pre-size for the latest compression.
    pub last_compression_ratio: f64,
    pub last_elapsed_ms: u64,
    pub trend: Vec<TrendSample>,
}

/// A critique phase that failed and fell back to a direct model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradeEvent {
    pub iteration: u32,
    pub phase: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies plan updates merge by id and never drop tasks.
    #[test]
    fn plan_update_merges_without_deleting() {
        let mut plan = Plan::seeded(&["scaffold".to_string(), "tests".to_string()]);
        let update: PlanUpdate = serde_json::from_str(
            r#"{"tasks":[{"id":"T1","status":"completed"},{"id":"T3","desc":"docs"}],"current_task_id":"T2"}"#,
        )
        .expect("parse update");

        plan.apply_update(&update);

        assert_eq!(plan.tasks.len(), 3);
        assert_eq!(plan.tasks[0].status, TaskStatus::Done);
        assert_eq!(plan.tasks[0].description, "scaffold");
        assert_eq!(plan.tasks[1].status, TaskStatus::Active);
        assert_eq!(plan.tasks[2].description, "docs");
        assert_eq!(plan.current_task_id.as_deref(), Some("T2"));
    }

    #[test]
    fn unknown_current_task_is_ignored() {
        let mut plan = Plan::seeded(&["a".to_string()]);
        plan.apply_update(&PlanUpdate {
            tasks: Vec::new(),
            current_task_id: Some("T9".to_string()),
        });
        assert_eq!(plan.current_task_id.as_deref(), Some("T1"));
    }

    /// Verifies write keys change with content while run keys only track the command.
    #[test]
    fn action_keys_cover_parameters() {
        let a = Action::Write {
            path: "a.py".to_string(),
            content: "x".to_string(),
        };
        let b = Action::Write {
            path: "a.py".to_string(),
            content: "y".to_string(),
        };
        assert_ne!(a.key(), b.key());
        assert_eq!(
            Action::Run {
                cmd: "ls -la".to_string()
            }
            .key(),
            "run:ls -la"
        );
    }
}
