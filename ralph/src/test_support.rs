//! Test-only helpers: scripted collaborators and throwaway project roots.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use tempfile::TempDir;

use crate::core::goal::run_id;
use crate::core::types::{FailureKind, Observation, Plan};
use crate::error::ModelError;
use crate::io::config::{EngineConfig, RetryConfig};
use crate::io::hitl::HitlSource;
use crate::io::init::RalphPaths;
use crate::io::model::{ModelClient, ModelRequest};
use crate::io::run_state::RunState;
use crate::step::Engine;

/// Build an observation with deterministic defaults.
///
/// Failed observations are tagged as a non-zero exit.
pub fn observation(
    iteration: u32,
    action: &str,
    action_key: Option<&str>,
    outcome: &str,
    success: bool,
) -> Observation {
    Observation {
        iteration,
        task_id: None,
        action: action.to_string(),
        action_key: action_key.map(str::to_string),
        outcome: outcome.to_string(),
        success,
        failure: (!success).then_some(FailureKind::NonZeroExit),
        duplicate: false,
        at: Utc::now(),
    }
}

/// Model that replays queued replies and records every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: RefCell<VecDeque<Result<String, ModelError>>>,
    requests: RefCell<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, text: &str) {
        self.replies.borrow_mut().push_back(Ok(text.to_string()));
    }

    pub fn push_error(&self, err: ModelError) {
        self.replies.borrow_mut().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.borrow().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        self.requests.borrow_mut().push(request.clone());
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Network("script exhausted".to_string())))
    }
}

/// Operator that types the queued lines, one per iteration boundary.
#[derive(Debug, Default)]
pub struct ScriptedHitl {
    lines: VecDeque<String>,
}

impl ScriptedHitl {
    pub fn new<'a, I: IntoIterator<Item = &'a str>>(lines: I) -> Self {
        Self {
            lines: lines.into_iter().map(str::to_string).collect(),
        }
    }
}

impl HitlSource for ScriptedHitl {
    fn poll(&mut self, _state: &RunState) -> Result<Option<String>> {
        Ok(self.lines.pop_front())
    }
}

/// A project root in a temp dir with a config tuned for tests.
///
/// Retry delays are 1ms so failure paths do not sleep.
pub struct TestWorkspace {
    _temp: TempDir,
    paths: RalphPaths,
    config: EngineConfig,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RalphPaths::new(temp.path());
        let mut config = EngineConfig {
            workspace: PathBuf::from("workspace"),
            retry: RetryConfig {
                initial_delay_ms: 1,
                max_delay_ms: 1,
                ..RetryConfig::default()
            },
            ..EngineConfig::default()
        };
        tweak(&mut config);
        Self {
            _temp: temp,
            paths,
            config,
        }
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.paths.clone(), self.config.clone()).expect("engine")
    }

    pub fn paths(&self) -> RalphPaths {
        self.paths.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fresh run state for `goal` with `tasks` seeded as T1..Tn.
    pub fn state(&self, goal: &str, tasks: &[&str]) -> RunState {
        let tasks: Vec<String> = tasks.iter().map(|task| task.to_string()).collect();
        RunState::new(
            run_id(goal),
            goal,
            Plan::seeded(&tasks),
            self.config.dedup.capacity,
        )
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.paths.workspace(&self.config)
    }

    pub fn read_workspace(&self, path: &str) -> String {
        fs::read_to_string(self.workspace_dir().join(path)).expect("read workspace file")
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
