//! Engine configuration stored under `.ralph/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::context::ContextConfig;
use crate::core::folding::ObservationConfig;
use crate::core::loop_detector::LoopDetectorConfig;
use crate::error::ConfigError;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields fall back to
/// the defaults below, section by section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Iteration budget for one run.
    pub max_iterations: u32,
    /// Sandbox root the agent works in.
    pub workspace: PathBuf,
    /// Render `todo.md` and `current.state.md` into the workspace each iteration.
    pub task_board: bool,
    pub model: ModelConfig,
    pub retry: RetryConfig,
    pub sandbox: SandboxConfig,
    pub context: ContextConfig,
    pub observations: ObservationConfig,
    pub history: HistoryConfig,
    pub loop_detector: LoopDetectorConfig,
    pub dedup: DedupConfig,
    pub critique: CritiqueConfig,
    pub parser: ParserConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            workspace: PathBuf::from("ralph_workspace"),
            task_board: true,
            model: ModelConfig::default(),
            retry: RetryConfig::default(),
            sandbox: SandboxConfig::default(),
            context: ContextConfig::default(),
            observations: ObservationConfig::default(),
            history: HistoryConfig::default(),
            loop_detector: LoopDetectorConfig::default(),
            dedup: DedupConfig::default(),
            critique: CritiqueConfig::default(),
            parser: ParserConfig::default(),
        }
    }
}

/// OpenAI-compatible endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding a bearer token, if any.
    pub api_key_env: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub stream_timeout_secs: u64,
    pub stream: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234".to_string(),
            model: "local-model".to_string(),
            api_key_env: None,
            temperature: 0.7,
            max_tokens: 4096,
            request_timeout_secs: 120,
            stream_timeout_secs: 300,
            stream: false,
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        if self.stream {
            Duration::from_secs(self.stream_timeout_secs)
        } else {
            Duration::from_secs(self.request_timeout_secs)
        }
    }
}

/// Exponential backoff for retryable model failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub command_timeout_secs: u64,
    /// Observation output cap, in characters.
    pub max_output_chars: usize,
    /// Command verbs refused regardless of arguments.
    pub deny_commands: Vec<String>,
    /// Used when a `test` action carries no command.
    pub test_command: String,
    /// Entries shown by a recursive listing.
    pub list_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let deny = [
            "rm", "rmdir", "sudo", "su", "doas", "mv", "chmod", "chown", "chgrp", "dd", "mkfs",
            "shutdown", "reboot", "halt", "poweroff", "kill", "killall", "pkill",
        ];
        Self {
            command_timeout_secs: 60,
            max_output_chars: 1500,
            deny_commands: deny.iter().map(|verb| verb.to_string()).collect(),
            test_command: "pytest -q".to_string(),
            list_limit: 200,
        }
    }
}

/// History Compressor (RCH) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Compress when `iteration % interval == 0`.
    pub interval: u32,
    pub max_summary_chars: usize,
    pub recent_observations: usize,
    pub recent_logs: usize,
    /// Also compress once history reaches this fraction of `context.max_context_chars`.
    pub context_threshold: f64,
    pub chars_per_token: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub trend_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 5,
            max_summary_chars: 2000,
            recent_observations: 10,
            recent_logs: 5,
            context_threshold: 0.9,
            chars_per_token: 4,
            temperature: 0.3,
            max_tokens: 1000,
            trend_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DedupConfig {
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { capacity: 10 }
    }
}

/// When the draft/critique/refine pass runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CritiqueMode {
    #[default]
    Off,
    Always,
    OnConfusion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CritiqueConfig {
    pub mode: CritiqueMode,
    pub draft_max_tokens: u32,
}

impl Default for CritiqueConfig {
    fn default() -> Self {
        Self {
            mode: CritiqueMode::Off,
            draft_max_tokens: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ParserConfig {
    /// Re-ask once with a stricter instruction when a reply cannot be parsed.
    pub strict_retry: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self { strict_retry: true }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError(msg.to_string()));
        if self.max_iterations == 0 {
            return fail("max_iterations must be > 0");
        }
        if self.model.base_url.trim().is_empty() {
            return fail("model.base_url must not be empty");
        }
        if self.model.request_timeout_secs == 0 || self.model.stream_timeout_secs == 0 {
            return fail("model timeouts must be > 0");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be >= 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return fail("retry.backoff_multiplier must be >= 1.0");
        }
        if self.sandbox.command_timeout_secs == 0 {
            return fail("sandbox.command_timeout_secs must be > 0");
        }
        if self.sandbox.max_output_chars == 0 {
            return fail("sandbox.max_output_chars must be > 0");
        }
        if self.context.max_turns < 2 {
            return fail("context.max_turns must be >= 2");
        }
        if self.history.interval == 0 {
            return fail("history.interval must be > 0");
        }
        if self.history.max_summary_chars < 16 {
            return fail("history.max_summary_chars must be >= 16");
        }
        if self.history.chars_per_token == 0 {
            return fail("history.chars_per_token must be > 0");
        }
        if !(0.0..=1.0).contains(&self.history.context_threshold) {
            return fail("history.context_threshold must be within 0.0..=1.0");
        }
        if self.loop_detector.window < 2 || self.loop_detector.repeat_threshold < 2 {
            return fail("loop_detector.window and repeat_threshold must be >= 2");
        }
        if !(0.0..=1.0).contains(&self.loop_detector.similarity_threshold) {
            return fail("loop_detector.similarity_threshold must be within 0.0..=1.0");
        }
        if self.loop_detector.kill_threshold <= self.loop_detector.warn_threshold {
            return fail("loop_detector.kill_threshold must exceed warn_threshold");
        }
        if self.observations.keep_recent > self.observations.fold_threshold {
            return fail("observations.keep_recent must not exceed fold_threshold");
        }
        if self.observations.trail_limit
            < self
                .loop_detector
                .window
                .max(self.loop_detector.no_progress_window)
        {
            return fail("observations.trail_limit must cover the loop detector windows");
        }
        if self.dedup.capacity == 0 {
            return fail("dedup.capacity must be > 0");
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::fsutil::write_atomic(path, &buf)
}
