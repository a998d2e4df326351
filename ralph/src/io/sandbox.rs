//! Sandboxed executor: the only component that touches the workspace.
//!
//! Every path is resolved against the workspace root with symlinks followed,
//! and rejected when the real location falls outside the root or inside a
//! protected engine location. Commands are screened against a verb deny-list
//! before they reach the shell.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::config::SandboxConfig;
use super::process::run_shell;
use crate::core::text::truncate_marked;
use crate::core::types::{Action, FailureKind, Observation};
use crate::error::SandboxError;

static SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&&|\|\||[;&|\n`(]|\$\(").unwrap());
static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());

/// Words that run the following word as a command.
const COMMAND_PREFIXES: &[&str] = &["env", "nohup", "time", "exec", "command", "nice", "xargs", "builtin"];

/// Verbs whose arguments are themselves a shell script.
const NESTED_SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh", "eval"];

/// Directories skipped by recursive listings.
const LIST_SKIP: &[&str] = &["node_modules", "target", "__pycache__", "venv"];

/// Result of a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    protected: Vec<PathBuf>,
    config: SandboxConfig,
}

impl Sandbox {
    /// Create the workspace root if needed and pin its canonical location.
    pub fn new(root: &Path, config: SandboxConfig) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("create workspace {}", root.display()))?;
        let root = fs::canonicalize(root)
            .with_context(|| format!("canonicalize workspace {}", root.display()))?;
        Ok(Self {
            root,
            protected: Vec::new(),
            config,
        })
    }

    /// Refuse every path under `path` (engine state, engine sources).
    pub fn protect(mut self, path: &Path) -> Self {
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if !self.protected.contains(&path) {
            self.protected.push(path);
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `requested` to a real path inside the workspace.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, SandboxError> {
        let trimmed = requested.trim();
        let requested_path = Path::new(if trimmed.is_empty() { "." } else { trimmed });
        let violation = || SandboxError::PathViolation {
            requested: requested.to_string(),
        };

        let mut resolved = PathBuf::new();
        for component in self.root.join(requested_path).components() {
            match component {
                Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(name) => {
                    resolved.push(name);
                    let is_link = fs::symlink_metadata(&resolved)
                        .map(|meta| meta.file_type().is_symlink())
                        .unwrap_or(false);
                    if is_link {
                        // Dangling links cannot be proven safe.
                        resolved = fs::canonicalize(&resolved).map_err(|_| violation())?;
                    }
                }
            }
        }

        if !resolved.starts_with(&self.root) {
            return Err(violation());
        }
        if self.protected.iter().any(|p| resolved.starts_with(p)) {
            return Err(SandboxError::ProtectedPath {
                requested: requested.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Reject commands whose verb (in any pipeline segment) is deny-listed.
    ///
    /// Scripts handed to a nested shell (`sh -c '...'`, `eval ...`) and the
    /// command after `find -exec` are screened too.
    pub fn check_command(&self, command: &str) -> Result<(), SandboxError> {
        for segment in SEPARATOR_RE.split(command) {
            let words: Vec<&str> = segment
                .split_whitespace()
                .map(|word| word.trim_matches(|c| matches!(c, '"' | '\'' | '{' | '}' | '!' | ')')))
                .filter(|word| !word.is_empty())
                .collect();
            let Some(start) = words
                .iter()
                .position(|word| !is_env_assignment(word) && !COMMAND_PREFIXES.contains(word))
            else {
                continue;
            };
            let verb = basename(words[start]);
            self.deny(verb)?;

            let rest = &words[start + 1..];
            if NESTED_SHELLS.contains(&verb) {
                let script_from = rest
                    .iter()
                    .position(|word| !word.starts_with('-'))
                    .unwrap_or(rest.len());
                self.check_command(&rest[script_from..].join(" "))?;
            }
            if verb == "find" {
                for pair in rest.windows(2) {
                    if matches!(pair[0], "-exec" | "-execdir" | "-ok" | "-okdir") {
                        self.deny(basename(pair[1]))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn deny(&self, verb: &str) -> Result<(), SandboxError> {
        if self.config.deny_commands.iter().any(|deny| deny == verb) {
            return Err(SandboxError::CommandBlocked {
                verb: verb.to_string(),
            });
        }
        Ok(())
    }

    pub fn read(&self, requested: &str) -> Result<String, SandboxError> {
        let path = self.resolve(requested)?;
        if !path.exists() {
            return Err(SandboxError::MissingTarget { path });
        }
        let contents = fs::read_to_string(&path).map_err(|source| SandboxError::Io {
            op: "read",
            path: path.clone(),
            source,
        })?;
        Ok(contents)
    }

    /// Write `content`, creating parent directories. Identical content is not rewritten.
    pub fn write(&self, requested: &str, content: &str) -> Result<WriteOutcome, SandboxError> {
        let path = self.resolve(requested)?;
        if path == self.root {
            return Err(SandboxError::Io {
                op: "write",
                path,
                source: std::io::Error::other("target is the workspace root"),
            });
        }
        if let Ok(existing) = fs::read_to_string(&path)
            && existing == content
        {
            return Ok(WriteOutcome::Unchanged);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SandboxError::Io {
                op: "create directory",
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&path, content).map_err(|source| SandboxError::Io {
            op: "write",
            path: path.clone(),
            source,
        })?;
        Ok(WriteOutcome::Written(content.len()))
    }

    pub fn list(&self, requested: &str, recursive: bool) -> Result<String, SandboxError> {
        let path = self.resolve(requested)?;
        if !path.is_dir() {
            return Err(SandboxError::MissingTarget { path });
        }
        if recursive {
            return Ok(self.tree(&path));
        }

        let entries = fs::read_dir(&path).map_err(|source| SandboxError::Io {
            op: "list",
            path: path.clone(),
            source,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    format!("{name}/")
                } else {
                    name
                }
            })
            .collect();
        names.sort();
        if names.is_empty() {
            return Ok("(empty directory)".to_string());
        }
        Ok(names.join("\n"))
    }

    fn tree(&self, dir: &Path) -> String {
        let mut lines = vec!["Project Tree:".to_string()];
        let mut hidden = 0usize;
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !(entry.file_type().is_dir()
                    && (name.starts_with('.') || LIST_SKIP.contains(&name.as_ref())))
            });
        for entry in walker.filter_map(|entry| entry.ok()) {
            if lines.len() > self.config.list_limit {
                hidden += 1;
                continue;
            }
            let indent = "  ".repeat(entry.depth() - 1);
            let name = entry.file_name().to_string_lossy();
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            lines.push(format!("{indent}{name}{suffix}"));
        }
        if hidden > 0 {
            lines.push(format!("... ({hidden} more entries)"));
        }
        lines.join("\n")
    }

    /// Run a shell command in the workspace root.
    pub fn run(&self, command: &str) -> Result<(bool, String, Option<FailureKind>), SandboxError> {
        self.check_command(command)?;
        let timeout = Duration::from_secs(self.config.command_timeout_secs);
        let limit = self.config.max_output_chars.saturating_mul(4).max(4096);
        let output = run_shell(command, &self.root, timeout, limit).map_err(|err| {
            SandboxError::Io {
                op: "run",
                path: self.root.clone(),
                source: std::io::Error::other(format!("{err:#}")),
            }
        })?;

        let body = ANSI_RE.replace_all(&output.combined(), "").trim_end().to_string();
        let body = truncate_marked(&body, self.config.max_output_chars);
        if output.timed_out {
            let text = format!("Timed out after {}s\nOutput: {body}", timeout.as_secs());
            return Ok((false, text, Some(FailureKind::Timeout)));
        }
        let code = output.exit_code();
        let text = if body.is_empty() {
            format!("Exit {code}")
        } else {
            format!("Exit {code}\nOutput: {body}")
        };
        let failure = (!output.success()).then_some(FailureKind::NonZeroExit);
        Ok((output.success(), text, failure))
    }

    /// Perform `action` and record exactly one observation for it.
    pub fn execute(&self, action: &Action, iteration: u32, task_id: Option<&str>) -> Observation {
        debug!(action = %action, "executing action");
        let result = match action {
            Action::Read { path } => self
                .read(path)
                .map(|text| (true, read_outcome(&text, self.config.max_output_chars), None)),
            Action::Write { path, content } => self.write(path, content).map(|outcome| match outcome {
                WriteOutcome::Written(bytes) => (true, format!("Wrote {bytes} bytes to {path}"), None),
                WriteOutcome::Unchanged => (
                    false,
                    format!("Skipped: {path} already has identical content"),
                    Some(FailureKind::Redundant),
                ),
            }),
            Action::List { path, recursive } => self
                .list(path, *recursive)
                .map(|text| (true, truncate_marked(&text, self.config.max_output_chars), None)),
            Action::Run { cmd } => self.run(cmd),
            Action::Test { cmd } => {
                let cmd = cmd.as_deref().unwrap_or(&self.config.test_command);
                self.run(cmd)
            }
        };

        let (success, outcome, failure) = match result {
            Ok(result) => result,
            Err(err) => {
                let kind = failure_kind(&err);
                warn!(action = %action, err = %err, "action refused or failed");
                (false, format!("Error: {err}"), Some(kind))
            }
        };
        info!(action = %action, success, "action finished");

        Observation {
            iteration,
            task_id: task_id.map(str::to_string),
            action: action.to_string(),
            action_key: Some(action.key()),
            outcome,
            success,
            failure,
            duplicate: false,
            at: Utc::now(),
        }
    }
}

fn read_outcome(text: &str, limit: usize) -> String {
    if text.is_empty() {
        return "(empty file)".to_string();
    }
    truncate_marked(text, limit)
}

fn failure_kind(err: &SandboxError) -> FailureKind {
    match err {
        SandboxError::PathViolation { .. } | SandboxError::ProtectedPath { .. } => {
            FailureKind::PathViolation
        }
        SandboxError::CommandBlocked { .. } => FailureKind::CommandBlocked,
        SandboxError::MissingTarget { .. } => FailureKind::MissingTarget,
        SandboxError::Io { .. } => FailureKind::Io,
    }
}

fn basename(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

fn is_env_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, Sandbox) {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("ws");
        let sandbox = Sandbox::new(&root, SandboxConfig::default()).expect("sandbox");
        (temp, sandbox)
    }

    /// Verifies traversal, absolute paths and symlink escapes are all path violations.
    #[cfg(unix)]
    #[test]
    fn rejects_escapes() {
        let (temp, sandbox) = sandbox();
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).expect("mkdir");
        fs::write(outside.join("secret.txt"), "s").expect("write");
        std::os::unix::fs::symlink(&outside, sandbox.root().join("link")).expect("symlink");

        for requested in ["../../etc/passwd", "/etc/passwd", "link/secret.txt", "link"] {
            let err = sandbox.resolve(requested).expect_err(requested);
            assert!(
                matches!(err, SandboxError::PathViolation { .. }),
                "{requested}: {err}"
            );
        }
    }

    #[test]
    fn accepts_workspace_paths() {
        let (_temp, sandbox) = sandbox();
        let notes = sandbox.resolve("notes/todo.txt").expect("notes");
        let nested = sandbox.resolve("./a/b/c.py").expect("nested");
        assert_eq!(notes, sandbox.root().join("notes/todo.txt"));
        assert_eq!(nested, sandbox.root().join("a/b/c.py"));
        assert_eq!(sandbox.resolve("a/../b.txt").expect("dotdot"), sandbox.root().join("b.txt"));
    }

    #[test]
    fn protected_locations_are_refused() {
        let (_temp, sandbox) = sandbox();
        let state = sandbox.root().join(".ralph");
        fs::create_dir_all(&state).expect("mkdir");
        let sandbox = sandbox.protect(&state);
        let err = sandbox.resolve(".ralph/state/run.json").expect_err("protected");
        assert!(matches!(err, SandboxError::ProtectedPath { .. }));
    }

    /// Verifies deny-listed verbs are blocked in every pipeline segment.
    #[test]
    fn blocks_denied_verbs() {
        let (_temp, sandbox) = sandbox();
        for command in [
            "rm -rf /",
            "ls && sudo reboot",
            "echo hi; /bin/rm x",
            "FOO=1 mv a b",
            "find . | xargs rm",
            "echo $(rm x)",
            "sh -c 'rm x'",
            "bash -c \"rm -rf .\"",
            "/bin/bash -e -c 'cd src && chmod 777 run.sh'",
            "eval rm x",
            "find . -name '*.pyc' -exec rm {} +",
        ] {
            let err = sandbox.check_command(command).expect_err(command);
            assert!(matches!(err, SandboxError::CommandBlocked { .. }), "{command}");
        }
        for command in [
            "ls -la",
            "python3 -m pytest",
            "echo remove",
            "grep -r rm .",
            "sh -c 'ls -la'",
            "find . -name '*.py' -exec cat {} +",
        ] {
            sandbox.check_command(command).expect(command);
        }
    }

    #[test]
    fn write_read_and_skip_identical() {
        let (_temp, sandbox) = sandbox();
        let write = Action::Write {
            path: "src/hello.py".to_string(),
            content: "print('hi')\n".to_string(),
        };

        let first = sandbox.execute(&write, 1, None);
        let second = sandbox.execute(&write, 2, None);
        let read = sandbox.execute(
            &Action::Read {
                path: "src/hello.py".to_string(),
            },
            3,
            Some("T1"),
        );

        assert!(first.success);
        assert_eq!(first.outcome, "Wrote 12 bytes to src/hello.py");
        assert!(!second.success);
        assert_eq!(second.failure, Some(FailureKind::Redundant));
        assert_eq!(read.outcome, "print('hi')\n");
        assert_eq!(read.task_id.as_deref(), Some("T1"));
    }

    #[test]
    fn violations_become_failed_observations() {
        let (_temp, sandbox) = sandbox();
        let obs = sandbox.execute(
            &Action::Read {
                path: "../../etc/passwd".to_string(),
            },
            1,
            None,
        );
        assert!(!obs.success);
        assert_eq!(obs.failure, Some(FailureKind::PathViolation));
        assert!(obs.outcome.starts_with("Error: path violation"));

        let missing = sandbox.execute(
            &Action::Read {
                path: "nope.txt".to_string(),
            },
            2,
            None,
        );
        assert_eq!(missing.failure, Some(FailureKind::MissingTarget));
    }

    #[test]
    fn lists_flat_and_recursive() {
        let (_temp, sandbox) = sandbox();
        sandbox.write("b.txt", "b").expect("write");
        sandbox.write("a/inner.txt", "i").expect("write");
        sandbox.write(".git/config", "x").expect("write");

        assert_eq!(sandbox.list(".", false).expect("list"), ".git/\na/\nb.txt");
        let tree = sandbox.list(".", true).expect("tree");
        assert_eq!(tree, "Project Tree:\na/\n  inner.txt\nb.txt");
    }

    #[cfg(unix)]
    #[test]
    fn shell_wrapped_delete_never_runs() {
        let (_temp, sandbox) = sandbox();
        fs::write(sandbox.root().join("victim.txt"), "keep").expect("write");

        let obs = sandbox.execute(
            &Action::Run {
                cmd: "sh -c 'rm victim.txt'".to_string(),
            },
            1,
            None,
        );

        assert!(!obs.success);
        assert_eq!(obs.failure, Some(FailureKind::CommandBlocked));
        assert!(sandbox.root().join("victim.txt").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn runs_commands_and_truncates_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = SandboxConfig {
            max_output_chars: 20,
            ..SandboxConfig::default()
        };
        let sandbox = Sandbox::new(&temp.path().join("ws"), config).expect("sandbox");

        let ok = sandbox.execute(
            &Action::Run {
                cmd: "printf 'hello'".to_string(),
            },
            1,
            None,
        );
        assert!(ok.success);
        assert_eq!(ok.outcome, "Exit 0\nOutput: hello");

        let long = sandbox.execute(
            &Action::Run {
                cmd: "printf '%0100d' 0; exit 2".to_string(),
            },
            2,
            None,
        );
        assert!(!long.success);
        assert_eq!(long.failure, Some(FailureKind::NonZeroExit));
        assert!(long.outcome.starts_with("Exit 2\n"));
        assert!(long.outcome.contains("[... truncated 80 chars ...]"));

        let blocked = sandbox.execute(
            &Action::Test {
                cmd: Some("sudo pytest".to_string()),
            },
            3,
            None,
        );
        assert_eq!(blocked.failure, Some(FailureKind::CommandBlocked));
    }
}
