//! Layout of the engine's state directory (`.ralph/`) and its scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{EngineConfig, write_config};

/// All canonical paths within `.ralph/` for a project root.
#[derive(Debug, Clone)]
pub struct RalphPaths {
    pub root: PathBuf,
    pub ralph_dir: PathBuf,
    pub state_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl RalphPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ralph_dir = root.join(".ralph");
        Self {
            root: root.clone(),
            ralph_dir: ralph_dir.clone(),
            state_dir: ralph_dir.join("state"),
            iterations_dir: ralph_dir.join("iterations"),
            config_path: ralph_dir.join("config.toml"),
            gitignore_path: ralph_dir.join(".gitignore"),
        }
    }

    /// Persisted RunState for `run_id`.
    pub fn run_state_path(&self, run_id: &str) -> PathBuf {
        self.state_dir.join(format!("{run_id}.json"))
    }

    /// Workspace directory, resolved against the project root when relative.
    pub fn workspace(&self, config: &EngineConfig) -> PathBuf {
        if config.workspace.is_absolute() {
            config.workspace.clone()
        } else {
            self.root.join(&config.workspace)
        }
    }
}

/// Options for `init_state_dir`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config.
    pub force: bool,
}

/// Create `.ralph/` scaffolding in `root` with a default config.
///
/// Fails if `.ralph/` already exists unless `options.force` is set.
pub fn init_state_dir(root: &Path, options: &InitOptions) -> Result<RalphPaths> {
    let paths = RalphPaths::new(root);
    if paths.ralph_dir.exists() && !options.force {
        return Err(anyhow!(
            "ralph init: .ralph already exists (use --force to overwrite)"
        ));
    }
    if paths.ralph_dir.exists() && !paths.ralph_dir.is_dir() {
        return Err(anyhow!("ralph init: .ralph exists but is not a directory"));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.iterations_dir)?;
    fs::write(&paths.gitignore_path, RALPH_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &EngineConfig::default())?;

    Ok(paths)
}

/// Create the directories a run writes into, without touching the config.
pub fn ensure_dirs(paths: &RalphPaths) -> Result<()> {
    create_dir(&paths.state_dir)?;
    create_dir(&paths.iterations_dir)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const RALPH_GITIGNORE: &str = "iterations/\nstate/\n";
