//! Per-iteration artifacts under `.ralph/iterations/<run_id>/<iter>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::parser::ParseTier;
use crate::core::types::LoopType;
use crate::critique::CritiqueReport;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub iter: u32,
    pub task_id: Option<String>,
    pub action: Option<String>,
    pub success: bool,
    pub duplicate: bool,
    pub parse_tier: Option<ParseTier>,
    /// Set when the draft/critique/refine pass ran.
    pub critique: Option<CritiqueReport>,
    pub stagnation: u32,
    pub loop_type: Option<LoopType>,
    pub started_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub response_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, run_id: &str, iter: u32) -> Self {
        let dir = iterations_dir.join(run_id).join(iter.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            response_path: dir.join("response.txt"),
            dir,
        }
    }
}

/// Write `meta.json` and the raw model text for one iteration.
pub fn write_iteration(
    iterations_dir: &Path,
    meta: &IterationMeta,
    response: &str,
) -> Result<IterationPaths> {
    let paths = IterationPaths::new(iterations_dir, &meta.run_id, meta.iter);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    fs::write(&paths.meta_path, buf)
        .with_context(|| format!("write {}", paths.meta_path.display()))?;
    fs::write(&paths.response_path, response)
        .with_context(|| format!("write {}", paths.response_path.display()))?;

    Ok(paths)
}
