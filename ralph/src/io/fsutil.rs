//! Small filesystem helpers shared by the persistence modules.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Write `contents` next to `path` first, then rename over it.
///
/// Readers observe either the previous file or the complete new one.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("out");
    let tmp_path = path.with_extension(format!("{ext}.tmp"));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
