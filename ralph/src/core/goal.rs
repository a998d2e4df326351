//! Goal text helpers: run identifiers and the brief goal shown in the system prompt.

use super::text::{short_digest, truncate_chars};

const BRIEF_MAX_CHARS: usize = 500;
const BRIEF_MAX_LINES: usize = 15;
const BRIEF_FALLBACK: &str = "Build the application as specified.";

/// Filesystem-safe identifier for a goal: a slug of its first words plus a short hash.
pub fn run_id(goal: &str) -> String {
    let mut slug = String::new();
    for ch in goal.chars() {
        if slug.len() >= 40 {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    let digest = short_digest(goal);
    if slug.is_empty() {
        return format!("run-{}", &digest[..8]);
    }
    format!("{slug}-{}", &digest[..8])
}

/// First section of a goal document, capped at 500 chars and 15 lines.
///
/// Stops at the second markdown header; blank lines and `---`/`===` rules are skipped.
pub fn brief_goal(goal: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut chars = 0usize;

    for line in goal.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with("---") || stripped.starts_with("===") {
            continue;
        }
        if stripped.starts_with('#') && lines.iter().any(|l| l.trim_start().starts_with('#')) {
            break;
        }
        lines.push(line);
        chars += line.chars().count();
        if chars >= BRIEF_MAX_CHARS {
            break;
        }
    }

    lines.truncate(BRIEF_MAX_LINES);
    let brief = lines.join("\n");
    if brief.is_empty() {
        return BRIEF_FALLBACK.to_string();
    }
    if brief.chars().count() > BRIEF_MAX_CHARS {
        return format!("{}...", truncate_chars(&brief, BRIEF_MAX_CHARS));
    }
    brief
}

/// True when the goal is long enough that the model should read it from the workspace.
pub fn needs_full_spec(goal: &str) -> bool {
    brief_goal(goal) != goal.trim()
}
