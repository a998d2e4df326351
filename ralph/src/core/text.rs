//! Char-boundary-safe text helpers shared by the core modules.

use sha2::{Digest, Sha256};

/// Keep at most `max` characters, never splitting a UTF-8 sequence.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Truncate to `max` characters in total, ending with `...` when anything was cut.
pub fn truncate_ellipsis(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max <= 3 {
        return truncate_chars(text, max).to_string();
    }
    format!("{}...", truncate_chars(text, max - 3))
}

/// Truncate to `max` characters and append a marker naming how much was cut.
pub fn truncate_marked(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    format!(
        "{}\n[... truncated {} chars ...]",
        truncate_chars(text, max),
        total - max
    )
}

/// Keep the last `max` characters, prefixed with `... ` when anything was cut.
/// The result never exceeds `max` characters.
pub fn keep_tail(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    let prefix = "... ";
    let keep = max.saturating_sub(prefix.len());
    let tail: String = text.chars().skip(total - keep).collect();
    if keep == 0 {
        return truncate_chars(prefix, max).to_string();
    }
    format!("{prefix}{tail}")
}

/// Trim and collapse internal whitespace runs to a single space.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First 12 hex characters of the SHA-256 of `text`.
pub fn short_digest(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest
        .iter()
        .take(6)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
