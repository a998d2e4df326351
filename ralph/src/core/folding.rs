//! Folding of old observations into the history summary.
//!
//! This is plain concatenation and truncation, no model call. It keeps the
//! observation list short between History Compressor runs.

use serde::{Deserialize, Serialize};

use super::text::{collapse_whitespace, keep_tail, truncate_ellipsis};
use super::types::Observation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    /// Fold once the list holds more than this many observations.
    pub fold_threshold: usize,
    /// Newest observations kept verbatim after a fold or compression.
    pub keep_recent: usize,
    /// Per-entry cap inside the folded summary line.
    pub fold_entry_chars: usize,
    /// Length of the unfolded action trail used for loop detection.
    pub trail_limit: usize,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            fold_threshold: 10,
            keep_recent: 3,
            fold_entry_chars: 500,
            trail_limit: 50,
        }
    }
}

const NOISE: &[&str] = &["Exit 0", "Wrote 0 bytes"];

/// Fold everything but the newest `keep_recent` observations into `summary`.
///
/// Returns the number of observations folded. The summary never exceeds
/// `max_summary_chars`; when it would, the oldest text is cut.
pub fn fold_observations(
    observations: &mut Vec<Observation>,
    summary: &mut String,
    config: &ObservationConfig,
    max_summary_chars: usize,
) -> usize {
    if observations.len() <= config.fold_threshold {
        return 0;
    }
    let split = observations.len().saturating_sub(config.keep_recent);
    let folded: Vec<Observation> = observations.drain(..split).collect();

    let mut entries: Vec<String> = Vec::new();
    for obs in &folded {
        let outcome = collapse_whitespace(&obs.outcome);
        if NOISE.iter().any(|noise| outcome == *noise) {
            continue;
        }
        let status = if obs.success { "ok" } else { "failed" };
        let entry = truncate_ellipsis(
            &format!("{} [{status}]: {outcome}", obs.action),
            config.fold_entry_chars,
        );
        if entries.last() != Some(&entry) {
            entries.push(entry);
        }
    }

    if let (Some(first), Some(last)) = (folded.first(), folded.last())
        && !entries.is_empty()
    {
        let range = if first.iteration == last.iteration {
            format!("Iter {}", first.iteration)
        } else {
            format!("Iter {}-{}", first.iteration, last.iteration)
        };
        summary.push_str(&format!("\n- {range}: {}", entries.join(" | ")));
        *summary = keep_tail(summary.trim_start(), max_summary_chars);
    }
    folded.len()
}

/// Append to a bounded trail, dropping the oldest entries.
pub fn push_bounded<T>(items: &mut Vec<T>, item: T, limit: usize) {
    items.push(item);
    if items.len() > limit {
        let excess = items.len() - limit;
        items.drain(..excess);
    }
}
