//! Bounded cache of recent response signatures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::text::{collapse_whitespace, short_digest};
use super::types::ActionEnvelope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub signature: String,
    pub last_seen: DateTime<Utc>,
    /// Monotonic insertion tick; breaks ties between equal timestamps.
    pub tick: u64,
}

/// Signature → last-seen mapping holding at most `capacity` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCache {
    pub capacity: usize,
    pub entries: Vec<CacheEntry>,
    #[serde(default)]
    pub tick: u64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Record `signature` and report whether it was already present.
    pub fn check_and_insert(&mut self, signature: &str, now: DateTime<Utc>) -> bool {
        self.tick += 1;
        if let Some(entry) = self.entries.iter_mut().find(|e| e.signature == signature) {
            entry.last_seen = now;
            entry.tick = self.tick;
            return true;
        }

        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.last_seen, e.tick))
                .map(|(idx, _)| idx);
            match oldest {
                Some(idx) => {
                    self.entries.remove(idx);
                }
                None => break,
            }
        }
        self.entries.push(CacheEntry {
            signature: signature.to_string(),
            last_seen: now,
            tick: self.tick,
        });
        false
    }
}

/// Fingerprint of the meaningful envelope fields: chat text, action kind and parameters.
///
/// Whitespace differences in the chat text do not change the signature.
pub fn signature(envelope: &ActionEnvelope) -> String {
    let chat = collapse_whitespace(&envelope.chat);
    let action = envelope
        .execute
        .as_ref()
        .map(|action| action.key())
        .unwrap_or_default();
    short_digest(&format!("chat:{chat}\u{1f}action:{action}"))
}
