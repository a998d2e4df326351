//! Typed failures that the engine inspects and recovers from.
//!
//! Plumbing errors (filesystem, serialization) stay `anyhow::Error`; the types
//! here are the ones the orchestrator branches on.

use std::path::PathBuf;
use std::time::Duration;

use crate::core::text::truncate_ellipsis;

/// Model transport failures.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("network error: {0}")]
    Network(String),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("model endpoint returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("malformed model response: {0}")]
    Malformed(String),
}

impl ModelError {
    /// Connection problems, timeouts, rate limits and server errors are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Status { code, .. } => *code == 429 || *code >= 500,
            Self::Malformed(_) => false,
        }
    }
}

/// The model output contained no usable action envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not parse model output: {reason}")]
pub struct ParseError {
    pub reason: String,
    /// Untouched model text.
    pub raw: String,
}

impl ParseError {
    pub fn new(reason: impl Into<String>, raw: &str) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }

    /// Short excerpt of the raw text for logs and observations.
    pub fn excerpt(&self) -> String {
        truncate_ellipsis(self.raw.trim(), 120)
    }
}

/// Refusals and failures raised by the sandboxed executor.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("path violation: {requested} resolves outside the workspace")]
    PathViolation { requested: String },
    #[error("path violation: {requested} is a protected engine location")]
    ProtectedPath { requested: String },
    #[error("command blocked: `{verb}` is not allowed")]
    CommandBlocked { verb: String },
    #[error("not found: {}", path.display())]
    MissingTarget { path: PathBuf },
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Invalid engine configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid config: {0}")]
pub struct ConfigError(pub String);
