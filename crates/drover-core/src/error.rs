//! Error types shared across the core.

use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from session-manager operations. These are rejected synchronously
/// and never have side effects.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("bad workdir: {0}")]
    BadWorkdir(String),

    #[error("session is down: {0}")]
    Closed(SessionId),

    #[error("queue full for session {0}")]
    QueueFull(SessionId),
}

/// Why a prompt failed. The kind doubles as the prefix token of the
/// user-visible error string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Timeout,
    Cancelled,
    Spawn,
    Stalled,
    SessionDown,
}

impl FailureKind {
    pub fn token(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Spawn => "spawn",
            FailureKind::Stalled => "stalled",
            FailureKind::SessionDown => "session-down",
        }
    }
}

/// Human-visible error strings stay short enough for chat surfaces.
const MAX_FAILURE_CHARS: usize = 200;

/// A failed prompt outcome. Always resolves to
/// `{ok: false, error: "<kind>: <detail>"}` at the edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl PromptFailure {
    pub fn new(kind: FailureKind, detail: impl AsRef<str>) -> Self {
        let mut message = format!("{}: {}", kind.token(), detail.as_ref());
        if message.chars().count() > MAX_FAILURE_CHARS {
            message = message.chars().take(MAX_FAILURE_CHARS).collect();
        }
        Self { kind, message }
    }

    pub fn timeout(detail: impl AsRef<str>) -> Self {
        Self::new(FailureKind::Timeout, detail)
    }

    pub fn cancelled(detail: impl AsRef<str>) -> Self {
        Self::new(FailureKind::Cancelled, detail)
    }

    pub fn spawn(detail: impl AsRef<str>) -> Self {
        Self::new(FailureKind::Spawn, detail)
    }

    pub fn stalled(detail: impl AsRef<str>) -> Self {
        Self::new(FailureKind::Stalled, detail)
    }

    pub fn session_down(detail: impl AsRef<str>) -> Self {
        Self::new(FailureKind::SessionDown, detail)
    }
}

impl std::fmt::Display for PromptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PromptFailure {}

// ============================================================================
// TESTS
// ============================================================================
