//! Per-session state and snapshots.

use crate::config::{ToolConfig, ToolMode};
use crate::driver::interactive::InteractiveDriver;
use crate::driver::{CancelHandle, DriverReply};
use crate::error::PromptFailure;
use crate::output::Destination;
use crate::transcript::Transcript;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Stable session identifier: a v5 UUID fingerprint of the tool name and
/// workdir. Deterministic and collision-free over distinct pairs, so the
/// same session keeps its id across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn fingerprint(tool: &str, workdir: &std::path::Path) -> Self {
        let material = format!("{tool}\0{}", workdir.display());
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes()).to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a completed (or failed) prompt resolves to its submitter.
pub type PromptResult = Result<DriverReply, PromptFailure>;

/// A scheduled unit of work waiting in a session's queue.
pub struct PendingPrompt {
    pub text: String,
    pub image_path: Option<PathBuf>,
    pub destination: Destination,
    /// Run budget; `None` falls back to the per-mode default. Zero resolves
    /// as a timeout without reaching the driver.
    pub timeout: Option<Duration>,
    pub cancel: CancelHandle,
    pub responder: Option<oneshot::Sender<PromptResult>>,
}

impl PendingPrompt {
    /// Resolve the submitter, if it is still listening.
    pub fn resolve(&mut self, result: PromptResult) {
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(result);
        }
    }
}

/// One session in the registry.
pub struct Session {
    pub id: SessionId,
    pub tool: ToolConfig,
    pub workdir: PathBuf,
    /// Usually the tool's mode; degraded to headless when an interactive
    /// spawn fails.
    pub mode: ToolMode,
    pub resume_token: Option<String>,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub queue: VecDeque<PendingPrompt>,
    /// True iff a prompt is being written or awaited right now.
    pub busy: bool,
    /// Terminal failure state; only recreate clears it.
    pub down: bool,
    /// Guards against two pumps racing on one session.
    pub pump_active: bool,
    pub driver: Option<Arc<InteractiveDriver>>,
    pub transcript: Arc<Transcript>,
    pub updated_at: f64,
    pub last_prompt_at: Option<f64>,
    pub last_output_bytes: usize,
    pub elapsed_ms_last: u64,
}

impl Session {
    pub fn new(
        id: SessionId,
        tool: ToolConfig,
        workdir: PathBuf,
        name: Option<String>,
        transcript: Arc<Transcript>,
    ) -> Self {
        let mode = tool.mode;
        Self {
            id,
            tool,
            workdir,
            mode,
            resume_token: None,
            name,
            summary: None,
            queue: VecDeque::new(),
            busy: false,
            down: false,
            pump_active: false,
            driver: None,
            transcript,
            updated_at: crate::persistence::now_epoch(),
            last_prompt_at: None,
            last_output_bytes: 0,
            elapsed_ms_last: 0,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            tool: self.tool.name.clone(),
            workdir: self.workdir.display().to_string(),
            mode: self.mode,
            name: self.name.clone(),
            updated_at: self.updated_at,
            busy: self.busy,
            down: self.down,
            queue_len: self.queue.len(),
            driver_state: self
                .driver
                .as_ref()
                .map(|d| d.state().to_string())
                .unwrap_or_else(|| "absent".to_string()),
            has_resume_token: self.resume_token.is_some(),
            last_prompt_at: self.last_prompt_at,
            last_output_bytes: self.last_output_bytes,
            elapsed_ms_last: self.elapsed_ms_last,
        }
    }
}

/// Published view of a session, for `list()` and the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub tool: String,
    pub workdir: String,
    pub mode: ToolMode,
    pub name: Option<String>,
    pub updated_at: f64,
    pub busy: bool,
    pub down: bool,
    pub queue_len: usize,
    pub driver_state: String,
    pub has_resume_token: bool,
    pub last_prompt_at: Option<f64>,
    pub last_output_bytes: usize,
    pub elapsed_ms_last: u64,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    mod session_id {
        use super::*;

        #[test]
        fn fingerprint_is_deterministic() {
            let a = SessionId::fingerprint("codex", Path::new("/tmp/project"));
            let b = SessionId::fingerprint("codex", Path::new("/tmp/project"));
            assert_eq!(a, b);
        }

        #[test]
        fn distinct_pairs_get_distinct_ids() {
            let a = SessionId::fingerprint("codex", Path::new("/tmp/a"));
            let b = SessionId::fingerprint("codex", Path::new("/tmp/b"));
            let c = SessionId::fingerprint("claude", Path::new("/tmp/a"));
            assert_ne!(a, b);
            assert_ne!(a, c);
            assert_ne!(b, c);
        }

        #[test]
        fn tool_workdir_boundary_is_unambiguous() {
            // "ab" + "/c" must not collide with "a" + "b/c".
            let a = SessionId::fingerprint("ab", Path::new("/c"));
            let b = SessionId::fingerprint("a", Path::new("b/c"));
            assert_ne!(a, b);
        }

        #[test]
        fn display_is_the_inner_string() {
            let id = SessionId("abc-123".to_string());
            assert_eq!(id.to_string(), "abc-123");
        }
    }

    mod session {
        use super::*;
        use crate::config::ToolMode;

        fn make_session() -> Session {
            let tool = ToolConfig::new(
                "codex",
                ToolMode::Headless,
                vec!["codex".to_string(), "{prompt}".to_string()],
            );
            let id = SessionId::fingerprint("codex", Path::new("/tmp"));
            Session::new(
                id,
                tool,
                PathBuf::from("/tmp"),
                Some("main".to_string()),
                Arc::new(Transcript::disabled()),
            )
        }

        #[test]
        fn new_session_is_idle_and_empty() {
            let session = make_session();
            assert!(!session.busy);
            assert!(!session.down);
            assert!(session.queue.is_empty());
            assert!(session.driver.is_none());
            assert!(session.resume_token.is_none());
        }

        #[test]
        fn snapshot_reflects_fields() {
            let mut session = make_session();
            session.busy = true;
            session.resume_token = Some("tok".to_string());
            session.last_output_bytes = 42;

            let snap = session.snapshot();
            assert_eq!(snap.tool, "codex");
            assert_eq!(snap.workdir, "/tmp");
            assert!(snap.busy);
            assert!(snap.has_resume_token);
            assert_eq!(snap.queue_len, 0);
            assert_eq!(snap.driver_state, "absent");
            assert_eq!(snap.last_output_bytes, 42);
        }

        #[test]
        fn snapshot_serializes() {
            let snap = make_session().snapshot();
            let json = serde_json::to_string(&snap).unwrap();
            assert!(json.contains("\"driver_state\":\"absent\""));
            assert!(json.contains("\"busy\":false"));
        }
    }

    mod pending_prompt {
        use super::*;

        #[test]
        fn resolve_reaches_the_receiver() {
            let (tx, rx) = oneshot::channel();
            let mut prompt = PendingPrompt {
                text: "hi".to_string(),
                image_path: None,
                destination: Destination::Rpc,
                timeout: None,
                cancel: CancelHandle::new(),
                responder: Some(tx),
            };
            prompt.resolve(Err(PromptFailure::cancelled("test")));
            let result = rx.blocking_recv().unwrap();
            assert!(result.is_err());
        }

        #[test]
        fn double_resolve_is_harmless() {
            let (tx, _rx) = oneshot::channel();
            let mut prompt = PendingPrompt {
                text: "hi".to_string(),
                image_path: None,
                destination: Destination::Rpc,
                timeout: None,
                cancel: CancelHandle::new(),
                responder: Some(tx),
            };
            prompt.resolve(Err(PromptFailure::cancelled("first")));
            prompt.resolve(Err(PromptFailure::cancelled("second")));
        }
    }
}
