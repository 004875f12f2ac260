//! SessionManager: the registry every interface talks to.
//!
//! Owns the session table and the active selection, persists both through
//! [`crate::persistence::StateStore`], and rehydrates them on startup. The
//! registry mutex is held only for in-memory mutation; file I/O happens
//! outside it, serialized by the store's own lock.

use super::state::{PendingPrompt, Session, SessionId, SessionSnapshot};
use crate::config::{AppConfig, ToolConfig, ToolMode};
use crate::driver::headless::run_tool_help;
use crate::driver::interactive::InteractiveDriver;
use crate::error::{PromptFailure, SessionError};
use crate::event_bus::{session_topic, EventBus};
use crate::persistence::{
    now_epoch, update_toolhelp, PersistedActive, PersistedSession, StateDoc, StateStore,
};
use crate::transcript::Transcript;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Persisted session summaries are bounded to this many characters.
pub(crate) const SUMMARY_MAX_CHARS: usize = 4000;

/// Help runs get a short budget regardless of the configured idle timeout.
const HELP_BUDGET_CAP: Duration = Duration::from_secs(20);

/// Externally supplied lifecycle notifier. Errors are logged and ignored;
/// they never roll back the operation that triggered them.
pub trait SessionHooks: Send + Sync {
    fn on_create(&self, _snapshot: &SessionSnapshot) -> Result<(), String> {
        Ok(())
    }
    fn on_activate(&self, _id: &SessionId) -> Result<(), String> {
        Ok(())
    }
    fn before_close(&self, _id: &SessionId) -> Result<(), String> {
        Ok(())
    }
    fn after_close(&self, _id: &SessionId) -> Result<(), String> {
        Ok(())
    }
}

struct Registry {
    sessions: HashMap<SessionId, Session>,
    active: Option<SessionId>,
}

/// Everything the dispatcher needs to run one prompt, cloned out of the
/// registry so no lock is held across the run.
pub(crate) struct RunContext {
    pub tool: ToolConfig,
    pub workdir: PathBuf,
    pub mode: ToolMode,
    pub resume_token: Option<String>,
    pub driver: Option<Arc<InteractiveDriver>>,
    pub transcript: Arc<Transcript>,
}

/// Post-run session updates.
pub(crate) struct PromptUpdate {
    pub resume_token: Option<String>,
    pub summary: Option<String>,
    pub output_bytes: usize,
    pub elapsed_ms: u64,
}

pub struct SessionManager {
    config: Arc<AppConfig>,
    store: StateStore,
    events: Arc<EventBus>,
    hooks: Mutex<Option<Arc<dyn SessionHooks>>>,
    registry: Mutex<Registry>,
}

impl SessionManager {
    /// Build the manager and rehydrate sessions from the state file.
    /// Restored sessions come back idle: no driver, empty queue, not busy.
    pub fn new(config: Arc<AppConfig>, events: Arc<EventBus>) -> Arc<Self> {
        let store = StateStore::new(config.defaults.state_path.clone());
        let doc = store.load().unwrap_or_else(|e| {
            log::warn!("state file unreadable, starting empty: {e}");
            StateDoc::default()
        });

        let mut sessions = HashMap::new();
        for (id, entry) in &doc.sessions {
            let Some(tool) = config.tools.get(&entry.tool) else {
                log::warn!("dropping persisted session {id}: unknown tool {}", entry.tool);
                continue;
            };
            let session_id = SessionId(id.clone());
            let transcript = Arc::new(Transcript::open(
                config.defaults.log_dir.as_deref(),
                &session_id.0,
            ));
            let mut session = Session::new(
                session_id.clone(),
                tool.clone(),
                PathBuf::from(&entry.workdir),
                entry.name.clone(),
                transcript,
            );
            session.resume_token = entry.resume_token.clone();
            session.summary = entry.summary.clone();
            session.updated_at = entry.updated_at;
            sessions.insert(session_id, session);
        }

        // A stale active selection is cleared, not resurrected.
        let active = doc
            .active
            .as_ref()
            .and_then(|a| a.session_id.clone())
            .map(SessionId)
            .filter(|id| sessions.contains_key(id));

        log::info!(
            "session manager restored {} sessions (active: {})",
            sessions.len(),
            active.as_ref().map(|a| a.0.as_str()).unwrap_or("none")
        );

        Arc::new(Self {
            config,
            store,
            events,
            hooks: Mutex::new(None),
            registry: Mutex::new(Registry { sessions, active }),
        })
    }

    pub fn set_hooks(&self, hooks: Arc<dyn SessionHooks>) {
        *self.hooks.lock().unwrap() = Some(hooks);
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn with_hooks(&self, f: impl FnOnce(&dyn SessionHooks) -> Result<(), String>) {
        let hooks = self.hooks.lock().unwrap().clone();
        if let Some(hooks) = hooks {
            if let Err(e) = f(hooks.as_ref()) {
                log::warn!("session hook failed: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Create a session for `(tool, workdir)` and make it active. The state
    /// file is written before the caller sees success.
    pub fn create(
        &self,
        tool_name: &str,
        workdir: &Path,
        name: Option<String>,
    ) -> Result<SessionSnapshot, SessionError> {
        let tool = self
            .config
            .tools
            .get(tool_name)
            .ok_or_else(|| SessionError::UnknownTool(tool_name.to_string()))?
            .clone();
        if !workdir.is_absolute() || !workdir.is_dir() {
            return Err(SessionError::BadWorkdir(workdir.display().to_string()));
        }

        let id = SessionId::fingerprint(tool_name, workdir);
        let snapshot = {
            let mut registry = self.registry.lock().unwrap();
            if registry.sessions.contains_key(&id) {
                return Err(SessionError::AlreadyExists(id));
            }
            let transcript = Arc::new(Transcript::open(
                self.config.defaults.log_dir.as_deref(),
                &id.0,
            ));
            let session = Session::new(id.clone(), tool, workdir.to_path_buf(), name, transcript);
            let snapshot = session.snapshot();
            registry.sessions.insert(id.clone(), session);
            registry.active = Some(id.clone());
            snapshot
        };

        self.persist();
        self.with_hooks(|h| h.on_create(&snapshot));
        self.publish(&snapshot);
        log::info!("session created: {id} ({tool_name} @ {})", workdir.display());
        Ok(snapshot)
    }

    pub fn set_active(&self, id: &SessionId) -> Result<(), SessionError> {
        {
            let mut registry = self.registry.lock().unwrap();
            if !registry.sessions.contains_key(id) {
                return Err(SessionError::NotFound(id.clone()));
            }
            registry.active = Some(id.clone());
        }
        self.persist();
        self.with_hooks(|h| h.on_activate(id));
        Ok(())
    }

    pub fn rename(&self, id: &SessionId, name: Option<String>) -> Result<(), SessionError> {
        let snapshot = self.mutate(id, |session| {
            session.name = name.clone();
        })?;
        self.persist();
        self.publish(&snapshot);
        Ok(())
    }

    pub fn set_resume(&self, id: &SessionId, token: Option<String>) -> Result<(), SessionError> {
        let snapshot = self.mutate(id, |session| {
            session.resume_token = token.clone();
        })?;
        self.persist();
        self.publish(&snapshot);
        Ok(())
    }

    /// Close a session: `before_close` hook, driver termination, removal,
    /// persistence, `after_close` hook. Queued prompts are discarded.
    pub fn close(&self, id: &SessionId) -> Result<(), SessionError> {
        self.with_hooks(|h| h.before_close(id));

        let (driver, mut dropped) = {
            let mut registry = self.registry.lock().unwrap();
            let Some(mut session) = registry.sessions.remove(id) else {
                return Err(SessionError::NotFound(id.clone()));
            };
            if registry.active.as_ref() == Some(id) {
                registry.active = None;
            }
            let driver = session.driver.take();
            let dropped: Vec<PendingPrompt> = session.queue.drain(..).collect();
            (driver, dropped)
        };

        if let Some(driver) = driver {
            driver.close();
        }
        for prompt in dropped.iter_mut() {
            prompt.resolve(Err(PromptFailure::session_down("session closed")));
        }

        self.persist();
        self.with_hooks(|h| h.after_close(id));
        log::info!("session closed: {id}");
        Ok(())
    }

    /// Snapshot of all sessions, most recently updated first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let registry = self.registry.lock().unwrap();
        let mut snapshots: Vec<SessionSnapshot> =
            registry.sessions.values().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| b.updated_at.total_cmp(&a.updated_at));
        snapshots
    }

    pub fn snapshot(&self, id: &SessionId) -> Option<SessionSnapshot> {
        let registry = self.registry.lock().unwrap();
        registry.sessions.get(id).map(|s| s.snapshot())
    }

    pub fn active(&self) -> Option<SessionId> {
        self.registry.lock().unwrap().active.clone()
    }

    /// RPC session resolution: an extant explicit id wins, else the active
    /// selection.
    pub fn resolve(&self, explicit: Option<&str>) -> Option<SessionId> {
        let registry = self.registry.lock().unwrap();
        if let Some(raw) = explicit {
            let id = SessionId(raw.to_string());
            if registry.sessions.contains_key(&id) {
                return Some(id);
            }
        }
        registry.active.clone()
    }

    /// Fetch (and cache) a tool's help output.
    pub async fn tool_help(&self, tool_name: &str) -> Result<String, PromptFailure> {
        let tool = self
            .config
            .tools
            .get(tool_name)
            .cloned()
            .ok_or_else(|| PromptFailure::spawn(format!("unknown tool: {tool_name}")))?;
        let budget = Duration::from_secs(self.config.defaults.idle_timeout_sec).min(HELP_BUDGET_CAP);
        let help = run_tool_help(&tool, &self.config.defaults.workdir, budget).await?;
        if let Err(e) = update_toolhelp(&self.config.defaults.toolhelp_path, tool_name, &help) {
            log::warn!("tool-help cache write failed: {e}");
        }
        Ok(help)
    }

    // ------------------------------------------------------------------
    // Dispatcher-facing operations
    // ------------------------------------------------------------------

    /// Append a prompt to a session's queue. Returns true when a pump task
    /// should be started (the session was idle).
    pub(crate) fn enqueue(
        &self,
        id: &SessionId,
        prompt: PendingPrompt,
    ) -> Result<bool, SessionError> {
        let (should_pump, snapshot) = {
            let mut registry = self.registry.lock().unwrap();
            let session = registry
                .sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            if session.down {
                return Err(SessionError::Closed(id.clone()));
            }
            if session.queue.len() >= self.config.queue.max_per_session {
                return Err(SessionError::QueueFull(id.clone()));
            }
            session.queue.push_back(prompt);
            session.updated_at = now_epoch();
            let should_pump = !session.pump_active;
            if should_pump {
                session.pump_active = true;
            }
            (should_pump, session.snapshot())
        };

        self.persist();
        self.publish(&snapshot);
        Ok(should_pump)
    }

    /// Pop the next prompt for dispatch, marking the session busy. Returns
    /// `None` (and parks the pump) when the queue is empty or the session
    /// is gone.
    pub(crate) fn begin_next(&self, id: &SessionId) -> Option<(PendingPrompt, RunContext)> {
        let (result, snapshot) = {
            let mut registry = self.registry.lock().unwrap();
            let session = registry.sessions.get_mut(id)?;
            match session.queue.pop_front() {
                Some(prompt) => {
                    session.busy = true;
                    session.last_prompt_at = Some(now_epoch());
                    let ctx = RunContext {
                        tool: session.tool.clone(),
                        workdir: session.workdir.clone(),
                        mode: session.mode,
                        resume_token: session.resume_token.clone(),
                        driver: session.driver.clone(),
                        transcript: Arc::clone(&session.transcript),
                    };
                    (Some((prompt, ctx)), session.snapshot())
                }
                None => {
                    session.busy = false;
                    session.pump_active = false;
                    (None, session.snapshot())
                }
            }
        };
        self.publish(&snapshot);
        result
    }

    /// Record the outcome of a finished prompt.
    pub(crate) fn complete_prompt(&self, id: &SessionId, update: PromptUpdate) {
        let snapshot = {
            let mut registry = self.registry.lock().unwrap();
            let Some(session) = registry.sessions.get_mut(id) else {
                return;
            };
            session.busy = false;
            if update.resume_token.is_some() {
                session.resume_token = update.resume_token;
            }
            if update.summary.is_some() {
                session.summary = update.summary;
            }
            session.last_output_bytes = update.output_bytes;
            session.elapsed_ms_last = update.elapsed_ms;
            session.updated_at = now_epoch();
            session.snapshot()
        };
        self.persist();
        self.publish(&snapshot);
    }

    pub(crate) fn attach_driver(&self, id: &SessionId, driver: Arc<InteractiveDriver>) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(session) = registry.sessions.get_mut(id) {
            session.driver = Some(driver);
        }
    }

    pub(crate) fn take_driver(&self, id: &SessionId) -> Option<Arc<InteractiveDriver>> {
        let mut registry = self.registry.lock().unwrap();
        registry.sessions.get_mut(id).and_then(|s| s.driver.take())
    }

    /// Interactive spawn failed: fall back to one-shot runs for the rest of
    /// this session's life.
    pub(crate) fn degrade_to_headless(&self, id: &SessionId) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(session) = registry.sessions.get_mut(id) {
            session.mode = ToolMode::Headless;
        }
    }

    /// Driver failure: the session goes down and stays down until it is
    /// recreated. Returns the drained queue and the dead driver.
    pub(crate) fn mark_down(
        &self,
        id: &SessionId,
    ) -> (Vec<PendingPrompt>, Option<Arc<InteractiveDriver>>) {
        let (drained, driver, snapshot) = {
            let mut registry = self.registry.lock().unwrap();
            let Some(session) = registry.sessions.get_mut(id) else {
                return (Vec::new(), None);
            };
            session.down = true;
            session.busy = false;
            session.pump_active = false;
            let drained: Vec<PendingPrompt> = session.queue.drain(..).collect();
            let driver = session.driver.take();
            (drained, driver, session.snapshot())
        };
        self.persist();
        self.publish(&snapshot);
        (drained, driver)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write the current registry to the state file. Failures are logged;
    /// the in-memory registry stays authoritative and the next mutation
    /// rewrites the file in full.
    fn persist(&self) {
        let doc = {
            let registry = self.registry.lock().unwrap();
            let mut doc = StateDoc::default();
            for (id, session) in &registry.sessions {
                doc.sessions.insert(
                    id.0.clone(),
                    PersistedSession {
                        tool: session.tool.name.clone(),
                        workdir: session.workdir.display().to_string(),
                        resume_token: session.resume_token.clone(),
                        name: session.name.clone(),
                        summary: session.summary.clone(),
                        updated_at: session.updated_at,
                    },
                );
            }
            doc.active = registry.active.as_ref().and_then(|id| {
                registry.sessions.get(id).map(|session| PersistedActive {
                    session_id: Some(id.0.clone()),
                    tool: session.tool.name.clone(),
                    workdir: session.workdir.display().to_string(),
                    updated_at: session.updated_at,
                })
            });
            doc
        };
        if let Err(e) = self.store.save(&doc) {
            log::warn!("state persistence failed (will retry on next mutation): {e}");
        }
    }

    fn mutate(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session),
    ) -> Result<SessionSnapshot, SessionError> {
        let mut registry = self.registry.lock().unwrap();
        let session = registry
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        f(session);
        session.updated_at = now_epoch();
        Ok(session.snapshot())
    }

    fn publish(&self, snapshot: &SessionSnapshot) {
        self.events.publish(&session_topic(&snapshot.id.0), snapshot);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Destination;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> Arc<AppConfig> {
        let mut tools = HashMap::new();
        tools.insert(
            "echo".to_string(),
            ToolConfig::new(
                "echo",
                ToolMode::Headless,
                vec!["echo".to_string(), "{prompt}".to_string()],
            ),
        );
        Arc::new(AppConfig {
            tools,
            defaults: crate::config::Defaults {
                workdir: dir.to_path_buf(),
                state_path: dir.join("state.json"),
                toolhelp_path: dir.join("toolhelp.json"),
                log_dir: None,
                idle_timeout_sec: 100,
                headless_timeout_sec: 600,
                output: Default::default(),
            },
            rpc: Default::default(),
            queue: crate::config::QueueConfig { max_per_session: 2 },
        })
    }

    fn manager(dir: &Path) -> Arc<SessionManager> {
        SessionManager::new(test_config(dir), Arc::new(EventBus::new()))
    }

    fn prompt() -> PendingPrompt {
        PendingPrompt {
            text: "hi".to_string(),
            image_path: None,
            destination: Destination::Rpc,
            timeout: None,
            cancel: crate::driver::CancelHandle::new(),
            responder: None,
        }
    }

    #[test]
    fn create_and_list() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());

        let snap = m.create("echo", dir.path(), Some("main".to_string())).unwrap();
        assert_eq!(snap.tool, "echo");
        assert_eq!(snap.name.as_deref(), Some("main"));

        let listed = m.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, snap.id);
        assert_eq!(m.active(), Some(snap.id));
    }

    #[test]
    fn create_unknown_tool_is_rejected() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        let err = m.create("ghost", dir.path(), None).unwrap_err();
        assert!(matches!(err, SessionError::UnknownTool(_)));
    }

    #[test]
    fn create_bad_workdir_is_rejected() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        let err = m
            .create("echo", Path::new("/definitely/not/a/dir"), None)
            .unwrap_err();
        assert!(matches!(err, SessionError::BadWorkdir(_)));

        let err = m.create("echo", Path::new("relative/dir"), None).unwrap_err();
        assert!(matches!(err, SessionError::BadWorkdir(_)));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        m.create("echo", dir.path(), None).unwrap();
        let err = m.create("echo", dir.path(), None).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(_)));
    }

    #[test]
    fn state_survives_restart() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        let id = {
            let m = SessionManager::new(config.clone(), Arc::new(EventBus::new()));
            let snap = m.create("echo", dir.path(), Some("named".to_string())).unwrap();
            m.set_resume(&snap.id, Some("tok-9".to_string())).unwrap();
            snap.id
        };

        let m = SessionManager::new(config, Arc::new(EventBus::new()));
        let listed = m.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].name.as_deref(), Some("named"));
        assert!(listed[0].has_resume_token);
        // Restored sessions come back idle.
        assert!(!listed[0].busy);
        assert_eq!(listed[0].queue_len, 0);
        assert_eq!(listed[0].driver_state, "absent");
        // The active selection survived too.
        assert_eq!(m.active(), Some(id));
    }

    #[test]
    fn stale_active_selection_is_cleared_on_restart() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        // Craft a state file whose active id references no session.
        let store = StateStore::new(config.defaults.state_path.clone());
        let mut doc = StateDoc::default();
        doc.active = Some(PersistedActive {
            session_id: Some("gone".to_string()),
            tool: "echo".to_string(),
            workdir: "/tmp".to_string(),
            updated_at: 1.0,
        });
        store.save(&doc).unwrap();

        let m = SessionManager::new(config, Arc::new(EventBus::new()));
        assert!(m.active().is_none());
    }

    #[test]
    fn sessions_with_unknown_tools_are_dropped_on_restart() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        let store = StateStore::new(config.defaults.state_path.clone());
        let mut doc = StateDoc::default();
        doc.sessions.insert(
            "sid-1".to_string(),
            PersistedSession {
                tool: "removed-tool".to_string(),
                workdir: "/tmp".to_string(),
                resume_token: None,
                name: None,
                summary: None,
                updated_at: 1.0,
            },
        );
        store.save(&doc).unwrap();

        let m = SessionManager::new(config, Arc::new(EventBus::new()));
        assert!(m.list().is_empty());
    }

    #[test]
    fn rename_and_set_resume_roundtrip_through_disk() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let m = SessionManager::new(config.clone(), Arc::new(EventBus::new()));
        let snap = m.create("echo", dir.path(), None).unwrap();

        m.rename(&snap.id, Some("renamed".to_string())).unwrap();
        m.set_resume(&snap.id, Some("tok".to_string())).unwrap();

        let store = StateStore::new(config.defaults.state_path.clone());
        let doc = store.load().unwrap();
        let entry = doc.sessions.get(&snap.id.0).unwrap();
        assert_eq!(entry.name.as_deref(), Some("renamed"));
        assert_eq!(entry.resume_token.as_deref(), Some("tok"));
    }

    #[test]
    fn close_removes_and_clears_active() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        let snap = m.create("echo", dir.path(), None).unwrap();

        m.close(&snap.id).unwrap();
        assert!(m.list().is_empty());
        assert!(m.active().is_none());
        assert!(matches!(
            m.close(&snap.id).unwrap_err(),
            SessionError::NotFound(_)
        ));
    }

    #[test]
    fn hooks_fire_in_order() {
        struct Recorder(Mutex<Vec<String>>);
        impl SessionHooks for Recorder {
            fn on_create(&self, snap: &SessionSnapshot) -> Result<(), String> {
                self.0.lock().unwrap().push(format!("create:{}", snap.tool));
                Ok(())
            }
            fn before_close(&self, _id: &SessionId) -> Result<(), String> {
                self.0.lock().unwrap().push("before_close".to_string());
                Ok(())
            }
            fn after_close(&self, _id: &SessionId) -> Result<(), String> {
                self.0.lock().unwrap().push("after_close".to_string());
                Ok(())
            }
        }

        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        m.set_hooks(recorder.clone());

        let snap = m.create("echo", dir.path(), None).unwrap();
        m.close(&snap.id).unwrap();

        let calls = recorder.0.lock().unwrap().clone();
        assert_eq!(calls, vec!["create:echo", "before_close", "after_close"]);
    }

    #[test]
    fn hook_errors_do_not_block_operations() {
        struct Failing;
        impl SessionHooks for Failing {
            fn on_create(&self, _snap: &SessionSnapshot) -> Result<(), String> {
                Err("hook exploded".to_string())
            }
        }

        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        m.set_hooks(Arc::new(Failing));
        assert!(m.create("echo", dir.path(), None).is_ok());
    }

    #[test]
    fn enqueue_respects_the_queue_cap() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        let snap = m.create("echo", dir.path(), None).unwrap();

        // First enqueue asks for a pump; drain nothing so prompts pile up.
        assert!(m.enqueue(&snap.id, prompt()).unwrap());
        assert!(!m.enqueue(&snap.id, prompt()).unwrap());
        // Cap is 2 in the test config.
        assert!(matches!(
            m.enqueue(&snap.id, prompt()).unwrap_err(),
            SessionError::QueueFull(_)
        ));

        // A dequeue frees a slot again.
        assert!(m.begin_next(&snap.id).is_some());
        assert!(!m.enqueue(&snap.id, prompt()).unwrap());
    }

    #[test]
    fn begin_next_drains_in_fifo_order_and_parks() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        let snap = m.create("echo", dir.path(), None).unwrap();

        let mut first = prompt();
        first.text = "first".to_string();
        let mut second = prompt();
        second.text = "second".to_string();
        m.enqueue(&snap.id, first).unwrap();
        m.enqueue(&snap.id, second).unwrap();

        let (p1, _) = m.begin_next(&snap.id).unwrap();
        assert_eq!(p1.text, "first");
        assert!(m.snapshot(&snap.id).unwrap().busy);

        let (p2, _) = m.begin_next(&snap.id).unwrap();
        assert_eq!(p2.text, "second");

        assert!(m.begin_next(&snap.id).is_none());
        let parked = m.snapshot(&snap.id).unwrap();
        assert!(!parked.busy);
    }

    #[test]
    fn mark_down_drains_and_rejects_enqueues() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        let snap = m.create("echo", dir.path(), None).unwrap();

        m.enqueue(&snap.id, prompt()).unwrap();
        let (drained, driver) = m.mark_down(&snap.id);
        assert_eq!(drained.len(), 1);
        assert!(driver.is_none());

        assert!(matches!(
            m.enqueue(&snap.id, prompt()).unwrap_err(),
            SessionError::Closed(_)
        ));
        assert!(m.snapshot(&snap.id).unwrap().down);
    }

    #[test]
    fn resolve_prefers_explicit_extant_id() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("other");
        std::fs::create_dir(&sub).unwrap();
        let m = manager(dir.path());

        let a = m.create("echo", dir.path(), None).unwrap();
        let b = m.create("echo", &sub, None).unwrap();
        // b is active now.
        assert_eq!(m.active(), Some(b.id.clone()));

        assert_eq!(m.resolve(Some(&a.id.0)), Some(a.id));
        assert_eq!(m.resolve(Some("bogus")), Some(b.id.clone()));
        assert_eq!(m.resolve(None), Some(b.id));
    }

    #[test]
    fn complete_prompt_updates_stats_and_token() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        let snap = m.create("echo", dir.path(), None).unwrap();

        m.enqueue(&snap.id, prompt()).unwrap();
        m.begin_next(&snap.id).unwrap();
        m.complete_prompt(
            &snap.id,
            PromptUpdate {
                resume_token: Some("tok-z".to_string()),
                summary: Some("short preview".to_string()),
                output_bytes: 123,
                elapsed_ms: 456,
            },
        );

        let after = m.snapshot(&snap.id).unwrap();
        assert!(!after.busy);
        assert!(after.has_resume_token);
        assert_eq!(after.last_output_bytes, 123);
        assert_eq!(after.elapsed_ms_last, 456);
    }
}
