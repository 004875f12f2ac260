//! The persisted session-state document.
//!
//! # Shape
//!
//! ```json
//! {
//!   "_active": {
//!     "session_id": "…", "tool": "…", "workdir": "…", "updated_at": 0.0
//!   },
//!   "_sessions": {
//!     "<session_id>": {
//!       "tool": "…", "workdir": "…", "resume_token": "…",
//!       "name": "…", "summary": "…", "updated_at": 0.0
//!     }
//!   }
//! }
//! ```
//!
//! An older layout keyed sessions at the top level as `"{tool}::{workdir}"`.
//! That layout is accepted on read (ids are re-derived as fingerprints) and
//! replaced by the shape above on the first write.

use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Error type for state-file operations.
#[derive(Debug)]
pub enum StateError {
    /// IO error
    Io(std::io::Error),
    /// JSON error
    Json(serde_json::Error),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Io(e) => write!(f, "IO error: {e}"),
            StateError::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for StateError {}

impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self {
        StateError::Io(e)
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Json(e)
    }
}

/// One session's durable metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub tool: String,
    pub workdir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub updated_at: f64,
}

/// The active-selection record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedActive {
    /// Older documents recorded only tool/workdir; the id is optional on
    /// read and always written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub tool: String,
    pub workdir: String,
    #[serde(default)]
    pub updated_at: f64,
}

/// The full state document. Sessions live in a `BTreeMap` so serialized key
/// order is stable across writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDoc {
    #[serde(rename = "_active", default, skip_serializing_if = "Option::is_none")]
    pub active: Option<PersistedActive>,
    #[serde(rename = "_sessions", default)]
    pub sessions: BTreeMap<String, PersistedSession>,
}

/// Serialized access to one state file.
///
/// All writes go through one in-process mutex; on top of that a
/// cross-process advisory `flock` guards every read and write, so a second
/// controller on the same file never observes a torn document.
pub struct StateStore {
    path: PathBuf,
    io: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current document. A missing or empty file yields the
    /// default (empty) document.
    pub fn load(&self) -> Result<StateDoc, StateError> {
        let _io = self.io.lock().unwrap();
        let _lock = FileLock::acquire(&self.lock_path())?;
        read_document(&self.path)
    }

    /// Replace the document on disk atomically.
    pub fn save(&self, doc: &StateDoc) -> Result<(), StateError> {
        let _io = self.io.lock().unwrap();
        let _lock = FileLock::acquire(&self.lock_path())?;
        let json = serde_json::to_string_pretty(doc)?;
        super::atomic_write(&self.path, &json)?;
        Ok(())
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }
}

fn read_document(path: &Path) -> Result<StateDoc, StateError> {
    if !path.exists() {
        return Ok(StateDoc::default());
    }
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(StateDoc::default());
    }
    let raw: serde_json::Value = serde_json::from_str(&contents)?;

    let mut doc = StateDoc::default();
    if let Some(active) = raw.get("_active") {
        if !active.is_null() {
            doc.active = serde_json::from_value(active.clone()).ok();
        }
    }
    if let Some(sessions) = raw.get("_sessions").and_then(|v| v.as_object()) {
        for (id, val) in sessions {
            if let Ok(entry) = serde_json::from_value::<PersistedSession>(val.clone()) {
                if !entry.tool.is_empty() && !entry.workdir.is_empty() {
                    doc.sessions.insert(id.clone(), entry);
                }
            }
        }
    }

    // Legacy top-level "{tool}::{workdir}" entries, honored only when no
    // per-session section exists. Ids are re-derived as fingerprints.
    if doc.sessions.is_empty() {
        if let Some(map) = raw.as_object() {
            for (key, val) in map {
                if key == "_active" || key == "_sessions" || !val.is_object() {
                    continue;
                }
                if let Ok(entry) = serde_json::from_value::<PersistedSession>(val.clone()) {
                    if !entry.tool.is_empty() && !entry.workdir.is_empty() {
                        let id =
                            SessionId::fingerprint(&entry.tool, Path::new(&entry.workdir));
                        doc.sessions.insert(id.0, entry);
                    }
                }
            }
        }
    }

    Ok(doc)
}

/// Cross-process advisory lock on a sibling `.lock` file. Held for the
/// lifetime of the guard; releasing the fd drops the lock.
struct FileLock {
    _file: std::fs::File,
}

impl FileLock {
    #[cfg(unix)]
    fn acquire(path: &Path) -> std::io::Result<Self> {
        use std::os::unix::io::AsRawFd;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { _file: file })
    }

    #[cfg(not(unix))]
    fn acquire(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        Ok(Self { _file: file })
    }
}

// ============================================================================
// TESTS
// ============================================================================
