//! Persistence layer for session state and the tool-help cache.
//!
//! # Files
//!
//! - **State document** (`state.json` by default) — sessions and the active
//!   selection, shape described in [`state`].
//! - **Tool-help cache** (`toolhelp.json` by default) — per-tool help text
//!   with update timestamps.
//!
//! # Design
//!
//! All saves are atomic: write to a sibling `.tmp` file, fsync, rename.
//! The state document additionally takes a cross-process advisory `flock`
//! for both reads and writes, so two controller instances sharing one state
//! file always observe complete snapshots. Persistence failures are
//! reported to callers but never abort control flow upstream; the in-memory
//! registry stays authoritative and the next mutation rewrites the file in
//! full.

pub mod state;
pub mod toolhelp;

pub use state::{PersistedActive, PersistedSession, StateDoc, StateError, StateStore};
pub use toolhelp::{load_toolhelp, save_toolhelp, update_toolhelp, ToolHelpEntry};

use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Wall-clock seconds since the Unix epoch, the on-disk timestamp format.
pub(crate) fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Write `contents` to `path` atomically: sibling temp file, fsync, rename.
pub(crate) fn atomic_write(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp);

    let mut file = File::create(&tmp_path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
