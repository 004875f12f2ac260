//! Tool-help cache.
//!
//! Help output fetched from a tool (`help_cmd_template`) is cached in a
//! single JSON document keyed by tool name, so chat surfaces can show it
//! without re-running the tool.

use super::{atomic_write, now_epoch, StateError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolHelpEntry {
    pub tool: String,
    pub content: String,
    pub updated_at: f64,
}

pub type ToolHelpCache = BTreeMap<String, ToolHelpEntry>;

/// Load the cache; a missing or empty file yields an empty cache.
pub fn load_toolhelp(path: &Path) -> Result<ToolHelpCache, StateError> {
    if !path.exists() {
        return Ok(ToolHelpCache::new());
    }
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(ToolHelpCache::new());
    }
    Ok(serde_json::from_str(&contents)?)
}

pub fn save_toolhelp(path: &Path, cache: &ToolHelpCache) -> Result<(), StateError> {
    let json = serde_json::to_string_pretty(cache)?;
    atomic_write(path, &json)?;
    Ok(())
}

/// Upsert one tool's help text, stamping the update time.
pub fn update_toolhelp(path: &Path, tool: &str, content: &str) -> Result<(), StateError> {
    let mut cache = load_toolhelp(path)?;
    cache.insert(
        tool.to_string(),
        ToolHelpEntry {
            tool: tool.to_string(),
            content: content.to_string(),
            updated_at: now_epoch(),
        },
    );
    save_toolhelp(path, &cache)
}

pub fn get_toolhelp(path: &Path, tool: &str) -> Result<Option<ToolHelpEntry>, StateError> {
    Ok(load_toolhelp(path)?.remove(tool))
}

// ============================================================================
// TESTS
// ============================================================================
