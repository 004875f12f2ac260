//! Typed configuration consumed by the core.
//!
//! The core never parses a config file itself; the host hands in a fully
//! typed [`AppConfig`]. Unknown fields are rejected at deserialization time
//! so stale host configs fail loudly instead of being silently ignored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// How a tool's subprocess is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    /// One subprocess per prompt; exits when the answer is complete.
    Headless,
    /// A persistent subprocess under a pty, reused across prompts.
    Interactive,
}

/// Immutable per-tool template.
///
/// `cmd_template` cells may contain the placeholders `{prompt}`, `{resume}`
/// and `{image}`; substitution rules live in [`crate::command`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    pub name: String,
    pub mode: ToolMode,
    pub cmd_template: Vec<String>,
    #[serde(default)]
    pub interactive_cmd_template: Option<Vec<String>>,
    #[serde(default)]
    pub resume_cmd_template: Option<Vec<String>>,
    #[serde(default)]
    pub image_arg_template: Option<Vec<String>>,
    #[serde(default)]
    pub help_cmd_template: Option<Vec<String>>,
    /// Signals the tool is idle and ready for input (interactive only).
    #[serde(default)]
    pub prompt_regex: Option<String>,
    /// First capture group yields the resume token.
    #[serde(default)]
    pub resume_regex: Option<String>,
    /// Substrings that prove the subprocess is still making progress.
    #[serde(default)]
    pub activity_tokens: Vec<String>,
    /// Environment for the subprocess; values may use `${VAR}` indirection.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Lines sent once, right after the first prompt is observed.
    #[serde(default)]
    pub auto_commands: Vec<String>,
    /// Line written to request a clean exit before force-terminating.
    #[serde(default)]
    pub exit_command: Option<String>,
}

impl ToolConfig {
    /// Minimal tool definition; the builder-ish setters below cover the rest.
    pub fn new(name: impl Into<String>, mode: ToolMode, cmd_template: Vec<String>) -> Self {
        Self {
            name: name.into(),
            mode,
            cmd_template,
            interactive_cmd_template: None,
            resume_cmd_template: None,
            image_arg_template: None,
            help_cmd_template: None,
            prompt_regex: None,
            resume_regex: None,
            activity_tokens: Vec::new(),
            env: HashMap::new(),
            auto_commands: Vec::new(),
            exit_command: None,
        }
    }

    pub fn prompt_regex(mut self, pattern: impl Into<String>) -> Self {
        self.prompt_regex = Some(pattern.into());
        self
    }

    pub fn resume_regex(mut self, pattern: impl Into<String>) -> Self {
        self.resume_regex = Some(pattern.into());
        self
    }
}

/// Output pipeline thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Outputs at or under this many characters are sent inline.
    #[serde(default = "default_inline_limit")]
    pub inline_limit: usize,
    /// Leading characters kept in an artifact preview.
    #[serde(default = "default_head_chars")]
    pub head_chars: usize,
    /// Trailing characters kept in an artifact preview.
    #[serde(default = "default_tail_chars")]
    pub tail_chars: usize,
    /// Coalescing window for inline flushes.
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
}

fn default_inline_limit() -> usize {
    3500
}
fn default_head_chars() -> usize {
    1000
}
fn default_tail_chars() -> usize {
    2000
}
fn default_flush_delay_ms() -> u64 {
    500
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            inline_limit: default_inline_limit(),
            head_chars: default_head_chars(),
            tail_chars: default_tail_chars(),
            flush_delay_ms: default_flush_delay_ms(),
        }
    }
}

/// Controller-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Root under which session workdirs are expected to live.
    pub workdir: PathBuf,
    /// Persisted session state document.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Tool-help cache document.
    #[serde(default = "default_toolhelp_path")]
    pub toolhelp_path: PathBuf,
    /// Per-session transcript logs land here; absent disables transcripts.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Interactive stall watchdog window, seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_sec: u64,
    /// Headless run budget, seconds.
    #[serde(default = "default_headless_timeout")]
    pub headless_timeout_sec: u64,
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state.json")
}
fn default_toolhelp_path() -> PathBuf {
    PathBuf::from("toolhelp.json")
}
fn default_idle_timeout() -> u64 {
    100
}
fn default_headless_timeout() -> u64 {
    600
}

/// RPC bridge listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rpc_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_rpc_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_rpc_host(),
            port: 0,
            token: None,
        }
    }
}

/// Queue limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Soft cap per session; enqueues past it are rejected.
    #[serde(default = "default_max_per_session")]
    pub max_per_session: usize,
}

fn default_max_per_session() -> usize {
    16
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_per_session: default_max_per_session(),
        }
    }
}

/// Root configuration record handed to the core at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub tools: HashMap<String, ToolConfig>,
    pub defaults: Defaults,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl AppConfig {
    pub fn tool(&self, name: &str) -> Option<&ToolConfig> {
        self.tools.get(name)
    }
}

/// Expand `${VAR}` references in a tool env value against the process
/// environment. Unknown variables are left untouched so typos stay visible.
pub fn resolve_env_value(value: &str) -> String {
    if !value.contains("${") {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                match std::env::var(var) {
                    Ok(v) => out.push_str(&v),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(var);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// ============================================================================
// TESTS
// ============================================================================
