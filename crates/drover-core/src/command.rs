//! Argv template materialization.
//!
//! Tool commands are argv templates with `{prompt}`, `{resume}` and
//! `{image}` placeholders. Substitution never goes through a shell; when a
//! placeholder sits inside a larger cell (e.g. `sh -c "tool '{prompt}'"`),
//! the value is shell-quoted first because that cell will be re-split by
//! the tool's own shell.

use crate::config::{resolve_env_value, ToolConfig};
use std::borrow::Cow;

/// A materialized command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
    pub argv: Vec<String>,
    /// True when the template had no `{prompt}` cell: the prompt is then
    /// written to the subprocess stdin instead.
    pub use_stdin: bool,
}

/// Substitute placeholders into `template`.
///
/// Rules, matching the controller's historical behavior:
/// - A cell containing `{prompt}` gets the prompt substituted; if any cell
///   did, stdin is not used.
/// - A `{resume}` cell is dropped when no token is present; a bare
///   `--resume` flag with no token drops its following value cell too.
/// - `--continue` cells are dropped when a resume token is present (the
///   token already pins the conversation).
/// - `{image}` cells are dropped (or blanked in-cell) when no image path
///   accompanies the prompt.
pub fn build_command(
    template: &[String],
    prompt: &str,
    resume: Option<&str>,
    image: Option<&str>,
) -> BuiltCommand {
    let mut argv = Vec::with_capacity(template.len());
    let mut replaced_prompt = false;
    let mut skip_next = false;

    for part in template {
        if skip_next {
            skip_next = false;
            continue;
        }
        if resume.is_some() && part == "--continue" {
            continue;
        }
        if part.contains("{resume}") {
            match resume {
                Some(token) => argv.push(substitute(part, "{resume}", token)),
                None => continue,
            }
            continue;
        }
        if part.contains("{image}") {
            match image {
                Some(path) => argv.push(substitute(part, "{image}", path)),
                None => {
                    if part != "{image}" {
                        argv.push(part.replace("{image}", ""));
                    }
                }
            }
            continue;
        }
        if part == "--resume" && resume.is_none() {
            skip_next = true;
            continue;
        }
        if part.contains("{prompt}") {
            argv.push(substitute(part, "{prompt}", prompt));
            replaced_prompt = true;
            continue;
        }
        argv.push(part.clone());
    }

    BuiltCommand {
        argv,
        use_stdin: !replaced_prompt,
    }
}

/// Replace `placeholder` in `cell`. Values going into a composite cell are
/// shell-quoted; a cell that is exactly the placeholder takes the value raw.
fn substitute(cell: &str, placeholder: &str, value: &str) -> String {
    if cell == placeholder {
        return value.to_string();
    }
    let quoted = shlex::try_quote(value).unwrap_or(Cow::Borrowed(value));
    cell.replace(placeholder, &quoted)
}

/// Resolve a tool's env map, expanding `${VAR}` indirections.
pub fn resolve_tool_env(tool: &ToolConfig) -> Vec<(String, String)> {
    tool.env
        .iter()
        .map(|(k, v)| (k.clone(), resolve_env_value(v)))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
