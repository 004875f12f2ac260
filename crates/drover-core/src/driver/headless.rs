//! Headless driver: one subprocess per prompt.
//!
//! The command template is materialized with the prompt (and optional
//! resume token / image path), the process runs to completion in the
//! session's workdir, and combined stdout+stderr is collected. The only
//! stream analysis is resume-token extraction; completion is the process
//! exiting, not a prompt appearing.

use super::{CancelHandle, DriverReply};
use crate::ansi::strip_ansi;
use crate::command::{build_command, resolve_tool_env};
use crate::config::ToolConfig;
use crate::error::PromptFailure;
use crate::matcher::detect_resume_regex;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Grace between polite and forceful signals when a run is terminated.
const TERM_GRACE: Duration = Duration::from_millis(300);

/// How long after the pipes close we wait for the exit status.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Run one prompt through a headless tool.
pub async fn run_headless(
    tool: &ToolConfig,
    workdir: &Path,
    prompt: &str,
    resume_token: Option<&str>,
    image: Option<&Path>,
    budget: Duration,
    cancel: &CancelHandle,
) -> Result<DriverReply, PromptFailure> {
    let template = select_template(tool, resume_token, image.is_some());
    let image_str = image.map(|p| p.display().to_string());
    let built = build_command(&template, prompt, resume_token, image_str.as_deref());
    if built.argv.is_empty() {
        return Err(PromptFailure::spawn(format!(
            "tool {} has an empty command template",
            tool.name
        )));
    }

    let started = Instant::now();
    let stdin_text = built.use_stdin.then(|| format!("{prompt}\n"));
    let (output, exit_code) =
        capture_run(&built.argv, tool, workdir, stdin_text, budget, cancel).await?;

    let text = String::from_utf8_lossy(&output).into_owned();
    let resume = extract_resume_token(tool, &text);
    log::info!(
        "headless run done tool={} exit={:?} bytes={} elapsed_ms={}",
        tool.name,
        exit_code,
        output.len(),
        started.elapsed().as_millis()
    );

    Ok(DriverReply {
        text,
        raw: output,
        resume_token: resume,
        exit_code,
        elapsed: started.elapsed(),
    })
}

/// Fetch a tool's help output by running its `help_cmd_template` headlessly.
pub async fn run_tool_help(
    tool: &ToolConfig,
    workdir: &Path,
    budget: Duration,
) -> Result<String, PromptFailure> {
    let Some(ref template) = tool.help_cmd_template else {
        return Err(PromptFailure::spawn(format!(
            "tool {} has no help command",
            tool.name
        )));
    };
    if template.is_empty() {
        return Err(PromptFailure::spawn(format!(
            "tool {} has an empty help command",
            tool.name
        )));
    }
    let cancel = CancelHandle::new();
    let (output, _) = capture_run(template, tool, workdir, None, budget, &cancel).await?;
    let text = strip_ansi(&String::from_utf8_lossy(&output));
    Ok(text.trim().to_string())
}

fn select_template(tool: &ToolConfig, resume: Option<&str>, with_image: bool) -> Vec<String> {
    let mut base = if resume.is_some() && tool.resume_cmd_template.is_some() {
        tool.resume_cmd_template.clone().unwrap()
    } else {
        tool.cmd_template.clone()
    };
    if with_image {
        if let Some(ref image_args) = tool.image_arg_template {
            base.extend(image_args.iter().cloned());
        }
    }
    base
}

fn extract_resume_token(tool: &ToolConfig, text: &str) -> Option<String> {
    let clean = strip_ansi(text);
    let pattern = match tool.resume_regex {
        Some(ref p) => p.clone(),
        // Tools without a configured pattern still get well-known shapes
        // probed against their output.
        None => detect_resume_regex(&clean)?.to_string(),
    };
    let regex = Regex::new(&pattern).ok()?;
    regex
        .captures_iter(&clean)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Spawn `argv`, optionally feed stdin, and collect combined stdout+stderr
/// until exit, budget expiry or cancellation.
async fn capture_run(
    argv: &[String],
    tool: &ToolConfig,
    workdir: &Path,
    stdin_text: Option<String>,
    budget: Duration,
    cancel: &CancelHandle,
) -> Result<(Vec<u8>, Option<i32>), PromptFailure> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(workdir)
        .envs(resolve_tool_env(tool))
        .stdin(if stdin_text.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| PromptFailure::spawn(format!("{}: {e}", argv[0])))?;

    if let Some(text) = stdin_text {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| PromptFailure::spawn(format!("stdin write failed: {e}")))?;
            // Dropping closes the pipe so line-reading tools see EOF.
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, tx);
    }

    let mut output = Vec::new();
    let deadline = tokio::time::sleep(budget);
    tokio::pin!(deadline);

    // Exit is observed as both pipes reaching EOF; a process that exits
    // while a descendant holds them open is caught by the budget instead.
    let exit_code = loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(bytes) => output.extend_from_slice(&bytes),
                None => {
                    match timeout(DRAIN_GRACE, child.wait()).await {
                        Ok(Ok(status)) => break status.code(),
                        Ok(Err(e)) => {
                            return Err(PromptFailure::spawn(format!("wait failed: {e}")));
                        }
                        Err(_) => {
                            terminate(&mut child).await;
                            break None;
                        }
                    }
                }
            },
            _ = &mut deadline => {
                terminate(&mut child).await;
                return Err(PromptFailure::timeout(format!(
                    "no completion within {}ms", budget.as_millis()
                )));
            }
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(PromptFailure::cancelled("run terminated by caller"));
            }
        }
    };

    Ok((output, exit_code))
}

fn spawn_reader<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncReadExt;
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Polite-then-forceful termination of the whole process group.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::killpg(pid as i32, libc::SIGINT);
            libc::killpg(pid as i32, libc::SIGTERM);
        }
        if timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
}

// ============================================================================
// TESTS
// ============================================================================
