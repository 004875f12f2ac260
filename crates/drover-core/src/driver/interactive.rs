//! Interactive driver: a persistent subprocess under a pseudo-terminal.
//!
//! One driver owns one pty and the tool process inside it. A blocking
//! reader thread streams pty output into a channel; the async side feeds
//! the stream matcher and runs the turn state machine:
//!
//! ```text
//! Spawning ──prompt──▶ Ready
//! Ready ──submit()──▶ Writing ──write done──▶ AwaitingPrompt
//! AwaitingPrompt ──prompt──▶ Ready
//! any ──process loss──▶ Failed      any ──close()──▶ Closed
//! ```
//!
//! Only one logical task drives a given driver (the session's dispatcher
//! pump); the internal locks exist for the snapshot readers, not for
//! concurrent submitters.

use super::{DriverReply, DriverState};
use crate::command::resolve_tool_env;
use crate::config::ToolConfig;
use crate::error::{FailureKind, PromptFailure};
use crate::matcher::{detect_prompt_regex, StreamMatcher};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use regex::Regex;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Chunk polling granularity while awaiting a prompt.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Per-command budget while replaying `auto_commands`.
const AUTO_COMMAND_BUDGET: Duration = Duration::from_secs(5);

/// Quiet window that ends a turn for tools without a prompt pattern; a
/// pattern is then autodetected from the collected output.
const AUTODETECT_IDLE: Duration = Duration::from_secs(2);

/// How long `close()` waits for a clean exit before killing.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

pub struct InteractiveDriver {
    tool_name: String,
    idle_timeout: Duration,
    exit_command: Option<String>,
    state: Mutex<DriverState>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    // The master must stay alive or the pty closes under the child.
    _master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    chunks: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    matcher: tokio::sync::Mutex<StreamMatcher>,
    resume_token: Mutex<Option<String>>,
}

impl InteractiveDriver {
    /// Spawn the tool under a pty and wait for its first prompt. Auto
    /// commands run once readiness is observed; the initial resume token,
    /// if the banner carries one, is recorded.
    pub async fn start(
        tool: &ToolConfig,
        workdir: &Path,
        idle_timeout: Duration,
    ) -> Result<Self, PromptFailure> {
        let matcher = StreamMatcher::for_tool(tool)
            .map_err(|e| PromptFailure::spawn(format!("bad pattern for {}: {e}", tool.name)))?;

        let template = tool
            .interactive_cmd_template
            .as_ref()
            .unwrap_or(&tool.cmd_template);
        if template.is_empty() {
            return Err(PromptFailure::spawn(format!(
                "tool {} has an empty interactive template",
                tool.name
            )));
        }

        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: 40,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PromptFailure::spawn(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(&template[0]);
        cmd.args(&template[1..]);
        cmd.cwd(workdir);
        for (key, value) in resolve_tool_env(tool) {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PromptFailure::spawn(format!("{}: {e}", template[0])))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PromptFailure::spawn(format!("pty reader unavailable: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PromptFailure::spawn(format!("pty writer unavailable: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let driver = Self {
            tool_name: tool.name.clone(),
            idle_timeout,
            exit_command: tool.exit_command.clone(),
            state: Mutex::new(DriverState::Spawning),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            _master: Mutex::new(Some(pair.master)),
            chunks: tokio::sync::Mutex::new(rx),
            matcher: tokio::sync::Mutex::new(matcher),
            resume_token: Mutex::new(None),
        };

        driver.await_prompt(driver.idle_timeout).await.map_err(|e| {
            driver.set_state(DriverState::Failed(e.kind));
            e
        })?;
        driver.set_state(DriverState::Ready);
        log::info!("interactive driver ready tool={}", driver.tool_name);

        for command in &tool.auto_commands {
            if driver.write_line(command).is_err() {
                break;
            }
            // Auto commands are best-effort; a silent one must not wedge
            // the spawn.
            let _ = driver.await_prompt(AUTO_COMMAND_BUDGET).await;
        }

        Ok(driver)
    }

    pub fn state(&self) -> DriverState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: DriverState) {
        *self.state.lock().unwrap() = state;
    }

    /// Latest resume token observed on the stream.
    pub fn resume_token(&self) -> Option<String> {
        self.resume_token.lock().unwrap().clone()
    }

    /// Write one prompt and wait for the tool's next idle prompt. The bytes
    /// in between are the response.
    pub async fn submit(&self, text: &str) -> Result<DriverReply, PromptFailure> {
        if self.state() != DriverState::Ready {
            return Err(PromptFailure::spawn(format!(
                "driver for {} is {}, not ready",
                self.tool_name,
                self.state()
            )));
        }
        let started = Instant::now();

        // Discard stream content from before this turn; stale prompt
        // redraws must not satisfy the upcoming wait. Tokens in the stale
        // tail were already recorded by previous observations.
        {
            let mut rx = self.chunks.lock().await;
            let mut matcher = self.matcher.lock().await;
            while let Ok(chunk) = rx.try_recv() {
                self.note_observed(&mut matcher, &chunk);
            }
            matcher.reset();
        }

        self.set_state(DriverState::Writing);
        if let Err(e) = self.write_line(text) {
            self.set_state(DriverState::Failed(FailureKind::Spawn));
            return Err(e);
        }

        self.set_state(DriverState::AwaitingPrompt);
        match self.await_prompt(self.idle_timeout).await {
            Ok(()) => {
                self.set_state(DriverState::Ready);
                let matcher = self.matcher.lock().await;
                let mut reply_text = matcher.response_text();
                // The pty echoes the submitted line back; drop it from the
                // front of the response.
                if let Some(rest) = reply_text.strip_prefix(text.trim_end()) {
                    reply_text = rest.trim_start_matches(['\r', '\n']).to_string();
                }
                Ok(DriverReply {
                    text: reply_text,
                    raw: matcher.raw().to_vec(),
                    resume_token: self.resume_token(),
                    exit_code: None,
                    elapsed: started.elapsed(),
                })
            }
            Err(e) => {
                self.set_state(DriverState::Failed(e.kind));
                Err(e)
            }
        }
    }

    /// Collect chunks until the prompt shows at the tail of the window.
    ///
    /// Tools without a prompt pattern fall back to a quiet-window turn end,
    /// after which a pattern is autodetected for subsequent turns.
    async fn await_prompt(&self, budget: Duration) -> Result<(), PromptFailure> {
        let started = Instant::now();
        let mut last_tick = started;
        let mut last_chunk = started;
        let mut rx = self.chunks.lock().await;
        let mut matcher = self.matcher.lock().await;

        loop {
            match timeout(POLL_SLICE, rx.recv()).await {
                Ok(Some(chunk)) => {
                    let observed = self.note_observed(&mut matcher, &chunk);
                    last_chunk = Instant::now();
                    if observed.activity {
                        last_tick = Instant::now();
                    }
                    if observed.prompt_ready {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    return Err(PromptFailure::spawn(format!(
                        "{} exited while a prompt was awaited",
                        self.tool_name
                    )));
                }
                Err(_) => {
                    if !matcher.has_prompt_regex() {
                        if last_chunk.elapsed() >= AUTODETECT_IDLE {
                            if let Some(pattern) = detect_prompt_regex(matcher.clean()) {
                                if let Ok(regex) = Regex::new(&pattern) {
                                    log::info!(
                                        "autodetected prompt pattern for {}: {pattern}",
                                        self.tool_name
                                    );
                                    matcher.set_prompt_regex(regex);
                                }
                            }
                            return Ok(());
                        }
                        continue;
                    }
                    if started.elapsed() >= budget && last_tick.elapsed() >= budget {
                        return Err(PromptFailure::stalled(format!(
                            "{} produced no prompt and no activity for {}ms",
                            self.tool_name,
                            budget.as_millis()
                        )));
                    }
                }
            }
        }
    }

    fn note_observed(
        &self,
        matcher: &mut StreamMatcher,
        chunk: &[u8],
    ) -> crate::matcher::Observed {
        let observed = matcher.observe(chunk);
        if let Some(ref token) = observed.resume_token {
            *self.resume_token.lock().unwrap() = Some(token.clone());
        }
        observed
    }

    fn write_line(&self, text: &str) -> Result<(), PromptFailure> {
        let mut guard = self.writer.lock().unwrap();
        let Some(ref mut writer) = *guard else {
            return Err(PromptFailure::spawn("pty writer is closed"));
        };
        writer
            .write_all(text.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush())
            .map_err(|e| PromptFailure::spawn(format!("pty write failed: {e}")))
    }

    /// Send a cancel (^C) to the subprocess. The turn in flight resolves
    /// when the next prompt appears; its output is discarded by the caller.
    pub fn interrupt(&self) {
        let mut guard = self.writer.lock().unwrap();
        if let Some(ref mut writer) = *guard {
            let _ = writer.write_all(b"\x03");
            let _ = writer.flush();
        }
    }

    /// Ask for a clean exit, wait briefly, then terminate and reap.
    pub fn close(&self) {
        self.set_state(DriverState::Closed);
        if let Some(ref exit_command) = self.exit_command {
            let _ = self.write_line(exit_command);
            std::thread::sleep(CLOSE_GRACE);
        }
        self.writer.lock().unwrap().take();
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let exited = matches!(child.try_wait(), Ok(Some(_)));
            if !exited {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        self._master.lock().unwrap().take();
    }
}

impl Drop for InteractiveDriver {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.lock().unwrap().take() {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
