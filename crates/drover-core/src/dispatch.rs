//! Prompt dispatching: one pump per session.
//!
//! Callers submit prompts and get a ticket; the session's pump task drains
//! the queue strictly in order, one prompt in flight at a time. Distinct
//! sessions pump concurrently and share nothing but the registry.
//!
//! ```text
//! Idle ──enqueue on empty──▶ Dispatching ──response──▶ Idle (next if any)
//! Dispatching ──timeout/cancel──▶ Idle (after the driver drains)
//! any ──driver failed──▶ Down (terminal until recreate)
//! ```

use crate::ansi::build_preview;
use crate::config::{AppConfig, ToolMode};
use crate::driver::headless::run_headless;
use crate::driver::interactive::InteractiveDriver;
use crate::driver::{CancelHandle, DriverState};
use crate::error::{FailureKind, PromptFailure, SessionError};
use crate::event_bus::{outcome_topic, EventBus};
use crate::output::{Destination, OutputPipeline};
use crate::session::manager::{PromptUpdate, RunContext, SUMMARY_MAX_CHARS};
use crate::session::{PendingPrompt, PromptResult, SessionId, SessionManager};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// After an interrupt, how long the driver gets to show a fresh prompt
/// before it is discarded outright.
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// A prompt submission.
pub struct PromptRequest {
    pub text: String,
    pub image_path: Option<PathBuf>,
    pub destination: Destination,
    /// Run budget; `None` uses the per-mode default from configuration.
    pub timeout: Option<Duration>,
}

impl PromptRequest {
    pub fn new(text: impl Into<String>, destination: Destination) -> Self {
        Self {
            text: text.into(),
            image_path: None,
            destination,
            timeout: None,
        }
    }
}

/// Handle returned to a submitter: the eventual result plus a cancel lever.
#[derive(Debug)]
pub struct SubmitTicket {
    pub session_id: SessionId,
    pub cancel: CancelHandle,
    pub result: oneshot::Receiver<PromptResult>,
}

/// Per-prompt outcome record published on the event bus.
#[derive(Debug, Clone, Serialize)]
pub struct PromptRecord {
    pub session_id: String,
    pub bytes_out: usize,
    pub elapsed_ms: u64,
    pub outcome: String,
}

pub struct Dispatcher {
    manager: Arc<SessionManager>,
    pipeline: Arc<OutputPipeline>,
    events: Arc<EventBus>,
    config: Arc<AppConfig>,
}

impl Dispatcher {
    pub fn new(
        manager: Arc<SessionManager>,
        pipeline: Arc<OutputPipeline>,
        events: Arc<EventBus>,
        config: Arc<AppConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            pipeline,
            events,
            config,
        })
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Enqueue a prompt. If the session was idle its pump starts now;
    /// otherwise the prompt waits its turn.
    pub fn submit(
        self: &Arc<Self>,
        id: &SessionId,
        request: PromptRequest,
    ) -> Result<SubmitTicket, SessionError> {
        let cancel = CancelHandle::new();
        let (tx, rx) = oneshot::channel();
        let pending = PendingPrompt {
            text: request.text,
            image_path: request.image_path,
            destination: request.destination,
            timeout: request.timeout,
            cancel: cancel.clone(),
            responder: Some(tx),
        };

        let should_pump = self.manager.enqueue(id, pending)?;
        if should_pump {
            let this = Arc::clone(self);
            let session_id = id.clone();
            tokio::spawn(async move {
                this.pump(session_id).await;
            });
        }

        Ok(SubmitTicket {
            session_id: id.clone(),
            cancel,
            result: rx,
        })
    }

    /// Drain one session's queue until it is empty or the session dies.
    async fn pump(self: Arc<Self>, id: SessionId) {
        while let Some((mut prompt, ctx)) = self.manager.begin_next(&id) {
            // Cancelled before dispatch: observationally equivalent to
            // never having been enqueued.
            if prompt.cancel.is_cancelled() {
                self.manager.complete_prompt(&id, PromptUpdate::noop(0));
                prompt.resolve(Err(PromptFailure::cancelled("cancelled before dispatch")));
                self.publish_outcome(&id, 0, 0, "cancelled");
                continue;
            }
            // A zero deadline times out without reaching the driver.
            if prompt.timeout == Some(Duration::ZERO) {
                self.manager.complete_prompt(&id, PromptUpdate::noop(0));
                prompt.resolve(Err(PromptFailure::timeout("deadline was zero")));
                self.publish_outcome(&id, 0, 0, "timeout");
                continue;
            }

            ctx.transcript.record_in(&prompt.text);
            let started = Instant::now();
            let result = match ctx.mode {
                ToolMode::Headless => self.run_headless_prompt(&prompt, &ctx).await,
                ToolMode::Interactive => {
                    self.run_interactive_prompt(&id, &mut prompt, &ctx).await
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(reply) => {
                    let summary = build_preview(&reply.text, SUMMARY_MAX_CHARS);
                    self.manager.complete_prompt(
                        &id,
                        PromptUpdate {
                            resume_token: reply.resume_token.clone(),
                            summary: Some(summary),
                            output_bytes: reply.raw.len(),
                            elapsed_ms,
                        },
                    );
                    ctx.transcript.record_out(&reply.text);
                    self.pipeline.emit(&prompt.destination, &id, &reply.raw);
                    self.publish_outcome(&id, reply.raw.len(), elapsed_ms, "ok");
                    prompt.resolve(Ok(reply));
                }
                Err(failure)
                    if matches!(failure.kind, FailureKind::Spawn | FailureKind::Stalled) =>
                {
                    // Driver-level failure: the session goes down and the
                    // rest of the queue fails with it. No auto-restart.
                    ctx.transcript.record_note(&failure.message);
                    self.publish_outcome(&id, 0, elapsed_ms, failure.kind.token());
                    prompt.resolve(Err(failure));

                    let (drained, driver) = self.manager.mark_down(&id);
                    if let Some(driver) = driver {
                        driver.close();
                    }
                    for mut queued in drained {
                        queued.resolve(Err(PromptFailure::session_down(
                            "session failed before this prompt ran",
                        )));
                        self.publish_outcome(&id, 0, 0, "session-down");
                    }
                    return;
                }
                Err(failure) => {
                    // Timeout or cancellation: the session stays up.
                    ctx.transcript.record_note(&failure.message);
                    self.manager.complete_prompt(&id, PromptUpdate::noop(elapsed_ms));
                    self.publish_outcome(&id, 0, elapsed_ms, failure.kind.token());
                    prompt.resolve(Err(failure));
                }
            }
        }
    }

    async fn run_headless_prompt(
        &self,
        prompt: &PendingPrompt,
        ctx: &RunContext,
    ) -> PromptResult {
        let budget = prompt
            .timeout
            .unwrap_or(Duration::from_secs(self.config.defaults.headless_timeout_sec));
        run_headless(
            &ctx.tool,
            &ctx.workdir,
            &prompt.text,
            ctx.resume_token.as_deref(),
            prompt.image_path.as_deref(),
            budget,
            &prompt.cancel,
        )
        .await
    }

    async fn run_interactive_prompt(
        &self,
        id: &SessionId,
        prompt: &mut PendingPrompt,
        ctx: &RunContext,
    ) -> PromptResult {
        // Image prompts have no channel over the pty line protocol; they
        // run as one-shot invocations.
        if prompt.image_path.is_some() {
            return self.run_headless_prompt(prompt, ctx).await;
        }

        let driver = match ctx.driver {
            Some(ref driver) if driver.state() == DriverState::Ready => Arc::clone(driver),
            _ => {
                if let Some(stale) = self.manager.take_driver(id) {
                    stale.close();
                }
                let idle = Duration::from_secs(self.config.defaults.idle_timeout_sec);
                match InteractiveDriver::start(&ctx.tool, &ctx.workdir, idle).await {
                    Ok(driver) => {
                        let driver = Arc::new(driver);
                        self.manager.attach_driver(id, Arc::clone(&driver));
                        driver
                    }
                    Err(e) => {
                        // Degrade rather than fail: one-shot runs still
                        // work when the pty flavor cannot start.
                        log::warn!(
                            "interactive spawn failed for {id}, degrading to headless: {e}"
                        );
                        self.manager.degrade_to_headless(id);
                        return self.run_headless_prompt(prompt, ctx).await;
                    }
                }
            }
        };

        let budget = prompt.timeout;
        let cancel = prompt.cancel.clone();
        let text = prompt.text.clone();
        let submit = driver.submit(&text);
        tokio::pin!(submit);
        let deadline = async move {
            match budget {
                Some(budget) => tokio::time::sleep(budget).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        tokio::select! {
            result = &mut submit => result,
            _ = &mut deadline => {
                // The caller learns about the timeout now; driver cleanup
                // continues in the background of this turn.
                let failure = PromptFailure::timeout(format!(
                    "no response within {}ms",
                    budget.unwrap_or_default().as_millis()
                ));
                prompt.resolve(Err(failure.clone()));
                driver.interrupt();
                self.settle_after_interrupt(id, &mut submit).await;
                Err(failure)
            }
            _ = cancel.cancelled() => {
                driver.interrupt();
                // Resolution waits for the driver to come back (or be
                // discarded) so the session is observably idle afterwards.
                self.settle_after_interrupt(id, &mut submit).await;
                Err(PromptFailure::cancelled("interrupted by caller"))
            }
        }
    }

    /// After an interrupt, wait for the in-flight turn to reach a fresh
    /// prompt; a driver that never recovers is discarded. Either way the
    /// interrupted output is dropped.
    async fn settle_after_interrupt(
        &self,
        id: &SessionId,
        submit: &mut (impl std::future::Future<Output = PromptResult> + Unpin),
    ) {
        match tokio::time::timeout(INTERRUPT_GRACE, submit).await {
            Ok(Ok(_discarded)) => {}
            Ok(Err(_)) | Err(_) => {
                if let Some(driver) = self.manager.take_driver(id) {
                    driver.close();
                }
            }
        }
    }

    fn publish_outcome(&self, id: &SessionId, bytes_out: usize, elapsed_ms: u64, outcome: &str) {
        let record = PromptRecord {
            session_id: id.0.clone(),
            bytes_out,
            elapsed_ms,
            outcome: outcome.to_string(),
        };
        self.events.publish(&outcome_topic(&id.0), &record);
    }
}

impl PromptUpdate {
    fn noop(elapsed_ms: u64) -> Self {
        Self {
            resume_token: None,
            summary: None,
            output_bytes: 0,
            elapsed_ms,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Defaults, OutputConfig, QueueConfig, ToolConfig};
    use crate::output::{OutboundMessage, OutputSink};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct NullSink;

    #[async_trait]
    impl OutputSink for NullSink {
        async fn deliver(&self, _: &Destination, _: &SessionId, _: OutboundMessage) {}
    }

    struct RecordingSink {
        texts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OutputSink for RecordingSink {
        async fn deliver(&self, _: &Destination, _: &SessionId, message: OutboundMessage) {
            if let OutboundMessage::Inline { text } = message {
                self.texts.lock().unwrap().push(text);
            }
        }
    }

    fn config_with(dir: &Path, tools: Vec<ToolConfig>) -> Arc<AppConfig> {
        let mut map = HashMap::new();
        for tool in tools {
            map.insert(tool.name.clone(), tool);
        }
        Arc::new(AppConfig {
            tools: map,
            defaults: Defaults {
                workdir: dir.to_path_buf(),
                state_path: dir.join("state.json"),
                toolhelp_path: dir.join("toolhelp.json"),
                log_dir: None,
                idle_timeout_sec: 10,
                headless_timeout_sec: 30,
                output: OutputConfig {
                    flush_delay_ms: 5,
                    ..Default::default()
                },
            },
            rpc: Default::default(),
            queue: QueueConfig { max_per_session: 8 },
        })
    }

    fn harness(
        config: Arc<AppConfig>,
        sink: Arc<dyn OutputSink>,
    ) -> (Arc<Dispatcher>, Arc<SessionManager>) {
        let events = Arc::new(EventBus::new());
        let manager = SessionManager::new(config.clone(), events.clone());
        let pipeline = OutputPipeline::new(config.defaults.output.clone(), sink, None);
        let dispatcher = Dispatcher::new(manager.clone(), pipeline, events, config);
        (dispatcher, manager)
    }

    fn echo_tool() -> ToolConfig {
        ToolConfig::new(
            "echo",
            ToolMode::Headless,
            vec!["echo".to_string(), "{prompt}".to_string()],
        )
    }

    fn pong_tool(name: &str, reply_fmt: &str) -> ToolConfig {
        let script = format!(
            "printf '$ '; while read line; do printf '{reply_fmt}\\n$ ' \"$line\"; done"
        );
        ToolConfig::new(
            name,
            ToolMode::Interactive,
            vec!["sh".to_string(), "-c".to_string(), script],
        )
        .prompt_regex(r"\$ $")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn headless_happy_path() {
        let dir = tempdir().unwrap();
        let config = config_with(dir.path(), vec![echo_tool()]);
        let (dispatcher, manager) = harness(config, Arc::new(NullSink));

        let snap = manager.create("echo", dir.path(), None).unwrap();
        let ticket = dispatcher
            .submit(&snap.id, PromptRequest::new("hello", Destination::Rpc))
            .unwrap();

        let reply = ticket.result.await.unwrap().unwrap();
        assert_eq!(reply.text, "hello\n");
        assert_eq!(reply.exit_code, Some(0));

        let after = manager.snapshot(&snap.id).unwrap();
        assert!(!after.busy);
        assert!(!after.has_resume_token);
        assert_eq!(after.last_output_bytes, 6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interactive_prompts_complete_in_submission_order() {
        let dir = tempdir().unwrap();
        let config = config_with(dir.path(), vec![pong_tool("pong", "got:%s")]);
        let sink = Arc::new(RecordingSink {
            texts: Mutex::new(Vec::new()),
        });
        let (dispatcher, manager) = harness(config, sink.clone());

        let snap = manager.create("pong", dir.path(), None).unwrap();
        let dest = Destination::Chat { chat_id: 1 };
        let tickets: Vec<SubmitTicket> = ["A", "B", "C"]
            .iter()
            .map(|p| {
                dispatcher
                    .submit(&snap.id, PromptRequest::new(*p, dest.clone()))
                    .unwrap()
            })
            .collect();

        let mut replies = Vec::new();
        for ticket in tickets {
            replies.push(ticket.result.await.unwrap().unwrap().text);
        }
        assert_eq!(replies, vec!["got:A", "got:B", "got:C"]);

        // The pipeline saw the same order (possibly coalesced, and with
        // terminal echo noise around the payloads).
        tokio::time::sleep(Duration::from_millis(200)).await;
        let joined = sink.texts.lock().unwrap().join("\n");
        let pos_a = joined.find("got:A").unwrap();
        let pos_b = joined.find("got:B").unwrap();
        let pos_c = joined.find("got:C").unwrap();
        assert!(pos_a < pos_b && pos_b < pos_c);

        assert!(!manager.snapshot(&snap.id).unwrap().busy);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn distinct_sessions_run_concurrently() {
        let dir = tempdir().unwrap();
        let slow = ToolConfig::new(
            "slow",
            ToolMode::Headless,
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "sleep 0.5; echo done".to_string(),
            ],
        );
        let config = config_with(dir.path(), vec![slow]);
        let (dispatcher, manager) = harness(config, Arc::new(NullSink));

        let sub = dir.path().join("second");
        std::fs::create_dir(&sub).unwrap();
        let a = manager.create("slow", dir.path(), None).unwrap();
        let b = manager.create("slow", &sub, None).unwrap();

        let started = Instant::now();
        let ta = dispatcher
            .submit(&a.id, PromptRequest::new("x", Destination::Rpc))
            .unwrap();
        let tb = dispatcher
            .submit(&b.id, PromptRequest::new("x", Destination::Rpc))
            .unwrap();
        ta.result.await.unwrap().unwrap();
        tb.result.await.unwrap().unwrap();

        // Serial execution would need ~1s.
        assert!(started.elapsed() < Duration::from_millis(950));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_deadline_times_out_without_running() {
        let dir = tempdir().unwrap();
        let config = config_with(dir.path(), vec![echo_tool()]);
        let (dispatcher, manager) = harness(config, Arc::new(NullSink));
        let snap = manager.create("echo", dir.path(), None).unwrap();

        let mut request = PromptRequest::new("never runs", Destination::Rpc);
        request.timeout = Some(Duration::ZERO);
        let ticket = dispatcher.submit(&snap.id, request).unwrap();

        let failure = ticket.result.await.unwrap().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(!manager.snapshot(&snap.id).unwrap().busy);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_before_dispatch_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let slow = ToolConfig::new(
            "slow",
            ToolMode::Headless,
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "sleep 0.4; echo first".to_string(),
            ],
        );
        let config = config_with(dir.path(), vec![slow]);
        let sink = Arc::new(RecordingSink {
            texts: Mutex::new(Vec::new()),
        });
        let (dispatcher, manager) = harness(config, sink.clone());
        let snap = manager.create("slow", dir.path(), None).unwrap();
        let dest = Destination::Chat { chat_id: 1 };

        let first = dispatcher
            .submit(&snap.id, PromptRequest::new("one", dest.clone()))
            .unwrap();
        let second = dispatcher
            .submit(&snap.id, PromptRequest::new("two", dest))
            .unwrap();
        second.cancel.cancel();

        first.result.await.unwrap().unwrap();
        let failure = second.result.await.unwrap().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Cancelled);

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Only the first prompt produced output.
        assert_eq!(sink.texts.lock().unwrap().join("").trim(), "first");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interactive_timeout_resolves_fast_and_session_recovers() {
        let dir = tempdir().unwrap();
        let slow_reply = "printf '$ '; while read line; do sleep 2; printf 'late\\n$ '; done";
        let tool = ToolConfig::new(
            "sluggish",
            ToolMode::Interactive,
            vec!["sh".to_string(), "-c".to_string(), slow_reply.to_string()],
        )
        .prompt_regex(r"\$ $");
        let config = config_with(dir.path(), vec![tool]);
        let (dispatcher, manager) = harness(config, Arc::new(NullSink));
        let snap = manager.create("sluggish", dir.path(), None).unwrap();

        let mut request = PromptRequest::new("sleepy", Destination::Rpc);
        request.timeout = Some(Duration::from_millis(200));
        let started = Instant::now();
        let ticket = dispatcher.submit(&snap.id, request).unwrap();

        let failure = ticket.result.await.unwrap().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        // The caller was unblocked at the deadline, not after the grace.
        assert!(started.elapsed() < Duration::from_millis(800));

        // The session is usable again: the next prompt spawns a fresh
        // driver and completes.
        for _ in 0..100 {
            if !manager.snapshot(&snap.id).unwrap().busy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let ticket = dispatcher
            .submit(&snap.id, PromptRequest::new("again", Destination::Rpc))
            .unwrap();
        let reply = ticket.result.await.unwrap().unwrap();
        assert_eq!(reply.text, "late");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn headless_spawn_failure_takes_the_session_down() {
        let dir = tempdir().unwrap();
        let broken = ToolConfig::new(
            "broken",
            ToolMode::Headless,
            vec!["/nonexistent/not-a-binary".to_string(), "{prompt}".to_string()],
        );
        let config = config_with(dir.path(), vec![broken]);
        let (dispatcher, manager) = harness(config, Arc::new(NullSink));
        let snap = manager.create("broken", dir.path(), None).unwrap();

        let first = dispatcher
            .submit(&snap.id, PromptRequest::new("a", Destination::Rpc))
            .unwrap();
        // The session may already be down by the time the second submit
        // lands; both shapes are valid.
        let queued = dispatcher.submit(&snap.id, PromptRequest::new("b", Destination::Rpc));

        assert_eq!(
            first.result.await.unwrap().unwrap_err().kind,
            FailureKind::Spawn
        );
        match queued {
            Ok(ticket) => assert_eq!(
                ticket.result.await.unwrap().unwrap_err().kind,
                FailureKind::SessionDown
            ),
            Err(e) => assert!(matches!(e, SessionError::Closed(_))),
        }

        let after = manager.snapshot(&snap.id).unwrap();
        assert!(after.down);
        assert!(matches!(
            dispatcher
                .submit(&snap.id, PromptRequest::new("c", Destination::Rpc))
                .unwrap_err(),
            SessionError::Closed(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_interactive_spawn_degrades_to_headless() {
        let dir = tempdir().unwrap();
        let mut tool = ToolConfig::new(
            "hybrid",
            ToolMode::Interactive,
            vec!["echo".to_string(), "{prompt}".to_string()],
        )
        .prompt_regex(r"\$ $");
        tool.interactive_cmd_template = Some(vec!["/nonexistent/not-a-binary".to_string()]);
        let config = config_with(dir.path(), vec![tool]);
        let (dispatcher, manager) = harness(config, Arc::new(NullSink));
        let snap = manager.create("hybrid", dir.path(), None).unwrap();
        assert_eq!(snap.mode, ToolMode::Interactive);

        let ticket = dispatcher
            .submit(&snap.id, PromptRequest::new("hello", Destination::Rpc))
            .unwrap();
        let reply = ticket.result.await.unwrap().unwrap();
        assert_eq!(reply.text, "hello\n");

        assert_eq!(
            manager.snapshot(&snap.id).unwrap().mode,
            ToolMode::Headless
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interactive_banner_token_is_persisted() {
        let dir = tempdir().unwrap();
        let script =
            "printf 'welcome\\nthread=abc123\\n$ '; while read line; do printf 'pong\\n$ '; done";
        let tool = ToolConfig::new(
            "resumable",
            ToolMode::Interactive,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        )
        .prompt_regex(r"\$ $")
        .resume_regex("thread=([a-f0-9]+)");
        let config = config_with(dir.path(), vec![tool]);
        let (dispatcher, manager) = harness(config.clone(), Arc::new(NullSink));
        let snap = manager.create("resumable", dir.path(), None).unwrap();

        let ticket = dispatcher
            .submit(&snap.id, PromptRequest::new("ping", Destination::Rpc))
            .unwrap();
        let reply = ticket.result.await.unwrap().unwrap();
        assert_eq!(reply.text, "pong");

        let store = crate::persistence::StateStore::new(config.defaults.state_path.clone());
        let doc = store.load().unwrap();
        assert_eq!(
            doc.sessions
                .get(&snap.id.0)
                .unwrap()
                .resume_token
                .as_deref(),
            Some("abc123")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resume_token_from_output_is_persisted() {
        let dir = tempdir().unwrap();
        let mut tool = ToolConfig::new(
            "tokeny",
            ToolMode::Headless,
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo 'thread=beef42'".to_string(),
            ],
        );
        tool.resume_regex = Some("thread=([a-f0-9]+)".to_string());
        let config = config_with(dir.path(), vec![tool]);
        let (dispatcher, manager) = harness(config.clone(), Arc::new(NullSink));
        let snap = manager.create("tokeny", dir.path(), None).unwrap();

        let ticket = dispatcher
            .submit(&snap.id, PromptRequest::new("x", Destination::Rpc))
            .unwrap();
        ticket.result.await.unwrap().unwrap();

        // In memory and on disk.
        assert!(manager.snapshot(&snap.id).unwrap().has_resume_token);
        let store = crate::persistence::StateStore::new(config.defaults.state_path.clone());
        let doc = store.load().unwrap();
        assert_eq!(
            doc.sessions
                .get(&snap.id.0)
                .unwrap()
                .resume_token
                .as_deref(),
            Some("beef42")
        );
    }
}
