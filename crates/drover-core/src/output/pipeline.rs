//! The output pipeline: ordered, coalesced, size-aware delivery.
//!
//! Each destination gets one lane with a single worker task, so delivery
//! order per destination always matches emission order. Small outputs are
//! buffered briefly and coalesced; oversize outputs become a rendered HTML
//! artifact preceded by an optional host summary.

use super::{Destination, OutboundMessage, OutputSink, Summarizer};
use crate::ansi::{ansi_to_html, clean_view, dedupe_repeated_blocks, head_tail_preview};
use crate::config::OutputConfig;
use crate::session::SessionId;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

/// Artifact file naming: `drover-output-<random>.html` in the system temp
/// directory.
const ARTIFACT_PREFIX: &str = "drover-output-";

/// The summariser may be slow but not unbounded; past this the artifact
/// goes out without a summary.
const SUMMARY_BUDGET: Duration = Duration::from_secs(100);

/// Only the tail of very large outputs is rendered to HTML.
const RENDER_TAIL_CHARS: usize = 50_000;

/// Artifacts older than this are removed by the periodic sweep.
const ARTIFACT_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Every Nth artifact triggers a sweep of stale ones.
const SWEEP_EVERY: usize = 16;

enum LaneItem {
    Inline {
        session: SessionId,
        text: String,
    },
    Oversize {
        session: SessionId,
        plain: String,
        raw: Vec<u8>,
    },
}

pub struct OutputPipeline {
    cfg: OutputConfig,
    sink: Arc<dyn OutputSink>,
    summarizer: Option<Arc<dyn Summarizer>>,
    lanes: Mutex<HashMap<Destination, mpsc::UnboundedSender<LaneItem>>>,
    artifacts_written: AtomicUsize,
}

impl OutputPipeline {
    pub fn new(
        cfg: OutputConfig,
        sink: Arc<dyn OutputSink>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            sink,
            summarizer,
            lanes: Mutex::new(HashMap::new()),
            artifacts_written: AtomicUsize::new(0),
        })
    }

    /// Accept one completed output for a destination. Synchronous
    /// destinations are skipped; their caller already holds the result.
    pub fn emit(self: &Arc<Self>, dest: &Destination, session: &SessionId, raw: &[u8]) {
        if dest.is_synchronous() {
            return;
        }
        let plain = dedupe_repeated_blocks(&clean_view(&String::from_utf8_lossy(raw)));
        let item = if plain.chars().count() <= self.cfg.inline_limit {
            LaneItem::Inline {
                session: session.clone(),
                text: plain,
            }
        } else {
            LaneItem::Oversize {
                session: session.clone(),
                plain,
                raw: raw.to_vec(),
            }
        };
        if self.lane(dest).send(item).is_err() {
            log::warn!("output lane for {dest:?} is gone; output dropped");
        }
    }

    fn lane(self: &Arc<Self>, dest: &Destination) -> mpsc::UnboundedSender<LaneItem> {
        let mut lanes = self.lanes.lock().unwrap();
        if let Some(sender) = lanes.get(dest) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Arc::clone(self);
        let lane_dest = dest.clone();
        tokio::spawn(async move {
            pipeline.run_lane(lane_dest, rx).await;
        });
        lanes.insert(dest.clone(), tx.clone());
        tx
    }

    /// One worker per destination: coalesce small texts, expand oversize
    /// outputs into summary + artifact.
    async fn run_lane(&self, dest: Destination, mut rx: mpsc::UnboundedReceiver<LaneItem>) {
        let delay = Duration::from_millis(self.cfg.flush_delay_ms);
        let mut buffer: Option<(SessionId, String)> = None;
        let mut last_append = Instant::now();
        // A pending flush may be pushed back once; the second schedule
        // commits.
        let mut deadline: Option<(Instant, u8)> = None;

        loop {
            let sleep_until = deadline
                .map(|(at, _)| at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                item = rx.recv() => match item {
                    None => {
                        self.flush_buffer(&dest, &mut buffer).await;
                        break;
                    }
                    Some(LaneItem::Inline { session, text }) => {
                        match buffer {
                            Some((ref buf_session, ref mut buf))
                                if *buf_session == session
                                    && buf.chars().count() + 1 + text.chars().count()
                                        <= self.cfg.inline_limit
                                    && last_append.elapsed() <= delay =>
                            {
                                buf.push('\n');
                                buf.push_str(&text);
                                if let Some((ref mut at, ref mut reschedules)) = deadline {
                                    if *reschedules == 0 {
                                        *at = Instant::now() + delay;
                                        *reschedules = 1;
                                    }
                                }
                            }
                            _ => {
                                self.flush_buffer(&dest, &mut buffer).await;
                                buffer = Some((session, text));
                                deadline = Some((Instant::now() + delay, 0));
                            }
                        }
                        last_append = Instant::now();
                    }
                    Some(LaneItem::Oversize { session, plain, raw }) => {
                        self.flush_buffer(&dest, &mut buffer).await;
                        deadline = None;
                        self.deliver_oversize(&dest, &session, plain, raw).await;
                    }
                },
                _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    self.flush_buffer(&dest, &mut buffer).await;
                    deadline = None;
                }
            }
        }
    }

    async fn flush_buffer(&self, dest: &Destination, buffer: &mut Option<(SessionId, String)>) {
        if let Some((session, text)) = buffer.take() {
            self.sink
                .deliver(dest, &session, OutboundMessage::Inline { text })
                .await;
        }
    }

    /// Summary first, artifact second. A slow summariser delays the
    /// artifact; a failed one never blocks it.
    async fn deliver_oversize(
        &self,
        dest: &Destination,
        session: &SessionId,
        plain: String,
        raw: Vec<u8>,
    ) {
        if let Some(ref summarizer) = self.summarizer {
            match timeout(SUMMARY_BUDGET, summarizer.summarize(&plain)).await {
                Ok(Ok(text)) => {
                    self.sink
                        .deliver(dest, session, OutboundMessage::Summary { text })
                        .await;
                }
                Ok(Err(e)) => log::warn!("summariser failed for {session}: {e}"),
                Err(_) => log::warn!("summariser timed out for {session}"),
            }
        }

        let preview = head_tail_preview(&plain, self.cfg.head_chars, self.cfg.tail_chars);
        let rendered_src = tail_chars(&String::from_utf8_lossy(&raw), RENDER_TAIL_CHARS);
        let html = ansi_to_html(&rendered_src);
        match write_artifact(&html) {
            Ok(path) => {
                self.maybe_sweep();
                self.sink
                    .deliver(dest, session, OutboundMessage::Artifact { preview, path })
                    .await;
            }
            Err(e) => {
                log::warn!("artifact write failed for {session}: {e}");
                self.sink
                    .deliver(dest, session, OutboundMessage::Inline { text: preview })
                    .await;
            }
        }
    }

    fn maybe_sweep(&self) {
        let count = self.artifacts_written.fetch_add(1, Ordering::Relaxed) + 1;
        if count % SWEEP_EVERY == 0 {
            tokio::task::spawn_blocking(|| {
                let removed = sweep_stale_artifacts(ARTIFACT_MAX_AGE);
                if removed > 0 {
                    log::info!("swept {removed} stale output artifacts");
                }
            });
        }
    }
}

fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

fn write_artifact(html: &str) -> std::io::Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix(ARTIFACT_PREFIX)
        .suffix(".html")
        .tempfile()?;
    file.write_all(html.as_bytes())?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Remove artifacts older than `max_age` from the temp directory.
pub fn sweep_stale_artifacts(max_age: Duration) -> usize {
    sweep_stale_artifacts_in(&std::env::temp_dir(), max_age)
}

/// Remove artifacts older than `max_age` from `dir`. Best-effort:
/// unreadable entries are skipped.
pub fn sweep_stale_artifacts_in(dir: &std::path::Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(ARTIFACT_PREFIX) || !name.ends_with(".html") {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if stale && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

// ============================================================================
// TESTS
// ============================================================================
