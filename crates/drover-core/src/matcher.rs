//! Incremental stream matcher for interactive subprocess output.
//!
//! Keeps a rolling window over the combined output stream and reports three
//! kinds of events per observed chunk: the tool's idle prompt appearing at
//! the tail (readiness), a resume token, and activity ticks that feed the
//! stall watchdog. All regex matching runs against an ANSI-stripped,
//! CR-normalized clean view; the raw view is kept for rendering.

use crate::ansi::clean_view;
use crate::config::ToolConfig;
use regex::Regex;

/// Rolling window size. Large enough that prompts and resume tokens cannot
/// straddle the trimmed edge.
const WINDOW_BYTES: usize = 64 * 1024;

/// Net output that counts as activity even without a known token.
const TICK_BYTES: usize = 128;

/// Events produced by one [`StreamMatcher::observe`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observed {
    /// The idle prompt is sitting at the tail of the window.
    pub prompt_ready: bool,
    /// A new or changed resume token.
    pub resume_token: Option<String>,
    /// The subprocess demonstrably made progress.
    pub activity: bool,
}

pub struct StreamMatcher {
    prompt_regex: Option<Regex>,
    resume_regex: Option<Regex>,
    activity_tokens: Vec<String>,
    raw: Vec<u8>,
    clean: String,
    /// The prompt only re-fires after a non-matching chunk was seen,
    /// debouncing repeated prompt redraws.
    prompt_armed: bool,
    resume_token: Option<String>,
    bytes_since_tick: usize,
}

impl StreamMatcher {
    pub fn new(
        prompt_regex: Option<Regex>,
        resume_regex: Option<Regex>,
        activity_tokens: Vec<String>,
    ) -> Self {
        Self {
            prompt_regex,
            resume_regex,
            activity_tokens,
            raw: Vec::new(),
            clean: String::new(),
            prompt_armed: true,
            resume_token: None,
            bytes_since_tick: 0,
        }
    }

    /// Compile a matcher from a tool template. Fails on invalid patterns so
    /// misconfigured tools are rejected at spawn time, not mid-stream.
    pub fn for_tool(tool: &ToolConfig) -> Result<Self, regex::Error> {
        let prompt = tool
            .prompt_regex
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        let resume = tool
            .resume_regex
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(Self::new(prompt, resume, tool.activity_tokens.clone()))
    }

    /// Replace the prompt pattern (used when one was autodetected mid-run).
    pub fn set_prompt_regex(&mut self, regex: Regex) {
        self.prompt_regex = Some(regex);
        self.prompt_armed = true;
    }

    pub fn has_prompt_regex(&self) -> bool {
        self.prompt_regex.is_some()
    }

    /// Append a chunk and report what it revealed.
    pub fn observe(&mut self, chunk: &[u8]) -> Observed {
        self.raw.extend_from_slice(chunk);
        if self.raw.len() > WINDOW_BYTES {
            let cut = self.raw.len() - WINDOW_BYTES;
            self.raw.drain(..cut);
        }

        let chunk_clean = clean_view(&String::from_utf8_lossy(chunk));
        self.clean.push_str(&chunk_clean);
        if self.clean.len() > WINDOW_BYTES {
            let mut cut = self.clean.len() - WINDOW_BYTES;
            while !self.clean.is_char_boundary(cut) {
                cut += 1;
            }
            self.clean.drain(..cut);
        }

        let mut observed = Observed::default();

        if let Some(ref regex) = self.prompt_regex {
            let matched_now = regex
                .find_iter(&self.clean)
                .any(|m| m.end() == self.clean.len());
            if matched_now && self.prompt_armed {
                observed.prompt_ready = true;
            }
            self.prompt_armed = !matched_now;
        }

        if let Some(ref regex) = self.resume_regex {
            if let Some(caps) = regex.captures_iter(&self.clean).last() {
                if let Some(group) = caps.get(1) {
                    let value = group.as_str().to_string();
                    if self.resume_token.as_deref() != Some(value.as_str()) {
                        self.resume_token = Some(value.clone());
                        observed.resume_token = Some(value);
                    }
                }
            }
        }

        let token_hit = !chunk_clean.is_empty()
            && self
                .activity_tokens
                .iter()
                .any(|t| !t.is_empty() && chunk_clean.contains(t.as_str()));
        if token_hit {
            observed.activity = true;
            self.bytes_since_tick = 0;
        } else {
            self.bytes_since_tick += chunk.len();
            if self.bytes_since_tick >= TICK_BYTES {
                observed.activity = true;
                self.bytes_since_tick = 0;
            }
        }

        observed
    }

    /// Clear the window and all match state.
    pub fn reset(&mut self) {
        self.raw.clear();
        self.clean.clear();
        self.prompt_armed = true;
        self.resume_token = None;
        self.bytes_since_tick = 0;
    }

    /// Raw bytes currently in the window (ANSI preserved).
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Clean text currently in the window.
    pub fn clean(&self) -> &str {
        &self.clean
    }

    pub fn resume_token(&self) -> Option<&str> {
        self.resume_token.as_deref()
    }

    /// The clean window with the trailing prompt match removed and trailing
    /// whitespace trimmed: the logical response to the last input.
    pub fn response_text(&self) -> String {
        let mut text = self.clean.clone();
        if let Some(ref regex) = self.prompt_regex {
            if let Some(m) = regex
                .find_iter(&text)
                .filter(|m| m.end() == text.len())
                .last()
            {
                text.truncate(m.start());
            }
        }
        text.trim_end().to_string()
    }
}

// ============================================================================
// Pattern autodetection
// ============================================================================

/// Guess a prompt pattern from collected output: the last non-empty clean
/// line, if short and repeated in the tail, is treated as the prompt.
pub fn detect_prompt_regex(output: &str) -> Option<String> {
    let cleaned: Vec<String> = clean_view(output)
        .lines()
        .map(|l| l.to_string())
        .filter(|l| !l.trim().is_empty())
        .collect();
    let candidate = cleaned.last()?;
    if candidate.len() > 80 {
        return None;
    }
    let tail = &cleaned[cleaned.len().saturating_sub(6)..];
    let occurrences = tail.iter().filter(|l| *l == candidate).count();
    if occurrences >= 2 {
        Some(format!("{}\\s*$", regex::escape(candidate)))
    } else {
        None
    }
}

/// Well-known resume-token shapes, probed against clean output.
const RESUME_PATTERNS: &[&str] = &[
    r#""thread_id"\s*:\s*"([^"]+)""#,
    r#""conversation_id"\s*:\s*"([^"]+)""#,
    r#""session_id"\s*:\s*"([^"]+)""#,
    r"resume\s*id\s*[:=]\s*([A-Za-z0-9_-]+)",
];

/// Guess a resume pattern by probing known shapes against the output.
pub fn detect_resume_regex(output: &str) -> Option<&'static str> {
    let cleaned = clean_view(output);
    RESUME_PATTERNS.iter().copied().find(|pattern| {
        Regex::new(pattern)
            .map(|re| re.is_match(&cleaned))
            .unwrap_or(false)
    })
}

// ============================================================================
// TESTS
// ============================================================================
