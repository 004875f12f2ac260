//! ANSI handling and plain-text shaping for subprocess output.
//!
//! Two views of every output exist side by side: a raw view that keeps
//! escape sequences for HTML rendering, and a clean view used for regex
//! matching, counting and previews.

use regex::Regex;
use std::sync::OnceLock;

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[mK]").unwrap())
}

/// Some tools emit color codes with the ESC byte already eaten by a pty
/// layer; this catches the orphaned `[1;32m` remnants.
fn loose_ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(?:\d{1,3};)*\d{1,3}m").unwrap())
}

/// Remove ANSI escape sequences.
pub fn strip_ansi(text: &str) -> String {
    let pass = ansi_re().replace_all(text, "");
    loose_ansi_re().replace_all(&pass, "").into_owned()
}

pub fn has_ansi(text: &str) -> bool {
    ansi_re().is_match(text)
}

/// The matcher's view: ANSI stripped and carriage returns removed, so
/// prompt/resume regexes never trip over terminal redraw noise.
pub fn clean_view(text: &str) -> String {
    strip_ansi(text).replace('\r', "")
}

/// Collapsing immediately repeated line blocks undoes the worst of TUI
/// redraw artifacts before text is counted or previewed.
///
/// Inputs past this many lines are returned untouched; the scan is
/// quadratic and redraw artifacts only matter for human-sized output.
const MAX_DEDUPE_LINES: usize = 2000;

pub fn dedupe_repeated_blocks(text: &str) -> String {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.len() > MAX_DEDUPE_LINES {
        return text.to_string();
    }
    let mut changed = true;
    while changed {
        changed = false;
        let total = lines.len();
        'outer: for i in 0..total.saturating_sub(1) {
            if lines[i].trim().is_empty() {
                continue;
            }
            let mut j = i + 1;
            while j < total {
                if lines[j].trim().is_empty() {
                    j += 1;
                    continue;
                }
                let mut k = 0;
                while i + k < total && j + k < total && lines[i + k] == lines[j + k] {
                    k += 1;
                }
                if k >= 1 && j + k <= total {
                    lines.drain(j..j + k);
                    changed = true;
                    break 'outer;
                }
                j += 1;
            }
        }
    }
    lines.join("\n")
}

/// Truncation marker users see instead of a silently cut-off answer.
pub const TRUNCATION_MARKER: &str = "\n...(truncated)...";

/// Bounded plain-text preview with an explicit truncation marker.
pub fn build_preview(text: &str, max_chars: usize) -> String {
    let plain = strip_ansi(text);
    let chars: Vec<char> = plain.chars().collect();
    if chars.len() <= max_chars {
        return plain;
    }
    if max_chars <= TRUNCATION_MARKER.chars().count() + 20 {
        return chars[..max_chars].iter().collect();
    }
    let keep = max_chars - TRUNCATION_MARKER.chars().count();
    let mut out: String = chars[..keep].iter().collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Head/tail split for artifact previews. The tail is favored because
/// trailing content typically carries the final answer.
pub fn head_tail_preview(plain: &str, head_chars: usize, tail_chars: usize) -> String {
    let chars: Vec<char> = plain.chars().collect();
    if chars.len() <= head_chars + tail_chars {
        return plain.to_string();
    }
    let head: String = chars[..head_chars].iter().collect();
    let tail: String = chars[chars.len() - tail_chars..].iter().collect();
    format!("{head}{TRUNCATION_MARKER}\n{tail}")
}

// ============================================================================
// ANSI → HTML
// ============================================================================

const FG_COLORS: &[(u32, &str)] = &[
    (30, "#000000"),
    (31, "#cc0000"),
    (32, "#00aa00"),
    (33, "#aa8800"),
    (34, "#0000cc"),
    (35, "#aa00aa"),
    (36, "#00aaaa"),
    (37, "#cccccc"),
    (90, "#555555"),
    (91, "#ff4444"),
    (92, "#44ff44"),
    (93, "#ffff44"),
    (94, "#4444ff"),
    (95, "#ff44ff"),
    (96, "#44ffff"),
    (97, "#ffffff"),
];

fn fg_color(code: u32) -> Option<&'static str> {
    FG_COLORS.iter().find(|(c, _)| *c == code).map(|(_, v)| *v)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Render raw subprocess output as a standalone HTML document with ANSI
/// colors mapped to inline-styled spans.
pub fn ansi_to_html(text: &str) -> String {
    let body = ansi_fragment(text);
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\">\
<style>\
body{{font-family:ui-monospace,SFMono-Regular,Consolas,Monaco,Menlo,monospace;\
line-height:1.45;color:#111;background:#fff;padding:16px;}}\
pre{{white-space:pre-wrap;word-break:break-word;margin:0;}}\
</style></head><body><pre>{body}</pre></body></html>"
    )
}

fn ansi_fragment(text: &str) -> String {
    if !text.contains('\x1b') {
        return escape_html(text);
    }
    let mut out = String::new();
    let mut color: Option<&str> = None;
    let mut bold = false;
    let mut open_span = false;

    let update_span = |out: &mut String, color: Option<&str>, bold: bool, open: &mut bool| {
        if *open {
            out.push_str("</span>");
            *open = false;
        }
        let mut styles = Vec::new();
        if let Some(c) = color {
            styles.push(format!("color:{c}"));
        }
        if bold {
            styles.push("font-weight:600".to_string());
        }
        if !styles.is_empty() {
            out.push_str(&format!("<span style=\"{}\">", styles.join(";")));
            *open = true;
        }
    };

    let mut idx = 0;
    for m in ansi_re().find_iter(text) {
        out.push_str(&escape_html(&text[idx..m.start()]));
        let seq = m.as_str();
        // Strip "\x1b[" and the final command byte.
        let codes = &seq[2..seq.len() - 1];
        if seq.ends_with('m') {
            let codes = if codes.is_empty() { "0" } else { codes };
            for code_str in codes.split(';') {
                let Ok(code) = code_str.parse::<u32>() else {
                    continue;
                };
                match code {
                    0 => {
                        color = None;
                        bold = false;
                    }
                    1 => bold = true,
                    22 => bold = false,
                    39 => color = None,
                    c => {
                        if let Some(hex) = fg_color(c) {
                            color = Some(hex);
                        }
                    }
                }
            }
            update_span(&mut out, color, bold, &mut open_span);
        }
        idx = m.end();
    }
    out.push_str(&escape_html(&text[idx..]));
    if open_span {
        out.push_str("</span>");
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================
