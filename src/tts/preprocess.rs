//! C9 — Text Preprocessor for TTS.
//!
//! `preprocess_for_tts`: strip markdown/HTML/code/SVG/math artefacts from
//! prose before synthesis, and detect partial-tag tails while streaming so
//! a half-arrived visual never leaks into narration.

use regex::Regex;
use std::sync::OnceLock;

macro_rules! regex_once {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pat).unwrap())
        }
    };
}

regex_once!(code_block_re, r"(?s)```.*?```");
regex_once!(mermaid_re, r"(?is)```mermaid.*?```");
regex_once!(svg_re, r"(?is)<svg\b.*?</svg\s*>");
regex_once!(xml_block_re, r"(?is)<(math|script|style)\b[^>]*>.*?</\1\s*>");
regex_once!(any_tag_re, r"(?s)<[^>]*>");
regex_once!(header_re, r"(?m)^\s{0,3}#{1,6}\s*");
regex_once!(md_image_re, r#"!\[[^\]]*\]\([^)]*\)"#);
regex_once!(link_re, r#"\[([^\]]*)\]\([^)]*\)"#);
regex_once!(bold_italic_re, r"(\*{1,3}|_{1,3})([^*_]+?)\1");
regex_once!(list_marker_re, r"(?m)^\s*([-*+]|\d+[.)])\s+");
regex_once!(data_uri_re, r"data:[a-zA-Z0-9/+;=,]+");
regex_once!(blank_runs_re, r"\n{3,}");
regex_once!(intra_line_ws_re, r"[ \t]{2,}");

fn strip_incomplete_fenced_code(text: &str) -> (String, bool) {
    let fence_count = text.matches("```").count();
    if fence_count % 2 == 0 {
        return (text.to_string(), false);
    }
    match text.rfind("```") {
        Some(idx) => (text[..idx].to_string(), true),
        None => (text.to_string(), false),
    }
}

fn strip_incomplete_xml_block(text: &str, tag: &str) -> (String, bool) {
    let lower = text.to_lowercase();
    let open = format!("<{tag}");
    if let Some(idx) = lower.rfind(&open) {
        let close = format!("</{tag}");
        if !lower[idx..].contains(&close) {
            return (text[..idx].to_string(), true);
        }
    }
    (text.to_string(), false)
}

fn strip_incomplete_angle_bracket_tag(text: &str) -> (String, bool) {
    if let Some(idx) = text.rfind('<') {
        let tail = &text[idx + 1..];
        if !tail.contains('>') {
            let next = tail.chars().next();
            let looks_like_tag = matches!(next, Some(c) if c.is_alphabetic() || c == '/' || c == '!' || c == '?');
            if looks_like_tag {
                return (text[..idx].to_string(), true);
            }
        }
    }
    (text.to_string(), false)
}

fn strip_incomplete_blocks(text: &str) -> (String, bool) {
    let mut had_incomplete = false;

    let (text, inc) = strip_incomplete_fenced_code(text);
    had_incomplete |= inc;

    let mut text = text;
    for tag in ["svg", "math", "script", "style"] {
        let (next, inc) = strip_incomplete_xml_block(&text, tag);
        text = next;
        had_incomplete |= inc;
    }

    let (text, inc) = strip_incomplete_angle_bracket_tag(&text);
    had_incomplete |= inc;

    (text, had_incomplete)
}

/// Streaming safeguard: true iff the tail of `text` opens a block the
/// preprocessor would otherwise strip, without closing it.
pub fn has_incomplete_block(text: &str) -> bool {
    if text.matches("```").count() % 2 != 0 {
        return true;
    }
    let lower = text.to_lowercase();
    if let Some(idx) = lower.rfind("<svg") {
        if !lower[idx..].contains("</svg") {
            return true;
        }
    }
    // mermaid-inside-odd-fence: an opened mermaid fence with no closing fence.
    if lower.contains("```mermaid") {
        let after = lower.rfind("```mermaid").unwrap();
        if !lower[after + "```mermaid".len()..].contains("```") {
            return true;
        }
    }
    false
}

fn unescape_html_once(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", "\u{a0}")
}

/// Strip markdown/HTML/code/SVG/math artefacts from `text` before TTS
/// synthesis. Idempotent: `preprocess_for_tts(preprocess_for_tts(x)) ==
/// preprocess_for_tts(x)`.
pub fn preprocess_for_tts(text: &str) -> String {
    // 1. Unescape HTML entities, up to twice (handles double-escaping).
    let mut text = text.to_string();
    for _ in 0..2 {
        let next = unescape_html_once(&text);
        if next == text {
            break;
        }
        text = next;
    }
    text = text.replace('\u{a0}', " ");

    // 2. Strip incomplete tail blocks (streaming safety).
    let (text, _) = strip_incomplete_blocks(&text);

    // 3. Remove fenced code, mermaid, SVG, math/script/style.
    let text = mermaid_re().replace_all(&text, "");
    let text = code_block_re().replace_all(&text, "");
    let text = svg_re().replace_all(&text, "");
    let text = xml_block_re().replace_all(&text, "");

    // 4. Remove remaining angle-bracket tags.
    let text = any_tag_re().replace_all(&text, "");

    // 5. Headers, images, keep link text, strip emphasis.
    let text = header_re().replace_all(&text, "");
    let text = md_image_re().replace_all(&text, "");
    let text = link_re().replace_all(&text, "$1");
    let text = bold_italic_re().replace_all(&text, "$2");

    // 6. List markers and data URIs.
    let text = list_marker_re().replace_all(&text, "");
    let text = data_uri_re().replace_all(&text, "");

    // 7. Collapse whitespace.
    let text = blank_runs_re().replace_all(&text, "\n\n");
    let text = intra_line_ws_re().replace_all(&text, " ");

    text.lines()
        .map(|l| l.trim())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
