//! C6 — Visual Boundary Parser.
//!
//! Pure string functions: [`find_earliest_complete_visual`] locates the
//! earliest fully-terminated "sandbox" region in a growing text buffer, and
//! [`has_incomplete_visual`] detects whether the tail opens one without
//! closing it — the signal the streaming TTS orchestrator uses to hold
//! back a part from closing.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VisualKind {
    Svg,
    Mermaid,
    Code,
    Image,
    Table,
    Iframe,
    Html,
    Math,
}

impl VisualKind {
    /// Tie-break priority when two matches share the same `start`; lower is
    /// higher priority (SVG wins ties).
    fn priority(self) -> u8 {
        match self {
            VisualKind::Svg => 0,
            VisualKind::Mermaid => 1,
            VisualKind::Code => 2,
            VisualKind::Image => 3,
            VisualKind::Table => 4,
            VisualKind::Iframe => 5,
            VisualKind::Html => 6,
            VisualKind::Math => 7,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisualMatch {
    pub start: usize,
    pub end: usize,
    pub kind: VisualKind,
    pub content: String,
}

macro_rules! regex_once {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pat).unwrap())
        }
    };
}

regex_once!(svg_re, r"(?is)<svg\b.*?</svg\s*>");
regex_once!(iframe_re, r"(?is)<iframe\b.*?</iframe\s*>");
regex_once!(math_block_re, r"(?s)\$\$.*?\$\$");
regex_once!(mathml_re, r"(?is)<math\b.*?</math\s*>");
regex_once!(fenced_code_re, r"(?s)```([^\n`]*)\n.*?```");
regex_once!(md_image_re, r#"!\[[^\]]*\]\([^)\s]+(?:\s+"[^"]*")?\)"#);
regex_once!(html_image_re, r"(?is)<img\b[^>]*/?>");
regex_once!(
    html_block_re,
    r"(?is)<(div|figure|details|summary|blockquote|section|article|aside|nav|header|footer)\b[^>]*>.*?</\1\s*>"
);
regex_once!(table_row_re, r"(?m)^[ \t]*\|.*\|[ \t]*$");
regex_once!(table_sep_re, r"^[ \t]*\|?(?:\s*:?-+:?\s*\|)+\s*:?-+:?\s*\|?[ \t]*$");

fn fence_open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```").unwrap())
}

fn first_match(re: &Regex, text: &str, kind: VisualKind) -> Option<VisualMatch> {
    re.find(text).map(|m| VisualMatch {
        start: m.start(),
        end: m.end(),
        kind,
        content: m.as_str().to_string(),
    })
}

fn mermaid_or_code(text: &str) -> Option<VisualMatch> {
    let caps = fenced_code_re().captures(text)?;
    let whole = caps.get(0)?;
    let info = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
    let kind = if info.to_lowercase().starts_with("mermaid") {
        VisualKind::Mermaid
    } else {
        VisualKind::Code
    };
    Some(VisualMatch {
        start: whole.start(),
        end: whole.end(),
        kind,
        content: whole.as_str().to_string(),
    })
}

fn image_match(text: &str) -> Option<VisualMatch> {
    let md = first_match(md_image_re(), text, VisualKind::Image);
    let html = first_match(html_image_re(), text, VisualKind::Image);
    match (md, html) {
        (Some(a), Some(b)) => Some(if a.start <= b.start { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn table_match(text: &str) -> Option<VisualMatch> {
    let rows: Vec<_> = table_row_re().find_iter(text).collect();
    for window in rows.windows(2) {
        let [header, sep] = window else { continue };
        if header.end() + 1 != sep.start() && !text[header.end()..sep.start()].trim().is_empty() {
            continue;
        }
        if !table_sep_re().is_match(sep.as_str().trim()) {
            continue;
        }
        // Require at least one body row following the separator.
        if let Some(body) = rows.iter().find(|r| r.start() > sep.end()) {
            if text[sep.end()..body.start()].trim().is_empty() {
                return Some(VisualMatch {
                    start: header.start(),
                    end: body.end(),
                    kind: VisualKind::Table,
                    content: text[header.start()..body.end()].to_string(),
                });
            }
        }
    }
    None
}

/// Find the earliest complete visual region in `text`, classified by
/// family, with ties on `start` broken by family priority.
pub fn find_earliest_complete_visual(text: &str) -> Option<VisualMatch> {
    let candidates = [
        first_match(svg_re(), text, VisualKind::Svg),
        mermaid_or_code(text),
        image_match(text),
        table_match(text),
        first_match(iframe_re(), text, VisualKind::Iframe),
        first_match(html_block_re(), text, VisualKind::Html),
        first_match(math_block_re(), text, VisualKind::Math),
        first_match(mathml_re(), text, VisualKind::Math),
    ];

    candidates
        .into_iter()
        .flatten()
        .min_by(|a, b| a.start.cmp(&b.start).then(a.kind.priority().cmp(&b.kind.priority())))
}

/// True iff the tail of `text` opens a visual region without a matching
/// terminator — the "don't leak a half-arrived SVG into TTS" guard.
pub fn has_incomplete_visual(text: &str) -> bool {
    let fence_count = fence_open_re().find_iter(text).count();
    if fence_count % 2 != 0 {
        return true;
    }

    let lower = text.to_lowercase();
    for (open, close) in [
        ("<svg", "</svg>"),
        ("<iframe", "</iframe>"),
        ("<math", "</math>"),
        ("<div", "</div>"),
        ("<figure", "</figure>"),
        ("<details", "</details>"),
        ("<section", "</section>"),
        ("<blockquote", "</blockquote>"),
    ] {
        if let Some(last_open) = lower.rfind(open) {
            if !lower[last_open..].contains(close) {
                return true;
            }
        }
    }

    if text.matches("$$").count() % 2 != 0 {
        return true;
    }

    // Table header with no following separator yet.
    if let Some(last_row) = table_row_re().find_iter(text).last() {
        let tail = &text[last_row.end()..];
        if tail.trim().is_empty() && !table_sep_re().is_match(last_row.as_str().trim()) {
            // Could still become a separator; treat a bare trailing row as
            // potentially incomplete only when it is the final line.
            return text.trim_end().ends_with(last_row.as_str().trim());
        }
    }

    false
}
