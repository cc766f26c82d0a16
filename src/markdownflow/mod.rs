//! C1 — MarkdownFlow Parser.
//!
//! A deterministic, pure function turning a lesson document into an ordered
//! list of [`Block`]s. Never fails: a malformed interaction degrades to a
//! `CONTENT` block carrying its raw text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::types::BlockKind;

/// One button inside an interaction: `label` with an optional `//value`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionButton {
    pub label: String,
    pub value: Option<String>,
}

/// The parsed shape of an `INTERACTION` block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Interaction {
    pub variable: Option<String>,
    pub buttons: Vec<InteractionButton>,
    pub question: Option<String>,
}

impl Interaction {
    pub fn is_free_form(&self) -> bool {
        self.buttons.is_empty() && self.question.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: usize,
    pub kind: BlockKind,
    /// Raw source text, verbatim, as it appeared in the document.
    pub content: String,
    pub interaction: Option<Interaction>,
}

impl Block {
    pub fn is_interaction(&self) -> bool {
        matches!(self.kind, BlockKind::Interaction)
    }
}

fn section_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^===\s*$").unwrap())
}

/// Matches the whole `?[...]` interaction span. The inner grammar is
/// re-parsed separately once a candidate span is isolated.
fn interaction_span() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\?\[(.*?)\]").unwrap())
}

fn var_ref() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^%\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}(.*)$").unwrap())
}

/// Parse one candidate interaction body (the text between `?[` and `]`)
/// into an [`Interaction`], or `None` if it doesn't match the grammar —
/// in which case the caller keeps the whole `?[...]` span as `CONTENT`.
fn parse_interaction_body(body: &str) -> Option<Interaction> {
    let (var_name, rest) = match var_ref().captures(body) {
        Some(caps) => (
            Some(caps.get(1).unwrap().as_str().to_string()),
            caps.get(2).unwrap().as_str().to_string(),
        ),
        None => (None, body.to_string()),
    };

    if let Some(question) = rest.strip_prefix("...") {
        return Some(Interaction {
            variable: var_name,
            buttons: Vec::new(),
            question: Some(question.trim().to_string()),
        });
    }

    if rest.trim().is_empty() {
        return None;
    }

    let buttons: Vec<InteractionButton> = rest
        .split("||")
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty())
        .map(|raw| match raw.split_once("//") {
            Some((label, value)) => InteractionButton {
                label: label.trim().to_string(),
                value: Some(value.trim().to_string()),
            },
            None => InteractionButton {
                label: raw.to_string(),
                value: None,
            },
        })
        .collect();

    if buttons.is_empty() {
        return None;
    }

    Some(Interaction {
        variable: var_name,
        buttons,
        question: None,
    })
}

/// Parse a MarkdownFlow document into an ordered list of blocks.
///
/// `===` on its own line starts a new section; within a section, the first
/// `?[...]` span (if the body parses as a valid interaction grammar)
/// produces one `INTERACTION` block holding the *entire* section text as
/// `content` (so downstream LLM prompt construction sees the original
/// source), while a section with no valid interaction is a `CONTENT` block.
///
/// This function never fails and never panics on malformed input.
pub fn parse(document: &str) -> Vec<Block> {
    let sections: Vec<&str> = section_marker().split(document).collect();

    let mut blocks = Vec::with_capacity(sections.len());
    let mut index = 0usize;

    for section in sections {
        let trimmed = section.trim();
        if trimmed.is_empty() {
            continue;
        }

        let interaction = interaction_span()
            .captures(trimmed)
            .and_then(|caps| parse_interaction_body(caps.get(1).unwrap().as_str()));

        let kind = if interaction.is_some() {
            BlockKind::Interaction
        } else {
            BlockKind::Content
        };

        blocks.push(Block {
            index,
            kind,
            content: trimmed.to_string(),
            interaction,
        });
        index += 1;
    }

    blocks
}

/// Build the synthetic next-chapter interaction body, `?[<label>//_sys_next_chapter](<label>)`.
pub fn next_chapter_interaction_source(label: &str) -> String {
    format!("?[{label}//{sys}]({label})", sys = crate::types::SYS_NEXT_CHAPTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_content_has_no_interaction() {
        let blocks = parse("Hello **world**.");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind, BlockKind::Content);
        assert_eq!(blocks[0].content, "Hello **world**.");
    }

    #[test]
    fn sections_split_on_triple_equals() {
        let doc = "First part.\n===\nSecond part.";
        let blocks = parse(doc);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].index, 0);
        assert_eq!(blocks[1].index, 1);
    }

    #[test]
    fn button_interaction_parses_labels_and_values() {
        let doc = "?[Yes//yes || No//no]";
        let blocks = parse(doc);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_interaction());
        let interaction = blocks[0].interaction.as_ref().unwrap();
        assert_eq!(interaction.buttons.len(), 2);
        assert_eq!(interaction.buttons[0].label, "Yes");
        assert_eq!(interaction.buttons[0].value.as_deref(), Some("yes"));
    }

    #[test]
    fn free_form_question_with_variable() {
        let doc = "?[%{{lang}}...your favourite language?]";
        let blocks = parse(doc);
        let interaction = blocks[0].interaction.as_ref().unwrap();
        assert_eq!(interaction.variable.as_deref(), Some("lang"));
        assert_eq!(
            interaction.question.as_deref(),
            Some("your favourite language?")
        );
        assert!(interaction.is_free_form());
    }

    #[test]
    fn malformed_interaction_degrades_to_content() {
        let doc = "?[]";
        let blocks = parse(doc);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind, BlockKind::Content);
        assert_eq!(blocks[0].content, "?[]");
    }

    #[test]
    fn parsing_is_deterministic_and_restartable() {
        let doc = "A.\n===\n?[Yes//yes]\n===\nB.";
        let first = parse(doc);
        let second = parse(doc);
        assert_eq!(first, second);
        assert_eq!(first.iter().map(|b| b.index).collect::<Vec<_>>(), vec![
            0, 1, 2
        ]);
    }

    #[test]
    fn next_chapter_source_embeds_system_button() {
        let src = next_chapter_interaction_source("Chapter 2");
        assert_eq!(src, "?[Chapter 2//_sys_next_chapter](Chapter 2)");
    }
}
