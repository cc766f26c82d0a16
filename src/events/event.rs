//! The wire event shape: `RunMarkdownFlow` frames, one per SSE `data:` line.
//! `to_json_value`/`to_sse_frame` normalize each of the nine frame types
//! this engine emits into the same `{outline_bid, generated_block_bid,
//! type, content}` shape.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::Bid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Content,
    Break,
    Interaction,
    VariableUpdate,
    OutlineItemUpdate,
    NewSlide,
    AudioSegment,
    AudioComplete,
    Done,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableUpdatePayload {
    pub variable_name: String,
    pub variable_value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlineStatusWire {
    NotStarted,
    InProgress,
    Completed,
    Locked,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutlineItemUpdatePayload {
    pub outline_bid: Bid,
    pub title: String,
    pub status: OutlineStatusWire,
    pub has_children: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioSegmentPayload {
    pub position: u32,
    pub segment_index: u32,
    pub audio_data: String,
    pub duration_ms: u64,
    pub is_final: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioCompletePayload {
    pub position: u32,
    pub audio_url: String,
    pub audio_bid: Bid,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewSlidePayload {
    pub slide_id: Bid,
    pub generated_block_bid: Bid,
    pub slide_index: u32,
    pub audio_position: u32,
    pub visual_kind: String,
    pub segment_type: String,
    pub segment_content: String,
    pub source_span: (usize, usize),
    pub is_placeholder: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Text(String),
    Variable(VariableUpdatePayload),
    OutlineItem(OutlineItemUpdatePayload),
    AudioSegment(AudioSegmentPayload),
    AudioComplete(AudioCompletePayload),
    NewSlide(NewSlidePayload),
    Empty,
}

/// One `RunMarkdownFlow` event: `{outline_bid, generated_block_bid, type, content}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub outline_bid: Bid,
    pub generated_block_bid: Bid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub content: EventPayload,
}

impl Event {
    pub fn content_chunk(outline_bid: Bid, generated_block_bid: Bid, chunk: impl Into<String>) -> Self {
        Event {
            outline_bid,
            generated_block_bid,
            event_type: EventType::Content,
            content: EventPayload::Text(chunk.into()),
        }
    }

    pub fn brk(outline_bid: Bid, generated_block_bid: Bid) -> Self {
        Event {
            outline_bid,
            generated_block_bid,
            event_type: EventType::Break,
            content: EventPayload::Empty,
        }
    }

    pub fn interaction(outline_bid: Bid, generated_block_bid: Bid, source: impl Into<String>) -> Self {
        Event {
            outline_bid,
            generated_block_bid,
            event_type: EventType::Interaction,
            content: EventPayload::Text(source.into()),
        }
    }

    pub fn variable_update(
        outline_bid: Bid,
        generated_block_bid: Bid,
        variable_name: impl Into<String>,
        variable_value: impl Into<String>,
    ) -> Self {
        Event {
            outline_bid,
            generated_block_bid,
            event_type: EventType::VariableUpdate,
            content: EventPayload::Variable(VariableUpdatePayload {
                variable_name: variable_name.into(),
                variable_value: variable_value.into(),
            }),
        }
    }

    pub fn outline_item_update(
        outline_bid: Bid,
        generated_block_bid: Bid,
        payload: OutlineItemUpdatePayload,
    ) -> Self {
        Event {
            outline_bid,
            generated_block_bid,
            event_type: EventType::OutlineItemUpdate,
            content: EventPayload::OutlineItem(payload),
        }
    }

    pub fn audio_segment(outline_bid: Bid, generated_block_bid: Bid, payload: AudioSegmentPayload) -> Self {
        Event {
            outline_bid,
            generated_block_bid,
            event_type: EventType::AudioSegment,
            content: EventPayload::AudioSegment(payload),
        }
    }

    pub fn audio_complete(outline_bid: Bid, generated_block_bid: Bid, payload: AudioCompletePayload) -> Self {
        Event {
            outline_bid,
            generated_block_bid,
            event_type: EventType::AudioComplete,
            content: EventPayload::AudioComplete(payload),
        }
    }

    pub fn new_slide(outline_bid: Bid, generated_block_bid: Bid, payload: NewSlidePayload) -> Self {
        Event {
            outline_bid,
            generated_block_bid,
            event_type: EventType::NewSlide,
            content: EventPayload::NewSlide(payload),
        }
    }

    pub fn done(outline_bid: Bid, generated_block_bid: Bid) -> Self {
        Event {
            outline_bid,
            generated_block_bid,
            event_type: EventType::Done,
            content: EventPayload::Empty,
        }
    }

    pub fn scope_label(&self) -> &'static str {
        match self.event_type {
            EventType::Content => "content",
            EventType::Break => "break",
            EventType::Interaction => "interaction",
            EventType::VariableUpdate => "variable_update",
            EventType::OutlineItemUpdate => "outline_item_update",
            EventType::NewSlide => "new_slide",
            EventType::AudioSegment => "audio_segment",
            EventType::AudioComplete => "audio_complete",
            EventType::Done => "done",
        }
    }

    pub fn to_json_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({"type": self.scope_label()}))
    }

    /// Render as the SSE wire frame: `data: <compact-json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json_value())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}@{}] {}", self.outline_bid, self.generated_block_bid, self.scope_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_sse_frame_wraps_compact_json_in_a_data_line() {
        let event = Event::content_chunk("outline-1".to_string(), "block-1".to_string(), "hi");
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"type\":\"content\""));
    }

    #[test]
    fn text_payload_round_trips_through_json() {
        let event = Event::interaction("outline-1".to_string(), "block-1".to_string(), "?[Yes//yes]");
        let value = event.to_json_value();
        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn variable_update_payload_serializes_untagged() {
        let event = Event::variable_update("outline-1".to_string(), "block-1".to_string(), "lang", "rust");
        let value = event.to_json_value();
        assert_eq!(value["content"]["variable_name"], "lang");
        assert_eq!(value["content"]["variable_value"], "rust");
    }

    #[test]
    fn empty_payload_variants_serialize_to_null() {
        let brk = Event::brk("outline-1".to_string(), "block-1".to_string());
        assert_eq!(brk.to_json_value()["content"], Value::Null);
        let done = Event::done("outline-1".to_string(), "block-1".to_string());
        assert_eq!(done.to_json_value()["content"], Value::Null);
    }

    #[test]
    fn scope_label_matches_every_event_type() {
        let outline_item = Event::outline_item_update(
            "outline-1".to_string(),
            String::new(),
            OutlineItemUpdatePayload {
                outline_bid: "outline-1".to_string(),
                title: "Chapter 1".to_string(),
                status: OutlineStatusWire::InProgress,
                has_children: false,
            },
        );
        assert_eq!(outline_item.scope_label(), "outline_item_update");
        assert_eq!(outline_item.event_type, EventType::OutlineItemUpdate);
    }

    #[test]
    fn display_formats_outline_and_block_scope() {
        let event = Event::brk("outline-1".to_string(), "block-1".to_string());
        assert_eq!(event.to_string(), "[outline-1@block-1] break");
    }
}
