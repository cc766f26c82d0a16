//! C8 — Event Emitter / Stream Protocol.
//!
//! `RunMarkdownFlow` events flow from the Block Runner (C3) and the
//! Streaming TTS Orchestrator (C7) through an [`EventBus`] to one or more
//! [`EventSink`]s — stdout for local runs, a channel sink for an HTTP
//! handler turning the stream into SSE. The ordering guarantee — the
//! transport must not reorder events — is upheld because a single
//! `tokio::sync::broadcast` channel preserves producer order per-subscriber.

mod bus;
mod emitter;
pub mod event;
mod hub;
pub mod sink;

pub use bus::EventBus;
pub use emitter::EventEmitter;
pub use event::{Event, EventPayload, EventType};
pub use hub::EventStream;
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};

use serde_json::json;

/// The terminating error frame: `data: {"type":"error", ...}` followed
/// by `done`. Not part of the nine-variant `Event` schema
/// (it only ever appears once, at stream end, in place of the next event).
pub fn error_frame(message: &str, details: serde_json::Value) -> String {
    format!(
        "data: {}\n\n",
        json!({"type": "error", "message": message, "details": details})
    )
}
