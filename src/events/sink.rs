//! Pluggable sinks: where broadcast events end up (`EventSink`,
//! `StdOutSink`, `ChannelSink`, `MemorySink`).

use parking_lot::Mutex;
use std::sync::Arc;

use super::event::Event;
use crate::telemetry::{FormatterMode, PlainFormatter, TelemetryFormatter};

pub trait EventSink: Send {
    fn handle(&mut self, event: &Event) -> Result<(), String>;
}

/// Writes human-readable lines to stdout; the default sink for local runs.
pub struct StdOutSink {
    formatter: PlainFormatter,
}

impl Default for StdOutSink {
    fn default() -> Self {
        Self {
            formatter: PlainFormatter::with_mode(FormatterMode::Auto),
        }
    }
}

impl EventSink for StdOutSink {
    fn handle(&mut self, event: &Event) -> Result<(), String> {
        print!("{}", self.formatter.render_event(event).join_lines());
        Ok(())
    }
}

/// Forwards every event onto an unbounded `flume` channel — the sink an
/// HTTP handler uses to turn the broadcast into an SSE body stream.
pub struct ChannelSink {
    tx: flume::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: flume::Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &Event) -> Result<(), String> {
        self.tx.send(event.clone()).map_err(|e| e.to_string())
    }
}

/// Captures every event in memory; used by tests to assert on exact
/// ordering.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &Event) -> Result<(), String> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_accumulates_events_in_handle_order() {
        let mut sink = MemorySink::new();
        sink.handle(&Event::content_chunk("outline-1".to_string(), "block-1".to_string(), "a")).unwrap();
        sink.handle(&Event::brk("outline-1".to_string(), "block-1".to_string())).unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, crate::events::event::EventType::Content);
        assert_eq!(events[1].event_type, crate::events::event::EventType::Break);
    }

    #[test]
    fn cloning_a_memory_sink_shares_the_same_backing_buffer() {
        let sink = MemorySink::new();
        let clone = sink.clone();
        let mut mutable_clone = clone;
        mutable_clone.handle(&Event::brk("outline-1".to_string(), "block-1".to_string())).unwrap();

        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn channel_sink_forwards_events_to_the_receiver() {
        let (tx, rx) = flume::unbounded();
        let mut sink = ChannelSink::new(tx);
        sink.handle(&Event::brk("outline-1".to_string(), "block-1".to_string())).unwrap();

        let received = rx.try_recv().unwrap();
        assert_eq!(received.event_type, crate::events::event::EventType::Break);
    }

    #[test]
    fn channel_sink_reports_an_error_when_the_receiver_is_dropped() {
        let (tx, rx) = flume::unbounded();
        drop(rx);
        let mut sink = ChannelSink::new(tx);
        assert!(sink.handle(&Event::brk("outline-1".to_string(), "block-1".to_string())).is_err());
    }
}
