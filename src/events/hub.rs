//! Broadcast hub: one producer (the run loop), many subscribers (sinks).

use std::sync::Arc;

use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::event::Event;

const DEFAULT_BUFFER_CAPACITY: usize = 1024;

pub type EventStream = broadcast::Receiver<Event>;

pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new(buffer_capacity: usize) -> Arc<Self> {
        let capacity = if buffer_capacity == 0 {
            DEFAULT_BUFFER_CAPACITY
        } else {
            buffer_capacity
        };
        let (tx, _rx) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> EventStream {
        self.tx.subscribe()
    }

    pub fn emitter(&self) -> HubEmitter {
        HubEmitter { tx: self.tx.clone() }
    }
}

#[derive(Clone)]
pub struct HubEmitter {
    tx: broadcast::Sender<Event>,
}

#[async_trait::async_trait]
impl EventEmitter for HubEmitter {
    async fn emit(&self, event: Event) {
        // A broadcast channel with no subscribers errors; that's fine, the
        // run loop does not need a live listener to make progress.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::generate_id;

    #[tokio::test]
    async fn a_subscriber_receives_events_emitted_after_it_subscribes() {
        let hub = EventHub::new(16);
        let mut stream = hub.subscribe();
        let emitter = hub.emitter();

        let outline = generate_id();
        let block = generate_id();
        emitter.emit(Event::brk(outline.clone(), block.clone())).await;

        let received = stream.recv().await.unwrap();
        assert_eq!(received.outline_bid, outline);
        assert_eq!(received.generated_block_bid, block);
    }

    #[tokio::test]
    async fn emitting_with_no_subscribers_does_not_panic() {
        let hub = EventHub::new(16);
        let emitter = hub.emitter();
        emitter.emit(Event::done("outline-1".to_string(), "block-1".to_string())).await;
    }

    #[test]
    fn a_zero_capacity_request_falls_back_to_the_default_buffer() {
        // Constructing with 0 must not panic (tokio::broadcast::channel(0) panics).
        let hub = EventHub::new(0);
        drop(hub.subscribe());
    }

    #[tokio::test]
    async fn every_subscriber_gets_its_own_copy_of_each_event() {
        let hub = EventHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        let emitter = hub.emitter();

        emitter.emit(Event::brk("outline-1".to_string(), "block-1".to_string())).await;

        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
