//! Emitter seam: the Runner and Orchestrator hold `Arc<dyn EventEmitter>`
//! rather than a concrete bus, so either can be wired to a broadcast hub,
//! a channel sink, or a test double.

use super::event::Event;

#[async_trait::async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: Event);
}
