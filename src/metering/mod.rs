//! C10 — Metering Recorder.
//!
//! Best-effort, never fatal: both entry points swallow store failures
//! after logging them, the same way `store::sqlite::SqliteStore`'s own
//! usage-insert path is documented to behave. Usage records come in two
//! levels — request-level and segment-level, linked by `parent_usage_bid`.

use miette::Diagnostic;
use thiserror::Error;
use tracing::warn;

use crate::store::models::BillUsageRecord;
use crate::store::Store;
use crate::types::{generate_id, Bid, RecordLevel, UsageScene, UsageType};

#[derive(Debug, Error, Diagnostic)]
pub enum MeteringError {
    #[error("metering backend error: {0}")]
    #[diagnostic(code(metering::backend))]
    Backend(String),
}

/// Fields common to every usage record regardless of whether it covers an
/// LLM call or a TTS segment.
#[derive(Clone, Debug)]
pub struct UsageCall {
    pub user_bid: Bid,
    pub shifu_bid: Bid,
    pub scene: UsageScene,
    pub provider: String,
    pub model: String,
    pub is_stream: bool,
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub word_count: u32,
    pub duration_ms: u64,
    pub latency_ms: u64,
    pub status: String,
    pub error_message: Option<String>,
    /// Explicit billability override; `None` defers to `scene.default_billable()`.
    pub billable_override: Option<bool>,
    pub extra: serde_json::Value,
}

fn resolve_billable(call: &UsageCall) -> bool {
    call.billable_override.unwrap_or_else(|| call.scene.default_billable())
}

/// Records one request-level LLM usage row. Never returns an error to the
/// caller: a persistence failure is logged and absorbed so the run loop
/// that triggered the LLM call is unaffected.
pub async fn record_llm_usage(store: &dyn Store, call: UsageCall, usage_bid: Option<Bid>) -> Bid {
    let usage_bid = usage_bid.unwrap_or_else(generate_id);
    let record = BillUsageRecord {
        usage_bid: usage_bid.clone(),
        parent_usage_bid: None,
        user_bid: call.user_bid.clone(),
        shifu_bid: call.shifu_bid.clone(),
        usage_type: UsageType::Llm as u16,
        record_level: RecordLevel::Request as u8,
        usage_scene: call.scene as u16,
        provider: call.provider.clone(),
        model: call.model.clone(),
        is_stream: call.is_stream,
        input: call.input,
        output: call.output,
        total: call.total,
        word_count: call.word_count,
        duration_ms: call.duration_ms,
        latency_ms: call.latency_ms,
        segment_index: None,
        segment_count: None,
        billable: resolve_billable(&call),
        status: call.status.clone(),
        error_message: call.error_message.clone(),
        extra: call.extra.clone(),
    };

    if let Err(err) = store.insert_usage(record).await {
        warn!(usage_bid = %usage_bid, error = %err, "failed to persist LLM usage record");
    }
    usage_bid
}

/// Records one TTS usage row. `segment` carries `(segment_index,
/// segment_count, parent_usage_bid)` for segment-level rows
/// (`record_level = 1`); pass `None` for the request-level roll-up row.
pub async fn record_tts_usage(
    store: &dyn Store,
    call: UsageCall,
    usage_bid: Option<Bid>,
    segment: Option<(u32, u32, Bid)>,
) -> Bid {
    let usage_bid = usage_bid.unwrap_or_else(generate_id);
    let (record_level, segment_index, segment_count, parent_usage_bid) = match segment {
        Some((idx, count, parent)) => (RecordLevel::Segment, Some(idx), Some(count), Some(parent)),
        None => (RecordLevel::Request, None, None, None),
    };

    let record = BillUsageRecord {
        usage_bid: usage_bid.clone(),
        parent_usage_bid,
        user_bid: call.user_bid.clone(),
        shifu_bid: call.shifu_bid.clone(),
        usage_type: UsageType::Tts as u16,
        record_level: record_level as u8,
        usage_scene: call.scene as u16,
        provider: call.provider.clone(),
        model: call.model.clone(),
        is_stream: call.is_stream,
        input: call.input,
        output: call.output,
        total: call.total,
        word_count: call.word_count,
        duration_ms: call.duration_ms,
        latency_ms: call.latency_ms,
        segment_index,
        segment_count,
        billable: resolve_billable(&call),
        status: call.status.clone(),
        error_message: call.error_message.clone(),
        extra: call.extra.clone(),
    };

    if let Err(err) = store.insert_usage(record).await {
        warn!(usage_bid = %usage_bid, error = %err, "failed to persist TTS usage record");
    }
    usage_bid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn base_call() -> UsageCall {
        UsageCall {
            user_bid: "user-1".into(),
            shifu_bid: "shifu-1".into(),
            scene: UsageScene::Debug,
            provider: "openai".into(),
            model: "gpt-5".into(),
            is_stream: true,
            input: 100,
            output: 50,
            total: 150,
            word_count: 40,
            duration_ms: 0,
            latency_ms: 320,
            status: "ok".into(),
            error_message: None,
            billable_override: None,
            extra: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn llm_usage_defaults_to_non_billable_outside_production() {
        let store = InMemoryStore::new();
        let bid = record_llm_usage(&store, base_call(), None).await;
        assert!(!bid.is_empty());
    }

    #[tokio::test]
    async fn billable_override_wins_over_scene_default() {
        let mut call = base_call();
        call.billable_override = Some(true);
        assert!(resolve_billable(&call));

        call.billable_override = None;
        call.scene = UsageScene::Production;
        assert!(resolve_billable(&call));

        call.scene = UsageScene::Preview;
        assert!(!resolve_billable(&call));
    }

    #[tokio::test]
    async fn tts_segment_usage_carries_parent_linkage() {
        let store = InMemoryStore::new();
        let parent = record_tts_usage(&store, base_call(), None, None).await;
        let _segment = record_tts_usage(&store, base_call(), None, Some((0, 3, parent.clone()))).await;
    }
}
