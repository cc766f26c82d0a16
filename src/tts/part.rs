//! C7a — Sub-Processor for a single audio part.
//!
//! First-sentence-ASAP segmentation, then batching by `max_segment_chars`
//! at the nearest trailing sentence terminator, synthesis on a shared
//! bounded worker pool, and in-order emission via a completed-segments
//! map keyed by `_next_yield_index`. A `parking_lot::Mutex` guards the
//! four pieces of shared state (completed segments, yield cursor,
//! accumulated audio, word count).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::error;

use crate::events::event::AudioSegmentPayload;
use crate::events::Event;
use crate::metering::{record_tts_usage, UsageCall};
use crate::store::Store;
use crate::tts::preprocess::preprocess_for_tts;
use crate::tts::{TtsSynthesizer, VoiceSettings};
use crate::types::{generate_id, Bid, UsageScene};

const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '\u{3002}', '\u{ff01}', '\u{ff1f}', ';', '\u{ff1b}'];
const SEGMENT_TIMEOUT: Duration = Duration::from_secs(60);

fn find_sentence_terminator(chars: &[char]) -> Option<usize> {
    chars.iter().position(|c| SENTENCE_TERMINATORS.contains(c))
}

fn last_sentence_terminator(chars: &[char]) -> Option<usize> {
    chars.iter().rposition(|c| SENTENCE_TERMINATORS.contains(c))
}

struct Segment {
    index: u32,
    text: String,
    audio_data: Option<Vec<u8>>,
    duration_ms: u64,
    word_count: u32,
    latency_ms: u64,
    error: Option<String>,
}

struct PartState {
    buffer: String,
    processed_text_offset: usize,
    first_sentence_done: bool,
    segment_index: u32,
    word_count_total: u32,
    completed_segments: HashMap<u32, Segment>,
    next_yield_index: u32,
    all_audio_data: Vec<(u32, Vec<u8>, u64)>,
    closed: bool,
    cleaned_text_length: usize,
    pending_handles: Vec<JoinHandle<()>>,
}

/// Per-part TTS state. Always used behind an `Arc` so spawned synthesis
/// tasks can update shared state after this value's owner has moved on
/// to later chunks.
pub struct TtsPart {
    pub position: u32,
    outline_bid: Bid,
    generated_block_bid: Bid,
    #[allow(dead_code)]
    progress_record_bid: Bid,
    user_bid: Bid,
    shifu_bid: Bid,
    max_segment_chars: usize,
    tts_provider: String,
    tts_model: String,
    voice_settings: VoiceSettings,
    usage_scene: UsageScene,
    audio_bid: Bid,
    usage_parent_bid: Bid,
    state: Mutex<PartState>,
    synthesizer: Arc<dyn TtsSynthesizer>,
    worker_pool: Arc<Semaphore>,
    store: Arc<dyn Store>,
}

impl TtsPart {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position: u32,
        outline_bid: Bid,
        generated_block_bid: Bid,
        progress_record_bid: Bid,
        user_bid: Bid,
        shifu_bid: Bid,
        max_segment_chars: usize,
        tts_provider: String,
        tts_model: String,
        voice_settings: VoiceSettings,
        usage_scene: UsageScene,
        synthesizer: Arc<dyn TtsSynthesizer>,
        worker_pool: Arc<Semaphore>,
        store: Arc<dyn Store>,
    ) -> Self {
        TtsPart {
            position,
            outline_bid,
            generated_block_bid,
            progress_record_bid,
            user_bid,
            shifu_bid,
            max_segment_chars: if max_segment_chars == 0 { 300 } else { max_segment_chars },
            tts_provider,
            tts_model,
            voice_settings,
            usage_scene,
            audio_bid: generate_id(),
            usage_parent_bid: generate_id(),
            state: Mutex::new(PartState {
                buffer: String::new(),
                processed_text_offset: 0,
                first_sentence_done: false,
                segment_index: 0,
                word_count_total: 0,
                completed_segments: HashMap::new(),
                next_yield_index: 0,
                all_audio_data: Vec::new(),
                closed: false,
                cleaned_text_length: 0,
            pending_handles: Vec::new(),
            }),
            synthesizer,
            worker_pool,
            store,
        }
    }

    pub fn audio_bid(&self) -> &str {
        &self.audio_bid
    }

    pub fn usage_parent_bid(&self) -> &str {
        &self.usage_parent_bid
    }

    pub fn has_audio(&self) -> bool {
        !self.state.lock().all_audio_data.is_empty()
    }

    pub fn segment_count(&self) -> u32 {
        self.state.lock().segment_index
    }

    pub fn word_count_total(&self) -> u32 {
        self.state.lock().word_count_total
    }

    /// Ordered `(index, bytes, duration_ms)` tuples for every segment that
    /// synthesised successfully, used by the orchestrator to join the
    /// part's final MP3 payload.
    pub fn audio_segments(&self) -> Vec<(u32, Vec<u8>, u64)> {
        let mut data = self.state.lock().all_audio_data.clone();
        data.sort_by_key(|(idx, _, _)| *idx);
        data
    }

    /// Appends new text, possibly submitting a new segment for
    /// synthesis, and returns any `AUDIO_SEGMENT` events that are ready
    /// to emit right now.
    pub async fn append_text(self: &Arc<Self>, delta: &str) -> Vec<Event> {
        if delta.is_empty() {
            return self.yield_ready_segments();
        }
        {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                return self.yield_ready_segments();
            }
            state.buffer.push_str(delta);
        }
        self.try_submit_tts_task();
        self.yield_ready_segments()
    }

    /// Closes the part: submits any remaining buffered text (if long
    /// enough to be worth synthesising) as the final segment.
    pub fn close(self: &Arc<Self>) {
        let remaining_text = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if state.buffer.is_empty() {
                None
            } else {
                let full_text: Vec<char> = preprocess_for_tts(&state.buffer).chars().collect();
                state.cleaned_text_length = full_text.len();
                if state.processed_text_offset > full_text.len() {
                    state.processed_text_offset = full_text.len();
                }
                let remaining: String = full_text[state.processed_text_offset..].iter().collect();
                let trimmed = remaining.trim().to_string();
                if trimmed.chars().count() >= 2 {
                    Some(trimmed)
                } else {
                    None
                }
            }
        };

        if let Some(text) = remaining_text {
            self.submit_tts_task(text);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Awaits every outstanding synthesis task, bounded by the per-segment
    /// timeout already enforced inside each task.
    pub async fn wait_for_futures(&self) {
        let handles = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending_handles)
        };
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, position = self.position, "tts segment task panicked");
            }
        }
    }

    pub fn yield_ready_segments(&self) -> Vec<Event> {
        let mut out = Vec::new();
        loop {
            let mut state = self.state.lock();
            let idx = state.next_yield_index;
            let Some(segment) = state.completed_segments.remove(&idx) else {
                break;
            };
            state.next_yield_index += 1;
            let is_final = state.closed && state.next_yield_index >= state.segment_index;
            let emit = match (&segment.audio_data, &segment.error) {
                (Some(audio), None) => {
                    state.all_audio_data.push((segment.index, audio.clone(), segment.duration_ms));
                    Some(audio.clone())
                }
                _ => None,
            };
            drop(state);

            if let Some(audio) = emit {
                out.push(Event::audio_segment(
                    self.outline_bid.clone(),
                    self.generated_block_bid.clone(),
                    AudioSegmentPayload {
                        position: self.position,
                        segment_index: segment.index,
                        audio_data: BASE64.encode(&audio),
                        duration_ms: segment.duration_ms,
                        is_final,
                    },
                ));
            }
        }
        out
    }

    fn try_submit_tts_task(self: &Arc<Self>) {
        let text_to_synthesize = {
            let mut state = self.state.lock();
            if state.buffer.is_empty() {
                return;
            }
            let processable: Vec<char> = preprocess_for_tts(&state.buffer).chars().collect();
            if processable.is_empty() {
                return;
            }
            if state.processed_text_offset > processable.len() {
                state.processed_text_offset = processable.len();
            }

            let mut remaining: Vec<char> = processable[state.processed_text_offset..].to_vec();
            if remaining.is_empty() {
                return;
            }

            let leading_ws = remaining.iter().take_while(|c| c.is_whitespace()).count();
            if leading_ws > 0 {
                state.processed_text_offset += leading_ws;
                remaining.drain(0..leading_ws);
            }

            if remaining.len() < 2 {
                return;
            }

            let mut consume_len = 0usize;
            let mut candidate: Option<String> = None;

            if !state.first_sentence_done {
                if let Some(pos) = find_sentence_terminator(&remaining) {
                    consume_len = pos + 1;
                    let text: String = remaining[..consume_len].iter().collect();
                    let trimmed = text.trim().to_string();
                    if trimmed.chars().count() >= 2 {
                        candidate = Some(trimmed);
                        state.first_sentence_done = true;
                    }
                }
            } else if remaining.len() >= self.max_segment_chars {
                let chunk = &remaining[..self.max_segment_chars];
                consume_len = last_sentence_terminator(chunk).map(|p| p + 1).unwrap_or(self.max_segment_chars);
                let text: String = remaining[..consume_len].iter().collect();
                candidate = Some(text.trim().to_string());
            }

            if consume_len > 0 {
                state.processed_text_offset += consume_len;
            }

            candidate
        };

        if let Some(text) = text_to_synthesize {
            if !text.is_empty() {
                self.submit_tts_task(text);
            }
        }
    }

    fn submit_tts_task(self: &Arc<Self>, text: String) {
        let segment_index = {
            let mut state = self.state.lock();
            let idx = state.segment_index;
            state.segment_index += 1;
            idx
        };

        let this = Arc::clone(self);
        let pool = Arc::clone(&self.worker_pool);

        let handle = tokio::spawn(async move {
            let _permit = pool.acquire_owned().await.expect("tts worker pool semaphore never closes");
            let started = Instant::now();
            let segment_len = text.chars().count() as u64;

            let outcome = tokio::time::timeout(
                SEGMENT_TIMEOUT,
                this.synthesizer.synthesize(&text, &this.voice_settings, &this.tts_model, &this.tts_provider),
            )
            .await;

            let mut segment = Segment {
                index: segment_index,
                text,
                audio_data: None,
                duration_ms: 0,
                word_count: 0,
                latency_ms: started.elapsed().as_millis() as u64,
                error: None,
            };

            match outcome {
                Ok(Ok(result)) => {
                    segment.audio_data = Some(result.audio_data);
                    segment.duration_ms = result.duration_ms;
                    segment.word_count = result.word_count;
                    this.record_segment_usage(&segment, segment_len).await;
                    this.state.lock().word_count_total += segment.word_count;
                }
                Ok(Err(err)) => {
                    segment.error = Some(err.to_string());
                    this.record_segment_usage(&segment, segment_len).await;
                }
                Err(_) => {
                    segment.error = Some("tts segment synthesis timed out".to_string());
                    this.record_segment_usage(&segment, segment_len).await;
                }
            }

            this.state.lock().completed_segments.insert(segment_index, segment);
        });

        self.state.lock().pending_handles.push(handle);
    }

    async fn record_segment_usage(&self, segment: &Segment, segment_len_chars: u64) {
        let extra = json!({
            "voice_id": self.voice_settings.voice_id,
            "speed": self.voice_settings.speed,
            "pitch": self.voice_settings.pitch,
            "emotion": self.voice_settings.emotion,
            "volume": self.voice_settings.volume,
            "format": self.voice_settings.format,
            "sample_rate": self.voice_settings.sample_rate,
        });
        let call = UsageCall {
            user_bid: self.user_bid.clone(),
            shifu_bid: self.shifu_bid.clone(),
            scene: self.usage_scene,
            provider: self.tts_provider.clone(),
            model: self.tts_model.clone(),
            is_stream: true,
            input: segment_len_chars,
            output: segment_len_chars,
            total: segment_len_chars,
            word_count: segment.word_count,
            duration_ms: segment.duration_ms,
            latency_ms: segment.latency_ms,
            status: if segment.error.is_some() { "error" } else { "ok" }.to_string(),
            error_message: segment.error.clone(),
            billable_override: None,
            extra,
        };
        record_tts_usage(
            self.store.as_ref(),
            call,
            None,
            Some((segment.index, 0, self.usage_parent_bid.clone())),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    struct StubSynthesizer;

    #[async_trait]
    impl TtsSynthesizer for StubSynthesizer {
        async fn synthesize(
            &self,
            text: &str,
            _settings: &VoiceSettings,
            _model: &str,
            _provider: &str,
        ) -> crate::tts::Result<crate::tts::TtsSynthesisResult> {
            Ok(crate::tts::TtsSynthesisResult {
                audio_data: text.as_bytes().to_vec(),
                duration_ms: (text.len() as u64) * 10,
                word_count: text.split_whitespace().count() as u32,
            })
        }
    }

    fn make_part() -> Arc<TtsPart> {
        Arc::new(TtsPart::new(
            0,
            "outline-1".into(),
            "block-1".into(),
            "progress-1".into(),
            "user-1".into(),
            "shifu-1".into(),
            300,
            "stub".into(),
            "stub-model".into(),
            VoiceSettings::default(),
            UsageScene::Debug,
            Arc::new(StubSynthesizer),
            Arc::new(Semaphore::new(4)),
            Arc::new(InMemoryStore::new()),
        ))
    }

    #[tokio::test]
    async fn first_sentence_is_submitted_as_soon_as_a_terminator_appears() {
        let part = make_part();
        part.append_text("Hello world").await;
        assert_eq!(part.segment_count(), 0);
        part.append_text(". More text follows without a terminator yet").await;
        assert_eq!(part.segment_count(), 1);
    }

    #[tokio::test]
    async fn close_submits_remaining_buffer_as_final_segment() {
        let part = make_part();
        part.append_text("Hello world. ").await;
        part.close();
        part.wait_for_futures().await;
        let events = part.yield_ready_segments();
        assert!(events.iter().any(|e| matches!(e.event_type, crate::events::event::EventType::AudioSegment)));
        assert!(part.has_audio());
    }

    #[tokio::test]
    async fn closing_an_already_closed_part_is_a_no_op() {
        let part = make_part();
        part.close();
        part.close();
        assert!(part.is_closed());
    }

    #[tokio::test]
    async fn segments_are_emitted_in_ascending_order() {
        let part = make_part();
        part.append_text("One. Two. Three. Four. Five. Six. ").await;
        part.close();
        part.wait_for_futures().await;
        let events = part.yield_ready_segments();
        let indices: Vec<u32> = events
            .iter()
            .filter_map(|e| match &e.content {
                crate::events::event::EventPayload::AudioSegment(p) => Some(p.segment_index),
                _ => None,
            })
            .collect();
        let mut sorted = indices.clone();
        sorted.sort();
        assert_eq!(indices, sorted);
    }
}
