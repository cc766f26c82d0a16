//! C7 — Streaming TTS Orchestrator.
//!
//! Owns the sequence of [`TtsPart`]s for one generated block, watching the
//! raw text as it arrives for a complete visual region. Each
//! boundary closes the open part, emits `NEW_SLIDE`, and opens a fresh part
//! for the prose that follows. Keeps a `pending_buffer` of everything
//! seen so far and a `position_cursor` marking how much of it has
//! already been split into closed `parts`.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::events::event::{AudioCompletePayload, NewSlidePayload};
use crate::events::Event;
use crate::metering::{record_tts_usage, UsageCall};
use crate::store::models::LearnGeneratedAudio;
use crate::store::Store;
use crate::tts::part::TtsPart;
use crate::tts::{join_audio_bytes, AudioStorage, TtsSynthesizer, VoiceSettings};
use crate::types::{generate_id, AudioStatus, Bid, UsageScene};
use crate::visual::{find_earliest_complete_visual, has_incomplete_visual};

pub struct StreamingTtsProcessor {
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
    parts: Vec<Arc<TtsPart>>,
    open_part: Option<Arc<TtsPart>>,
    pending_buffer: String,
    position_cursor: u32,
    slide_index: u32,
}

impl StreamingTtsProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
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
        StreamingTtsProcessor {
            outline_bid,
            generated_block_bid,
            progress_record_bid,
            user_bid,
            shifu_bid,
            max_segment_chars,
            tts_provider,
            tts_model,
            voice_settings,
            usage_scene,
            synthesizer,
            worker_pool,
            store,
            parts: Vec::new(),
            open_part: None,
            pending_buffer: String::new(),
            position_cursor: 0,
            slide_index: 0,
        }
    }

    fn ensure_open_part(&mut self) -> Arc<TtsPart> {
        if let Some(part) = &self.open_part {
            return Arc::clone(part);
        }
        let part = Arc::new(TtsPart::new(
            self.position_cursor,
            self.outline_bid.clone(),
            self.generated_block_bid.clone(),
            self.progress_record_bid.clone(),
            self.user_bid.clone(),
            self.shifu_bid.clone(),
            self.max_segment_chars,
            self.tts_provider.clone(),
            self.tts_model.clone(),
            self.voice_settings.clone(),
            self.usage_scene,
            Arc::clone(&self.synthesizer),
            Arc::clone(&self.worker_pool),
            Arc::clone(&self.store),
        ));
        self.open_part = Some(Arc::clone(&part));
        part
    }

    fn close_open_part(&mut self) {
        let Some(part) = self.open_part.take() else {
            return;
        };
        part.close();
        if part.segment_count() > 0 || part.has_audio() {
            self.parts.push(part);
            self.position_cursor += 1;
        }
    }

    /// Feeds newly-generated prose into the processor, returning whatever
    /// `AUDIO_SEGMENT`/`NEW_SLIDE` events are ready to emit right now.
    pub async fn push_text(&mut self, delta: &str) -> Vec<Event> {
        self.pending_buffer.push_str(delta);
        let mut events = Vec::new();

        loop {
            let Some(found) = find_earliest_complete_visual(&self.pending_buffer) else {
                break;
            };
            let before = self.pending_buffer[..found.start].to_string();
            let after = self.pending_buffer[found.end..].to_string();

            if !before.is_empty() {
                let part = self.ensure_open_part();
                events.extend(part.append_text(&before).await);
            }
            self.close_open_part();

            self.slide_index += 1;
            events.push(Event::new_slide(
                self.outline_bid.clone(),
                self.generated_block_bid.clone(),
                NewSlidePayload {
                    slide_id: generate_id(),
                    generated_block_bid: self.generated_block_bid.clone(),
                    slide_index: self.slide_index,
                    audio_position: self.position_cursor,
                    visual_kind: format!("{:?}", found.kind).to_lowercase(),
                    segment_type: "visual".to_string(),
                    segment_content: found.content.clone(),
                    source_span: (found.start, found.end),
                    is_placeholder: false,
                },
            ));

            self.pending_buffer = after;
        }

        if !self.pending_buffer.is_empty() && !has_incomplete_visual(&self.pending_buffer) {
            let text = std::mem::take(&mut self.pending_buffer);
            let part = self.ensure_open_part();
            events.extend(part.append_text(&text).await);
        }

        events
    }

    /// Closes the current part and persists every part's joined audio,
    /// emitting `AUDIO_COMPLETE` for each one in position order.
    pub async fn finalize(&mut self, storage: &dyn AudioStorage) -> Vec<Event> {
        if !self.pending_buffer.is_empty() {
            let text = std::mem::take(&mut self.pending_buffer);
            let part = self.ensure_open_part();
            part.append_text(&text).await;
        }
        self.close_open_part();

        let mut events = Vec::new();
        for part in &self.parts {
            part.wait_for_futures().await;
            events.extend(part.yield_ready_segments());

            let segments = part.audio_segments();
            if segments.is_empty() {
                continue;
            }
            let audio_bytes = join_audio_bytes(&segments.iter().map(|(_, b, _)| b.clone()).collect::<Vec<_>>());
            let duration_ms: u64 = segments.iter().map(|(_, _, d)| d).sum();
            let text_length = part.word_count_total();
            let segment_count = segments.len() as u32;

            let key = format!("{}/{}.mp3", self.generated_block_bid, part.audio_bid());
            let (audio_url, status, error_message) = match storage.upload(&key, &audio_bytes).await {
                Ok(url) => (url, AudioStatus::Completed, None),
                Err(err) => {
                    warn!(error = %err, position = part.position, "tts audio upload failed");
                    (String::new(), AudioStatus::Failed, Some(err.to_string()))
                }
            };

            let audio_row = LearnGeneratedAudio {
                audio_bid: part.audio_bid().to_string(),
                generated_block_bid: self.generated_block_bid.clone(),
                position: part.position,
                progress_record_bid: self.progress_record_bid.clone(),
                user_bid: self.user_bid.clone(),
                shifu_bid: self.shifu_bid.clone(),
                oss_url: audio_url.clone(),
                oss_bucket: String::new(),
                oss_object_key: key,
                duration_ms,
                file_size: audio_bytes.len() as u64,
                audio_format: self.voice_settings.format.clone(),
                sample_rate: self.voice_settings.sample_rate,
                voice_id: self.voice_settings.voice_id.clone(),
                voice_settings: serde_json::to_value(&self.voice_settings).unwrap_or(serde_json::Value::Null),
                model: self.tts_model.clone(),
                text_length,
                segment_count,
                status,
                error_message: error_message.clone(),
                deleted: false,
            };
            if let Err(err) = self.store.insert_audio(audio_row).await {
                warn!(error = %err, position = part.position, "failed to persist generated audio row");
            }

            record_tts_usage(
                self.store.as_ref(),
                UsageCall {
                    user_bid: self.user_bid.clone(),
                    shifu_bid: self.shifu_bid.clone(),
                    scene: self.usage_scene,
                    provider: self.tts_provider.clone(),
                    model: self.tts_model.clone(),
                    is_stream: true,
                    input: text_length as u64,
                    output: text_length as u64,
                    total: text_length as u64,
                    word_count: text_length,
                    duration_ms,
                    latency_ms: 0,
                    status: if error_message.is_some() { "error" } else { "ok" }.to_string(),
                    error_message,
                    billable_override: None,
                    extra: serde_json::json!({"segment_count": segment_count}),
                },
                Some(part.usage_parent_bid().to_string()),
                None,
            )
            .await;

            events.push(Event::audio_complete(
                self.outline_bid.clone(),
                self.generated_block_bid.clone(),
                AudioCompletePayload {
                    position: part.position,
                    audio_url,
                    audio_bid: part.audio_bid().to_string(),
                    duration_ms,
                },
            ));
        }

        events
    }

    /// Preview-mode finalisation: skips upload and persistence, emitting
    /// `AUDIO_COMPLETE` with an empty `audio_url` so the client knows a
    /// part ended without pretending durable audio exists.
    pub async fn finalize_preview(&mut self) -> Vec<Event> {
        if !self.pending_buffer.is_empty() {
            let text = std::mem::take(&mut self.pending_buffer);
            let part = self.ensure_open_part();
            part.append_text(&text).await;
        }
        self.close_open_part();

        let mut events = Vec::new();
        for part in &self.parts {
            part.wait_for_futures().await;
            events.extend(part.yield_ready_segments());
            let duration_ms: u64 = part.audio_segments().iter().map(|(_, _, d)| d).sum();
            events.push(Event::audio_complete(
                self.outline_bid.clone(),
                self.generated_block_bid.clone(),
                AudioCompletePayload {
                    position: part.position,
                    audio_url: String::new(),
                    audio_bid: part.audio_bid().to_string(),
                    duration_ms,
                },
            ));
        }
        events
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
                duration_ms: 10,
                word_count: text.split_whitespace().count() as u32,
            })
        }
    }

    struct StubStorage;

    #[async_trait]
    impl AudioStorage for StubStorage {
        async fn upload(&self, key: &str, _bytes: &[u8]) -> crate::tts::Result<String> {
            Ok(format!("https://audio.example/{key}"))
        }
    }

    fn make_processor() -> StreamingTtsProcessor {
        StreamingTtsProcessor::new(
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
        )
    }

    #[tokio::test]
    async fn plain_prose_never_emits_a_new_slide() {
        let mut processor = make_processor();
        let events = processor.push_text("Hello world. No visuals here.").await;
        assert!(!events.iter().any(|e| matches!(e.event_type, crate::events::event::EventType::NewSlide)));
    }

    #[tokio::test]
    async fn a_complete_svg_closes_the_part_and_emits_a_new_slide() {
        let mut processor = make_processor();
        let events = processor
            .push_text("Look at this. <svg><text>v</text></svg> And after.")
            .await;
        assert!(events.iter().any(|e| matches!(e.event_type, crate::events::event::EventType::NewSlide)));
        assert_eq!(processor.position_cursor, 1);
    }

    #[tokio::test]
    async fn a_visual_with_no_leading_prose_does_not_advance_position() {
        let mut processor = make_processor();
        let events = processor.push_text("<svg><text>v</text></svg>After.").await;
        assert!(events.iter().any(|e| matches!(e.event_type, crate::events::event::EventType::NewSlide)));
        assert_eq!(processor.position_cursor, 0);
        let slide = events
            .iter()
            .find_map(|e| match &e.content {
                crate::events::event::EventPayload::NewSlide(p) => Some(p),
                _ => None,
            })
            .expect("expected a new_slide event");
        assert_eq!(slide.audio_position, 0);
    }

    #[tokio::test]
    async fn an_incomplete_visual_tail_is_held_back() {
        let mut processor = make_processor();
        let events = processor.push_text("Before it starts. <svg><text>v</text>").await;
        assert!(!events.iter().any(|e| matches!(e.event_type, crate::events::event::EventType::NewSlide)));
        assert!(!processor.pending_buffer.is_empty());
    }

    #[tokio::test]
    async fn finalize_emits_audio_complete_with_an_uploaded_url() {
        let mut processor = make_processor();
        processor.push_text("One. Two. Three. ").await;
        let events = processor.finalize(&StubStorage).await;
        let complete = events
            .iter()
            .find(|e| matches!(e.event_type, crate::events::event::EventType::AudioComplete))
            .expect("expected an audio_complete event");
        if let crate::events::event::EventPayload::AudioComplete(payload) = &complete.content {
            assert!(payload.audio_url.starts_with("https://audio.example/"));
        } else {
            panic!("wrong payload variant");
        }
    }

    #[tokio::test]
    async fn finalize_preview_never_uploads() {
        let mut processor = make_processor();
        processor.push_text("One. Two. ").await;
        let events = processor.finalize_preview().await;
        let complete = events
            .iter()
            .find(|e| matches!(e.event_type, crate::events::event::EventType::AudioComplete))
            .expect("expected an audio_complete event");
        if let crate::events::event::EventPayload::AudioComplete(payload) = &complete.content {
            assert!(payload.audio_url.is_empty());
        } else {
            panic!("wrong payload variant");
        }
    }
}
