//! C7 — Streaming TTS Orchestrator, plus C9's text preprocessor.
//!
//! `preprocess` is pure text transformation; `part` is the per-part
//! sub-processor (speakable-prose segmentation and bounded-pool
//! synthesis); `processor` is the sandbox-boundary-aware orchestrator
//! that owns the set of parts.

pub mod part;
pub mod preprocess;
pub mod processor;

pub use part::TtsPart;
pub use preprocess::{has_incomplete_block, preprocess_for_tts};
pub use processor::StreamingTtsProcessor;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TtsError {
    #[error("tts synthesis failed: {0}")]
    #[diagnostic(code(tts::synthesis_failed))]
    SynthesisFailed(String),

    #[error("tts segment synthesis timed out")]
    #[diagnostic(code(tts::timeout))]
    Timeout,

    #[error("audio upload failed: {0}")]
    #[diagnostic(code(tts::upload_failed))]
    UploadFailed(String),
}

pub type Result<T> = std::result::Result<T, TtsError>;

/// Voice/audio knobs resolved from the outline's `TtsSettings`,
/// possibly overridden per-call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub voice_id: String,
    pub speed: f32,
    pub pitch: i32,
    pub emotion: String,
    pub volume: f32,
    pub format: String,
    pub sample_rate: u32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        VoiceSettings {
            voice_id: String::new(),
            speed: 1.0,
            pitch: 0,
            emotion: String::new(),
            volume: 1.0,
            format: "mp3".to_string(),
            sample_rate: 24_000,
        }
    }
}

pub struct TtsSynthesisResult {
    pub audio_data: Vec<u8>,
    pub duration_ms: u64,
    pub word_count: u32,
}

/// One call to a TTS provider for a single segment of prose.
#[async_trait]
pub trait TtsSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        settings: &VoiceSettings,
        model: &str,
        provider: &str,
    ) -> Result<TtsSynthesisResult>;
}

/// Object-storage seam for uploading a finalised part's joined MP3 bytes.
#[async_trait]
pub trait AudioStorage: Send + Sync {
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<String>;
}

/// Best-effort joiner: raw concatenation of segment byte buffers. A real
/// deployment able to pull in a proper MP3-frame-aware muxer can swap
/// this implementation in; nothing downstream depends on which one runs.
pub fn join_audio_bytes(segments: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = segments.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    for segment in segments {
        out.extend_from_slice(segment);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_audio_bytes_concatenates_segments_in_order() {
        let joined = join_audio_bytes(&[vec![1, 2], vec![3], vec![4, 5, 6]]);
        assert_eq!(joined, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn join_audio_bytes_of_no_segments_is_empty() {
        assert!(join_audio_bytes(&[]).is_empty());
    }

    #[test]
    fn default_voice_settings_are_a_usable_baseline() {
        let settings = VoiceSettings::default();
        assert_eq!(settings.speed, 1.0);
        assert_eq!(settings.format, "mp3");
        assert_eq!(settings.sample_rate, 24_000);
    }
}
