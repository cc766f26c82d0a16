//! Persisted record shapes for the run loop's tables. Plain serde-friendly structs,
//! decoupled from any particular backend — the sqlx and in-memory stores
//! both produce/consume these.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AudioStatus, Bid, GeneratedBlockKind, Liked, ProgressStatus, Role};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearnProgressRecord {
    pub progress_record_bid: Bid,
    pub user_bid: Bid,
    pub shifu_bid: Bid,
    pub outline_item_bid: Bid,
    pub status: ProgressStatus,
    pub block_position: u32,
    pub deleted: bool,
}

impl LearnProgressRecord {
    pub fn new_not_started(user_bid: Bid, shifu_bid: Bid, outline_item_bid: Bid) -> Self {
        Self {
            progress_record_bid: crate::types::generate_id(),
            user_bid,
            shifu_bid,
            outline_item_bid,
            status: ProgressStatus::NotStarted,
            block_position: 0,
            deleted: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearnGeneratedBlock {
    pub generated_block_bid: Bid,
    pub progress_record_bid: Bid,
    pub user_bid: Bid,
    pub shifu_bid: Bid,
    pub outline_item_bid: Bid,
    pub kind: GeneratedBlockKind,
    pub role: Role,
    pub position: u32,
    pub block_content_conf: String,
    pub generated_content: String,
    /// 1 = active, 0 = obsolete (overwritten on reload).
    pub status: i32,
    pub liked: Liked,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearnGeneratedAudio {
    pub audio_bid: Bid,
    pub generated_block_bid: Bid,
    pub position: u32,
    pub progress_record_bid: Bid,
    pub user_bid: Bid,
    pub shifu_bid: Bid,
    pub oss_url: String,
    pub oss_bucket: String,
    pub oss_object_key: String,
    pub duration_ms: u64,
    pub file_size: u64,
    pub audio_format: String,
    pub sample_rate: u32,
    pub voice_id: String,
    pub voice_settings: serde_json::Value,
    pub model: String,
    pub text_length: u32,
    pub segment_count: u32,
    pub status: AudioStatus,
    pub error_message: Option<String>,
    pub deleted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BillUsageRecord {
    pub usage_bid: Bid,
    pub parent_usage_bid: Option<Bid>,
    pub user_bid: Bid,
    pub shifu_bid: Bid,
    pub usage_type: u16,
    pub record_level: u8,
    pub usage_scene: u16,
    pub provider: String,
    pub model: String,
    pub is_stream: bool,
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub word_count: u32,
    pub duration_ms: u64,
    pub latency_ms: u64,
    pub segment_index: Option<u32>,
    pub segment_count: Option<u32>,
    pub billable: bool,
    pub status: String,
    pub error_message: Option<String>,
    pub extra: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigRow {
    pub config_bid: Bid,
    pub key: String,
    pub value: String,
    pub is_encrypted: bool,
    pub remark: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_not_started_is_position_zero_with_a_fresh_bid() {
        let a = LearnProgressRecord::new_not_started("user-1".to_string(), "shifu-1".to_string(), "leaf-1".to_string());
        let b = LearnProgressRecord::new_not_started("user-1".to_string(), "shifu-1".to_string(), "leaf-1".to_string());

        assert_eq!(a.status, ProgressStatus::NotStarted);
        assert_eq!(a.block_position, 0);
        assert!(!a.deleted);
        assert_ne!(a.progress_record_bid, b.progress_record_bid, "each call mints a fresh bid");
    }
}
