//! C2 (persistence half) + C10 + C11 storage backend.
//!
//! A backend-agnostic persistence trait covering the handful of tables
//! the run loop reads and writes: progress records, generated blocks,
//! generated audio, usage records, and config rows. `InMemoryStore` backs
//! tests and preview mode; `SqliteStore` (behind the `sqlite`/`postgres`
//! features) is the durable backend.

pub mod memory;
pub mod models;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::types::Bid;
use models::{BillUsageRecord, ConfigRow, LearnGeneratedAudio, LearnGeneratedBlock, LearnProgressRecord};

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("progress record not found for user {user_bid} / outline {outline_bid}")]
    #[diagnostic(code(store::progress_not_found))]
    ProgressNotFound { user_bid: Bid, outline_bid: Bid },

    #[error("generated block not found: {0}")]
    #[diagnostic(code(store::generated_block_not_found))]
    GeneratedBlockNotFound(Bid),

    #[error("backend error: {message}")]
    #[diagnostic(code(store::backend))]
    Backend { message: String },

    #[cfg(feature = "sqlite")]
    #[error("sqlx error: {0}")]
    #[diagnostic(code(store::sqlx))]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    #[diagnostic(code(store::serde))]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence seam for everything the run loop reads and writes.
///
/// Every method is a single logical operation; callers that need several
/// writes to be atomic (e.g. "persist answer + mark interaction obsolete")
/// issue them back to back — `SqlStore` wraps each call in its own short
/// transaction, matching how `AppRunner` treats one block step as the unit
/// of commit.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_active_progress(
        &self,
        user_bid: &str,
        outline_item_bid: &str,
    ) -> Result<Option<LearnProgressRecord>>;

    async fn insert_progress(&self, record: LearnProgressRecord) -> Result<()>;

    async fn update_progress(&self, record: LearnProgressRecord) -> Result<()>;

    /// Marks every non-deleted, non-`Reset` progress row for this
    /// `(user, outline)` as `RESET`.
    async fn reset_progress(&self, user_bid: &str, outline_item_bid: &str) -> Result<()>;

    async fn append_generated_block(&self, block: LearnGeneratedBlock) -> Result<()>;

    async fn find_active_generated_block(
        &self,
        progress_record_bid: &str,
        position: u32,
    ) -> Result<Option<LearnGeneratedBlock>>;

    async fn find_generated_block(&self, generated_block_bid: &str) -> Result<Option<LearnGeneratedBlock>>;

    async fn update_generated_block(&self, block: LearnGeneratedBlock) -> Result<()>;

    /// Sets `status = 0` on all active rows with `position >= from_position`
    /// for this progress record.
    async fn mark_generated_blocks_obsolete(&self, progress_record_bid: &str, from_position: u32) -> Result<()>;

    async fn list_generated_blocks(&self, progress_record_bid: &str) -> Result<Vec<LearnGeneratedBlock>>;

    async fn insert_audio(&self, audio: LearnGeneratedAudio) -> Result<()>;

    async fn insert_usage(&self, usage: BillUsageRecord) -> Result<()>;

    async fn get_config(&self, key: &str) -> Result<Option<ConfigRow>>;

    async fn upsert_config(&self, row: ConfigRow) -> Result<()>;

    /// The learner's accumulated MarkdownFlow variables for this Shifu,
    /// keyed by variable name — the `user_profile` the Block Runner
    /// passes into `MarkdownFlow.process(..., STREAM, variables)`
    ///.
    async fn get_profile_variables(&self, user_bid: &str, shifu_bid: &str) -> Result<BTreeMap<String, String>>;

    async fn set_profile_variable(&self, user_bid: &str, shifu_bid: &str, name: &str, value: &str) -> Result<()>;
}
