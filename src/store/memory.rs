//! In-memory `Store` backend: used by preview mode and the test suite.
//! An `RwLock<FxHashMap<...>>` keyed map per table, with no external
//! dependencies — the whole backend lives for the process's lifetime.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use super::models::{BillUsageRecord, ConfigRow, LearnGeneratedAudio, LearnGeneratedBlock, LearnProgressRecord};
use super::{Result, Store};

#[derive(Default)]
pub struct InMemoryStore {
    progress: RwLock<FxHashMap<(String, String), Vec<LearnProgressRecord>>>,
    generated_blocks: RwLock<FxHashMap<String, Vec<LearnGeneratedBlock>>>,
    audio: RwLock<Vec<LearnGeneratedAudio>>,
    usage: RwLock<Vec<BillUsageRecord>>,
    config: RwLock<FxHashMap<String, ConfigRow>>,
    profile_variables: RwLock<FxHashMap<(String, String), BTreeMap<String, String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find_active_progress(
        &self,
        user_bid: &str,
        outline_item_bid: &str,
    ) -> Result<Option<LearnProgressRecord>> {
        let key = (user_bid.to_string(), outline_item_bid.to_string());
        let guard = self.progress.read().await;
        Ok(guard
            .get(&key)
            .and_then(|rows| rows.iter().rev().find(|r| !matches!(r.status, crate::types::ProgressStatus::Reset)))
            .cloned())
    }

    async fn insert_progress(&self, record: LearnProgressRecord) -> Result<()> {
        let key = (record.user_bid.clone(), record.outline_item_bid.clone());
        self.progress.write().await.entry(key).or_default().push(record);
        Ok(())
    }

    async fn update_progress(&self, record: LearnProgressRecord) -> Result<()> {
        let key = (record.user_bid.clone(), record.outline_item_bid.clone());
        let mut guard = self.progress.write().await;
        let rows = guard.entry(key).or_default();
        if let Some(existing) = rows
            .iter_mut()
            .rev()
            .find(|r| r.progress_record_bid == record.progress_record_bid)
        {
            *existing = record;
        } else {
            rows.push(record);
        }
        Ok(())
    }

    async fn reset_progress(&self, user_bid: &str, outline_item_bid: &str) -> Result<()> {
        let key = (user_bid.to_string(), outline_item_bid.to_string());
        let mut guard = self.progress.write().await;
        if let Some(rows) = guard.get_mut(&key) {
            for row in rows.iter_mut() {
                if !row.deleted && !matches!(row.status, crate::types::ProgressStatus::Reset) {
                    row.status = crate::types::ProgressStatus::Reset;
                }
            }
        }
        Ok(())
    }

    async fn append_generated_block(&self, block: LearnGeneratedBlock) -> Result<()> {
        self.generated_blocks
            .write()
            .await
            .entry(block.progress_record_bid.clone())
            .or_default()
            .push(block);
        Ok(())
    }

    async fn find_active_generated_block(
        &self,
        progress_record_bid: &str,
        position: u32,
    ) -> Result<Option<LearnGeneratedBlock>> {
        let guard = self.generated_blocks.read().await;
        Ok(guard.get(progress_record_bid).and_then(|rows| {
            rows.iter()
                .rev()
                .find(|b| b.position == position && b.status == 1 && !b.deleted)
                .cloned()
        }))
    }

    async fn find_generated_block(&self, generated_block_bid: &str) -> Result<Option<LearnGeneratedBlock>> {
        let guard = self.generated_blocks.read().await;
        Ok(guard
            .values()
            .flat_map(|rows| rows.iter())
            .find(|b| b.generated_block_bid == generated_block_bid)
            .cloned())
    }

    async fn update_generated_block(&self, block: LearnGeneratedBlock) -> Result<()> {
        let mut guard = self.generated_blocks.write().await;
        let rows = guard.entry(block.progress_record_bid.clone()).or_default();
        if let Some(existing) = rows
            .iter_mut()
            .find(|b| b.generated_block_bid == block.generated_block_bid)
        {
            *existing = block;
        } else {
            rows.push(block);
        }
        Ok(())
    }

    async fn mark_generated_blocks_obsolete(&self, progress_record_bid: &str, from_position: u32) -> Result<()> {
        let mut guard = self.generated_blocks.write().await;
        if let Some(rows) = guard.get_mut(progress_record_bid) {
            for row in rows.iter_mut() {
                if row.position >= from_position && row.status == 1 {
                    row.status = 0;
                }
            }
        }
        Ok(())
    }

    async fn list_generated_blocks(&self, progress_record_bid: &str) -> Result<Vec<LearnGeneratedBlock>> {
        Ok(self
            .generated_blocks
            .read()
            .await
            .get(progress_record_bid)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_audio(&self, audio: LearnGeneratedAudio) -> Result<()> {
        self.audio.write().await.push(audio);
        Ok(())
    }

    async fn insert_usage(&self, usage: BillUsageRecord) -> Result<()> {
        self.usage.write().await.push(usage);
        Ok(())
    }

    async fn get_config(&self, key: &str) -> Result<Option<ConfigRow>> {
        Ok(self.config.read().await.get(key).cloned())
    }

    async fn upsert_config(&self, row: ConfigRow) -> Result<()> {
        self.config.write().await.insert(row.key.clone(), row);
        Ok(())
    }

    async fn get_profile_variables(&self, user_bid: &str, shifu_bid: &str) -> Result<BTreeMap<String, String>> {
        let key = (user_bid.to_string(), shifu_bid.to_string());
        Ok(self.profile_variables.read().await.get(&key).cloned().unwrap_or_default())
    }

    async fn set_profile_variable(&self, user_bid: &str, shifu_bid: &str, name: &str, value: &str) -> Result<()> {
        let key = (user_bid.to_string(), shifu_bid.to_string());
        self.profile_variables
            .write()
            .await
            .entry(key)
            .or_default()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}
