//! C2 — progress-record orchestration.
//!
//! Wraps [`crate::store::Store`] with the higher-level operations the
//! runner needs: finding the active row for a leaf, materialising the
//! whole not-started ancestor chain the first time a learner reaches it,
//! and retiring generated blocks on reload. Built on
//! `store::sqlite::SqliteStore`'s per-call transaction idiom.

use std::sync::Arc;

use crate::outline::tree::{OutlineItem, StructTreeProvider};
use crate::store::models::LearnProgressRecord;
use crate::store::{Store, StoreError};
use crate::types::{Bid, ProgressStatus};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns the active progress record for `outline_item_bid`, creating a
/// fresh `NOT_STARTED` row if none exists yet.
pub async fn find_or_create_progress(
    store: &dyn Store,
    user_bid: &str,
    shifu_bid: &str,
    outline_item_bid: &str,
) -> Result<LearnProgressRecord> {
    if let Some(existing) = store.find_active_progress(user_bid, outline_item_bid).await? {
        return Ok(existing);
    }
    let record = LearnProgressRecord::new_not_started(
        user_bid.to_string(),
        shifu_bid.to_string(),
        outline_item_bid.to_string(),
    );
    store.insert_progress(record.clone()).await?;
    Ok(record)
}

/// Ensures every ancestor outline item up to and including
/// `outline_item_bid` has a progress record, creating `NOT_STARTED` rows
/// for any that are missing. The chain is re-resolved from the tree
/// provider on every call rather than reused from a caller-held
/// snapshot: the struct tree can change between learner turns (authoring
/// edits a chapter while a student is mid-course), so each invocation
/// re-derives the ancestor list fresh instead of trusting a value
/// captured before the loop started.
///
/// Returns the chain root-first, each entry paired with its progress
/// record.
pub async fn ensure_progress_chain(
    store: &dyn Store,
    tree_provider: &dyn StructTreeProvider,
    user_bid: &str,
    shifu_bid: &str,
    outline_item_bid: &str,
    preview_mode: bool,
) -> Result<Vec<(OutlineItem, LearnProgressRecord)>> {
    let chain = tree_provider
        .ancestor_chain(outline_item_bid, preview_mode)
        .await
        .map_err(|e| StoreError::Backend { message: e.to_string() })?;

    let mut out = Vec::with_capacity(chain.len());
    for item in chain {
        let record = find_or_create_progress(store, user_bid, shifu_bid, &item.outline_item_bid).await?;
        out.push((item, record));
    }
    Ok(out)
}

/// Advances `record` to `new_status`, persisting only if the transition
/// is actually forward progress.
pub async fn advance_status(
    store: &dyn Store,
    mut record: LearnProgressRecord,
    new_status: ProgressStatus,
) -> Result<LearnProgressRecord> {
    if record.status.can_advance_to(new_status) {
        record.status = new_status;
        store.update_progress(record.clone()).await?;
    }
    Ok(record)
}

/// Persists the learner's new cursor position within the active leaf.
pub async fn set_block_position(
    store: &dyn Store,
    mut record: LearnProgressRecord,
    position: u32,
) -> Result<LearnProgressRecord> {
    record.block_position = position;
    store.update_progress(record.clone()).await?;
    Ok(record)
}

/// Reload support: marks every generated block at or after
/// `from_position` obsolete and rewinds the progress cursor there, so the
/// next run re-derives content from that point.
pub async fn rewind_for_reload(
    store: &dyn Store,
    record: LearnProgressRecord,
    from_position: u32,
) -> Result<LearnProgressRecord> {
    store
        .mark_generated_blocks_obsolete(&record.progress_record_bid, from_position)
        .await?;
    set_block_position(store, record, from_position).await
}

/// Convenience wrapper bundling a `Store` + `StructTreeProvider` pair so
/// callers don't have to thread two trait objects through every runner
/// call site.
#[derive(Clone)]
pub struct ProgressLedger {
    store: Arc<dyn Store>,
    tree_provider: Arc<dyn StructTreeProvider>,
}

impl ProgressLedger {
    pub fn new(store: Arc<dyn Store>, tree_provider: Arc<dyn StructTreeProvider>) -> Self {
        Self { store, tree_provider }
    }

    pub async fn ensure_chain(
        &self,
        user_bid: &str,
        shifu_bid: &str,
        outline_item_bid: &str,
        preview_mode: bool,
    ) -> Result<Vec<(OutlineItem, LearnProgressRecord)>> {
        ensure_progress_chain(
            self.store.as_ref(),
            self.tree_provider.as_ref(),
            user_bid,
            shifu_bid,
            outline_item_bid,
            preview_mode,
        )
        .await
    }

    pub async fn find_or_create(
        &self,
        user_bid: &str,
        shifu_bid: &str,
        outline_item_bid: &str,
    ) -> Result<LearnProgressRecord> {
        find_or_create_progress(self.store.as_ref(), user_bid, shifu_bid, outline_item_bid).await
    }

    pub async fn advance(&self, record: LearnProgressRecord, new_status: ProgressStatus) -> Result<LearnProgressRecord> {
        advance_status(self.store.as_ref(), record, new_status).await
    }

    pub async fn set_position(&self, record: LearnProgressRecord, position: u32) -> Result<LearnProgressRecord> {
        set_block_position(self.store.as_ref(), record, position).await
    }

    pub async fn rewind(&self, record: LearnProgressRecord, from_position: u32) -> Result<LearnProgressRecord> {
        rewind_for_reload(self.store.as_ref(), record, from_position).await
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }
}

#[allow(dead_code)]
fn _assert_bid_is_string(_: Bid) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::tree::{OutlineError, Shifu, StructTree};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    struct FixedChain(Vec<OutlineItem>);

    #[async_trait]
    impl StructTreeProvider for FixedChain {
        async fn get_struct(&self, _shifu_bid: &str, _preview_mode: bool) -> crate::outline::tree::Result<StructTree> {
            Err(OutlineError::ShifuStructNotFound("unused".into()))
        }

        async fn get_shifu(&self, _shifu_bid: &str, _preview_mode: bool) -> crate::outline::tree::Result<Shifu> {
            Err(OutlineError::ShifuNotFound("unused".into()))
        }

        async fn get_outline_with_mdflow(
            &self,
            outline_item_bid: &str,
            _preview_mode: bool,
        ) -> crate::outline::tree::Result<OutlineItem> {
            self.0
                .iter()
                .find(|i| i.outline_item_bid == outline_item_bid)
                .cloned()
                .ok_or_else(|| OutlineError::OutlineItemNotFound(outline_item_bid.to_string()))
        }

        async fn ancestor_chain(
            &self,
            _outline_item_bid: &str,
            _preview_mode: bool,
        ) -> crate::outline::tree::Result<Vec<OutlineItem>> {
            Ok(self.0.clone())
        }
    }

    fn item(bid: &str) -> OutlineItem {
        OutlineItem {
            outline_item_bid: bid.to_string(),
            shifu_bid: "shifu-1".to_string(),
            position: "1".to_string(),
            title: bid.to_string(),
            outline_type: crate::types::OutlineType::Normal,
            hidden: false,
            llm_system_prompt: None,
            llm: None,
            llm_temperature: None,
            mdflow: String::new(),
        }
    }

    #[tokio::test]
    async fn ensure_chain_creates_missing_rows_for_every_ancestor() {
        let store = InMemoryStore::new();
        let provider = FixedChain(vec![item("chapter-1"), item("leaf-1a")]);

        let chain = ensure_progress_chain(&store, &provider, "user-1", "shifu-1", "leaf-1a", false)
            .await
            .unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].1.status, ProgressStatus::NotStarted);
        assert_eq!(chain[1].1.status, ProgressStatus::NotStarted);

        let reloaded = store.find_active_progress("user-1", "leaf-1a").await.unwrap().unwrap();
        assert_eq!(reloaded.progress_record_bid, chain[1].1.progress_record_bid);
    }

    #[tokio::test]
    async fn ensure_chain_reuses_existing_rows_instead_of_duplicating() {
        let store = InMemoryStore::new();
        let provider = FixedChain(vec![item("leaf-1a")]);

        let first = ensure_progress_chain(&store, &provider, "user-1", "shifu-1", "leaf-1a", false)
            .await
            .unwrap();
        let second = ensure_progress_chain(&store, &provider, "user-1", "shifu-1", "leaf-1a", false)
            .await
            .unwrap();

        assert_eq!(first[0].1.progress_record_bid, second[0].1.progress_record_bid);
    }

    #[tokio::test]
    async fn rewind_marks_obsolete_and_resets_cursor() {
        let store = InMemoryStore::new();
        let record = find_or_create_progress(&store, "user-1", "shifu-1", "leaf-1a").await.unwrap();
        let record = set_block_position(&store, record, 5).await.unwrap();
        assert_eq!(record.block_position, 5);

        let record = rewind_for_reload(&store, record, 2).await.unwrap();
        assert_eq!(record.block_position, 2);
    }

    #[tokio::test]
    async fn advance_status_ignores_backward_transitions() {
        let store = InMemoryStore::new();
        let record = find_or_create_progress(&store, "user-1", "shifu-1", "leaf-1a").await.unwrap();
        let record = advance_status(&store, record, ProgressStatus::Completed).await.unwrap();
        assert_eq!(record.status, ProgressStatus::Completed);

        let record = advance_status(&store, record, ProgressStatus::InProgress).await.unwrap();
        assert_eq!(record.status, ProgressStatus::Completed);
    }
}
