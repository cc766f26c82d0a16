//! Durable SQLite-backed `Store`: connect, run embedded migrations, then
//! hand-roll `sqlx::query`/`Row` mapping rather than the compile-time-checked
//! `query!` macro (no database is available at build time for this crate).

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::models::{BillUsageRecord, ConfigRow, LearnGeneratedAudio, LearnGeneratedBlock, LearnProgressRecord};
use super::{Result, Store, StoreError};
use crate::types::{AudioStatus, GeneratedBlockKind, Liked, ProgressStatus, Role};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    #[tracing::instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        #[cfg(feature = "sqlite-migrations")]
        {
            sqlx::migrate!("./migrations/sqlite")
                .run(&pool)
                .await
                .map_err(|e| StoreError::Backend { message: format!("migration failure: {e}") })?;
        }
        Ok(Self { pool })
    }
}

fn status_to_str(s: ProgressStatus) -> &'static str {
    match s {
        ProgressStatus::Locked => "locked",
        ProgressStatus::NotStarted => "not_started",
        ProgressStatus::InProgress => "in_progress",
        ProgressStatus::Completed => "completed",
        ProgressStatus::Reset => "reset",
    }
}

fn status_from_str(s: &str) -> ProgressStatus {
    match s {
        "locked" => ProgressStatus::Locked,
        "not_started" => ProgressStatus::NotStarted,
        "in_progress" => ProgressStatus::InProgress,
        "completed" => ProgressStatus::Completed,
        _ => ProgressStatus::Reset,
    }
}

fn kind_to_str(k: GeneratedBlockKind) -> &'static str {
    match k {
        GeneratedBlockKind::Content => "content",
        GeneratedBlockKind::Interaction => "interaction",
        GeneratedBlockKind::ErrorMessage => "error_message",
        GeneratedBlockKind::Ask => "ask",
        GeneratedBlockKind::Answer => "answer",
    }
}

fn kind_from_str(s: &str) -> GeneratedBlockKind {
    match s {
        "interaction" => GeneratedBlockKind::Interaction,
        "error_message" => GeneratedBlockKind::ErrorMessage,
        "ask" => GeneratedBlockKind::Ask,
        "answer" => GeneratedBlockKind::Answer,
        _ => GeneratedBlockKind::Content,
    }
}

fn role_to_str(r: Role) -> &'static str {
    match r {
        Role::Teacher => "teacher",
        Role::Student => "student",
    }
}

fn role_from_str(s: &str) -> Role {
    if s == "student" { Role::Student } else { Role::Teacher }
}

#[async_trait]
impl Store for SqliteStore {
    #[tracing::instrument(skip(self), err)]
    async fn find_active_progress(
        &self,
        user_bid: &str,
        outline_item_bid: &str,
    ) -> Result<Option<LearnProgressRecord>> {
        let row = sqlx::query(
            r#"
            SELECT progress_record_bid, user_bid, shifu_bid, outline_item_bid, status, block_position, deleted
            FROM learn_progress_records
            WHERE user_bid = ?1 AND outline_item_bid = ?2 AND status != 'reset'
            ORDER BY rowid DESC
            LIMIT 1
            "#,
        )
        .bind(user_bid)
        .bind(outline_item_bid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| LearnProgressRecord {
            progress_record_bid: r.get("progress_record_bid"),
            user_bid: r.get("user_bid"),
            shifu_bid: r.get("shifu_bid"),
            outline_item_bid: r.get("outline_item_bid"),
            status: status_from_str(r.get::<String, _>("status").as_str()),
            block_position: r.get::<i64, _>("block_position") as u32,
            deleted: r.get::<i64, _>("deleted") != 0,
        }))
    }

    #[tracing::instrument(skip(self, record), err)]
    async fn insert_progress(&self, record: LearnProgressRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO learn_progress_records
                (progress_record_bid, user_bid, shifu_bid, outline_item_bid, status, block_position, deleted)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&record.progress_record_bid)
        .bind(&record.user_bid)
        .bind(&record.shifu_bid)
        .bind(&record.outline_item_bid)
        .bind(status_to_str(record.status))
        .bind(record.block_position as i64)
        .bind(record.deleted as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, record), err)]
    async fn update_progress(&self, record: LearnProgressRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE learn_progress_records
            SET status = ?2, block_position = ?3, deleted = ?4
            WHERE progress_record_bid = ?1
            "#,
        )
        .bind(&record.progress_record_bid)
        .bind(status_to_str(record.status))
        .bind(record.block_position as i64)
        .bind(record.deleted as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn reset_progress(&self, user_bid: &str, outline_item_bid: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE learn_progress_records
            SET status = 'reset'
            WHERE user_bid = ?1 AND outline_item_bid = ?2 AND deleted = 0 AND status != 'reset'
            "#,
        )
        .bind(user_bid)
        .bind(outline_item_bid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, block), err)]
    async fn append_generated_block(&self, block: LearnGeneratedBlock) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO learn_generated_blocks
                (generated_block_bid, progress_record_bid, user_bid, shifu_bid, outline_item_bid,
                 kind, role, position, block_content_conf, generated_content, status, liked, deleted,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&block.generated_block_bid)
        .bind(&block.progress_record_bid)
        .bind(&block.user_bid)
        .bind(&block.shifu_bid)
        .bind(&block.outline_item_bid)
        .bind(kind_to_str(block.kind))
        .bind(role_to_str(block.role))
        .bind(block.position as i64)
        .bind(&block.block_content_conf)
        .bind(&block.generated_content)
        .bind(block.status as i64)
        .bind(block.liked as i64)
        .bind(block.deleted as i64)
        .bind(block.created_at.to_rfc3339())
        .bind(block.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn find_active_generated_block(
        &self,
        progress_record_bid: &str,
        position: u32,
    ) -> Result<Option<LearnGeneratedBlock>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM learn_generated_blocks
            WHERE progress_record_bid = ?1 AND position = ?2 AND status = 1 AND deleted = 0
            ORDER BY rowid DESC LIMIT 1
            "#,
        )
        .bind(progress_record_bid)
        .bind(position as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_generated_block))
    }

    #[tracing::instrument(skip(self), err)]
    async fn find_generated_block(&self, generated_block_bid: &str) -> Result<Option<LearnGeneratedBlock>> {
        let row = sqlx::query(r#"SELECT * FROM learn_generated_blocks WHERE generated_block_bid = ?1"#)
            .bind(generated_block_bid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_generated_block))
    }

    #[tracing::instrument(skip(self, block), err)]
    async fn update_generated_block(&self, block: LearnGeneratedBlock) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE learn_generated_blocks
            SET role = ?2, generated_content = ?3, status = ?4, liked = ?5, updated_at = ?6
            WHERE generated_block_bid = ?1
            "#,
        )
        .bind(&block.generated_block_bid)
        .bind(role_to_str(block.role))
        .bind(&block.generated_content)
        .bind(block.status as i64)
        .bind(block.liked as i64)
        .bind(block.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn mark_generated_blocks_obsolete(&self, progress_record_bid: &str, from_position: u32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE learn_generated_blocks
            SET status = 0
            WHERE progress_record_bid = ?1 AND position >= ?2 AND status = 1
            "#,
        )
        .bind(progress_record_bid)
        .bind(from_position as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn list_generated_blocks(&self, progress_record_bid: &str) -> Result<Vec<LearnGeneratedBlock>> {
        let rows = sqlx::query(
            r#"SELECT * FROM learn_generated_blocks WHERE progress_record_bid = ?1 ORDER BY position ASC, rowid ASC"#,
        )
        .bind(progress_record_bid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_generated_block).collect())
    }

    #[tracing::instrument(skip(self, audio), err)]
    async fn insert_audio(&self, audio: LearnGeneratedAudio) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO learn_generated_audio
                (audio_bid, generated_block_bid, position, progress_record_bid, user_bid, shifu_bid,
                 oss_url, oss_bucket, oss_object_key, duration_ms, file_size, audio_format, sample_rate,
                 voice_id, voice_settings, model, text_length, segment_count, status, error_message, deleted)
            VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)
            "#,
        )
        .bind(&audio.audio_bid)
        .bind(&audio.generated_block_bid)
        .bind(audio.position as i64)
        .bind(&audio.progress_record_bid)
        .bind(&audio.user_bid)
        .bind(&audio.shifu_bid)
        .bind(&audio.oss_url)
        .bind(&audio.oss_bucket)
        .bind(&audio.oss_object_key)
        .bind(audio.duration_ms as i64)
        .bind(audio.file_size as i64)
        .bind(&audio.audio_format)
        .bind(audio.sample_rate as i64)
        .bind(&audio.voice_id)
        .bind(serde_json::to_string(&audio.voice_settings)?)
        .bind(&audio.model)
        .bind(audio.text_length as i64)
        .bind(audio.segment_count as i64)
        .bind(audio_status_to_str(audio.status))
        .bind(&audio.error_message)
        .bind(audio.deleted as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, usage), err)]
    async fn insert_usage(&self, usage: BillUsageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bill_usage_records
                (usage_bid, parent_usage_bid, user_bid, shifu_bid, usage_type, record_level, usage_scene,
                 provider, model, is_stream, input, output, total, word_count, duration_ms, latency_ms,
                 segment_index, segment_count, billable, status, error_message, extra)
            VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)
            "#,
        )
        .bind(&usage.usage_bid)
        .bind(&usage.parent_usage_bid)
        .bind(&usage.user_bid)
        .bind(&usage.shifu_bid)
        .bind(usage.usage_type as i64)
        .bind(usage.record_level as i64)
        .bind(usage.usage_scene as i64)
        .bind(&usage.provider)
        .bind(&usage.model)
        .bind(usage.is_stream as i64)
        .bind(usage.input as i64)
        .bind(usage.output as i64)
        .bind(usage.total as i64)
        .bind(usage.word_count as i64)
        .bind(usage.duration_ms as i64)
        .bind(usage.latency_ms as i64)
        .bind(usage.segment_index.map(|v| v as i64))
        .bind(usage.segment_count.map(|v| v as i64))
        .bind(usage.billable as i64)
        .bind(&usage.status)
        .bind(&usage.error_message)
        .bind(serde_json::to_string(&usage.extra)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "metering insert failed, swallowing (best-effort)");
            e
        })
        .ok();
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn get_config(&self, key: &str) -> Result<Option<ConfigRow>> {
        let row = sqlx::query(
            r#"SELECT config_bid, key, value, is_encrypted, remark FROM config WHERE key = ?1 ORDER BY rowid DESC LIMIT 1"#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ConfigRow {
            config_bid: r.get("config_bid"),
            key: r.get("key"),
            value: r.get("value"),
            is_encrypted: r.get::<i64, _>("is_encrypted") != 0,
            remark: r.get("remark"),
        }))
    }

    #[tracing::instrument(skip(self, row), err)]
    async fn upsert_config(&self, row: ConfigRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO config (config_bid, key, value, is_encrypted, remark)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, is_encrypted = excluded.is_encrypted, remark = excluded.remark
            "#,
        )
        .bind(&row.config_bid)
        .bind(&row.key)
        .bind(&row.value)
        .bind(row.is_encrypted as i64)
        .bind(&row.remark)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn get_profile_variables(&self, user_bid: &str, shifu_bid: &str) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query(
            r#"SELECT variable_name, variable_value FROM learn_profile_variables WHERE user_bid = ?1 AND shifu_bid = ?2"#,
        )
        .bind(user_bid)
        .bind(shifu_bid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("variable_name"), r.get::<String, _>("variable_value")))
            .collect())
    }

    #[tracing::instrument(skip(self, value), err)]
    async fn set_profile_variable(&self, user_bid: &str, shifu_bid: &str, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO learn_profile_variables (user_bid, shifu_bid, variable_name, variable_value, updated_at)
            VALUES (?1, ?2, ?3, ?4, datetime('now'))
            ON CONFLICT(user_bid, shifu_bid, variable_name)
                DO UPDATE SET variable_value = excluded.variable_value, updated_at = excluded.updated_at
            "#,
        )
        .bind(user_bid)
        .bind(shifu_bid)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_generated_block(r: sqlx::sqlite::SqliteRow) -> LearnGeneratedBlock {
    LearnGeneratedBlock {
        generated_block_bid: r.get("generated_block_bid"),
        progress_record_bid: r.get("progress_record_bid"),
        user_bid: r.get("user_bid"),
        shifu_bid: r.get("shifu_bid"),
        outline_item_bid: r.get("outline_item_bid"),
        kind: kind_from_str(r.get::<String, _>("kind").as_str()),
        role: role_from_str(r.get::<String, _>("role").as_str()),
        position: r.get::<i64, _>("position") as u32,
        block_content_conf: r.get("block_content_conf"),
        generated_content: r.get("generated_content"),
        status: r.get::<i64, _>("status") as i32,
        liked: match r.get::<i64, _>("liked") {
            -1 => Liked::Disliked,
            1 => Liked::Liked,
            _ => Liked::Neutral,
        },
        deleted: r.get::<i64, _>("deleted") != 0,
        created_at: chrono::DateTime::from_str(r.get::<String, _>("created_at").as_str())
            .unwrap_or_else(|_| chrono::Utc::now()),
        updated_at: chrono::DateTime::from_str(r.get::<String, _>("updated_at").as_str())
            .unwrap_or_else(|_| chrono::Utc::now()),
    }
}

fn audio_status_to_str(s: AudioStatus) -> &'static str {
    match s {
        AudioStatus::Pending => "pending",
        AudioStatus::Processing => "processing",
        AudioStatus::Completed => "completed",
        AudioStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_status_round_trips_through_its_string_form() {
        for status in [
            ProgressStatus::Locked,
            ProgressStatus::NotStarted,
            ProgressStatus::InProgress,
            ProgressStatus::Completed,
        ] {
            assert_eq!(status_from_str(status_to_str(status)), status);
        }
    }

    #[test]
    fn an_unrecognised_status_string_falls_back_to_reset() {
        assert_eq!(status_from_str("made up"), ProgressStatus::Reset);
    }

    #[test]
    fn generated_block_kind_round_trips_through_its_string_form() {
        for kind in [
            GeneratedBlockKind::Content,
            GeneratedBlockKind::Interaction,
            GeneratedBlockKind::ErrorMessage,
            GeneratedBlockKind::Ask,
            GeneratedBlockKind::Answer,
        ] {
            assert_eq!(kind_from_str(kind_to_str(kind)), kind);
        }
    }

    #[test]
    fn an_unrecognised_kind_string_falls_back_to_content() {
        assert_eq!(kind_from_str("made up"), GeneratedBlockKind::Content);
    }

    #[test]
    fn role_round_trips_through_its_string_form() {
        assert_eq!(role_from_str(role_to_str(Role::Teacher)), Role::Teacher);
        assert_eq!(role_from_str(role_to_str(Role::Student)), Role::Student);
    }

    #[test]
    fn an_unrecognised_role_string_falls_back_to_teacher() {
        assert_eq!(role_from_str("made up"), Role::Teacher);
    }

    #[test]
    fn audio_status_maps_to_its_expected_wire_strings() {
        assert_eq!(audio_status_to_str(AudioStatus::Pending), "pending");
        assert_eq!(audio_status_to_str(AudioStatus::Processing), "processing");
        assert_eq!(audio_status_to_str(AudioStatus::Completed), "completed");
        assert_eq!(audio_status_to_str(AudioStatus::Failed), "failed");
    }
}
