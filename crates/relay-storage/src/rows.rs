//! Raw row shapes and their conversion into domain types.

use relay_core::{
    AiModel, Classification, MediaDescriptor, Post, PostStatus, Setting, SourceChannel, TargetChannel,
    WorkerControl, WorkerKind,
};
use tracing::warn;

use crate::{from_millis, opt_from_millis, StoreError};

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct PostRow {
    pub id: i64,
    pub source_channel_id: Option<i64>,
    pub origin_message_id: Option<i64>,
    pub original_text: Option<String>,
    pub original_media: Option<String>,
    pub rewritten_text: Option<String>,
    pub target_channel_id: Option<i64>,
    pub classification_confidence: Option<i64>,
    pub classification: Option<String>,
    pub target_rewrite_digest: Option<String>,
    pub is_manual: bool,
    pub status: String,
    pub created_at: i64,
    pub text_processed_at: Option<i64>,
    pub approved_at: Option<i64>,
    pub scheduled_at: Option<i64>,
    pub published_at: Option<i64>,
    pub notes: Option<String>,
    pub approved_by: Option<String>,
    pub published_message_id: Option<i64>,
}

impl TryFrom<PostRow> for Post {
    type Error = StoreError;

    fn try_from(row: PostRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<PostStatus>()
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        // Unusable legacy media is dropped here rather than failing every read of the row.
        let original_media = match row.original_media.as_deref() {
            None => None,
            Some(raw) => match MediaDescriptor::from_json_str(raw) {
                Ok(media) => media,
                Err(err) => {
                    warn!(post_id = row.id, error = %err, "discarding unusable media descriptor");
                    None
                }
            },
        };

        let classification = row
            .classification
            .as_deref()
            .map(serde_json::from_str::<Classification>)
            .transpose()
            .map_err(|e| StoreError::Decode(format!("post {} classification: {e}", row.id)))?;

        Ok(Post {
            id: row.id,
            source_channel_id: row.source_channel_id,
            origin_message_id: row.origin_message_id,
            original_text: row.original_text,
            original_media,
            rewritten_text: row.rewritten_text,
            target_channel_id: row.target_channel_id,
            classification_confidence: row
                .classification_confidence
                .map(|c| c.clamp(0, 100) as u8),
            classification,
            target_rewrite_digest: row.target_rewrite_digest,
            is_manual: row.is_manual,
            status,
            created_at: from_millis(row.created_at)?,
            text_processed_at: opt_from_millis(row.text_processed_at)?,
            approved_at: opt_from_millis(row.approved_at)?,
            scheduled_at: opt_from_millis(row.scheduled_at)?,
            published_at: opt_from_millis(row.published_at)?,
            notes: row.notes,
            approved_by: row.approved_by,
            published_message_id: row.published_message_id,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SourceChannelRow {
    pub id: i64,
    pub address: String,
    pub title: String,
    pub is_active: bool,
    pub check_interval_secs: i64,
    pub last_checked: Option<i64>,
    pub last_message_id: i64,
    pub created_at: i64,
}

impl TryFrom<SourceChannelRow> for SourceChannel {
    type Error = StoreError;

    fn try_from(row: SourceChannelRow) -> Result<Self, Self::Error> {
        Ok(SourceChannel {
            id: row.id,
            address: row.address,
            title: row.title,
            is_active: row.is_active,
            check_interval_secs: row.check_interval_secs,
            last_checked: opt_from_millis(row.last_checked)?,
            last_message_id: row.last_message_id,
            created_at: from_millis(row.created_at)?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TargetChannelRow {
    pub id: i64,
    pub address: String,
    pub title: String,
    pub description: Option<String>,
    pub tags: String,
    pub is_active: bool,
    pub rewrite_prompt: Option<String>,
    pub classification_threshold: i64,
    pub auto_publish_enabled: bool,
}

impl TryFrom<TargetChannelRow> for TargetChannel {
    type Error = StoreError;

    fn try_from(row: TargetChannelRow) -> Result<Self, Self::Error> {
        let tags = serde_json::from_str::<Vec<String>>(&row.tags)
            .map_err(|e| StoreError::Decode(format!("target {} tags: {e}", row.id)))?;
        Ok(TargetChannel {
            id: row.id,
            address: row.address,
            title: row.title,
            description: row.description,
            tags,
            is_active: row.is_active,
            rewrite_prompt: row.rewrite_prompt,
            classification_threshold: row.classification_threshold.clamp(0, 100) as u8,
            auto_publish_enabled: row.auto_publish_enabled,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct WorkerControlRow {
    pub kind: String,
    pub should_run: bool,
    pub is_running: bool,
    pub last_heartbeat: Option<i64>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
}

impl TryFrom<WorkerControlRow> for WorkerControl {
    type Error = StoreError;

    fn try_from(row: WorkerControlRow) -> Result<Self, Self::Error> {
        Ok(WorkerControl {
            kind: row
                .kind
                .parse::<WorkerKind>()
                .map_err(StoreError::Decode)?,
            should_run: row.should_run,
            is_running: row.is_running,
            last_heartbeat: opt_from_millis(row.last_heartbeat)?,
            started_at: opt_from_millis(row.started_at)?,
            stopped_at: opt_from_millis(row.stopped_at)?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SettingRow {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub updated_at: i64,
}

impl TryFrom<SettingRow> for Setting {
    type Error = StoreError;

    fn try_from(row: SettingRow) -> Result<Self, Self::Error> {
        Ok(Setting {
            key: row.key,
            value: row.value,
            description: row.description,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

pub(crate) fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct AiModelRow {
    pub id: i64,
    pub name: String,
    pub model_id: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

impl TryFrom<AiModelRow> for AiModel {
    type Error = StoreError;

    fn try_from(row: AiModelRow) -> Result<Self, Self::Error> {
        Ok(AiModel {
            id: row.id,
            name: row.name,
            model_id: row.model_id,
            description: row.description,
            is_active: row.is_active,
            is_default: row.is_default,
            created_at: from_millis(row.created_at)?,
            updated_at: opt_from_millis(row.updated_at)?,
        })
    }
}
