use chrono::{DateTime, Utc};
use relay_core::{
    template_digest, ChannelId, NewSourceChannel, NewTargetChannel, SourceChannel, TargetChannel,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::rows::{convert_all, SourceChannelRow, TargetChannelRow};
use crate::{now_millis, to_millis, Store, StoreError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceChannelUpdate {
    pub title: Option<String>,
    pub is_active: Option<bool>,
    pub check_interval_secs: Option<i64>,
}

/// Partial update of a target. `Some(None)` clears `description` or `rewrite_prompt`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetChannelUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub is_active: Option<bool>,
    pub rewrite_prompt: Option<Option<String>>,
    pub classification_threshold: Option<u8>,
    pub auto_publish_enabled: Option<bool>,
}

fn bare_address(address: &str) -> &str {
    address.trim().trim_start_matches('@')
}

fn prompt_digest(prompt: Option<&str>) -> Option<String> {
    prompt
        .filter(|p| !p.trim().is_empty())
        .map(template_digest)
}

fn validate_threshold(threshold: u8) -> Result<(), StoreError> {
    if threshold > 100 {
        return Err(StoreError::Invalid(format!(
            "classification threshold {threshold} is outside 0-100"
        )));
    }
    Ok(())
}

fn tags_json(tags: &[String]) -> Result<String, StoreError> {
    serde_json::to_string(tags).map_err(|e| StoreError::Invalid(e.to_string()))
}

impl Store {
    // =========================================================================
    // Source channels
    // =========================================================================

    pub async fn create_source_channel(
        &self,
        channel: &NewSourceChannel,
    ) -> Result<SourceChannel, StoreError> {
        if channel.check_interval_secs <= 0 {
            return Err(StoreError::Invalid(
                "check interval must be positive".to_string(),
            ));
        }
        let result = sqlx::query(
            "INSERT INTO source_channels (address, title, is_active, check_interval_secs, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(channel.address.trim())
        .bind(&channel.title)
        .bind(channel.is_active)
        .bind(channel.check_interval_secs)
        .bind(now_millis())
        .execute(self.pool())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(
                format!("source channel {} already exists", channel.address),
            ),
            other => other.into(),
        })?;

        info!(address = %channel.address, "source channel created");
        self.get_source_channel(result.last_insert_rowid()).await
    }

    /// Create or refresh a source channel keyed by address. The cursor is preserved.
    pub async fn upsert_source_channel(
        &self,
        channel: &NewSourceChannel,
    ) -> Result<SourceChannel, StoreError> {
        match self.source_channel_by_address(&channel.address).await? {
            Some(existing) => {
                self.update_source_channel(
                    existing.id,
                    &SourceChannelUpdate {
                        title: Some(channel.title.clone()),
                        is_active: Some(channel.is_active),
                        check_interval_secs: Some(channel.check_interval_secs),
                    },
                )
                .await
            }
            None => self.create_source_channel(channel).await,
        }
    }

    pub async fn get_source_channel(&self, id: ChannelId) -> Result<SourceChannel, StoreError> {
        sqlx::query_as::<_, SourceChannelRow>("SELECT * FROM source_channels WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("source channel {id}")))?
            .try_into()
    }

    /// Look up by address, matching with or without a leading `@`.
    pub async fn source_channel_by_address(
        &self,
        address: &str,
    ) -> Result<Option<SourceChannel>, StoreError> {
        let bare = bare_address(address);
        sqlx::query_as::<_, SourceChannelRow>(
            "SELECT * FROM source_channels WHERE address = ? OR address = ? LIMIT 1",
        )
        .bind(bare)
        .bind(format!("@{bare}"))
        .fetch_optional(self.pool())
        .await?
        .map(SourceChannel::try_from)
        .transpose()
    }

    pub async fn list_source_channels(
        &self,
        active_only: bool,
    ) -> Result<Vec<SourceChannel>, StoreError> {
        let rows = sqlx::query_as::<_, SourceChannelRow>(
            "SELECT * FROM source_channels WHERE (? = 0 OR is_active = 1) ORDER BY id",
        )
        .bind(active_only)
        .fetch_all(self.pool())
        .await?;
        convert_all(rows)
    }

    pub async fn update_source_channel(
        &self,
        id: ChannelId,
        update: &SourceChannelUpdate,
    ) -> Result<SourceChannel, StoreError> {
        if update.check_interval_secs.is_some_and(|s| s <= 0) {
            return Err(StoreError::Invalid(
                "check interval must be positive".to_string(),
            ));
        }
        let result = sqlx::query(
            "UPDATE source_channels SET \
                 title = COALESCE(?, title), \
                 is_active = COALESCE(?, is_active), \
                 check_interval_secs = COALESCE(?, check_interval_secs) \
             WHERE id = ?",
        )
        .bind(update.title.as_deref())
        .bind(update.is_active)
        .bind(update.check_interval_secs)
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("source channel {id}")));
        }
        self.get_source_channel(id).await
    }

    pub async fn delete_source_channel(&self, id: ChannelId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM source_channels WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("source channel {id}")));
        }
        info!(channel_id = id, "source channel deleted");
        Ok(())
    }

    /// Stamp a completed check. The cursor only moves up to `max_seen_id`.
    pub async fn record_channel_check(
        &self,
        id: ChannelId,
        max_seen_id: Option<i64>,
        checked_at: DateTime<Utc>,
    ) -> Result<SourceChannel, StoreError> {
        let result = sqlx::query(
            "UPDATE source_channels SET last_checked = ?, \
                 last_message_id = MAX(last_message_id, COALESCE(?, last_message_id)) \
             WHERE id = ?",
        )
        .bind(to_millis(checked_at))
        .bind(max_seen_id)
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("source channel {id}")));
        }
        self.get_source_channel(id).await
    }

    // =========================================================================
    // Target channels
    // =========================================================================

    pub async fn create_target_channel(
        &self,
        channel: &NewTargetChannel,
    ) -> Result<TargetChannel, StoreError> {
        validate_threshold(channel.classification_threshold)?;
        let prompt = channel.rewrite_prompt.as_deref();
        let result = sqlx::query(
            "INSERT INTO target_channels \
             (address, title, description, tags, is_active, rewrite_prompt, rewrite_prompt_digest, \
              classification_threshold, auto_publish_enabled, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(channel.address.trim())
        .bind(&channel.title)
        .bind(channel.description.as_deref())
        .bind(tags_json(&channel.tags)?)
        .bind(channel.is_active)
        .bind(prompt)
        .bind(prompt_digest(prompt))
        .bind(i64::from(channel.classification_threshold))
        .bind(channel.auto_publish_enabled)
        .bind(now_millis())
        .execute(self.pool())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(
                format!("target channel {} already exists", channel.address),
            ),
            other => other.into(),
        })?;

        info!(address = %channel.address, "target channel created");
        self.get_target_channel(result.last_insert_rowid()).await
    }

    pub async fn upsert_target_channel(
        &self,
        channel: &NewTargetChannel,
    ) -> Result<TargetChannel, StoreError> {
        let existing = sqlx::query_as::<_, TargetChannelRow>(
            "SELECT * FROM target_channels WHERE address = ?",
        )
        .bind(channel.address.trim())
        .fetch_optional(self.pool())
        .await?;

        match existing {
            Some(row) => {
                self.update_target_channel(
                    row.id,
                    &TargetChannelUpdate {
                        title: Some(channel.title.clone()),
                        description: Some(channel.description.clone()),
                        tags: Some(channel.tags.clone()),
                        is_active: Some(channel.is_active),
                        rewrite_prompt: Some(channel.rewrite_prompt.clone()),
                        classification_threshold: Some(channel.classification_threshold),
                        auto_publish_enabled: Some(channel.auto_publish_enabled),
                    },
                )
                .await
            }
            None => self.create_target_channel(channel).await,
        }
    }

    pub async fn get_target_channel(&self, id: ChannelId) -> Result<TargetChannel, StoreError> {
        sqlx::query_as::<_, TargetChannelRow>("SELECT * FROM target_channels WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("target channel {id}")))?
            .try_into()
    }

    pub async fn list_target_channels(
        &self,
        active_only: bool,
    ) -> Result<Vec<TargetChannel>, StoreError> {
        let rows = sqlx::query_as::<_, TargetChannelRow>(
            "SELECT * FROM target_channels WHERE (? = 0 OR is_active = 1) ORDER BY id",
        )
        .bind(active_only)
        .fetch_all(self.pool())
        .await?;
        convert_all(rows)
    }

    pub async fn update_target_channel(
        &self,
        id: ChannelId,
        update: &TargetChannelUpdate,
    ) -> Result<TargetChannel, StoreError> {
        if let Some(threshold) = update.classification_threshold {
            validate_threshold(threshold)?;
        }
        let current = self.get_target_channel(id).await?;

        let description = match &update.description {
            Some(next) => next.clone(),
            None => current.description.clone(),
        };
        let prompt = match &update.rewrite_prompt {
            Some(next) => next.clone(),
            None => current.rewrite_prompt.clone(),
        };
        let tags = match &update.tags {
            Some(tags) => tags.clone(),
            None => current.tags.clone(),
        };

        sqlx::query(
            "UPDATE target_channels SET \
                 title = ?, description = ?, tags = ?, is_active = ?, \
                 rewrite_prompt = ?, rewrite_prompt_digest = ?, \
                 classification_threshold = ?, auto_publish_enabled = ? \
             WHERE id = ?",
        )
        .bind(update.title.as_deref().unwrap_or(&current.title))
        .bind(description.as_deref())
        .bind(tags_json(&tags)?)
        .bind(update.is_active.unwrap_or(current.is_active))
        .bind(prompt.as_deref())
        .bind(prompt_digest(prompt.as_deref()))
        .bind(i64::from(
            update
                .classification_threshold
                .unwrap_or(current.classification_threshold),
        ))
        .bind(
            update
                .auto_publish_enabled
                .unwrap_or(current.auto_publish_enabled),
        )
        .bind(id)
        .execute(self.pool())
        .await?;

        self.get_target_channel(id).await
    }

    /// Targets referenced by posts cannot be deleted; deactivate them instead.
    pub async fn delete_target_channel(&self, id: ChannelId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM target_channels WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    StoreError::Conflict(format!("target channel {id} is referenced by posts"))
                }
                other => other.into(),
            })?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("target channel {id}")));
        }
        info!(channel_id = id, "target channel deleted");
        Ok(())
    }
}
