use std::collections::HashMap;

use chrono::{DateTime, Utc};
use relay_core::{
    Classification, ChannelId, MediaDescriptor, Post, PostDraft, PostId, PostStatus,
    TargetChannel, Transition, AUTO_APPROVER,
};
use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

use crate::rows::{convert_all, PostRow};
use crate::{now_millis, status_list, to_millis, Store, StoreError};

/// Result of offering a scraped or manual post to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created(PostId),
    /// The (source channel, origin message) pair was already stored.
    Duplicate,
}

impl IngestOutcome {
    pub fn created(self) -> Option<PostId> {
        match self {
            Self::Created(id) => Some(id),
            Self::Duplicate => None,
        }
    }
}

/// Operator-facing post listing filter. Results are newest first.
#[derive(Debug, Clone)]
pub struct PostFilter {
    pub status: Option<PostStatus>,
    pub source_channel_id: Option<ChannelId>,
    pub target_channel_id: Option<ChannelId>,
    pub is_manual: Option<bool>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for PostFilter {
    fn default() -> Self {
        Self {
            status: None,
            source_channel_id: None,
            target_channel_id: None,
            is_manual: None,
            created_after: None,
            created_before: None,
            limit: 50,
            offset: 0,
        }
    }
}

const TARGET_REWRITE_STATUSES: &[PostStatus] =
    &[PostStatus::AwaitingReview, PostStatus::ReadyToPublish];

impl Store {
    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Insert a post unless its (source channel, origin message) pair already exists.
    pub async fn ingest_post(&self, draft: &PostDraft) -> Result<IngestOutcome, StoreError> {
        if !draft.has_content() {
            return Err(StoreError::Invalid(
                "post has neither text nor media".to_string(),
            ));
        }

        let media = draft.original_media.as_ref().map(MediaDescriptor::to_json_string);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO posts \
             (source_channel_id, origin_message_id, original_text, original_media, \
              target_channel_id, is_manual, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(draft.source_channel_id)
        .bind(draft.origin_message_id)
        .bind(draft.original_text.as_deref())
        .bind(media)
        .bind(draft.target_channel_id)
        .bind(draft.is_manual)
        .bind(PostStatus::New.as_str())
        .bind(now_millis())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                source_channel_id = ?draft.source_channel_id,
                origin_message_id = ?draft.origin_message_id,
                "duplicate post ignored"
            );
            return Ok(IngestOutcome::Duplicate);
        }
        Ok(IngestOutcome::Created(result.last_insert_rowid()))
    }

    /// Operator-authored post with no source reference.
    pub async fn create_manual_post(
        &self,
        text: Option<String>,
        media: Option<MediaDescriptor>,
        target_channel_id: Option<ChannelId>,
    ) -> Result<Post, StoreError> {
        if let Some(target_id) = target_channel_id {
            self.get_target_channel(target_id).await?;
        }
        let draft = PostDraft::manual(text, media, target_channel_id);
        match self.ingest_post(&draft).await? {
            IngestOutcome::Created(id) => self.get_post(id).await,
            IngestOutcome::Duplicate => Err(StoreError::Conflict(
                "manual post collided with an existing row".to_string(),
            )),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get_post(&self, id: PostId) -> Result<Post, StoreError> {
        sqlx::query_as::<_, PostRow>("SELECT * FROM posts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("post {id}")))?
            .try_into()
    }

    pub async fn list_posts(&self, filter: &PostFilter) -> Result<Vec<Post>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM posts WHERE 1 = 1");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(source) = filter.source_channel_id {
            qb.push(" AND source_channel_id = ").push_bind(source);
        }
        if let Some(target) = filter.target_channel_id {
            qb.push(" AND target_channel_id = ").push_bind(target);
        }
        if let Some(manual) = filter.is_manual {
            qb.push(" AND is_manual = ").push_bind(manual);
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND created_at >= ").push_bind(to_millis(after));
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND created_at < ").push_bind(to_millis(before));
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit.max(0))
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let rows = qb.build_query_as::<PostRow>().fetch_all(self.pool()).await?;
        convert_all(rows)
    }

    /// Posts in `status`, oldest first.
    pub async fn posts_with_status(
        &self,
        status: PostStatus,
        limit: i64,
    ) -> Result<Vec<Post>, StoreError> {
        let rows = sqlx::query_as::<_, PostRow>(
            "SELECT * FROM posts WHERE status = ? ORDER BY created_at, id LIMIT ?",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        convert_all(rows)
    }

    /// Text-processed posts not yet routed, oldest first. Untargeted posts are
    /// included only when `include_untargeted`.
    pub async fn posts_needing_classification(
        &self,
        limit: i64,
        include_untargeted: bool,
    ) -> Result<Vec<Post>, StoreError> {
        let rows = sqlx::query_as::<_, PostRow>(
            "SELECT * FROM posts \
             WHERE status = ? AND classification_confidence IS NULL \
               AND (? OR target_channel_id IS NOT NULL) \
             ORDER BY created_at, id \
             LIMIT ?",
        )
        .bind(PostStatus::TextProcessed.as_str())
        .bind(include_untargeted)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        convert_all(rows)
    }

    /// Routed posts whose target template changed since their last rewrite.
    pub async fn posts_needing_target_rewrite(
        &self,
        limit: i64,
    ) -> Result<Vec<(Post, TargetChannel)>, StoreError> {
        let sql = format!(
            "SELECT p.* FROM posts p \
             JOIN target_channels t ON t.id = p.target_channel_id \
             WHERE p.status IN ({}) \
               AND t.rewrite_prompt_digest IS NOT NULL \
               AND p.original_text IS NOT NULL AND trim(p.original_text) <> '' \
               AND (p.target_rewrite_digest IS NULL OR p.target_rewrite_digest <> t.rewrite_prompt_digest) \
             ORDER BY p.created_at, p.id \
             LIMIT ?",
            status_list(TARGET_REWRITE_STATUSES)
        );
        let rows = sqlx::query_as::<_, PostRow>(&sql)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        let posts: Vec<Post> = convert_all(rows)?;

        let mut targets: HashMap<ChannelId, TargetChannel> = HashMap::new();
        let mut out = Vec::with_capacity(posts.len());
        for post in posts {
            let Some(target_id) = post.target_channel_id else {
                continue;
            };
            if !targets.contains_key(&target_id) {
                let target = self.get_target_channel(target_id).await?;
                targets.insert(target_id, target);
            }
            if let Some(target) = targets.get(&target_id) {
                out.push((post, target.clone()));
            }
        }
        Ok(out)
    }

    /// Scheduled posts whose due time is at or before `now`, earliest due first.
    pub async fn due_scheduled_posts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Post>, StoreError> {
        let rows = sqlx::query_as::<_, PostRow>(
            "SELECT * FROM posts \
             WHERE status = ? AND scheduled_at IS NOT NULL AND scheduled_at <= ? \
             ORDER BY scheduled_at, id LIMIT ?",
        )
        .bind(PostStatus::Scheduled.as_str())
        .bind(to_millis(now))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        convert_all(rows)
    }

    /// Posts flipped to PUBLISHING by an operator or the auto-approver.
    pub async fn immediate_publish_posts(&self, limit: i64) -> Result<Vec<Post>, StoreError> {
        let rows = sqlx::query_as::<_, PostRow>(
            "SELECT * FROM posts WHERE status = ? \
             ORDER BY COALESCE(scheduled_at, created_at), id LIMIT ?",
        )
        .bind(PostStatus::Publishing.as_str())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        convert_all(rows)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    async fn finish_transition(
        &self,
        id: PostId,
        transition: Transition,
        rows_affected: u64,
    ) -> Result<Post, StoreError> {
        if rows_affected == 0 {
            return Err(self.transition_failure(id, transition).await);
        }
        debug!(post_id = id, status = %transition.target(), "post transitioned");
        self.get_post(id).await
    }

    /// NEW -> TEXT_PROCESSED, optionally storing the global rewrite.
    pub async fn mark_text_processed(
        &self,
        id: PostId,
        rewritten_text: Option<&str>,
    ) -> Result<Post, StoreError> {
        let t = Transition::TextProcessed;
        let sql = format!(
            "UPDATE posts SET status = ?, \
                 text_processed_at = COALESCE(text_processed_at, ?), \
                 rewritten_text = COALESCE(?, rewritten_text) \
             WHERE id = ? AND status IN ({})",
            status_list(t.sources())
        );
        let result = sqlx::query(&sql)
            .bind(t.target().as_str())
            .bind(now_millis())
            .bind(rewritten_text)
            .bind(id)
            .execute(self.pool())
            .await?;
        self.finish_transition(id, t, result.rows_affected()).await
    }

    /// Store a confident classification and route the post to review or auto-publish.
    pub async fn record_classification(
        &self,
        id: PostId,
        classification: &Classification,
        target_channel_id: ChannelId,
        auto_publish: bool,
    ) -> Result<Post, StoreError> {
        let t = if auto_publish {
            Transition::RouteToAutoPublish
        } else {
            Transition::RouteToReview
        };
        let payload = serde_json::to_string(classification)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let sql = format!(
            "UPDATE posts SET status = ?, target_channel_id = ?, \
                 classification_confidence = ?, classification = ? \
             WHERE id = ? AND status IN ({})",
            status_list(t.sources())
        );
        let result = sqlx::query(&sql)
            .bind(t.target().as_str())
            .bind(target_channel_id)
            .bind(i64::from(classification.confidence.min(100)))
            .bind(payload)
            .bind(id)
            .execute(self.pool())
            .await?;
        self.finish_transition(id, t, result.rows_affected()).await
    }

    /// Send a post that already carries a target straight to human review.
    pub async fn route_to_review(&self, id: PostId) -> Result<Post, StoreError> {
        let t = Transition::RouteToReview;
        let sql = format!(
            "UPDATE posts SET status = ? \
             WHERE id = ? AND status IN ({}) AND target_channel_id IS NOT NULL",
            status_list(t.sources())
        );
        let result = sqlx::query(&sql)
            .bind(t.target().as_str())
            .bind(id)
            .execute(self.pool())
            .await?;
        self.finish_transition(id, t, result.rows_affected()).await
    }

    pub async fn route_to_manual(
        &self,
        id: PostId,
        classification: Option<&Classification>,
    ) -> Result<Post, StoreError> {
        let t = Transition::RouteToManual;
        let payload = classification
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let sql = format!(
            "UPDATE posts SET status = ?, \
                 classification_confidence = COALESCE(?, classification_confidence), \
                 classification = COALESCE(?, classification) \
             WHERE id = ? AND status IN ({})",
            status_list(t.sources())
        );
        let result = sqlx::query(&sql)
            .bind(t.target().as_str())
            .bind(classification.map(|c| i64::from(c.confidence.min(100))))
            .bind(payload)
            .bind(id)
            .execute(self.pool())
            .await?;
        self.finish_transition(id, t, result.rows_affected()).await
    }

    /// Record the outcome of a target-specific rewrite. `rewritten_text` is `None`
    /// when the template was unusable; the digest is stored either way so the
    /// post is retried only after the template changes.
    pub async fn record_target_rewrite(
        &self,
        id: PostId,
        rewritten_text: Option<&str>,
        template_digest: &str,
    ) -> Result<Post, StoreError> {
        let sql = format!(
            "UPDATE posts SET rewritten_text = COALESCE(?, rewritten_text), \
                 target_rewrite_digest = ? \
             WHERE id = ? AND status IN ({})",
            status_list(TARGET_REWRITE_STATUSES)
        );
        let result = sqlx::query(&sql)
            .bind(rewritten_text)
            .bind(template_digest)
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            let post = self.get_post(id).await?;
            return Err(StoreError::Conflict(format!(
                "post {id} is {}; target rewrites apply only before approval",
                post.status
            )));
        }
        self.get_post(id).await
    }

    /// READY_TO_PUBLISH -> PUBLISHING on behalf of an auto-publish target.
    pub async fn auto_approve(&self, id: PostId) -> Result<Post, StoreError> {
        let t = Transition::AutoApprove;
        let now = now_millis();
        let sql = format!(
            "UPDATE posts SET status = ?, approved_by = ?, \
                 approved_at = COALESCE(approved_at, ?), scheduled_at = ? \
             WHERE id = ? AND status IN ({}) AND target_channel_id IS NOT NULL",
            status_list(t.sources())
        );
        let result = sqlx::query(&sql)
            .bind(t.target().as_str())
            .bind(AUTO_APPROVER)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;
        self.finish_transition(id, t, result.rows_affected()).await
    }

    /// Human approval. `target_channel_id` overrides the routed target when given.
    pub async fn approve(
        &self,
        id: PostId,
        target_channel_id: Option<ChannelId>,
        approver: &str,
    ) -> Result<Post, StoreError> {
        if let Some(target_id) = target_channel_id {
            self.get_target_channel(target_id).await?;
        }
        let t = Transition::Approve;
        let sql = format!(
            "UPDATE posts SET status = ?, target_channel_id = COALESCE(?, target_channel_id), \
                 approved_by = ?, approved_at = COALESCE(approved_at, ?) \
             WHERE id = ? AND status IN ({}) AND COALESCE(?, target_channel_id) IS NOT NULL",
            status_list(t.sources())
        );
        let result = sqlx::query(&sql)
            .bind(t.target().as_str())
            .bind(target_channel_id)
            .bind(approver)
            .bind(now_millis())
            .bind(id)
            .bind(target_channel_id)
            .execute(self.pool())
            .await?;
        self.finish_transition(id, t, result.rows_affected()).await
    }

    /// Approve and defer delivery until `at`, which must lie in the future.
    pub async fn schedule(
        &self,
        id: PostId,
        target_channel_id: Option<ChannelId>,
        at: DateTime<Utc>,
        approver: &str,
    ) -> Result<Post, StoreError> {
        let now = now_millis();
        if to_millis(at) <= now {
            return Err(StoreError::Invalid(format!(
                "scheduled time {at} is not in the future"
            )));
        }
        if let Some(target_id) = target_channel_id {
            self.get_target_channel(target_id).await?;
        }
        let t = Transition::Schedule;
        let sql = format!(
            "UPDATE posts SET status = ?, target_channel_id = COALESCE(?, target_channel_id), \
                 approved_by = ?, approved_at = COALESCE(approved_at, ?), scheduled_at = ? \
             WHERE id = ? AND status IN ({}) AND COALESCE(?, target_channel_id) IS NOT NULL",
            status_list(t.sources())
        );
        let result = sqlx::query(&sql)
            .bind(t.target().as_str())
            .bind(target_channel_id)
            .bind(approver)
            .bind(now)
            .bind(to_millis(at))
            .bind(id)
            .bind(target_channel_id)
            .execute(self.pool())
            .await?;
        self.finish_transition(id, t, result.rows_affected()).await
    }

    /// Flip an approved or scheduled post to PUBLISHING, due now.
    pub async fn request_immediate_publish(&self, id: PostId) -> Result<Post, StoreError> {
        let t = Transition::PublishNow;
        let sql = format!(
            "UPDATE posts SET status = ?, scheduled_at = ? \
             WHERE id = ? AND status IN ({}) AND target_channel_id IS NOT NULL",
            status_list(t.sources())
        );
        let result = sqlx::query(&sql)
            .bind(t.target().as_str())
            .bind(now_millis())
            .bind(id)
            .execute(self.pool())
            .await?;
        self.finish_transition(id, t, result.rows_affected()).await
    }

    pub async fn reject(
        &self,
        id: PostId,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<Post, StoreError> {
        let t = Transition::Reject;
        let sql = format!(
            "UPDATE posts SET status = ?, approved_by = ?, notes = COALESCE(?, notes) \
             WHERE id = ? AND status IN ({})",
            status_list(t.sources())
        );
        let result = sqlx::query(&sql)
            .bind(t.target().as_str())
            .bind(approver)
            .bind(notes)
            .bind(id)
            .execute(self.pool())
            .await?;
        self.finish_transition(id, t, result.rows_affected()).await
    }

    pub async fn mark_published(
        &self,
        id: PostId,
        published_message_id: i64,
    ) -> Result<Post, StoreError> {
        let t = Transition::Published;
        let sql = format!(
            "UPDATE posts SET status = ?, published_message_id = ?, \
                 published_at = COALESCE(published_at, ?) \
             WHERE id = ? AND status IN ({}) AND target_channel_id IS NOT NULL",
            status_list(t.sources())
        );
        let result = sqlx::query(&sql)
            .bind(t.target().as_str())
            .bind(published_message_id)
            .bind(now_millis())
            .bind(id)
            .execute(self.pool())
            .await?;
        self.finish_transition(id, t, result.rows_affected()).await
    }

    /// Operator edit of the outgoing text and notes. Only pre-publish posts are editable.
    pub async fn update_post_text(
        &self,
        id: PostId,
        rewritten_text: Option<&str>,
        notes: Option<&str>,
    ) -> Result<Post, StoreError> {
        let editable: Vec<PostStatus> = PostStatus::ALL
            .into_iter()
            .filter(|s| s.is_pre_publish())
            .collect();
        let sql = format!(
            "UPDATE posts SET rewritten_text = COALESCE(?, rewritten_text), \
                 notes = COALESCE(?, notes) \
             WHERE id = ? AND status IN ({})",
            status_list(&editable)
        );
        let result = sqlx::query(&sql)
            .bind(rewritten_text)
            .bind(notes)
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            let post = self.get_post(id).await?;
            return Err(StoreError::Conflict(format!(
                "post {id} is {}; only pre-publish posts can be edited",
                post.status
            )));
        }
        self.get_post(id).await
    }
}
