//! Publisher worker: delivers due posts to their target channel.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_adapters::{Delivery, DeliveryError};
use relay_core::{normalize_delivery_text, truncate_chars, Post, PostId, WorkerKind};
use relay_storage::{Store, StoreError};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::PublisherConfig;
use crate::runtime::{every, Worker};

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered(i64),
    /// The platform timed out; the post is recorded with a placeholder id.
    AssumedDelivered(i64),
    /// Left in its current status for the next poll.
    Deferred(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherSummary {
    pub delivered: usize,
    pub assumed: usize,
    pub deferred: usize,
}

/// Placeholder message id for deliveries whose outcome is unknown. Always in `1..=1_000_000`.
pub fn placeholder_message_id(now: DateTime<Utc>) -> i64 {
    now.timestamp_millis().rem_euclid(1_000_000) + 1
}

pub struct PublisherWorker {
    store: Store,
    delivery: Arc<dyn Delivery>,
    config: PublisherConfig,
}

impl PublisherWorker {
    pub fn new(store: Store, delivery: Arc<dyn Delivery>, config: PublisherConfig) -> Self {
        Self {
            store,
            delivery,
            config,
        }
    }

    /// Deliver due scheduled posts (earliest due first), then immediate requests.
    pub async fn run_batch(&self, now: DateTime<Utc>) -> Result<PublisherSummary, StoreError> {
        let mut summary = PublisherSummary::default();
        let mut queue = self
            .store
            .due_scheduled_posts(now, self.config.batch_size)
            .await?;
        let remaining = self.config.batch_size - queue.len() as i64;
        if remaining > 0 {
            queue.extend(self.store.immediate_publish_posts(remaining).await?);
        }

        for post in queue {
            match self.publish_post(&post).await {
                Ok(PublishOutcome::Delivered(_)) => summary.delivered += 1,
                Ok(PublishOutcome::AssumedDelivered(_)) => summary.assumed += 1,
                Ok(PublishOutcome::Deferred(reason)) => {
                    debug!(post_id = post.id, %reason, "publication deferred");
                    summary.deferred += 1;
                }
                Err(err) => {
                    error!(post_id = post.id, error = %err, "publication bookkeeping failed");
                    summary.deferred += 1;
                }
            }
        }
        if summary != PublisherSummary::default() {
            info!(?summary, "publisher batch finished");
        }
        Ok(summary)
    }

    /// Deliver one post and record the result.
    pub async fn publish_post(&self, post: &Post) -> Result<PublishOutcome, StoreError> {
        let Some(target_id) = post.target_channel_id else {
            return Ok(PublishOutcome::Deferred("post has no target channel".into()));
        };
        let target = self.store.get_target_channel(target_id).await?;
        let span = info_span!("publish_post", post_id = post.id, target = %target.address);

        async {
            let text = post.text_for_delivery().map(normalize_delivery_text);
            match self.deliver(&target.address, post, text.as_deref()).await {
                Ok(message_id) => {
                    self.store.mark_published(post.id, message_id).await?;
                    info!(message_id, "post published");
                    Ok(PublishOutcome::Delivered(message_id))
                }
                Err(DeliveryError::Timeout) => {
                    let placeholder = placeholder_message_id(Utc::now());
                    warn!(
                        placeholder_id = placeholder,
                        "delivery timed out; assuming delivered to avoid a duplicate send"
                    );
                    self.store.mark_published(post.id, placeholder).await?;
                    Ok(PublishOutcome::AssumedDelivered(placeholder))
                }
                Err(err @ DeliveryError::MissingMedia(_)) => {
                    error!(error = %err, "media missing; post needs manual attention");
                    Ok(PublishOutcome::Deferred(err.to_string()))
                }
                Err(err) => {
                    warn!(error = %err, "delivery failed; will retry");
                    Ok(PublishOutcome::Deferred(err.to_string()))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn deliver(&self, address: &str, post: &Post, text: Option<&str>) -> Result<i64, DeliveryError> {
        let items = post
            .original_media
            .as_ref()
            .map(|m| m.items())
            .unwrap_or_default();

        match items {
            [] => {
                let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
                    return Err(DeliveryError::MissingMedia(
                        "post has neither text nor usable media".into(),
                    ));
                };
                self.delivery
                    .send_text(address, truncate_chars(text, self.delivery.message_limit()))
                    .await
            }
            [item] => {
                let caption = text.map(|t| truncate_chars(t, self.delivery.caption_limit()));
                self.delivery.send_media(address, item, caption).await
            }
            items => {
                let ids = self.delivery.send_group(address, items).await?;
                let first = ids.first().copied();
                let follow_up = match text {
                    Some(text) => Some(
                        self.delivery
                            .send_text(address, truncate_chars(text, self.delivery.message_limit()))
                            .await,
                    ),
                    None => None,
                };
                match (first, follow_up) {
                    (Some(id), Some(Err(err))) => {
                        warn!(error = %err, "album delivered but follow-up text failed");
                        Ok(id)
                    }
                    (Some(id), _) => Ok(id),
                    (None, Some(Ok(id))) => Ok(id),
                    (None, _) => Err(DeliveryError::Rejected(
                        "media group delivery returned no message ids".into(),
                    )),
                }
            }
        }
    }

    /// Publish a single post now regardless of the poll cadence.
    pub async fn publish_by_id(&self, id: PostId) -> Result<PublishOutcome, StoreError> {
        let post = self.store.get_post(id).await?;
        if !post.is_due(Utc::now()) {
            return Ok(PublishOutcome::Deferred(format!("post is {} and not due", post.status)));
        }
        self.publish_post(&post).await
    }
}

#[async_trait]
impl Worker for PublisherWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Publisher
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        self.delivery.check().await?;
        Ok(())
    }

    fn spawn_loops(self: Arc<Self>, tasks: &mut JoinSet<()>, cancel: CancellationToken) {
        let period = self.config.poll_interval;
        tasks.spawn(
            every(period, cancel, move || {
                let worker = self.clone();
                async move {
                    if let Err(err) = worker.run_batch(Utc::now()).await {
                        error!(error = %err, "publisher batch failed");
                    }
                }
            })
            .instrument(info_span!("publisher_loop")),
        );
    }
}
