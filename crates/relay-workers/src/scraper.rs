//! Scraper worker: turns new source-channel messages into posts.
//!
//! Two paths feed the store concurrently. The pull path walks every active
//! channel whose polling interval has elapsed and reads history past the
//! channel's cursor. The push path consumes the source's subscription stream,
//! buffering albums briefly. Both rely on the store's unique
//! (channel, origin message) key, so a message delivered twice is ingested once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use relay_adapters::{bare_address, AdapterError, ChannelHandle, ChannelSource};
use relay_core::{coalesce_album, SourceChannel, SourceMessage, WorkerKind};
use relay_storage::{IngestOutcome, Store, StoreError};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::album::AlbumBuffer;
use crate::config::ScraperConfig;
use crate::runtime::{every, Worker};

/// Telegram caps an album at this many items.
const MAX_ALBUM_ITEMS: usize = 10;

/// Counters for one pull of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub fetched: usize,
    pub created: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ScraperWorker {
    store: Store,
    source: Arc<dyn ChannelSource>,
    config: ScraperConfig,
}

struct PushSubscription {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PushSubscription {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            if err.is_panic() {
                error!("push subscription task panicked");
            }
        }
    }
}

impl ScraperWorker {
    pub fn new(store: Store, source: Arc<dyn ChannelSource>, config: ScraperConfig) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    /// Pull every active channel whose interval has elapsed. A channel that
    /// fails is logged and the pass moves on to the next one.
    pub async fn poll_due_channels(&self) -> Result<PullSummary, StoreError> {
        let now = Utc::now();
        let channels = self.store.list_source_channels(true).await?;
        let mut total = PullSummary::default();
        for channel in channels.iter().filter(|c| c.is_due(now)) {
            let summary = match self.pull_channel(channel).await {
                Ok(summary) => summary,
                Err(err) => {
                    error!(channel = %channel.address, error = %err, "pulling channel failed");
                    continue;
                }
            };
            total.fetched += summary.fetched;
            total.created += summary.created;
            total.duplicates += summary.duplicates;
            total.skipped += summary.skipped;
            total.failed += summary.failed;
        }
        if total.created > 0 {
            info!(created = total.created, duplicates = total.duplicates, "pull pass ingested posts");
        }
        Ok(total)
    }

    /// Read one channel's history past its cursor and ingest what qualifies.
    ///
    /// The cursor advances to the highest id observed even when nothing
    /// qualified or individual messages failed. A failed fetch only stamps the
    /// check time. An album cut off by the end of a full page is left for the
    /// next pull; a page holding nothing but part of one album is read again
    /// with room for the rest.
    pub async fn pull_channel(&self, channel: &SourceChannel) -> Result<PullSummary, StoreError> {
        let span = info_span!("pull_channel", channel = %channel.address, cursor = channel.last_message_id);
        async {
            let mut summary = PullSummary::default();

            let mut limit = self.config.history_limit;
            let mut fetched = self.fetch_page(channel, limit).await;
            if matches!(&fetched, Ok(page) if album_cut(page, limit) == Some(0)) {
                limit += MAX_ALBUM_ITEMS;
                fetched = self.fetch_page(channel, limit).await;
            }
            let mut messages = match fetched {
                Ok(messages) => messages,
                Err(err) => {
                    warn!(error = %err, "history fetch failed");
                    self.store
                        .record_channel_check(channel.id, None, Utc::now())
                        .await?;
                    return Ok(summary);
                }
            };

            summary.fetched = messages.len();
            if let Some(cut) = album_cut(&messages, limit).filter(|&cut| cut > 0) {
                debug!(
                    held_back = messages.len() - cut,
                    "page ends inside an album; leaving it for the next pull"
                );
                messages.truncate(cut);
            }
            let max_seen = messages.iter().map(|m| m.id).max();

            for message in group_page(messages) {
                self.ingest(channel, message, &mut summary).await;
            }

            let updated = self
                .store
                .record_channel_check(channel.id, max_seen, Utc::now())
                .await?;
            debug!(
                fetched = summary.fetched,
                created = summary.created,
                cursor = updated.last_message_id,
                "channel pulled"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn fetch_page(&self, channel: &SourceChannel, limit: usize) -> Result<Vec<SourceMessage>, AdapterError> {
        let handle = self.source.resolve(&channel.address).await?;
        let mut page = self
            .source
            .history(&handle, limit, channel.last_message_id)
            .await?;
        page.sort_by_key(|m| m.id);
        Ok(page)
    }

    async fn ingest(&self, channel: &SourceChannel, message: SourceMessage, summary: &mut PullSummary) {
        if message.is_empty() {
            debug!(channel = %channel.address, message_id = message.id, "skipping message without text or media");
            summary.skipped += 1;
            return;
        }
        let message_id = message.id;
        match self.store.ingest_post(&message.into_draft(channel.id)).await {
            Ok(IngestOutcome::Created(post_id)) => {
                debug!(channel = %channel.address, message_id, post_id, "post created");
                summary.created += 1;
            }
            Ok(IngestOutcome::Duplicate) => summary.duplicates += 1,
            Err(err) => {
                error!(channel = %channel.address, message_id, error = %err, "ingesting message failed");
                summary.failed += 1;
            }
        }
    }

    /// Ingest one push-delivered message. Never moves the channel cursor.
    pub async fn ingest_pushed(&self, message: SourceMessage) -> Result<IngestOutcome, StoreError> {
        let Some(channel) = self.store.source_channel_by_address(&message.channel).await? else {
            return Err(StoreError::NotFound(format!("source channel {}", message.channel)));
        };
        if !channel.is_active {
            return Err(StoreError::Conflict(format!(
                "source channel {} is inactive",
                channel.address
            )));
        }
        if message.is_empty() {
            return Err(StoreError::Invalid("message has neither text nor media".into()));
        }
        self.store.ingest_post(&message.into_draft(channel.id)).await
    }

    async fn ingest_pushed_logged(&self, message: SourceMessage) {
        let message_id = message.id;
        let channel = message.channel.clone();
        match self.ingest_pushed(message).await {
            Ok(IngestOutcome::Created(post_id)) => {
                info!(channel = %channel, message_id, post_id, "pushed message ingested");
            }
            Ok(IngestOutcome::Duplicate) => {
                debug!(channel = %channel, message_id, "pushed message already stored");
            }
            Err(StoreError::Invalid(_)) => {
                debug!(channel = %channel, message_id, "skipping pushed message without content");
            }
            Err(err) => warn!(channel = %channel, message_id, error = %err, "pushed message not ingested"),
        }
    }

    /// Consume a subscription stream until cancelled or the stream ends.
    async fn consume_push(self: Arc<Self>, mut rx: mpsc::Receiver<SourceMessage>, cancel: CancellationToken) {
        let mut albums = AlbumBuffer::new(self.config.album_delay);
        loop {
            let deadline = albums
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + self.config.album_delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(message) => {
                        if let Some(single) = albums.push(message, Instant::now()) {
                            self.ingest_pushed_logged(single).await;
                        }
                    }
                    None => {
                        warn!("push stream closed");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if albums.has_pending() => {
                    for album in albums.drain_due(Instant::now()) {
                        self.ingest_pushed_logged(album).await;
                    }
                }
            }
        }
        for album in albums.drain_all() {
            self.ingest_pushed_logged(album).await;
        }
    }

    async fn resolve_all(&self, channels: &[SourceChannel]) -> Vec<ChannelHandle> {
        let mut handles = Vec::with_capacity(channels.len());
        for channel in channels {
            match self.source.resolve(&channel.address).await {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!(channel = %channel.address, error = %err, "cannot resolve channel for push"),
            }
        }
        handles
    }

    /// Keep the push subscription matched to the active channel set.
    async fn reload_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut current: Option<BTreeSet<String>> = None;
        let mut subscription: Option<PushSubscription> = None;
        let mut interval = tokio::time::interval(self.config.reload_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if subscription.as_ref().is_some_and(|s| s.handle.is_finished()) {
                warn!("push subscription ended; resubscribing");
                if let Some(old) = subscription.take() {
                    old.stop().await;
                }
                current = None;
            }

            let channels = match self.store.list_source_channels(true).await {
                Ok(channels) => channels,
                Err(err) => {
                    error!(error = %err, "loading source channels failed");
                    continue;
                }
            };
            let wanted = channels
                .iter()
                .map(|c| bare_address(&c.address).to_string())
                .collect::<BTreeSet<_>>();
            if current.as_ref() == Some(&wanted) {
                continue;
            }

            if let Some(old) = subscription.take() {
                old.stop().await;
            }
            info!(channels = wanted.len(), "source channel set changed");

            if wanted.is_empty() {
                current = Some(wanted);
                continue;
            }

            let handles = self.resolve_all(&channels).await;
            match self.source.subscribe(&handles).await {
                Ok(rx) => {
                    let sub_cancel = cancel.child_token();
                    let handle = tokio::spawn(
                        self.clone()
                            .consume_push(rx, sub_cancel.clone())
                            .instrument(info_span!("push_subscription")),
                    );
                    subscription = Some(PushSubscription {
                        cancel: sub_cancel,
                        handle,
                    });
                    info!(channels = handles.len(), "push subscription started");
                    current = Some(wanted);
                }
                Err(AdapterError::Unsupported(reason)) => {
                    info!(reason, "push delivery unavailable; relying on periodic pulls");
                    current = Some(wanted);
                }
                Err(err) => {
                    warn!(error = %err, "subscribing to channels failed; retrying on next reload");
                    current = None;
                }
            }
        }

        if let Some(old) = subscription.take() {
            old.stop().await;
        }
    }
}

/// Index at which a full page must be cut so an album running past its end is
/// left for the next pull. `Some(0)` means the page holds nothing but that album.
/// Expects the page ordered by id.
pub(crate) fn album_cut(page: &[SourceMessage], limit: usize) -> Option<usize> {
    if page.len() < limit {
        return None;
    }
    let group = page.last()?.group_id?;
    page.iter().position(|m| m.group_id == Some(group))
}

/// Coalesce album members within one history page; other messages pass through.
/// Output is ordered by (coalesced) message id.
pub(crate) fn group_page(messages: Vec<SourceMessage>) -> Vec<SourceMessage> {
    let mut singles = Vec::new();
    let mut albums: BTreeMap<i64, Vec<SourceMessage>> = BTreeMap::new();
    for message in messages {
        match message.group_id {
            Some(group) => albums.entry(group).or_default().push(message),
            None => singles.push(message),
        }
    }
    singles.extend(albums.into_values().filter_map(coalesce_album));
    singles.sort_by_key(|m| m.id);
    singles
}

#[async_trait]
impl Worker for ScraperWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Scraper
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        self.source.connect().await?;
        Ok(())
    }

    fn spawn_loops(self: Arc<Self>, tasks: &mut JoinSet<()>, cancel: CancellationToken) {
        let pull = self.clone();
        tasks.spawn(
            every(self.config.fallback_interval, cancel.clone(), move || {
                let worker = pull.clone();
                async move {
                    if let Err(err) = worker.poll_due_channels().await {
                        error!(error = %err, "pull pass failed");
                    }
                }
            })
            .instrument(info_span!("scraper_pull")),
        );
        tasks.spawn(self.reload_loop(cancel).instrument(info_span!("scraper_reload")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{MediaDescriptor, MediaItem, MediaKind};

    fn msg(id: i64, group: Option<i64>, text: &str) -> SourceMessage {
        SourceMessage {
            id,
            channel: "@news".into(),
            timestamp: Utc::now(),
            text: text.into(),
            media: Some(MediaDescriptor::Single(MediaItem::new(
                MediaKind::Photo,
                format!("{id}.jpg"),
            ))),
            group_id: group,
            sender: None,
            views: 0,
            forwards: 0,
        }
    }

    #[test]
    fn page_grouping_coalesces_albums_in_id_order() {
        let out = group_page(vec![
            msg(105, None, "later"),
            msg(102, Some(1), ""),
            msg(101, Some(1), "album text"),
            msg(100, None, "first"),
        ]);
        assert_eq!(out.iter().map(|m| m.id).collect::<Vec<_>>(), vec![100, 101, 105]);
        assert_eq!(out[1].text, "album text");
        assert!(out[1].media.as_ref().is_some_and(|m| m.is_group()));
    }

    #[test]
    fn full_page_is_cut_before_a_trailing_album() {
        let page = vec![
            msg(100, None, "single"),
            msg(101, Some(7), "album"),
            msg(102, Some(7), ""),
        ];
        assert_eq!(album_cut(&page, 3), Some(1));
        // A short page holds the whole album.
        assert_eq!(album_cut(&page, 10), None);
        // Only the album: the caller widens the page instead.
        assert_eq!(album_cut(&page[1..], 2), Some(0));

        let plain = vec![msg(101, Some(7), "album"), msg(102, Some(7), ""), msg(103, None, "x")];
        assert_eq!(album_cut(&plain, 3), None);
    }
}
