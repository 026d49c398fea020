mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use async_trait::async_trait;
use relay_adapters::{AdapterError, ChannelHandle, ChannelSource, DeliveryError};
use relay_core::{
    settings_keys, template_digest, Classification, MediaDescriptor, MediaItem, MediaKind,
    PostDraft, PostStatus, WorkerKind, CAPTION_LIMIT,
};
use relay_storage::{IngestOutcome, PostFilter, Store};
use relay_workers::{
    improve_post, supervise, ClassifierConfig, ClassifierWorker, PublishOutcome, PublisherConfig,
    PublisherWorker, RuntimeConfig, ScraperConfig, ScraperWorker, Worker,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

fn classifier(store: &Store, model: &Arc<ScriptedModel>) -> ClassifierWorker {
    ClassifierWorker::new(store.clone(), model.clone(), ClassifierConfig::default())
}

fn publisher(store: &Store, delivery: &Arc<RecordingDelivery>) -> PublisherWorker {
    PublisherWorker::new(store.clone(), delivery.clone(), PublisherConfig::default())
}

async fn enable_classification(store: &Store) {
    store
        .upsert_setting(settings_keys::CLASSIFICATION_ENABLED, "true", None)
        .await
        .unwrap();
}

async fn ingest_text(store: &Store, source_id: i64, origin: i64, text: &str) -> i64 {
    store
        .ingest_post(&PostDraft {
            source_channel_id: Some(source_id),
            origin_message_id: Some(origin),
            original_text: Some(text.into()),
            ..PostDraft::default()
        })
        .await
        .unwrap()
        .created()
        .unwrap()
}

fn confident(target_id: i64, confidence: u8) -> Classification {
    Classification {
        target_channel_id: Some(target_id),
        confidence,
        rationale: "matches the channel topic".into(),
    }
}

/// Deletes one channel from the store as soon as the scraper resolves it.
struct VanishingSource {
    store: Store,
    channel_id: i64,
    address: String,
    inner: Arc<ScriptedSource>,
}

#[async_trait]
impl ChannelSource for VanishingSource {
    async fn connect(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn resolve(&self, address: &str) -> Result<ChannelHandle, AdapterError> {
        if address == self.address {
            self.store.delete_source_channel(self.channel_id).await.unwrap();
        }
        self.inner.resolve(address).await
    }

    async fn history(
        &self,
        channel: &ChannelHandle,
        limit: usize,
        since_id: i64,
    ) -> Result<Vec<relay_core::SourceMessage>, AdapterError> {
        self.inner.history(channel, limit, since_id).await
    }

    async fn subscribe(
        &self,
        channels: &[ChannelHandle],
    ) -> Result<mpsc::Receiver<relay_core::SourceMessage>, AdapterError> {
        self.inner.subscribe(channels).await
    }
}

async fn all_posts(store: &Store) -> Vec<relay_core::Post> {
    store.list_posts(&PostFilter::default()).await.unwrap()
}

#[tokio::test]
async fn pull_ingests_new_messages_and_advances_cursor() {
    let store = store().await;
    let channel = source_channel(&store, "@c").await;
    store
        .record_channel_check(channel.id, Some(100), Utc::now() - ChronoDuration::seconds(10))
        .await
        .unwrap();

    let source = shared(ScriptedSource::with_history(
        "@c",
        vec![
            message("@c", 99, "already seen", None),
            message("@c", 101, "first", None),
            message("@c", 103, "second", None),
        ],
    ));
    let scraper = ScraperWorker::new(store.clone(), source, ScraperConfig::default());

    let summary = scraper.poll_due_channels().await.unwrap();
    assert_eq!(summary.created, 2);

    let channel = store.get_source_channel(channel.id).await.unwrap();
    assert_eq!(channel.last_message_id, 103);
    let mut origins = all_posts(&store)
        .await
        .into_iter()
        .map(|p| p.origin_message_id)
        .collect::<Vec<_>>();
    origins.sort();
    assert_eq!(origins, vec![Some(101), Some(103)]);

    // Interval has not elapsed again; nothing is pulled.
    assert_eq!(scraper.poll_due_channels().await.unwrap().fetched, 0);
}

#[tokio::test]
async fn cursor_advances_even_when_nothing_qualifies() {
    let store = store().await;
    let channel = source_channel(&store, "@quiet").await;
    let source = shared(ScriptedSource::with_history(
        "@quiet",
        vec![message("@quiet", 7, "  ", None), message("@quiet", 9, "", None)],
    ));
    let scraper = ScraperWorker::new(store.clone(), source, ScraperConfig::default());

    let summary = scraper.pull_channel(&channel).await.unwrap();
    assert_eq!(summary.created, 0);
    assert_eq!(summary.skipped, 2);
    assert_eq!(store.get_source_channel(channel.id).await.unwrap().last_message_id, 9);
    assert!(all_posts(&store).await.is_empty());
}

#[tokio::test]
async fn failed_fetch_keeps_cursor_but_stamps_check() {
    let store = store().await;
    let channel = source_channel(&store, "@missing").await;
    let scraper = ScraperWorker::new(
        store.clone(),
        shared(ScriptedSource::default()),
        ScraperConfig::default(),
    );

    scraper.pull_channel(&channel).await.unwrap();
    let channel = store.get_source_channel(channel.id).await.unwrap();
    assert_eq!(channel.last_message_id, 0);
    assert!(channel.last_checked.is_some());
}

#[tokio::test]
async fn pushed_and_pulled_copies_deduplicate() {
    let store = store().await;
    let channel = source_channel(&store, "@dup").await;
    let source = shared(ScriptedSource::with_history(
        "@dup",
        vec![message("@dup", 5, "hello", None)],
    ));
    let scraper = ScraperWorker::new(store.clone(), source, ScraperConfig::default());

    let pushed = scraper
        .ingest_pushed(message("dup", 5, "hello", None))
        .await
        .unwrap();
    assert!(matches!(pushed, IngestOutcome::Created(_)));

    let summary = scraper.pull_channel(&channel).await.unwrap();
    assert_eq!(summary.created, 0);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(all_posts(&store).await.len(), 1);
}

#[tokio::test]
async fn pulled_album_becomes_one_post() {
    let store = store().await;
    let channel = source_channel(&store, "@pics").await;
    let mut first = message("@pics", 20, "", Some(photo("a.jpg")));
    first.group_id = Some(77);
    let mut second = message("@pics", 21, "album caption", Some(photo("b.jpg")));
    second.group_id = Some(77);
    let source = shared(ScriptedSource::with_history("@pics", vec![second, first]));
    let scraper = ScraperWorker::new(store.clone(), source, ScraperConfig::default());

    scraper.pull_channel(&channel).await.unwrap();

    let posts = all_posts(&store).await;
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].origin_message_id, Some(20));
    assert_eq!(posts[0].original_text.as_deref(), Some("album caption"));
    assert_eq!(posts[0].original_media.as_ref().map(|m| m.items().len()), Some(2));
    assert_eq!(store.get_source_channel(channel.id).await.unwrap().last_message_id, 21);
}

#[tokio::test]
async fn album_split_across_pages_becomes_one_post() {
    let store = store().await;
    let channel = source_channel(&store, "@paged").await;
    let mut history = vec![message("@paged", 10, "before the album", None)];
    for (id, path) in [(11, "a.jpg"), (12, "b.jpg"), (13, "c.jpg")] {
        let text = if id == 11 { "three photos" } else { "" };
        let mut member = message("@paged", id, text, Some(photo(path)));
        member.group_id = Some(500);
        history.push(member);
    }
    let source = shared(ScriptedSource::with_history("@paged", history));
    let scraper = ScraperWorker::new(
        store.clone(),
        source,
        ScraperConfig {
            history_limit: 2,
            ..ScraperConfig::default()
        },
    );

    scraper.pull_channel(&channel).await.unwrap();
    let channel = store.get_source_channel(channel.id).await.unwrap();
    assert_eq!(channel.last_message_id, 10);
    assert_eq!(all_posts(&store).await.len(), 1);

    let summary = scraper.pull_channel(&channel).await.unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(store.get_source_channel(channel.id).await.unwrap().last_message_id, 13);

    let albums = all_posts(&store)
        .await
        .into_iter()
        .filter(|p| p.original_media.is_some())
        .collect::<Vec<_>>();
    assert_eq!(albums.len(), 1);
    assert_eq!(albums[0].origin_message_id, Some(11));
    assert_eq!(albums[0].original_media.as_ref().map(|m| m.items().len()), Some(3));
}

#[tokio::test]
async fn failing_channel_does_not_stop_the_pass() {
    let store = store().await;
    let doomed = source_channel(&store, "@doomed").await;
    source_channel(&store, "@healthy").await;

    // Deleting the first channel mid-pass makes its check bookkeeping fail.
    let source = shared(ScriptedSource::with_history(
        "@healthy",
        vec![message("@healthy", 1, "still pulled", None)],
    ));
    let vanishing = Arc::new(VanishingSource {
        store: store.clone(),
        channel_id: doomed.id,
        address: doomed.address.clone(),
        inner: source,
    });
    let scraper = ScraperWorker::new(store.clone(), vanishing, ScraperConfig::default());

    let summary = scraper.poll_due_channels().await.unwrap();
    assert_eq!(summary.created, 1);
    let posts = all_posts(&store).await;
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].original_text.as_deref(), Some("still pulled"));
}

#[tokio::test]
async fn pushed_album_members_are_coalesced_after_quiet_period() {
    let store = store().await;
    let channel = source_channel(&store, "@live").await;
    // Cursor past everything so only the push path can create posts.
    store
        .record_channel_check(channel.id, Some(1_000), Utc::now())
        .await
        .unwrap();

    let source = shared(ScriptedSource::with_history("@live", Vec::new()));
    let tx = source.enable_push();
    let config = ScraperConfig {
        fallback_interval: Duration::from_secs(60),
        reload_interval: Duration::from_millis(20),
        album_delay: Duration::from_millis(50),
        history_limit: 50,
    };
    let worker = Arc::new(ScraperWorker::new(store.clone(), source.clone(), config));
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    worker.spawn_loops(&mut tasks, cancel.clone());

    for _ in 0..100 {
        if !source.subscriptions.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(source.subscriptions.lock().unwrap()[0], vec!["live".to_string()]);

    let mut a = message("@live", 2001, "", Some(photo("1.jpg")));
    a.group_id = Some(5);
    let mut b = message("@live", 2002, "caption", Some(photo("2.jpg")));
    b.group_id = Some(5);
    tx.send(a).await.unwrap();
    tx.send(b).await.unwrap();
    tx.send(message("@live", 2003, "standalone", None)).await.unwrap();

    let mut posts = Vec::new();
    for _ in 0..100 {
        posts = all_posts(&store).await;
        if posts.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    assert_eq!(posts.len(), 2);
    let album = posts
        .iter()
        .find(|p| p.origin_message_id == Some(2001))
        .expect("album post");
    assert_eq!(album.original_text.as_deref(), Some("caption"));
    assert!(album.original_media.as_ref().is_some_and(|m| m.is_group()));
    // Push deliveries leave the pull cursor alone.
    assert_eq!(store.get_source_channel(channel.id).await.unwrap().last_message_id, 1_000);
}

#[tokio::test]
async fn media_only_posts_skip_the_rewrite_call() {
    let store = store().await;
    let channel = source_channel(&store, "@media").await;
    let id = store
        .ingest_post(&PostDraft {
            source_channel_id: Some(channel.id),
            origin_message_id: Some(1),
            original_media: Some(photo("only.jpg")),
            ..PostDraft::default()
        })
        .await
        .unwrap()
        .created()
        .unwrap();
    let model = shared(ScriptedModel::default());

    classifier(&store, &model).run_batch().await.unwrap();

    let post = store.get_post(id).await.unwrap();
    assert_eq!(post.status, PostStatus::TextProcessed);
    assert!(post.rewritten_text.is_none());
    assert_eq!(model.rewrite_calls(), 0);
}

#[tokio::test]
async fn global_prompt_carries_original_text() {
    let store = store().await;
    let channel = source_channel(&store, "@src").await;
    store
        .upsert_setting(settings_keys::REWRITE_PROMPT, "Shorten this: {original_text}", None)
        .await
        .unwrap();
    let id = ingest_text(&store, channel.id, 1, "Markets rallied on Friday").await;
    let model = shared(ScriptedModel::default());
    model.push_rewrite(Ok("Stocks up Friday".into()));

    let summary = classifier(&store, &model).run_batch().await.unwrap();
    assert_eq!(summary.rewritten, 1);

    let prompts = model.rewrite_prompts.lock().unwrap().clone();
    assert_eq!(prompts, vec!["Shorten this: Markets rallied on Friday".to_string()]);
    let post = store.get_post(id).await.unwrap();
    assert_eq!(post.status, PostStatus::TextProcessed);
    assert_eq!(post.rewritten_text.as_deref(), Some("Stocks up Friday"));
}

#[tokio::test]
async fn malformed_global_prompt_falls_back_to_default() {
    let store = store().await;
    let channel = source_channel(&store, "@src").await;
    store
        .upsert_setting(settings_keys::REWRITE_PROMPT, "Rewrite {post_text}", None)
        .await
        .unwrap();
    let id = ingest_text(&store, channel.id, 1, "original words").await;
    let model = shared(ScriptedModel::default());

    classifier(&store, &model).run_batch().await.unwrap();

    assert_eq!(store.get_post(id).await.unwrap().status, PostStatus::TextProcessed);
    let prompts = model.rewrite_prompts.lock().unwrap().clone();
    assert!(prompts[0].ends_with("original words"));
}

#[tokio::test]
async fn transient_rewrite_failure_leaves_post_new() {
    let store = store().await;
    let channel = source_channel(&store, "@src").await;
    let id = ingest_text(&store, channel.id, 1, "retry me").await;
    let model = shared(ScriptedModel::default());
    model.push_rewrite(Err(AdapterError::Timeout));
    let worker = classifier(&store, &model);

    worker.run_batch().await.unwrap();
    assert_eq!(store.get_post(id).await.unwrap().status, PostStatus::New);

    worker.run_batch().await.unwrap();
    let post = store.get_post(id).await.unwrap();
    assert_eq!(post.status, PostStatus::TextProcessed);
    assert_eq!(post.rewritten_text.as_deref(), Some("rewritten: retry me"));
}

#[tokio::test]
async fn unusable_rewrite_keeps_original_text() {
    let store = store().await;
    let channel = source_channel(&store, "@src").await;
    let id = ingest_text(&store, channel.id, 1, "keep me").await;
    let model = shared(ScriptedModel::default());
    model.push_rewrite(Err(AdapterError::InvalidResponse("no choices".into())));

    classifier(&store, &model).run_batch().await.unwrap();

    let post = store.get_post(id).await.unwrap();
    assert_eq!(post.status, PostStatus::TextProcessed);
    assert_eq!(post.text_for_delivery(), Some("keep me"));
}

#[tokio::test]
async fn confident_match_without_auto_publish_awaits_review() {
    let store = store().await;
    enable_classification(&store).await;
    let channel = source_channel(&store, "@src").await;
    let target = target_channel(&store, "@t", 80, false, None).await;
    let id = ingest_text(&store, channel.id, 1, "new chip launched").await;
    let model = shared(ScriptedModel::default());
    model.push_classification(Ok(confident(target.id, 90)));

    classifier(&store, &model).run_batch().await.unwrap();

    let post = store.get_post(id).await.unwrap();
    assert_eq!(post.status, PostStatus::AwaitingReview);
    assert_eq!(post.target_channel_id, Some(target.id));
    assert_eq!(post.classification_confidence, Some(90));
}

#[tokio::test]
async fn low_confidence_routes_to_manual() {
    let store = store().await;
    enable_classification(&store).await;
    let channel = source_channel(&store, "@src").await;
    let target = target_channel(&store, "@t", 80, true, None).await;
    let id = ingest_text(&store, channel.id, 1, "ambiguous").await;
    let model = shared(ScriptedModel::default());
    model.push_classification(Ok(confident(target.id, 79)));

    classifier(&store, &model).run_batch().await.unwrap();

    let post = store.get_post(id).await.unwrap();
    assert_eq!(post.status, PostStatus::WaitingManual);
    assert!(post.target_channel_id.is_none());
}

#[tokio::test]
async fn classification_failures_retry_or_route_manual() {
    let store = store().await;
    enable_classification(&store).await;
    let channel = source_channel(&store, "@src").await;
    target_channel(&store, "@t", 80, false, None).await;
    let flaky = ingest_text(&store, channel.id, 1, "flaky").await;
    let model = shared(ScriptedModel::default());
    model.push_classification(Err(AdapterError::RateLimited { retry_after: None }));
    let worker = classifier(&store, &model);

    worker.run_batch().await.unwrap();
    assert_eq!(store.get_post(flaky).await.unwrap().status, PostStatus::TextProcessed);

    model.push_classification(Err(AdapterError::InvalidResponse("prose".into())));
    worker.run_batch().await.unwrap();
    let post = store.get_post(flaky).await.unwrap();
    assert_eq!(post.status, PostStatus::WaitingManual);
    assert_eq!(*model.classify_calls.lock().unwrap(), 2);
}

#[tokio::test]
async fn disabled_classification_leaves_posts_processed() {
    let store = store().await;
    let channel = source_channel(&store, "@src").await;
    target_channel(&store, "@t", 80, true, None).await;
    let id = ingest_text(&store, channel.id, 1, "untouched").await;
    let model = shared(ScriptedModel::default());

    classifier(&store, &model).run_batch().await.unwrap();

    assert_eq!(store.get_post(id).await.unwrap().status, PostStatus::TextProcessed);
    assert_eq!(*model.classify_calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn targeted_manual_post_goes_to_review_without_classifier() {
    let store = store().await;
    let target = target_channel(&store, "@t", 80, false, None).await;
    let post = store
        .create_manual_post(Some("operator text".into()), None, Some(target.id))
        .await
        .unwrap();
    let model = shared(ScriptedModel::default());

    classifier(&store, &model).run_batch().await.unwrap();

    let post = store.get_post(post.id).await.unwrap();
    assert_eq!(post.status, PostStatus::AwaitingReview);
    assert!(post.is_manual);
    assert_eq!(*model.classify_calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn auto_publish_route_reaches_published_without_approval() {
    let store = store().await;
    enable_classification(&store).await;
    let channel = source_channel(&store, "@src").await;
    let target = target_channel(&store, "@auto", 70, true, None).await;
    let id = ingest_text(&store, channel.id, 1, "breaking story").await;
    let model = shared(ScriptedModel::default());
    model.push_classification(Ok(confident(target.id, 95)));

    let summary = classifier(&store, &model).run_batch().await.unwrap();
    assert_eq!(summary.routed_auto, 1);
    assert_eq!(summary.auto_approved, 1);

    let post = store.get_post(id).await.unwrap();
    assert_eq!(post.status, PostStatus::Publishing);
    assert_eq!(post.approved_by.as_deref(), Some(relay_core::AUTO_APPROVER));

    let delivery = shared(RecordingDelivery::default());
    publisher(&store, &delivery).run_batch(Utc::now()).await.unwrap();

    let post = store.get_post(id).await.unwrap();
    assert_eq!(post.status, PostStatus::Published);
    assert!(post.published_message_id.is_some());
    assert_eq!(post.target_channel_id, Some(target.id));
    assert_eq!(
        delivery.sent(),
        vec![Sent::Text {
            address: "@auto".into(),
            text: "rewritten: breaking story".into()
        }]
    );
}

#[tokio::test]
async fn target_template_rewrites_routed_post_once() {
    let store = store().await;
    enable_classification(&store).await;
    let channel = source_channel(&store, "@src").await;
    let template = "Write for developers:\n{original_text}";
    let target = target_channel(&store, "@dev", 80, false, Some(template)).await;
    let id = ingest_text(&store, channel.id, 1, "Rust 2.0 announced").await;
    let model = shared(ScriptedModel::default());
    model.push_rewrite(Ok("global version".into()));
    model.push_classification(Ok(confident(target.id, 88)));
    model.push_rewrite(Ok("developer version".into()));
    let worker = classifier(&store, &model);

    let summary = worker.run_batch().await.unwrap();
    assert_eq!(summary.target_rewrites, 1);

    let post = store.get_post(id).await.unwrap();
    assert_eq!(post.rewritten_text.as_deref(), Some("developer version"));
    assert_eq!(post.target_rewrite_digest, Some(template_digest(template)));
    assert_eq!(
        model.rewrite_prompts.lock().unwrap()[1],
        "Write for developers:\nRust 2.0 announced"
    );

    worker.run_batch().await.unwrap();
    assert_eq!(model.rewrite_calls(), 2);
}

#[tokio::test]
async fn malformed_target_template_parks_post_until_template_changes() {
    let store = store().await;
    enable_classification(&store).await;
    let channel = source_channel(&store, "@src").await;
    let target = target_channel(&store, "@bad", 80, false, Some("Rewrite {text} please")).await;
    let id = ingest_text(&store, channel.id, 1, "some news").await;
    let model = shared(ScriptedModel::default());
    model.push_classification(Ok(confident(target.id, 99)));
    let worker = classifier(&store, &model);

    worker.run_batch().await.unwrap();
    worker.run_batch().await.unwrap();

    let post = store.get_post(id).await.unwrap();
    assert_eq!(post.status, PostStatus::AwaitingReview);
    assert_eq!(post.rewritten_text.as_deref(), Some("rewritten: some news"));
    // Only the global rewrite reached the model.
    assert_eq!(model.rewrite_calls(), 1);

    store
        .update_target_channel(
            target.id,
            &relay_storage::TargetChannelUpdate {
                rewrite_prompt: Some(Some("Fixed: {original_text}".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    worker.run_batch().await.unwrap();
    assert_eq!(model.rewrite_calls(), 2);
}

#[tokio::test]
async fn scheduled_post_waits_for_due_time() {
    let store = store().await;
    let target = target_channel(&store, "@t", 80, false, None).await;
    let post = store
        .create_manual_post(Some("later".into()), None, Some(target.id))
        .await
        .unwrap();
    let due = Utc::now() + ChronoDuration::hours(1);
    store.schedule(post.id, None, due, "editor").await.unwrap();

    let delivery = shared(RecordingDelivery::default());
    let worker = publisher(&store, &delivery);

    let early = worker.run_batch(Utc::now()).await.unwrap();
    assert_eq!(early.delivered, 0);
    assert_eq!(store.get_post(post.id).await.unwrap().status, PostStatus::Scheduled);

    let late = worker
        .run_batch(due + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(late.delivered, 1);
    assert_eq!(store.get_post(post.id).await.unwrap().status, PostStatus::Published);
}

#[tokio::test]
async fn long_caption_is_truncated_for_single_photo() {
    let store = store().await;
    let target = target_channel(&store, "@photos", 80, false, None).await;
    let text = "é".repeat(CAPTION_LIMIT + 500);
    let post = store
        .create_manual_post(Some(text), Some(photo("sunset.jpg")), Some(target.id))
        .await
        .unwrap();
    store.approve(post.id, None, "editor").await.unwrap();
    store.request_immediate_publish(post.id).await.unwrap();
    let delivery = shared(RecordingDelivery::default());

    let outcome = publisher(&store, &delivery).publish_by_id(post.id).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Delivered(_)));

    let sent = delivery.sent();
    let Sent::Media { caption: Some(caption), path, .. } = &sent[0] else {
        panic!("expected a captioned photo, got {sent:?}");
    };
    assert_eq!(path, "sunset.jpg");
    assert_eq!(caption.chars().count(), CAPTION_LIMIT);
    assert_eq!(store.get_post(post.id).await.unwrap().status, PostStatus::Published);
}

#[tokio::test]
async fn album_is_sent_without_caption_then_text_follows() {
    let store = store().await;
    let target = target_channel(&store, "@albums", 80, false, None).await;
    let media = MediaDescriptor::from_items(vec![
        MediaItem::new(MediaKind::Photo, "1.jpg"),
        MediaItem::new(MediaKind::Video, "2.mp4"),
    ]);
    let post = store
        .create_manual_post(Some("line one\\nline two".into()), media, Some(target.id))
        .await
        .unwrap();
    store.approve(post.id, None, "editor").await.unwrap();
    store.request_immediate_publish(post.id).await.unwrap();
    let delivery = shared(RecordingDelivery::default());

    publisher(&store, &delivery).run_batch(Utc::now()).await.unwrap();

    assert_eq!(
        delivery.sent(),
        vec![
            Sent::Group {
                address: "@albums".into(),
                count: 2
            },
            Sent::Text {
                address: "@albums".into(),
                text: "line one\nline two".into()
            },
        ]
    );
    let post = store.get_post(post.id).await.unwrap();
    assert_eq!(post.published_message_id, Some(1001));
}

#[tokio::test]
async fn timeout_is_recorded_as_published_with_placeholder() {
    let store = store().await;
    let target = target_channel(&store, "@slow", 80, false, None).await;
    let post = store
        .create_manual_post(Some("maybe sent".into()), None, Some(target.id))
        .await
        .unwrap();
    store.approve(post.id, None, "editor").await.unwrap();
    store.request_immediate_publish(post.id).await.unwrap();
    let delivery = shared(RecordingDelivery::failing(DeliveryError::Timeout));

    let summary = publisher(&store, &delivery).run_batch(Utc::now()).await.unwrap();
    assert_eq!(summary.assumed, 1);

    let post = store.get_post(post.id).await.unwrap();
    assert_eq!(post.status, PostStatus::Published);
    let id = post.published_message_id.unwrap();
    assert!((1..=1_000_000).contains(&id));
}

#[tokio::test]
async fn post_without_content_is_not_sent() {
    let store = store().await;
    let target = target_channel(&store, "@empty", 80, false, None).await;
    let post = store
        .create_manual_post(Some("placeholder".into()), None, Some(target.id))
        .await
        .unwrap();
    store.approve(post.id, None, "editor").await.unwrap();
    let mut post = store.request_immediate_publish(post.id).await.unwrap();
    // As read back when the stored media descriptor was unusable and text is blank.
    post.original_text = Some("   ".into());
    post.original_media = None;
    let delivery = shared(RecordingDelivery::default());

    let outcome = publisher(&store, &delivery).publish_post(&post).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Deferred(_)));
    assert!(delivery.sent().is_empty());
    assert_eq!(store.get_post(post.id).await.unwrap().status, PostStatus::Publishing);
}

#[tokio::test]
async fn rejected_delivery_leaves_post_for_retry() {
    let store = store().await;
    let target = target_channel(&store, "@strict", 80, false, None).await;
    let post = store
        .create_manual_post(Some("try again".into()), None, Some(target.id))
        .await
        .unwrap();
    store.approve(post.id, None, "editor").await.unwrap();
    store.request_immediate_publish(post.id).await.unwrap();
    let delivery = shared(RecordingDelivery::failing(DeliveryError::Rejected(
        "chat not found".into(),
    )));
    let worker = publisher(&store, &delivery);

    let summary = worker.run_batch(Utc::now()).await.unwrap();
    assert_eq!(summary.deferred, 1);
    assert_eq!(store.get_post(post.id).await.unwrap().status, PostStatus::Publishing);

    *delivery.fail_with.lock().unwrap() = None;
    worker.run_batch(Utc::now()).await.unwrap();
    assert_eq!(store.get_post(post.id).await.unwrap().status, PostStatus::Published);
}

#[tokio::test]
async fn published_posts_always_carry_target_and_message_id() {
    let store = store().await;
    let target = target_channel(&store, "@t", 80, false, None).await;
    for i in 0..3 {
        let post = store
            .create_manual_post(Some(format!("post {i}")), None, Some(target.id))
            .await
            .unwrap();
        store.approve(post.id, None, "editor").await.unwrap();
        store.request_immediate_publish(post.id).await.unwrap();
    }
    let delivery = shared(RecordingDelivery::default());
    publisher(&store, &delivery).run_batch(Utc::now()).await.unwrap();

    let published = all_posts(&store)
        .await
        .into_iter()
        .filter(|p| p.status == PostStatus::Published)
        .collect::<Vec<_>>();
    assert_eq!(published.len(), 3);
    assert!(published
        .iter()
        .all(|p| p.published_message_id.is_some() && p.target_channel_id.is_some()));
}

#[tokio::test]
async fn rejected_credentials_keep_publisher_stopped_and_retry() {
    let store = store().await;
    store.set_should_run(WorkerKind::Publisher, true).await.unwrap();
    let delivery = shared(RecordingDelivery::default());
    *delivery.reject_check.lock().unwrap() = Some(AdapterError::Auth("bot token rejected".into()));
    let worker = Arc::new(publisher(&store, &delivery));
    assert!(worker.initialize().await.is_err());

    let config = RuntimeConfig {
        control_poll: Duration::from_millis(10),
        heartbeat: Duration::from_millis(20),
        init_backoff: Duration::from_millis(30),
    };
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(supervise(worker, store.clone(), config, shutdown.clone()));

    for _ in 0..200 {
        if *delivery.checks.lock().unwrap() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(*delivery.checks.lock().unwrap() >= 3);
    let control = store.worker_control(WorkerKind::Publisher).await.unwrap();
    assert!(!control.is_running);
    assert!(control.should_run);

    *delivery.reject_check.lock().unwrap() = None;
    let mut running = false;
    for _ in 0..200 {
        running = store
            .worker_control(WorkerKind::Publisher)
            .await
            .unwrap()
            .is_running;
        if running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(running);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn improve_uses_operator_template_and_keeps_original() {
    let store = store().await;
    store
        .upsert_setting(
            settings_keys::IMPROVE_PROMPT,
            "Edit per [{user_prompt}]: {original_text}",
            None,
        )
        .await
        .unwrap();
    let post = store
        .create_manual_post(Some("draft headline".into()), None, None)
        .await
        .unwrap();
    let model = shared(ScriptedModel::default());

    let improved = improve_post(&store, &*model, post.id, "  add a call to action ")
        .await
        .unwrap();
    assert_eq!(improved.rewritten_text.as_deref(), Some("improved: draft headline"));
    assert_eq!(improved.original_text.as_deref(), Some("draft headline"));
    assert_eq!(
        model.improve_prompts.lock().unwrap().clone(),
        vec!["Edit per [add a call to action]: draft headline".to_string()]
    );

    // A second pass works on the improved text.
    let again = improve_post(&store, &*model, post.id, "shorter").await.unwrap();
    assert_eq!(
        again.rewritten_text.as_deref(),
        Some("improved: improved: draft headline")
    );
}

#[tokio::test]
async fn improve_falls_back_to_default_template_and_guards_input() {
    let store = store().await;
    store
        .upsert_setting(settings_keys::IMPROVE_PROMPT, "{audience}: {original_text}", None)
        .await
        .unwrap();
    let target = target_channel(&store, "@done", 80, false, None).await;
    let post = store
        .create_manual_post(Some("body".into()), None, Some(target.id))
        .await
        .unwrap();
    let model = shared(ScriptedModel::default());

    assert!(improve_post(&store, &*model, post.id, "   ").await.is_err());
    assert!(model.improve_prompts.lock().unwrap().is_empty());

    improve_post(&store, &*model, post.id, "fix typos").await.unwrap();
    let prompt = model.improve_prompts.lock().unwrap()[0].clone();
    assert!(prompt.contains("Original text:\nbody"));
    assert!(prompt.contains("User instructions:\nfix typos"));

    store.approve(post.id, None, "editor").await.unwrap();
    store.request_immediate_publish(post.id).await.unwrap();
    store.mark_published(post.id, 42).await.unwrap();
    assert!(improve_post(&store, &*model, post.id, "again").await.is_err());
    assert_eq!(model.improve_prompts.lock().unwrap().len(), 1);
}
