//! Classifier/rewriter worker.
//!
//! One batch runs four stages in order, each bounded by the batch size:
//! text processing of NEW posts, routing of text-processed posts, per-target
//! rewrites of routed posts, and auto-approval of posts headed for an
//! auto-publish target. Adapter failures never advance a post; the next poll
//! simply tries again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_adapters::{AdapterError, TextModel};
use relay_core::{
    render_rewrite_prompt, settings_keys, template_digest, ChannelId, Classification,
    ClassificationCandidate, Post, PostStatus, TargetChannel, WorkerKind, DEFAULT_REWRITE_PROMPT,
};
use relay_storage::{Store, StoreError};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ClassifierConfig;
use crate::runtime::{every, Worker};

/// Where a classification result sends a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Confident match on a target that publishes without review.
    AutoPublish(ChannelId),
    /// Confident match; a human approves.
    Review(ChannelId),
    Manual,
}

/// Decide routing for a classification against the active targets.
///
/// A target id the model invented, or one that is inactive, counts as no match.
pub fn route_classification(classification: &Classification, targets: &[TargetChannel]) -> Route {
    let Some(target_id) = classification.target_channel_id else {
        return Route::Manual;
    };
    let Some(target) = targets.iter().find(|t| t.id == target_id && t.is_active) else {
        return Route::Manual;
    };
    if !target.accepts(classification.confidence) {
        return Route::Manual;
    }
    if target.auto_publish_enabled {
        Route::AutoPublish(target.id)
    } else {
        Route::Review(target.id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassifierSummary {
    pub text_processed: usize,
    pub rewritten: usize,
    pub routed_review: usize,
    pub routed_auto: usize,
    pub routed_manual: usize,
    pub target_rewrites: usize,
    pub auto_approved: usize,
    pub deferred: usize,
}

/// What to do after an adapter failure inside a stage.
enum Failure {
    /// Leave the post for the next poll.
    Retry,
    /// The adapter cannot work at all; stop the stage.
    Abort,
    /// A definitive answer that will not improve on retry.
    Permanent,
}

fn failure_kind(err: &AdapterError) -> Failure {
    if err.is_transient() {
        Failure::Retry
    } else if err.is_fatal() {
        Failure::Abort
    } else {
        Failure::Permanent
    }
}

pub struct ClassifierWorker {
    store: Store,
    model: Arc<dyn TextModel>,
    config: ClassifierConfig,
}

impl ClassifierWorker {
    pub fn new(store: Store, model: Arc<dyn TextModel>, config: ClassifierConfig) -> Self {
        Self {
            store,
            model,
            config,
        }
    }

    /// Run every stage once.
    pub async fn run_batch(&self) -> Result<ClassifierSummary, StoreError> {
        let mut summary = ClassifierSummary::default();
        self.process_new_posts(&mut summary).await?;
        self.classify_posts(&mut summary).await?;
        self.apply_target_rewrites(&mut summary).await?;
        self.auto_approve_ready(&mut summary).await?;
        if summary != ClassifierSummary::default() {
            info!(?summary, "classifier batch finished");
        }
        Ok(summary)
    }

    async fn process_new_posts(&self, summary: &mut ClassifierSummary) -> Result<(), StoreError> {
        let posts = self
            .store
            .posts_with_status(PostStatus::New, self.config.batch_size)
            .await?;
        if posts.is_empty() {
            return Ok(());
        }
        let rewrite_enabled = self
            .store
            .setting_flag(settings_keys::REWRITE_ENABLED, true)
            .await?;
        let template = self
            .store
            .setting_value(settings_keys::REWRITE_PROMPT)
            .await?
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REWRITE_PROMPT.to_string());

        for post in posts {
            let text = match post.original_text.as_deref() {
                Some(text) if rewrite_enabled && post.has_text() => text,
                _ => {
                    // Media-only posts and disabled rewriting need no adapter call.
                    self.mark_processed(&post, None, summary).await;
                    continue;
                }
            };

            let prompt = match render_rewrite_prompt(&template, text) {
                Ok(prompt) => prompt,
                Err(err) => {
                    warn!(post_id = post.id, error = %err, "global rewrite prompt unusable; using default");
                    match render_rewrite_prompt(DEFAULT_REWRITE_PROMPT, text) {
                        Ok(prompt) => prompt,
                        Err(err) => {
                            error!(post_id = post.id, error = %err, "default rewrite prompt unusable");
                            self.mark_processed(&post, None, summary).await;
                            continue;
                        }
                    }
                }
            };

            match self.model.rewrite(text, &prompt).await {
                Ok(rewritten) => {
                    let rewritten = rewritten.trim();
                    let stored = (!rewritten.is_empty()).then_some(rewritten);
                    if stored.is_some() {
                        summary.rewritten += 1;
                    }
                    self.mark_processed(&post, stored, summary).await;
                }
                Err(err) => match failure_kind(&err) {
                    Failure::Retry => {
                        warn!(post_id = post.id, error = %err, "rewrite failed; will retry");
                        summary.deferred += 1;
                    }
                    Failure::Abort => {
                        error!(post_id = post.id, error = %err, "rewrite adapter unavailable");
                        summary.deferred += 1;
                        break;
                    }
                    Failure::Permanent => {
                        warn!(post_id = post.id, error = %err, "rewrite failed; keeping original text");
                        self.mark_processed(&post, None, summary).await;
                    }
                },
            }
        }
        Ok(())
    }

    async fn mark_processed(&self, post: &Post, rewritten: Option<&str>, summary: &mut ClassifierSummary) {
        match self.store.mark_text_processed(post.id, rewritten).await {
            Ok(_) => {
                debug!(post_id = post.id, rewritten = rewritten.is_some(), "post text processed");
                summary.text_processed += 1;
            }
            Err(err) => error!(post_id = post.id, error = %err, "marking post processed failed"),
        }
    }

    async fn classify_posts(&self, summary: &mut ClassifierSummary) -> Result<(), StoreError> {
        let enabled = self
            .store
            .setting_flag(settings_keys::CLASSIFICATION_ENABLED, false)
            .await?;
        let posts = self
            .store
            .posts_needing_classification(self.config.batch_size, enabled)
            .await?;
        if posts.is_empty() {
            return Ok(());
        }
        let targets = self.store.list_target_channels(true).await?;
        let candidates = targets
            .iter()
            .map(ClassificationCandidate::from)
            .collect::<Vec<_>>();

        for post in posts {
            if post.target_channel_id.is_some() {
                match self.store.route_to_review(post.id).await {
                    Ok(_) => summary.routed_review += 1,
                    Err(err) => error!(post_id = post.id, error = %err, "routing targeted post failed"),
                }
                continue;
            }

            let text = match post.original_text.as_deref() {
                Some(text) if post.has_text() => text,
                _ => {
                    self.to_manual(&post, Classification::no_match("no text to classify"), summary)
                        .await;
                    continue;
                }
            };
            if candidates.is_empty() {
                self.to_manual(&post, Classification::no_match("no active target channels"), summary)
                    .await;
                continue;
            }

            let classification = match self.model.classify(text, &candidates).await {
                Ok(classification) => classification,
                Err(err) => match failure_kind(&err) {
                    Failure::Retry => {
                        warn!(post_id = post.id, error = %err, "classification failed; will retry");
                        summary.deferred += 1;
                        continue;
                    }
                    Failure::Abort => {
                        error!(post_id = post.id, error = %err, "classification adapter unavailable");
                        summary.deferred += 1;
                        break;
                    }
                    Failure::Permanent => {
                        warn!(post_id = post.id, error = %err, "classification unusable; routing to manual");
                        let failed = Classification::no_match(format!("classification failed: {err}"));
                        self.to_manual(&post, failed, summary).await;
                        continue;
                    }
                },
            };

            let route = route_classification(&classification, &targets);
            debug!(
                post_id = post.id,
                target = ?classification.target_channel_id,
                confidence = classification.confidence,
                ?route,
                "post classified"
            );
            let result = match route {
                Route::AutoPublish(target_id) => self
                    .store
                    .record_classification(post.id, &classification, target_id, true)
                    .await
                    .map(|_| summary.routed_auto += 1),
                Route::Review(target_id) => self
                    .store
                    .record_classification(post.id, &classification, target_id, false)
                    .await
                    .map(|_| summary.routed_review += 1),
                Route::Manual => {
                    self.to_manual(&post, classification, summary).await;
                    Ok(())
                }
            };
            if let Err(err) = result {
                error!(post_id = post.id, error = %err, "recording classification failed");
            }
        }
        Ok(())
    }

    async fn to_manual(&self, post: &Post, classification: Classification, summary: &mut ClassifierSummary) {
        match self.store.route_to_manual(post.id, Some(&classification)).await {
            Ok(_) => {
                info!(post_id = post.id, reason = %classification.rationale, "post needs manual routing");
                summary.routed_manual += 1;
            }
            Err(err) => error!(post_id = post.id, error = %err, "routing post to manual failed"),
        }
    }

    async fn apply_target_rewrites(&self, summary: &mut ClassifierSummary) -> Result<(), StoreError> {
        let pending = self
            .store
            .posts_needing_target_rewrite(self.config.batch_size)
            .await?;
        for (post, target) in pending {
            let (Some(template), Some(text)) = (target.rewrite_template(), post.original_text.as_deref())
            else {
                continue;
            };
            let digest = template_digest(template);

            let prompt = match render_rewrite_prompt(template, text) {
                Ok(prompt) => prompt,
                Err(err) => {
                    // Recording the digest parks the post until the template changes.
                    warn!(
                        post_id = post.id,
                        target = %target.address,
                        error = %err,
                        "target rewrite template unusable; post left unrewritten"
                    );
                    if let Err(err) = self.store.record_target_rewrite(post.id, None, &digest).await {
                        error!(post_id = post.id, error = %err, "recording template failure failed");
                    }
                    continue;
                }
            };

            match self.model.rewrite(text, &prompt).await {
                Ok(rewritten) if !rewritten.trim().is_empty() => {
                    match self
                        .store
                        .record_target_rewrite(post.id, Some(rewritten.trim()), &digest)
                        .await
                    {
                        Ok(_) => {
                            debug!(post_id = post.id, target = %target.address, "target rewrite stored");
                            summary.target_rewrites += 1;
                        }
                        Err(err) => error!(post_id = post.id, error = %err, "storing target rewrite failed"),
                    }
                }
                Ok(_) => {
                    warn!(post_id = post.id, "target rewrite came back empty; will retry");
                    summary.deferred += 1;
                }
                Err(err) => {
                    warn!(post_id = post.id, error = %err, "target rewrite failed; will retry");
                    summary.deferred += 1;
                    if err.is_fatal() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn auto_approve_ready(&self, summary: &mut ClassifierSummary) -> Result<(), StoreError> {
        let posts = self
            .store
            .posts_with_status(PostStatus::ReadyToPublish, self.config.batch_size)
            .await?;
        let mut targets: HashMap<ChannelId, TargetChannel> = HashMap::new();
        for post in posts {
            let Some(target_id) = post.target_channel_id else {
                continue;
            };
            if !targets.contains_key(&target_id) {
                let target = self.store.get_target_channel(target_id).await?;
                targets.insert(target_id, target);
            }
            let Some(target) = targets.get(&target_id) else {
                continue;
            };
            if !target.is_active || !target.auto_publish_enabled {
                debug!(post_id = post.id, target = %target.address, "auto-publish no longer enabled; left for operator");
                continue;
            }
            if post.needs_target_rewrite(target) {
                continue;
            }
            match self.store.auto_approve(post.id).await {
                Ok(_) => {
                    info!(post_id = post.id, target = %target.address, "post auto-approved");
                    summary.auto_approved += 1;
                }
                Err(err) => error!(post_id = post.id, error = %err, "auto-approval failed"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for ClassifierWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Classifier
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        self.model.check().await?;
        Ok(())
    }

    fn spawn_loops(self: Arc<Self>, tasks: &mut JoinSet<()>, cancel: CancellationToken) {
        let period = self.config.poll_interval;
        tasks.spawn(
            every(period, cancel, move || {
                let worker = self.clone();
                async move {
                    if let Err(err) = worker.run_batch().await {
                        error!(error = %err, "classifier batch failed");
                    }
                }
            })
            .instrument(info_span!("classifier_loop")),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: ChannelId, threshold: u8, auto: bool) -> TargetChannel {
        TargetChannel {
            id,
            address: format!("@target{id}"),
            title: format!("Target {id}"),
            description: None,
            tags: Vec::new(),
            is_active: true,
            rewrite_prompt: None,
            classification_threshold: threshold,
            auto_publish_enabled: auto,
        }
    }

    fn result(target: Option<ChannelId>, confidence: u8) -> Classification {
        Classification {
            target_channel_id: target,
            confidence,
            rationale: String::new(),
        }
    }

    #[test]
    fn confident_match_routes_by_auto_publish_flag() {
        let targets = vec![target(1, 80, false), target(2, 60, true)];
        assert_eq!(route_classification(&result(Some(1), 90), &targets), Route::Review(1));
        assert_eq!(route_classification(&result(Some(2), 60), &targets), Route::AutoPublish(2));
    }

    #[test]
    fn weak_or_unknown_matches_go_manual() {
        let mut inactive = target(3, 10, true);
        inactive.is_active = false;
        let targets = vec![target(1, 80, true), inactive];
        assert_eq!(route_classification(&result(Some(1), 79), &targets), Route::Manual);
        assert_eq!(route_classification(&result(None, 100), &targets), Route::Manual);
        assert_eq!(route_classification(&result(Some(9), 100), &targets), Route::Manual);
        assert_eq!(route_classification(&result(Some(3), 100), &targets), Route::Manual);
    }

    #[test]
    fn adapter_failures_are_sorted_by_recoverability() {
        assert!(matches!(failure_kind(&AdapterError::Timeout), Failure::Retry));
        assert!(matches!(failure_kind(&AdapterError::Auth("key".into())), Failure::Abort));
        assert!(matches!(
            failure_kind(&AdapterError::InvalidResponse("prose".into())),
            Failure::Permanent
        ));
    }
}
