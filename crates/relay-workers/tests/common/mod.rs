#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use relay_adapters::{
    bare_address, AdapterError, ChannelHandle, ChannelSource, Delivery, DeliveryError, TextModel,
};
use relay_core::{
    Classification, ClassificationCandidate, MediaDescriptor, MediaItem, NewSourceChannel,
    NewTargetChannel, SourceChannel, SourceMessage, TargetChannel,
};
use relay_storage::Store;
use tokio::sync::mpsc;

pub async fn store() -> Store {
    Store::open_in_memory().await.unwrap()
}

pub async fn source_channel(store: &Store, address: &str) -> SourceChannel {
    store
        .create_source_channel(&NewSourceChannel {
            address: address.into(),
            title: address.trim_start_matches('@').into(),
            is_active: true,
            check_interval_secs: 5,
        })
        .await
        .unwrap()
}

pub async fn target_channel(
    store: &Store,
    address: &str,
    threshold: u8,
    auto_publish: bool,
    rewrite_prompt: Option<&str>,
) -> TargetChannel {
    store
        .create_target_channel(&NewTargetChannel {
            address: address.into(),
            title: address.trim_start_matches('@').into(),
            description: Some(format!("posts for {address}")),
            tags: vec!["news".into()],
            is_active: true,
            rewrite_prompt: rewrite_prompt.map(str::to_string),
            classification_threshold: threshold,
            auto_publish_enabled: auto_publish,
        })
        .await
        .unwrap()
}

pub fn message(channel: &str, id: i64, text: &str, media: Option<MediaDescriptor>) -> SourceMessage {
    SourceMessage {
        id,
        channel: channel.into(),
        timestamp: Utc::now(),
        text: text.into(),
        media,
        group_id: None,
        sender: None,
        views: 0,
        forwards: 0,
    }
}

pub fn photo(path: &str) -> MediaDescriptor {
    MediaDescriptor::Single(MediaItem::new(relay_core::MediaKind::Photo, path))
}

/// Channel source backed by in-memory message lists and an optional push stream.
#[derive(Default)]
pub struct ScriptedSource {
    history: Mutex<HashMap<String, Vec<SourceMessage>>>,
    push: Mutex<Option<mpsc::Receiver<SourceMessage>>>,
    pub subscriptions: Mutex<Vec<Vec<String>>>,
}

impl ScriptedSource {
    pub fn with_history(channel: &str, messages: Vec<SourceMessage>) -> Self {
        let source = Self::default();
        source
            .history
            .lock()
            .unwrap()
            .insert(bare_address(channel).to_string(), messages);
        source
    }

    /// Enable push delivery; the returned sender feeds the next subscription.
    pub fn enable_push(&self) -> mpsc::Sender<SourceMessage> {
        let (tx, rx) = mpsc::channel(32);
        *self.push.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl ChannelSource for ScriptedSource {
    async fn connect(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn resolve(&self, address: &str) -> Result<ChannelHandle, AdapterError> {
        Ok(ChannelHandle {
            address: address.to_string(),
            remote_id: bare_address(address).to_string(),
        })
    }

    async fn history(
        &self,
        channel: &ChannelHandle,
        limit: usize,
        since_id: i64,
    ) -> Result<Vec<SourceMessage>, AdapterError> {
        let history = self.history.lock().unwrap();
        let Some(messages) = history.get(&channel.remote_id) else {
            return Err(AdapterError::UnknownChannel(channel.address.clone()));
        };
        let mut newer = messages
            .iter()
            .filter(|m| m.id > since_id)
            .cloned()
            .collect::<Vec<_>>();
        newer.sort_by_key(|m| m.id);
        newer.truncate(limit);
        Ok(newer)
    }

    async fn subscribe(
        &self,
        channels: &[ChannelHandle],
    ) -> Result<mpsc::Receiver<SourceMessage>, AdapterError> {
        self.subscriptions
            .lock()
            .unwrap()
            .push(channels.iter().map(|c| c.remote_id.clone()).collect());
        self.push
            .lock()
            .unwrap()
            .take()
            .ok_or(AdapterError::Unsupported("push delivery"))
    }
}

/// Text model returning queued answers and counting calls.
#[derive(Default)]
pub struct ScriptedModel {
    rewrites: Mutex<VecDeque<Result<String, AdapterError>>>,
    classifications: Mutex<VecDeque<Result<Classification, AdapterError>>>,
    pub rewrite_prompts: Mutex<Vec<String>>,
    pub improve_prompts: Mutex<Vec<String>>,
    pub classify_calls: Mutex<usize>,
}

impl ScriptedModel {
    pub fn push_rewrite(&self, result: Result<String, AdapterError>) {
        self.rewrites.lock().unwrap().push_back(result);
    }

    pub fn push_classification(&self, result: Result<Classification, AdapterError>) {
        self.classifications.lock().unwrap().push_back(result);
    }

    pub fn rewrite_calls(&self) -> usize {
        self.rewrite_prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl TextModel for ScriptedModel {
    async fn rewrite(&self, text: &str, prompt: &str) -> Result<String, AdapterError> {
        self.rewrite_prompts.lock().unwrap().push(prompt.to_string());
        self.rewrites
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("rewritten: {text}")))
    }

    async fn classify(
        &self,
        _text: &str,
        _candidates: &[ClassificationCandidate],
    ) -> Result<Classification, AdapterError> {
        *self.classify_calls.lock().unwrap() += 1;
        self.classifications
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Classification::no_match("nothing scripted")))
    }

    async fn improve(&self, text: &str, prompt: &str) -> Result<String, AdapterError> {
        self.improve_prompts.lock().unwrap().push(prompt.to_string());
        Ok(format!("improved: {text}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text { address: String, text: String },
    Media { address: String, path: String, caption: Option<String> },
    Group { address: String, count: usize },
}

/// Delivery that records every call. `fail_with` makes every send fail and
/// `reject_check` makes the startup check fail.
#[derive(Default)]
pub struct RecordingDelivery {
    pub sent: Mutex<Vec<Sent>>,
    pub fail_with: Mutex<Option<DeliveryError>>,
    pub reject_check: Mutex<Option<AdapterError>>,
    pub checks: Mutex<usize>,
    next_id: Mutex<i64>,
}

impl RecordingDelivery {
    pub fn failing(err: DeliveryError) -> Self {
        let delivery = Self::default();
        *delivery.fail_with.lock().unwrap() = Some(err);
        delivery
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, call: Sent) -> Result<i64, DeliveryError> {
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(call);
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        Ok(1000 + *next)
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn check(&self) -> Result<(), AdapterError> {
        *self.checks.lock().unwrap() += 1;
        match self.reject_check.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn send_text(&self, address: &str, text: &str) -> Result<i64, DeliveryError> {
        self.record(Sent::Text {
            address: address.into(),
            text: text.into(),
        })
    }

    async fn send_media(
        &self,
        address: &str,
        item: &MediaItem,
        caption: Option<&str>,
    ) -> Result<i64, DeliveryError> {
        self.record(Sent::Media {
            address: address.into(),
            path: item.path.clone(),
            caption: caption.map(str::to_string),
        })
    }

    async fn send_group(&self, address: &str, items: &[MediaItem]) -> Result<Vec<i64>, DeliveryError> {
        let first = self.record(Sent::Group {
            address: address.into(),
            count: items.len(),
        })?;
        Ok((0..items.len() as i64).map(|i| first + i).collect())
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
