use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{MediaDescriptor, SenderInfo, SourceMessage};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{bare_address, AdapterError, ChannelHandle, ChannelSource};

/// Reads channel history from `<root>/<address>.json`, one JSON array per channel.
///
/// Useful for dry runs and demos; push subscription is not available.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

#[derive(Debug, Deserialize)]
struct FixtureMessage {
    id: i64,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    media: Option<MediaDescriptor>,
    #[serde(default)]
    group_id: Option<i64>,
    #[serde(default)]
    sender: Option<SenderInfo>,
    #[serde(default)]
    views: i64,
    #[serde(default)]
    forwards: i64,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_path(&self, address: &str) -> PathBuf {
        self.root.join(format!("{}.json", bare_address(address)))
    }

    async fn load(&self, address: &str) -> Result<Vec<FixtureMessage>, AdapterError> {
        let path = self.channel_path(address);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AdapterError::Transport(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| AdapterError::InvalidResponse(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl ChannelSource for FixtureSource {
    async fn connect(&self) -> Result<(), AdapterError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(AdapterError::Config(format!(
                "fixture directory {} does not exist",
                self.root.display()
            ))),
        }
    }

    async fn resolve(&self, address: &str) -> Result<ChannelHandle, AdapterError> {
        let path = self.channel_path(address);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(ChannelHandle {
                address: address.to_string(),
                remote_id: bare_address(address).to_string(),
            }),
            _ => Err(AdapterError::UnknownChannel(address.to_string())),
        }
    }

    async fn history(
        &self,
        channel: &ChannelHandle,
        limit: usize,
        since_id: i64,
    ) -> Result<Vec<SourceMessage>, AdapterError> {
        let mut messages = self
            .load(&channel.address)
            .await?
            .into_iter()
            .filter(|m| m.id > since_id)
            .map(|m| SourceMessage {
                id: m.id,
                channel: channel.address.clone(),
                timestamp: m.timestamp,
                text: m.text,
                media: m.media,
                group_id: m.group_id,
                sender: m.sender,
                views: m.views,
                forwards: m.forwards,
            })
            .collect::<Vec<_>>();
        messages.sort_by_key(|m| m.id);
        messages.truncate(limit);
        debug!(channel = %channel.address, since_id, count = messages.len(), "fixture history read");
        Ok(messages)
    }

    async fn subscribe(
        &self,
        _channels: &[ChannelHandle],
    ) -> Result<mpsc::Receiver<SourceMessage>, AdapterError> {
        Err(AdapterError::Unsupported("fixture sources have no push delivery"))
    }
}
