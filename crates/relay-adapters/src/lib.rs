//! Capability contracts for the outside world plus the concrete adapters.
//!
//! Adapters never panic or leak transport types past their boundary: every call
//! returns an [`AdapterError`] or [`DeliveryError`] the workers can branch on.

mod fixture;
mod http;
mod log_delivery;
mod openrouter;
mod telegram;

use std::time::Duration;

use async_trait::async_trait;
use relay_core::{Classification, ClassificationCandidate, MediaItem, SourceMessage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use fixture::FixtureSource;
pub use http::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition};
pub use log_delivery::LogDelivery;
pub use openrouter::{OpenRouterClient, OpenRouterConfig, DEFAULT_OPENROUTER_BASE_URL};
pub use telegram::TelegramDelivery;

pub const CRATE_NAME: &str = "relay-adapters";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl AdapterError {
    /// Worth retrying on the next poll without operator involvement.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout | Self::RateLimited { .. }
        )
    }

    /// The adapter cannot work at all until reconfigured.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Config(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The request timed out; the message may or may not have been delivered.
    #[error("delivery timed out")]
    Timeout,
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("delivery transport error: {0}")]
    Transport(String),
    #[error("media file missing: {0}")]
    MissingMedia(String),
}

/// A resolved reference to a source channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelHandle {
    /// Address as stored on the source channel row.
    pub address: String,
    /// Adapter-specific identifier.
    pub remote_id: String,
}

/// Reads messages from monitored channels.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Establish a session. Auth and config failures are fatal for the worker.
    async fn connect(&self) -> Result<(), AdapterError>;

    async fn resolve(&self, address: &str) -> Result<ChannelHandle, AdapterError>;

    /// Messages with id greater than `since_id`, oldest first, at most `limit`.
    async fn history(
        &self,
        channel: &ChannelHandle,
        limit: usize,
        since_id: i64,
    ) -> Result<Vec<SourceMessage>, AdapterError>;

    /// Push delivery of new messages on `channels`. The stream ends when the
    /// receiver is dropped or the adapter loses its session.
    async fn subscribe(
        &self,
        channels: &[ChannelHandle],
    ) -> Result<mpsc::Receiver<SourceMessage>, AdapterError>;
}

/// Language-model backed rewriting and routing.
#[async_trait]
pub trait TextModel: Send + Sync {
    /// Cheap readiness check run once when a worker starts.
    async fn check(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// `prompt` is the rendered instruction; `text` is the post being rewritten.
    async fn rewrite(&self, text: &str, prompt: &str) -> Result<String, AdapterError>;

    async fn classify(
        &self,
        text: &str,
        candidates: &[ClassificationCandidate],
    ) -> Result<Classification, AdapterError>;

    /// Operator-requested edit. `prompt` is the rendered improve template.
    async fn improve(&self, text: &str, prompt: &str) -> Result<String, AdapterError> {
        self.rewrite(text, prompt).await
    }
}

/// Sends content to a target channel address. Returned ids are the platform's message ids.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Confirms the credentials work. Run once when the publisher starts.
    async fn check(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn caption_limit(&self) -> usize {
        relay_core::CAPTION_LIMIT
    }

    fn message_limit(&self) -> usize {
        relay_core::MESSAGE_LIMIT
    }

    async fn send_text(&self, address: &str, text: &str) -> Result<i64, DeliveryError>;

    async fn send_media(
        &self,
        address: &str,
        item: &MediaItem,
        caption: Option<&str>,
    ) -> Result<i64, DeliveryError>;

    async fn send_group(&self, address: &str, items: &[MediaItem]) -> Result<Vec<i64>, DeliveryError>;
}

/// `@name`, `name` and surrounding whitespace all refer to the same channel.
pub fn bare_address(address: &str) -> &str {
    address.trim().trim_start_matches('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes() {
        assert!(AdapterError::Timeout.is_transient());
        assert!(AdapterError::RateLimited { retry_after: None }.is_transient());
        assert!(!AdapterError::InvalidResponse("x".into()).is_transient());
        assert!(AdapterError::Auth("bad key".into()).is_fatal());
        assert!(!AdapterError::Unsupported("push").is_fatal());
    }

    #[test]
    fn addresses_compare_without_at() {
        assert_eq!(bare_address(" @news "), "news");
        assert_eq!(bare_address("news"), "news");
    }
}
