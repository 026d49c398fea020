//! Core domain model for the channel relay: posts, channels, worker control rows.

mod media;
mod prompt;
mod status;
mod text;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use media::{MediaDescriptor, MediaError, MediaItem, MediaKind};
pub use prompt::{
    render_improve_prompt, render_rewrite_prompt, template_digest, TemplateError,
    DEFAULT_IMPROVE_PROMPT, DEFAULT_REWRITE_PROMPT, ORIGINAL_TEXT_PLACEHOLDER,
    USER_PROMPT_PLACEHOLDER,
};
pub use status::{PostStatus, Transition, TransitionError, UnknownStatus};
pub use text::{normalize_delivery_text, truncate_chars, CAPTION_LIMIT, MESSAGE_LIMIT};

pub const CRATE_NAME: &str = "relay-core";

pub type PostId = i64;
pub type ChannelId = i64;

/// Settings keys read by the workers at runtime.
pub mod settings_keys {
    pub const REWRITE_PROMPT: &str = "rewrite_prompt";
    pub const REWRITE_ENABLED: &str = "rewrite_enabled";
    pub const CLASSIFICATION_ENABLED: &str = "classification_enabled";
    /// Template for operator-requested improvements; takes `{original_text}` and `{user_prompt}`.
    pub const IMPROVE_PROMPT: &str = "improve_prompt";
}

/// Approver identity recorded when the classifier skips the human step.
pub const AUTO_APPROVER: &str = "auto-classifier";

/// Structured result returned by the classification adapter and persisted on the post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub target_channel_id: Option<ChannelId>,
    pub confidence: u8,
    #[serde(default)]
    pub rationale: String,
}

impl Classification {
    pub fn no_match(rationale: impl Into<String>) -> Self {
        Self {
            target_channel_id: None,
            confidence: 0,
            rationale: rationale.into(),
        }
    }
}

/// The central entity moving through ingestion, processing and publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub source_channel_id: Option<ChannelId>,
    pub origin_message_id: Option<i64>,
    pub original_text: Option<String>,
    pub original_media: Option<MediaDescriptor>,
    pub rewritten_text: Option<String>,
    pub target_channel_id: Option<ChannelId>,
    pub classification_confidence: Option<u8>,
    pub classification: Option<Classification>,
    /// Digest of the target rewrite template last applied to this post.
    pub target_rewrite_digest: Option<String>,
    pub is_manual: bool,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
    pub text_processed_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub approved_by: Option<String>,
    pub published_message_id: Option<i64>,
}

impl Post {
    pub fn has_text(&self) -> bool {
        self.original_text
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }

    pub fn has_media(&self) -> bool {
        self.original_media.is_some()
    }

    /// Rewritten text when present, else the original text.
    pub fn text_for_delivery(&self) -> Option<&str> {
        self.rewritten_text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.original_text.as_deref().filter(|t| !t.trim().is_empty()))
    }

    /// True when `target` carries a template this post has not yet been rewritten with.
    pub fn needs_target_rewrite(&self, target: &TargetChannel) -> bool {
        if !self.has_text() {
            return false;
        }
        match target.rewrite_template() {
            Some(template) => {
                self.target_rewrite_digest.as_deref() != Some(template_digest(template).as_str())
            }
            None => false,
        }
    }

    /// A scheduled post becomes eligible once its due time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            PostStatus::Scheduled => self.scheduled_at.is_some_and(|at| at <= now),
            PostStatus::Publishing => true,
            _ => false,
        }
    }
}

/// Handoff contract from ingestion (scraper or operator) into the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostDraft {
    pub source_channel_id: Option<ChannelId>,
    pub origin_message_id: Option<i64>,
    pub original_text: Option<String>,
    pub original_media: Option<MediaDescriptor>,
    pub target_channel_id: Option<ChannelId>,
    pub is_manual: bool,
}

impl PostDraft {
    pub fn manual(
        text: Option<String>,
        media: Option<MediaDescriptor>,
        target_channel_id: Option<ChannelId>,
    ) -> Self {
        Self {
            source_channel_id: None,
            origin_message_id: None,
            original_text: text,
            original_media: media,
            target_channel_id,
            is_manual: true,
        }
    }

    /// Posts with neither text nor media are never created.
    pub fn has_content(&self) -> bool {
        self.original_text
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
            || self.original_media.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: Option<i64>,
    pub username: Option<String>,
    pub display_name: Option<String>,
}

/// One message yielded by a channel source, already normalized at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub id: i64,
    /// Address of the channel the message was read from.
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: Option<MediaDescriptor>,
    /// Album identifier shared by members of one grouped post.
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub sender: Option<SenderInfo>,
    #[serde(default)]
    pub views: i64,
    #[serde(default)]
    pub forwards: i64,
}

impl SourceMessage {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.media.is_none()
    }

    pub fn into_draft(self, source_channel_id: ChannelId) -> PostDraft {
        let text = if self.text.trim().is_empty() {
            None
        } else {
            Some(self.text)
        };
        PostDraft {
            source_channel_id: Some(source_channel_id),
            origin_message_id: Some(self.id),
            original_text: text,
            original_media: self.media,
            target_channel_id: None,
            is_manual: false,
        }
    }
}

/// Coalesce the members of one album into a single message.
///
/// The smallest member id becomes the origin id so push and pull deliveries of
/// the same album deduplicate against each other. Text comes from the first
/// member (by id) carrying non-empty text.
pub fn coalesce_album(mut members: Vec<SourceMessage>) -> Option<SourceMessage> {
    members.sort_by_key(|m| m.id);
    if members.len() <= 1 {
        return members.pop();
    }

    let text = members
        .iter()
        .map(|m| m.text.clone())
        .find(|t| !t.trim().is_empty())
        .unwrap_or_default();
    let items = members
        .iter()
        .filter_map(|m| m.media.clone())
        .flat_map(MediaDescriptor::into_items)
        .collect::<Vec<_>>();

    let mut base = members.swap_remove(0);
    base.text = text;
    base.media = MediaDescriptor::from_items(items);
    Some(base)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceChannel {
    pub id: ChannelId,
    pub address: String,
    pub title: String,
    pub is_active: bool,
    pub check_interval_secs: i64,
    pub last_checked: Option<DateTime<Utc>>,
    /// High-water mark of message ids seen by completed pulls. Only increases.
    pub last_message_id: i64,
    pub created_at: DateTime<Utc>,
}

impl SourceChannel {
    /// Whether the polling interval has elapsed since the last check.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_checked {
            None => true,
            Some(at) => now - at >= Duration::seconds(self.check_interval_secs.max(0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSourceChannel {
    pub address: String,
    pub title: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetChannel {
    pub id: ChannelId,
    pub address: String,
    pub title: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub is_active: bool,
    /// Instruction template; may reference `{original_text}`.
    pub rewrite_prompt: Option<String>,
    /// Confidence floor (0-100) for automatic routing.
    pub classification_threshold: u8,
    pub auto_publish_enabled: bool,
}

impl TargetChannel {
    pub fn rewrite_template(&self) -> Option<&str> {
        self.rewrite_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
    }

    pub fn accepts(&self, confidence: u8) -> bool {
        confidence >= self.classification_threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTargetChannel {
    pub address: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub rewrite_prompt: Option<String>,
    #[serde(default = "default_threshold")]
    pub classification_threshold: u8,
    #[serde(default)]
    pub auto_publish_enabled: bool,
}

/// Candidate shown to the classifier for one target channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationCandidate {
    pub id: ChannelId,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl From<&TargetChannel> for ClassificationCandidate {
    fn from(target: &TargetChannel) -> Self {
        Self {
            id: target.id,
            name: target.title.clone(),
            description: target.description.clone().unwrap_or_default(),
            tags: target.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Scraper,
    Classifier,
    Publisher,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 3] = [Self::Scraper, Self::Classifier, Self::Publisher];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scraper => "scraper",
            Self::Classifier => "classifier",
            Self::Publisher => "publisher",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scraper" => Ok(Self::Scraper),
            "classifier" => Ok(Self::Classifier),
            "publisher" => Ok(Self::Publisher),
            other => Err(format!("unknown worker kind: {other}")),
        }
    }
}

/// Persisted desired/actual run state of one worker kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerControl {
    pub kind: WorkerKind,
    pub should_run: bool,
    pub is_running: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A language model the operator can select. At most one active model is the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiModel {
    pub id: i64,
    pub name: String,
    /// Provider-side identifier, e.g. `openai/gpt-4o-mini`.
    pub model_id: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAiModel {
    pub name: String,
    pub model_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> i64 {
    5
}

fn default_threshold() -> u8 {
    80
}
