//! Telegram Bot API delivery.

use std::future::Future;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{MediaItem, MediaKind};
use teloxide::prelude::*;
use teloxide::types::{
    InputFile, InputMedia, InputMediaDocument, InputMediaPhoto, InputMediaVideo, Recipient,
};
use teloxide::RequestError;
use tracing::{debug, warn};

use crate::{bare_address, AdapterError, Delivery, DeliveryError};

/// Telegram accepts between 2 and 10 items in one media group.
const MEDIA_GROUP_LIMIT: usize = 10;

pub struct TelegramDelivery {
    bot: Bot,
}

impl std::fmt::Debug for TelegramDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramDelivery").finish_non_exhaustive()
    }
}

impl TelegramDelivery {
    pub fn new(token: &str, timeout: Duration) -> Result<Self, AdapterError> {
        if token.trim().is_empty() {
            return Err(AdapterError::Config("Telegram bot token is empty".into()));
        }
        let client = teloxide::net::default_reqwest_settings()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Config(format!("building telegram client: {e}")))?;
        Ok(Self {
            bot: Bot::with_client(token.trim(), client),
        })
    }
}

/// Numeric ids address chats directly; anything else is a public `@username`.
pub(crate) fn recipient(address: &str) -> Recipient {
    let trimmed = address.trim();
    match trimmed.parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => Recipient::ChannelUsername(format!("@{}", bare_address(trimmed))),
    }
}

fn is_remote(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

async fn input_file(item: &MediaItem) -> Result<InputFile, DeliveryError> {
    if is_remote(&item.path) {
        let url = reqwest::Url::parse(&item.path)
            .map_err(|e| DeliveryError::MissingMedia(format!("{}: {e}", item.path)))?;
        return Ok(InputFile::url(url));
    }
    match tokio::fs::try_exists(&item.path).await {
        Ok(true) => Ok(InputFile::file(Path::new(&item.path))),
        _ => Err(DeliveryError::MissingMedia(item.path.clone())),
    }
}

/// Split `len` items into the fewest groups of at most [`MEDIA_GROUP_LIMIT`],
/// balanced so no group is left with a single item.
pub(crate) fn media_group_chunks(len: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let groups = len.div_ceil(MEDIA_GROUP_LIMIT);
    let base = len / groups;
    let extra = len % groups;
    let mut start = 0;
    (0..groups)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Send each group in turn. Once one group is out, a failure ends the run and
/// the ids delivered so far are returned.
async fn send_in_groups<T, F, Fut>(groups: Vec<T>, mut send: F) -> Result<Vec<i64>, DeliveryError>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<Vec<i64>, DeliveryError>>,
{
    let total = groups.len();
    let mut ids = Vec::new();
    for (index, group) in groups.into_iter().enumerate() {
        match send(group).await {
            Ok(sent) => ids.extend(sent),
            Err(err) if ids.is_empty() => return Err(err),
            Err(err) => {
                warn!(group = index + 1, total, error = %err, "media group partially delivered");
                break;
            }
        }
    }
    Ok(ids)
}

fn input_media(item: &MediaItem, file: InputFile) -> InputMedia {
    match item.kind {
        MediaKind::Photo => InputMedia::Photo(InputMediaPhoto::new(file)),
        MediaKind::Video => InputMedia::Video(InputMediaVideo::new(file)),
        MediaKind::Document | MediaKind::Other => InputMedia::Document(InputMediaDocument::new(file)),
    }
}

fn check_error(err: RequestError) -> AdapterError {
    match err {
        RequestError::Api(api) => AdapterError::Auth(api.to_string()),
        RequestError::Network(ref e) if e.is_timeout() => AdapterError::Timeout,
        other => AdapterError::Transport(other.to_string()),
    }
}

fn delivery_error(err: RequestError) -> DeliveryError {
    match err {
        RequestError::Network(ref e) if e.is_timeout() => DeliveryError::Timeout,
        RequestError::Api(ref api) => DeliveryError::Rejected(api.to_string()),
        other => DeliveryError::Transport(other.to_string()),
    }
}

#[async_trait]
impl Delivery for TelegramDelivery {
    async fn check(&self) -> Result<(), AdapterError> {
        let me = self.bot.get_me().await.map_err(check_error)?;
        debug!(bot = %me.username(), "telegram bot authenticated");
        Ok(())
    }

    async fn send_text(&self, address: &str, text: &str) -> Result<i64, DeliveryError> {
        let sent = self
            .bot
            .send_message(recipient(address), text)
            .await
            .map_err(delivery_error)?;
        debug!(address, message_id = sent.id.0, "text delivered");
        Ok(i64::from(sent.id.0))
    }

    async fn send_media(
        &self,
        address: &str,
        item: &MediaItem,
        caption: Option<&str>,
    ) -> Result<i64, DeliveryError> {
        let file = input_file(item).await?;
        let to = recipient(address);
        let caption = caption.filter(|c| !c.trim().is_empty()).map(str::to_string);

        let sent = match item.kind {
            MediaKind::Photo => {
                let mut req = self.bot.send_photo(to, file);
                if let Some(caption) = caption {
                    req = req.caption(caption);
                }
                req.await
            }
            MediaKind::Video => {
                let mut req = self.bot.send_video(to, file);
                if let Some(caption) = caption {
                    req = req.caption(caption);
                }
                req.await
            }
            MediaKind::Document | MediaKind::Other => {
                let mut req = self.bot.send_document(to, file);
                if let Some(caption) = caption {
                    req = req.caption(caption);
                }
                req.await
            }
        }
        .map_err(delivery_error)?;

        debug!(address, message_id = sent.id.0, kind = item.kind.as_str(), "media delivered");
        Ok(i64::from(sent.id.0))
    }

    /// Albums over the group limit go out as several groups. A failure after
    /// the first group still returns the delivered ids so the post is not resent.
    async fn send_group(&self, address: &str, items: &[MediaItem]) -> Result<Vec<i64>, DeliveryError> {
        if let [item] = items {
            return self.send_media(address, item, None).await.map(|id| vec![id]);
        }

        let mut groups = Vec::new();
        for range in media_group_chunks(items.len()) {
            let mut media = Vec::with_capacity(range.len());
            for item in &items[range] {
                media.push(input_media(item, input_file(item).await?));
            }
            groups.push(media);
        }

        let bot = &self.bot;
        let ids = send_in_groups(groups, move |media| {
            let to = recipient(address);
            async move {
                bot.send_media_group(to, media)
                    .await
                    .map(|sent| sent.iter().map(|m| i64::from(m.id.0)).collect())
                    .map_err(delivery_error)
            }
        })
        .await?;
        debug!(address, count = ids.len(), "media group delivered");
        Ok(ids)
    }
}
