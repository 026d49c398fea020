use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use relay_core::MediaItem;
use tracing::info;

use crate::{Delivery, DeliveryError};

/// Dry-run delivery: logs what would be sent and hands out sequential ids.
#[derive(Debug)]
pub struct LogDelivery {
    next_id: AtomicI64,
}

impl Default for LogDelivery {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }
}

impl LogDelivery {
    fn next(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl Delivery for LogDelivery {
    async fn send_text(&self, address: &str, text: &str) -> Result<i64, DeliveryError> {
        let id = self.next();
        info!(address, message_id = id, chars = text.chars().count(), "dry-run text delivery");
        Ok(id)
    }

    async fn send_media(
        &self,
        address: &str,
        item: &MediaItem,
        caption: Option<&str>,
    ) -> Result<i64, DeliveryError> {
        let id = self.next();
        info!(
            address,
            message_id = id,
            kind = item.kind.as_str(),
            path = %item.path,
            caption_chars = caption.map(|c| c.chars().count()).unwrap_or(0),
            "dry-run media delivery"
        );
        Ok(id)
    }

    async fn send_group(&self, address: &str, items: &[MediaItem]) -> Result<Vec<i64>, DeliveryError> {
        let ids = items.iter().map(|_| self.next()).collect::<Vec<_>>();
        info!(address, count = items.len(), "dry-run media group delivery");
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::MediaKind;

    #[tokio::test]
    async fn ids_are_sequential_across_calls() {
        let delivery = LogDelivery::default();
        assert_eq!(delivery.send_text("@out", "hi").await.unwrap(), 1);
        let group = delivery
            .send_group(
                "@out",
                &[
                    MediaItem::new(MediaKind::Photo, "a.jpg"),
                    MediaItem::new(MediaKind::Photo, "b.jpg"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(group, vec![2, 3]);
    }
}
