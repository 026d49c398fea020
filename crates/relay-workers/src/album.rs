use std::collections::HashMap;
use std::time::Duration;

use relay_adapters::bare_address;
use relay_core::{coalesce_album, SourceMessage};
use tokio::time::Instant;

struct PendingAlbum {
    members: Vec<SourceMessage>,
    deadline: Instant,
}

/// Holds album members arriving on the push path until the album goes quiet.
///
/// Each new member restarts that album's timer; once `delay` passes without a
/// new member the album is coalesced into a single message.
pub struct AlbumBuffer {
    delay: Duration,
    pending: HashMap<(String, i64), PendingAlbum>,
}

impl AlbumBuffer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
        }
    }

    /// Buffer an album member. Messages outside any album are handed straight back.
    pub fn push(&mut self, message: SourceMessage, now: Instant) -> Option<SourceMessage> {
        let Some(group_id) = message.group_id else {
            return Some(message);
        };
        let key = (bare_address(&message.channel).to_string(), group_id);
        let entry = self.pending.entry(key).or_insert_with(|| PendingAlbum {
            members: Vec::new(),
            deadline: now,
        });
        entry.members.push(message);
        entry.deadline = now + self.delay;
        None
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Coalesce every album whose quiet period has elapsed.
    pub fn drain_due(&mut self, now: Instant) -> Vec<SourceMessage> {
        let due = self
            .pending
            .iter()
            .filter(|(_, album)| album.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        due.into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .filter_map(|album| coalesce_album(album.members))
            .collect()
    }

    /// Coalesce everything still buffered, regardless of timers.
    pub fn drain_all(&mut self) -> Vec<SourceMessage> {
        self.pending
            .drain()
            .filter_map(|(_, album)| coalesce_album(album.members))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_core::{MediaDescriptor, MediaItem, MediaKind};

    fn member(id: i64, group: Option<i64>, text: &str) -> SourceMessage {
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
    fn ungrouped_messages_pass_through() {
        let mut buffer = AlbumBuffer::new(Duration::from_secs(2));
        let out = buffer.push(member(1, None, "solo"), Instant::now());
        assert_eq!(out.map(|m| m.id), Some(1));
        assert!(!buffer.has_pending());
    }

    #[test]
    fn album_flushes_after_quiet_period_restarted_by_each_member() {
        let start = Instant::now();
        let mut buffer = AlbumBuffer::new(Duration::from_secs(2));

        assert!(buffer.push(member(11, Some(9), ""), start).is_none());
        assert!(buffer
            .push(member(12, Some(9), "caption"), start + Duration::from_millis(1500))
            .is_none());

        assert!(buffer.drain_due(start + Duration::from_millis(2500)).is_empty());
        let flushed = buffer.drain_due(start + Duration::from_millis(3500));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].id, 11);
        assert_eq!(flushed[0].text, "caption");
        assert_eq!(flushed[0].media.as_ref().map(|m| m.items().len()), Some(2));
        assert!(!buffer.has_pending());
    }

    #[test]
    fn albums_are_keyed_per_channel() {
        let now = Instant::now();
        let mut buffer = AlbumBuffer::new(Duration::from_secs(2));
        buffer.push(member(1, Some(5), ""), now);
        let mut other = member(2, Some(5), "");
        other.channel = "other".into();
        buffer.push(other, now);

        assert_eq!(buffer.next_deadline(), Some(now + Duration::from_secs(2)));
        assert_eq!(buffer.drain_all().len(), 2);
    }
}
