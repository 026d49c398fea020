//! Media descriptors attached to posts.
//!
//! Stored rows may carry older shapes (`media_group` with a `media_list`, items
//! keyed by `file_path`). Everything is normalized into [`MediaDescriptor`] on
//! read so the workers never branch on storage layout.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Other,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Other => "other",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "photo" | "image" => Self::Photo,
            "video" | "animation" => Self::Video,
            "document" | "file" => Self::Document,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub kind: MediaKind,
    /// Local file path or remote reference understood by the delivery adapter.
    pub path: String,
}

impl MediaItem {
    pub fn new(kind: MediaKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let path = obj
            .get("path")
            .or_else(|| obj.get("file_path"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .map(MediaKind::parse)
            .unwrap_or(MediaKind::Other);
        Some(Self::new(kind, path))
    }

    fn to_value(&self) -> Value {
        json!({ "type": self.kind.as_str(), "path": self.path })
    }
}

/// Either a single attachment or an ordered album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum MediaDescriptor {
    Single(MediaItem),
    Group { items: Vec<MediaItem> },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media descriptor must be a JSON object")]
    NotAnObject,
    #[error("media descriptor has no usable file path")]
    MissingPath,
}

impl MediaDescriptor {
    /// Zero items yield `None`; one item collapses to `Single`.
    pub fn from_items(mut items: Vec<MediaItem>) -> Option<Self> {
        match items.len() {
            0 => None,
            1 => items.pop().map(Self::Single),
            _ => Some(Self::Group { items }),
        }
    }

    pub fn items(&self) -> &[MediaItem] {
        match self {
            Self::Single(item) => std::slice::from_ref(item),
            Self::Group { items } => items,
        }
    }

    pub fn into_items(self) -> Vec<MediaItem> {
        match self {
            Self::Single(item) => vec![item],
            Self::Group { items } => items,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group { .. })
    }

    /// Parse a stored JSON string, accepting legacy layouts.
    pub fn from_json_str(raw: &str) -> Result<Option<Self>, MediaError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| MediaError::NotAnObject)?;
        if value.is_null() {
            return Ok(None);
        }
        Self::try_from(value).map(Some)
    }

    pub fn to_json_string(&self) -> String {
        Value::from(self.clone()).to_string()
    }
}

impl TryFrom<Value> for MediaDescriptor {
    type Error = MediaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let obj: &Map<String, Value> = value.as_object().ok_or(MediaError::NotAnObject)?;
        let list = obj
            .get("items")
            .or_else(|| obj.get("media_list"))
            .and_then(Value::as_array);

        match list {
            Some(list) => {
                let items = list.iter().filter_map(MediaItem::from_value).collect();
                Self::from_items(items).ok_or(MediaError::MissingPath)
            }
            None => MediaItem::from_value(&value)
                .map(Self::Single)
                .ok_or(MediaError::MissingPath),
        }
    }
}

impl From<MediaDescriptor> for Value {
    fn from(media: MediaDescriptor) -> Self {
        match media {
            MediaDescriptor::Single(item) => item.to_value(),
            MediaDescriptor::Group { items } => json!({
                "type": "group",
                "items": items.iter().map(MediaItem::to_value).collect::<Vec<_>>(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_media_group_normalizes_to_group() {
        let raw = r#"{"type":"media_group","media_list":[
            {"type":"photo","file_path":"/media/a.jpg"},
            {"type":"video","file_path":"/media/b.mp4"},
            {"type":"photo"}
        ]}"#;
        let media = MediaDescriptor::from_json_str(raw).unwrap().unwrap();
        assert_eq!(
            media,
            MediaDescriptor::Group {
                items: vec![
                    MediaItem::new(MediaKind::Photo, "/media/a.jpg"),
                    MediaItem::new(MediaKind::Video, "/media/b.mp4"),
                ]
            }
        );
    }

    #[test]
    fn legacy_single_uses_file_path() {
        let media = MediaDescriptor::from_json_str(r#"{"type":"document","file_path":"x.pdf"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            media,
            MediaDescriptor::Single(MediaItem::new(MediaKind::Document, "x.pdf"))
        );
    }

    #[test]
    fn group_with_one_usable_item_collapses() {
        let media = MediaDescriptor::from_json_str(
            r#"{"type":"group","items":[{"type":"photo","path":"a.jpg"},{"type":"photo","path":""}]}"#,
        )
        .unwrap()
        .unwrap();
        assert!(!media.is_group());
        assert_eq!(media.items().len(), 1);
    }

    #[test]
    fn canonical_shape_is_written_back() {
        let media = MediaDescriptor::Group {
            items: vec![
                MediaItem::new(MediaKind::Photo, "a.jpg"),
                MediaItem::new(MediaKind::Photo, "b.jpg"),
            ],
        };
        let value: Value = serde_json::from_str(&media.to_json_string()).unwrap();
        assert_eq!(value["type"], "group");
        assert_eq!(value["items"][1]["path"], "b.jpg");
    }

    #[test]
    fn unusable_descriptors_are_rejected() {
        assert_eq!(
            MediaDescriptor::from_json_str(r#"{"type":"photo"}"#),
            Err(MediaError::MissingPath)
        );
        assert_eq!(
            MediaDescriptor::from_json_str("[1,2]"),
            Err(MediaError::NotAnObject)
        );
        assert_eq!(MediaDescriptor::from_json_str("null"), Ok(None));
    }
}
