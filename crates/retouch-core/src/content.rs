//! Chat message content units as seen by the edit pipeline.

use crate::media;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

const REPLY_ID_KEYS: [&str; 4] = ["message_id", "id", "reply_id", "msg_id"];

/// Where an image attached to a message can be read from. Sources are tried
/// in field order: inline data, then URL, then local path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSegment {
    /// Raw base64 or a complete `data:` URI.
    pub base64: Option<String>,
    pub url: Option<String>,
    pub path: Option<PathBuf>,
}

impl ImageSegment {
    pub fn inline(payload: impl Into<String>) -> Self {
        Self {
            base64: Some(payload.into()),
            ..Self::default()
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn inline_data_uri(&self) -> Option<String> {
        self.base64
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(media::normalize_inline)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplySegment {
    pub id: Option<String>,
    /// Loose adapter-provided fields; some platforms only put the quoted id here.
    pub metadata: HashMap<String, Value>,
    /// Quoted content, when the platform delivers it inline.
    pub chain: Vec<Segment>,
}

impl ReplySegment {
    pub fn to(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_chain(chain: Vec<Segment>) -> Self {
        Self {
            chain,
            ..Self::default()
        }
    }

    /// Identifier of the quoted message, if any field carries one.
    pub fn message_id(&self) -> Option<String> {
        if let Some(id) = self.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return Some(id.to_string());
        }
        REPLY_ID_KEYS.iter().find_map(|key| match self.metadata.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Image(ImageSegment),
    Reply(ReplySegment),
    Other(String),
}

impl Segment {
    pub fn is_image(&self) -> bool {
        matches!(self, Segment::Image(_))
    }

    /// Inline payload as a `data:` URI, when the segment carries one.
    pub fn as_inline_data(&self) -> Option<String> {
        match self {
            Segment::Image(image) => image.inline_data_uri(),
            _ => None,
        }
    }

    pub fn as_reply_chain(&self) -> Option<&[Segment]> {
        match self {
            Segment::Reply(reply) => Some(reply.chain.as_slice()),
            _ => None,
        }
    }
}

/// One inbound chat message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingMessage {
    pub sender_id: String,
    /// Chat group the message was posted in; `None` for direct messages.
    pub group_id: Option<String>,
    pub segments: Vec<Segment>,
}

impl IncomingMessage {
    pub fn new(sender_id: impl Into<String>, group_id: Option<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            group_id,
            segments: Vec::new(),
        }
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn reply_ids(&self) -> Vec<String> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Reply(reply) => reply.message_id(),
                _ => None,
            })
            .collect()
    }
}
