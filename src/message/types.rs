use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub type MessageId = String;
pub type LeadId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

/// Which discovery mechanism delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Poll,
    Push,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ChannelSet: u8 {
        const SMS = 0b01;
        const EMAIL = 0b10;
    }
}

impl From<Channel> for ChannelSet {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Sms => ChannelSet::SMS,
            Channel::Email => ChannelSet::EMAIL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// A message row as delivered by the store or a push event.
///
/// `id`, `lead_id` and `timestamp` are optional on the wire so that
/// malformed rows survive decoding and can be dropped at ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub lead_id: Option<LeadId>,
    pub channel: Channel,
    pub direction: Direction,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default, alias = "isRead")]
    pub server_read_flag: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip)]
    pub source: Source,
}

/// Decode store rows one at a time. A row that does not fit `RawMessage`
/// (unknown channel, missing direction) is dropped without losing the rest.
/// Returns the decoded rows and the number dropped.
pub fn decode_rows(rows: Vec<serde_json::Value>) -> (Vec<RawMessage>, usize) {
    let mut dropped = 0;
    let messages = rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value::<RawMessage>(row) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!("Dropping undecodable message row: {}", e);
                dropped += 1;
                None
            }
        })
        .collect();
    (messages, dropped)
}

/// A message that is unique within the working set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalMessage {
    pub id: MessageId,
    pub lead_id: LeadId,
    pub channel: Channel,
    pub direction: Direction,
    pub subject: Option<String>,
    pub body: String,
    pub timestamp: i64,
    pub server_read: bool,
    pub attachments: Vec<Attachment>,
    pub source: Source,
    /// True when `id` came from the store rather than being synthesized.
    pub authoritative: bool,
}

impl CanonicalMessage {
    pub fn is_received(&self) -> bool {
        self.direction == Direction::Received
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Text shown in thread previews: the body, or the subject for empty emails.
    pub fn preview_text(&self) -> &str {
        if self.body.trim().is_empty() {
            self.subject.as_deref().unwrap_or_default()
        } else {
            &self.body
        }
    }
}

/// Prefix marking ids synthesized for push messages without a store id.
pub const PROVISIONAL_ID_PREFIX: &str = "push:";

pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_ID_PREFIX)
}
