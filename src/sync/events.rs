//! Real-time push events.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::types::{Attachment, Channel, Direction, LeadId, MessageId, RawMessage, Source};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("empty event")]
    Empty,
}

/// Events pushed by the real-time channel. No ordering is guaranteed
/// relative to polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InboundEvent {
    MessageReceived {
        #[serde(default)]
        message_id: Option<MessageId>,
        #[serde(default)]
        lead_id: Option<LeadId>,
        channel: Channel,
        #[serde(default = "default_direction")]
        direction: Direction,
        #[serde(default)]
        subject: Option<String>,
        #[serde(default)]
        body: String,
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    MessageRead {
        message_id: MessageId,
    },
    MessagesDeleted {
        ids: Vec<MessageId>,
    },
}

fn default_direction() -> Direction {
    Direction::Received
}

impl InboundEvent {
    /// Decode one JSON event.
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EventError::Empty);
        }
        Ok(serde_json::from_str(text)?)
    }

    /// A pushed message becomes a one-element raw batch. The store has not
    /// acknowledged any read yet, so the server flag is always false.
    /// Other event kinds carry no message.
    pub fn into_raw(self) -> Option<RawMessage> {
        match self {
            InboundEvent::MessageReceived {
                message_id,
                lead_id,
                channel,
                direction,
                subject,
                body,
                timestamp,
                attachments,
            } => Some(RawMessage {
                id: message_id,
                lead_id,
                channel,
                direction,
                subject,
                body,
                timestamp,
                server_read_flag: false,
                attachments,
                source: Source::Push,
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::MessageReceived { .. } => "message_received",
            InboundEvent::MessageRead { .. } => "message_read",
            InboundEvent::MessagesDeleted { .. } => "messages_deleted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_received() {
        let event = InboundEvent::parse(
            r#"{"type":"message_received","leadId":"L42","channel":"sms","body":"See you at 3pm","timestamp":1000}"#,
        )
        .unwrap();

        match event {
            InboundEvent::MessageReceived {
                message_id,
                lead_id,
                channel,
                direction,
                body,
                timestamp,
                ..
            } => {
                assert!(message_id.is_none());
                assert_eq!(lead_id.as_deref(), Some("L42"));
                assert_eq!(channel, Channel::Sms);
                assert_eq!(direction, Direction::Received);
                assert_eq!(body, "See you at 3pm");
                assert_eq!(timestamp, Some(1000));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_read_and_delete() {
        assert_eq!(
            InboundEvent::parse(r#"{"type":"message_read","messageId":"m1"}"#).unwrap(),
            InboundEvent::MessageRead {
                message_id: "m1".to_string()
            }
        );
        assert_eq!(
            InboundEvent::parse(r#"{"type":"messages_deleted","ids":["a","b"]}"#).unwrap(),
            InboundEvent::MessagesDeleted {
                ids: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(InboundEvent::parse("   "), Err(EventError::Empty)));
        assert!(matches!(
            InboundEvent::parse(r#"{"type":"typing"}"#),
            Err(EventError::Decode(_))
        ));
    }

    #[test]
    fn test_into_raw_is_unread_push() {
        let event = InboundEvent::parse(
            r#"{"type":"message_received","messageId":"m1","leadId":"L1","channel":"email","direction":"sent","subject":"Quote","body":"Attached","timestamp":50}"#,
        )
        .unwrap();

        let raw = event.into_raw().unwrap();
        assert_eq!(raw.id.as_deref(), Some("m1"));
        assert!(!raw.server_read_flag);
        assert_eq!(raw.source, Source::Push);
        assert_eq!(raw.direction, Direction::Sent);
        assert_eq!(raw.subject.as_deref(), Some("Quote"));

        let read = InboundEvent::MessageRead {
            message_id: "m1".to_string(),
        };
        assert!(read.into_raw().is_none());
    }
}
