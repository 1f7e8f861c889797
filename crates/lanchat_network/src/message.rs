//! Chat messages delivered to and from the consuming layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::MessageId;

/// The kind of a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A conversation message typed by a user.
    Chat,
    /// A notice generated locally (peer joined, renamed, ...).
    System,
    /// A locally generated error notice.
    Error,
}

/// A delivered unit of conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message identifier, used for de-duplication.
    pub id: MessageId,
    /// Username of the sender at the time the message was sent.
    pub sender_name: String,
    /// Message text.
    pub content: String,
    /// When the message was created (send time or parse time).
    pub timestamp: DateTime<Utc>,
    /// Whether the local user sent this message.
    pub is_mine: bool,
    /// Chat, system or error.
    pub kind: MessageKind,
}

impl ChatMessage {
    /// A message the local user is about to send.
    pub fn outgoing(sender_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            sender_name: sender_name.into(),
            content: content.into(),
            timestamp: Utc::now(),
            is_mine: true,
            kind: MessageKind::Chat,
        }
    }

    /// A message parsed off the wire.
    pub fn incoming(id: MessageId, sender_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id,
            sender_name: sender_name.into(),
            content: content.into(),
            timestamp: Utc::now(),
            is_mine: false,
            kind: MessageKind::Chat,
        }
    }

    /// A locally generated notice.
    pub fn system(content: impl Into<String>) -> Self {
        Self::local_notice(MessageKind::System, content)
    }

    /// A locally generated error notice.
    pub fn error(content: impl Into<String>) -> Self {
        Self::local_notice(MessageKind::Error, content)
    }

    fn local_notice(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            sender_name: String::new(),
            content: content.into(),
            timestamp: Utc::now(),
            is_mine: false,
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
