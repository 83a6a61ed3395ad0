use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::MessageId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

/// Lifecycle of a single message. User messages are created `Settled`;
/// model replies start `Pending` and end `Settled` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Settled,
    Failed,
}

impl MessageStatus {
    pub fn is_in_flight(self) -> bool {
        matches!(self, MessageStatus::Pending | MessageStatus::Streaming)
    }
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::User,
            content: text.into(),
            timestamp: Utc::now(),
            status: MessageStatus::Settled,
        }
    }

    /// Empty model reply that fragments will be appended to.
    pub fn placeholder() -> Self {
        Self {
            id: MessageId::new(),
            role: Role::Model,
            content: String::new(),
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
        }
    }

    /// Whether the content of this message may still grow.
    pub fn is_streaming(&self) -> bool {
        self.status.is_in_flight()
    }
}
