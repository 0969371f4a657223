//! Domain model structs persisted in SQLite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pulse_shared::types::{
    CallId, CallStatus, CallType, ConversationId, MessageId, PresenceState, UserId,
};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub display_name: Option<String>,
    /// Whether this user accepts incoming calls at all.
    pub call_access_enabled: bool,
    /// Last durable presence written by the realtime layer.
    pub presence: PresenceState,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub name: Option<String>,
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: Option<String>,
    /// Opaque attachment descriptors, stored as a JSON array.
    pub attachments: Vec<Value>,
    pub metadata: Option<Value>,
    pub reply_to: Option<MessageId>,
    /// Original message when this one was created by a forward.
    pub forwarded_from: Option<MessageId>,
    pub pinned: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A fresh, unpinned, undeleted message stamped now.
    pub fn new(conversation_id: ConversationId, sender_id: UserId) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender_id,
            body: None,
            attachments: Vec::new(),
            metadata: None,
            reply_to: None,
            forwarded_from: None,
            pinned: false,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Message status
// ---------------------------------------------------------------------------

/// Delivery state of one message for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageStatus {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Timestamps to apply in a bulk status update. `None` leaves the column as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusPatch {
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl StatusPatch {
    pub fn delivered(at: DateTime<Utc>) -> Self {
        Self {
            delivered_at: Some(at),
            read_at: None,
        }
    }

    pub fn read(at: DateTime<Utc>) -> Self {
        Self {
            delivered_at: None,
            read_at: Some(at),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.delivered_at.is_none() && self.read_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub end_reason: Option<String>,
}
