//! JSON frames exchanged over the realtime socket.
//!
//! Every frame is `{"type": "<tag>", "payload": {...}}`. Inbound and
//! outbound tags overlap (`call:accept` is both a client command and the
//! relay the peer receives) but the payload shapes differ, so each direction
//! has its own sum type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{ErrorCode, ProtocolError};
use crate::types::{
    CallId, CallStatus, CallType, ConversationId, MessageId, PresenceState, UserId,
};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum InboundFrame {
    #[serde(rename = "connection:status")]
    ConnectionStatus(StatusUpdate),

    #[serde(rename = "conversation:join")]
    ConversationJoin(ConversationRef),

    #[serde(rename = "conversation:leave")]
    ConversationLeave(ConversationRef),

    #[serde(rename = "message:new")]
    MessageNew(NewMessage),

    /// Explicit read receipt for messages already on screen.
    #[serde(rename = "message:read")]
    MessageRead(ReadRequest),

    #[serde(rename = "conversation:typing")]
    Typing(TypingUpdate),

    #[serde(rename = "message:pin")]
    MessagePin(PinRequest),

    #[serde(rename = "message:star")]
    MessageStar(StarRequest),

    #[serde(rename = "message:forward")]
    MessageForward(ForwardRequest),

    #[serde(rename = "message:delete")]
    MessageDelete(MessageRef),

    #[serde(rename = "call:init")]
    CallInit(CallInit),

    #[serde(rename = "call:offer")]
    CallOffer(SdpPayload),

    #[serde(rename = "call:answer")]
    CallAnswer(SdpPayload),

    #[serde(rename = "call:ice")]
    CallIce(IcePayload),

    #[serde(rename = "call:accept")]
    CallAccept(CallRef),

    #[serde(rename = "call:decline")]
    CallDecline(CallClose),

    #[serde(rename = "call:end")]
    CallEnd(CallClose),

    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub state: PresenceState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRef {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub body: Option<String>,
    /// Opaque attachment descriptors (uploaded out of band).
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    /// Client-side correlation id, echoed back in `message:ack`.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingUpdate {
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinRequest {
    pub message_id: MessageId,
    #[serde(default = "default_true")]
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StarRequest {
    pub message_id: MessageId,
    #[serde(default = "default_true")]
    pub starred: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub message_ids: Vec<MessageId>,
    pub conversation_ids: Vec<ConversationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRef {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInit {
    pub callee_id: UserId,
    #[serde(default = "default_call_type")]
    pub call_type: CallType,
    #[serde(default)]
    pub sdp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    pub call_id: CallId,
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcePayload {
    pub call_id: CallId,
    pub candidate: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRef {
    pub call_id: CallId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallClose {
    pub call_id: CallId,
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_call_type() -> CallType {
    CallType::Audio
}

impl InboundFrame {
    /// Parse a text frame, rejecting oversized input before touching serde.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// The wire tag, for log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ConnectionStatus(_) => "connection:status",
            Self::ConversationJoin(_) => "conversation:join",
            Self::ConversationLeave(_) => "conversation:leave",
            Self::MessageNew(_) => "message:new",
            Self::MessageRead(_) => "message:read",
            Self::Typing(_) => "conversation:typing",
            Self::MessagePin(_) => "message:pin",
            Self::MessageStar(_) => "message:star",
            Self::MessageForward(_) => "message:forward",
            Self::MessageDelete(_) => "message:delete",
            Self::CallInit(_) => "call:init",
            Self::CallOffer(_) => "call:offer",
            Self::CallAnswer(_) => "call:answer",
            Self::CallIce(_) => "call:ice",
            Self::CallAccept(_) => "call:accept",
            Self::CallDecline(_) => "call:decline",
            Self::CallEnd(_) => "call:end",
            Self::Ping => "ping",
        }
    }

    /// Payload checks that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::ConnectionStatus(update) if !update.state.is_online() => Err(format!(
                "clients may only report foreground or background, got {}",
                update.state.as_str()
            )),
            Self::MessageNew(msg) => {
                let has_body = msg
                    .body
                    .as_deref()
                    .map(|b| !b.trim().is_empty())
                    .unwrap_or(false);
                if !has_body && msg.attachments.is_empty() {
                    return Err("message needs a body or at least one attachment".into());
                }
                Ok(())
            }
            Self::MessageRead(req) if req.message_ids.is_empty() => {
                Err("message_ids must not be empty".into())
            }
            Self::MessageForward(req) => {
                if req.message_ids.is_empty() {
                    return Err("message_ids must not be empty".into());
                }
                if req.conversation_ids.is_empty() {
                    return Err("conversation_ids must not be empty".into());
                }
                Ok(())
            }
            Self::CallOffer(p) | Self::CallAnswer(p) if p.sdp.is_empty() => {
                Err("sdp must not be empty".into())
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundFrame {
    #[serde(rename = "message:new")]
    MessageNew(MessageEvent),

    /// Delivery receipt for the sender of a message.
    #[serde(rename = "message:ack")]
    MessageAck(MessageAck),

    #[serde(rename = "message:read")]
    MessageRead(ReadReceipt),

    #[serde(rename = "message:pin")]
    MessagePinned(PinEvent),

    #[serde(rename = "message:star")]
    MessageStarred(StarEvent),

    #[serde(rename = "message:delete")]
    MessageDeleted(DeleteEvent),

    #[serde(rename = "conversation:typing")]
    Typing(TypingEvent),

    #[serde(rename = "connection:status")]
    Presence(PresenceEvent),

    /// Incoming call, delivered to the callee.
    #[serde(rename = "call:init")]
    IncomingCall(IncomingCall),

    #[serde(rename = "call:ringing")]
    CallRinging(CallRinging),

    #[serde(rename = "call:offer")]
    CallOffer(SignalRelay),

    #[serde(rename = "call:answer")]
    CallAnswer(SignalRelay),

    #[serde(rename = "call:ice")]
    CallIce(SignalRelay),

    #[serde(rename = "call:accept")]
    CallAccepted(CallUpdate),

    #[serde(rename = "call:decline")]
    CallDeclined(CallUpdate),

    #[serde(rename = "call:end")]
    CallEnded(CallUpdate),

    #[serde(rename = "pong")]
    Pong(Pong),

    #[serde(rename = "socket:error")]
    Error(ErrorFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEvent {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageAck {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Recipients the message reached over a live socket.
    pub online: Vec<UserId>,
    /// Recipients that will be notified out of band.
    pub offline: Vec<UserId>,
    /// Recipients that were viewing the conversation (already read).
    pub read_by: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub message_ids: Vec<MessageId>,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PinEvent {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub pinned: bool,
    pub by: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StarEvent {
    pub message_id: MessageId,
    pub starred: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteEvent {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypingEvent {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub state: PresenceState,
    pub online: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub call_type: CallType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRinging {
    pub call_id: CallId,
    pub callee_id: UserId,
    /// Whether the callee had a live socket; `false` means push fallback.
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalRelay {
    pub call_id: CallId,
    pub from: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallUpdate {
    pub call_id: CallId,
    pub by: UserId,
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pong {
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
    /// Tag of the inbound frame that failed, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl OutboundFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>, context: Option<&str>) -> Self {
        Self::Error(ErrorFrame {
            code,
            message: message.into(),
            context: context.map(str::to_string),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
