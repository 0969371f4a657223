use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// First 8 hex chars, for log lines.
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Account identity, as issued by the auth service.
    UserId
);
uuid_id!(ConversationId);
uuid_id!(MessageId);
uuid_id!(
    /// One call attempt between a caller and a callee.
    CallId
);

/// Visibility of a connected client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Foreground,
    Background,
    Disconnected,
    /// Socket still registered but silent past the stale threshold.
    Stale,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Background => "background",
            Self::Disconnected => "disconnected",
            Self::Stale => "stale",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Foreground | Self::Background)
    }
}

impl FromStr for PresenceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "foreground" => Ok(Self::Foreground),
            "background" => Ok(Self::Background),
            "disconnected" => Ok(Self::Disconnected),
            "stale" => Ok(Self::Stale),
            other => Err(format!("unknown presence state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown call type: {other}")),
        }
    }
}

/// Lifecycle of a call.
///
/// `Initiated -> Ringing -> Answered -> Ended`, with `Missed` (ring timeout)
/// and `Declined` (callee refused) reachable from `Initiated`/`Ringing`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Ended,
    Missed,
    Declined,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Ended => "ended",
            Self::Missed => "missed",
            Self::Declined => "declined",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Missed | Self::Declined)
    }

    /// Still waiting for the callee to pick up.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Initiated | Self::Ringing)
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "ringing" => Ok(Self::Ringing),
            "answered" => Ok(Self::Answered),
            "ended" => Ok(Self::Ended),
            "missed" => Ok(Self::Missed),
            "declined" => Ok(Self::Declined),
            other => Err(format!("unknown call status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = UserId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CallStatus::Initiated.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Answered.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
        assert!(CallStatus::Declined.is_terminal());
    }

    #[test]
    fn test_presence_parse() {
        assert_eq!(
            "background".parse::<PresenceState>().unwrap(),
            PresenceState::Background
        );
        assert!("away".parse::<PresenceState>().is_err());
        assert!(!PresenceState::Stale.is_online());
    }
}
