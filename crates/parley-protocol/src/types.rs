use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User identifier assigned by the relay.
pub type UserId = u64;

/// Message identifier. Relay-assigned ids are stringified integers;
/// optimistic local echoes use a `local-` prefixed uuid.
pub type MessageId = String;

/// Prefix marking a message id that was generated on this device.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// A decrypted message as it lives in the on-device cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub author_id: UserId,
    /// True when `author_id` is the local identity.
    pub mine: bool,
}

impl Message {
    /// Whether this is an optimistic echo that has not been replaced by the
    /// relay's copy yet.
    pub fn is_local_echo(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

/// Per-correspondent conversation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub other_user_id: UserId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub last_preview_text: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
}

/// The other side of a conversation, as known to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correspondent {
    pub id: UserId,
    pub display_name: Option<String>,
}

impl Correspondent {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            display_name: None,
        }
    }

    pub fn named(id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: Some(display_name.into()),
        }
    }
}
