use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{MessageId, UserId};

/// Encrypted message as submitted to the relay.
///
/// This is the only shape the client emits; the historical aliases are
/// accepted on the inbound side only (see [`InboundEnvelope`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub receiver_id: UserId,
    /// Base64 AES-256-CBC ciphertext.
    pub encrypted_message: String,
    /// Base64 RSA-OAEP wrap of the message key for the receiver.
    pub encrypted_key_for_receiver: String,
    /// Base64 RSA-OAEP wrap of the message key for the sender's own key.
    pub encrypted_key_for_sender: String,
    /// Base64 128-bit IV.
    pub iv: String,
    /// Base64 HMAC-SHA256 over `iv || ciphertext`.
    pub mac: String,
}

/// Encrypted message as delivered by the relay, live or via history.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct InboundEnvelope {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub encrypted_message: String,
    pub iv: String,
    pub mac: String,
    pub key_for_receiver: Option<String>,
    pub key_for_sender: Option<String>,
    /// Relay timestamp; `None` when the relay omitted it.
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundEnvelope {
    /// The other party of this message from `me`'s point of view, or `None`
    /// if the envelope was not addressed to or sent by `me`.
    pub fn correspondent_of(&self, me: UserId) -> Option<UserId> {
        if self.sender_id == me {
            Some(self.receiver_id)
        } else if self.receiver_id == me {
            Some(self.sender_id)
        } else {
            None
        }
    }

    /// The key wrap `me` can open: the receiver wrap for incoming messages,
    /// the sender wrap when re-reading a message `me` sent.
    ///
    /// A self-addressed message prefers the receiver wrap.
    pub fn wrap_for(&self, me: UserId) -> Option<&str> {
        if self.receiver_id == me {
            self.key_for_receiver.as_deref()
        } else if self.sender_id == me {
            self.key_for_sender.as_deref()
        } else {
            None
        }
    }
}

/// Every field name any relay version has used for an envelope.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    id: Option<Value>,
    sender: Option<Value>,
    sender_id: Option<Value>,
    receiver: Option<Value>,
    receiver_id: Option<Value>,
    encrypted_message: Option<String>,
    iv: Option<String>,
    mac: Option<String>,
    encrypted_key_for_receiver: Option<String>,
    encrypted_key: Option<String>,
    encrypted_key_for_sender: Option<String>,
    encrypted_key_sender: Option<String>,
    timestamp: Option<Value>,
    created_at: Option<Value>,
}

impl TryFrom<RawEnvelope> for InboundEnvelope {
    type Error = ProtocolError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let id = raw
            .id
            .as_ref()
            .and_then(value_to_id)
            .ok_or(ProtocolError::MissingField("id"))?;
        let sender_id = user_id_field("sender", raw.sender.or(raw.sender_id))?;
        let receiver_id = user_id_field("receiver", raw.receiver.or(raw.receiver_id))?;
        let timestamp = match raw.timestamp.or(raw.created_at) {
            Some(Value::Null) | None => None,
            Some(v) => Some(parse_timestamp(&v)?),
        };

        Ok(Self {
            id,
            sender_id,
            receiver_id,
            encrypted_message: required("encrypted_message", raw.encrypted_message)?,
            iv: required("iv", raw.iv)?,
            mac: required("mac", raw.mac)?,
            key_for_receiver: non_empty(raw.encrypted_key_for_receiver)
                .or_else(|| non_empty(raw.encrypted_key)),
            key_for_sender: non_empty(raw.encrypted_key_for_sender)
                .or_else(|| non_empty(raw.encrypted_key_sender)),
            timestamp,
        })
    }
}

fn required(field: &'static str, value: Option<String>) -> Result<String, ProtocolError> {
    non_empty(value).ok_or(ProtocolError::MissingField(field))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn user_id_field(field: &'static str, value: Option<Value>) -> Result<UserId, ProtocolError> {
    let value = value.ok_or(ProtocolError::MissingField(field))?;
    let parsed = match &value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ProtocolError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// Parse a relay timestamp: RFC 3339, a naive ISO timestamp (taken as UTC),
/// or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, ProtocolError> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc())
                .map_err(|_| ProtocolError::InvalidTimestamp(s.clone()))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| ProtocolError::InvalidTimestamp(n.to_string())),
        other => Err(ProtocolError::InvalidTimestamp(other.to_string())),
    }
}

/// Liveness ping exchanged in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "type")]
    pub kind: String,
    /// Sender clock in epoch milliseconds.
    pub ts: i64,
}

impl Heartbeat {
    pub fn now() -> Self {
        Self {
            kind: "heartbeat".into(),
            ts: Utc::now().timestamp_millis(),
        }
    }
}

/// Relay acknowledgement that a submitted envelope was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub ok: bool,
    pub message_id: Option<MessageId>,
}

/// Relay rejection of a submitted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayError {
    pub code: String,
    pub message: String,
}

/// A classified inbound socket frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Envelope(InboundEnvelope),
    Heartbeat(Heartbeat),
    Ack(Ack),
    Error(RelayError),
    /// Well-formed JSON of a shape this client does not know.
    Unknown(Value),
}

/// One page of `GET /conversations/{other}/`.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub results: Vec<InboundEnvelope>,
    #[serde(default)]
    pub next_page: Option<u32>,
    #[serde(default)]
    pub prev_page: Option<u32>,
    #[serde(default)]
    pub count: u64,
}

/// Body of `GET /users/{id}/public_key/`.
#[derive(Debug, Clone, Deserialize)]
pub struct PublicKeyResponse {
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Body of `POST /generate_keys/`.
#[derive(Debug, Clone, Serialize)]
pub struct PublicKeyUpload<'a> {
    pub public_key: &'a str,
}
