//! Parley wire protocol: data model and relay frame codec.
//!
//! This crate provides:
//! - The on-device data model (`Message`, `Thread`)
//! - Outbound and inbound envelope frames, including the relay's field aliases
//! - Heartbeat / ack / error frame classification

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{decode_server_frame, encode_envelope, encode_heartbeat};
pub use error::ProtocolError;
pub use messages::{
    Ack, Heartbeat, HistoryPage, InboundEnvelope, OutboundEnvelope, RelayError, ServerFrame,
};
pub use types::{Correspondent, Message, MessageId, Thread, UserId};
