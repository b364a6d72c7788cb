use serde_json::{Map, Value};
use tracing::trace;

use crate::error::ProtocolError;
use crate::messages::{Ack, Heartbeat, InboundEnvelope, OutboundEnvelope, RelayError, ServerFrame};

/// Keys a heartbeat frame may carry. Anything else means it is not one.
const HEARTBEAT_KEYS: [&str; 3] = ["type", "ts", "timestamp"];

/// Encode an outbound envelope as a socket text frame.
pub fn encode_envelope(envelope: &OutboundEnvelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Encode a heartbeat as a socket text frame.
pub fn encode_heartbeat(beat: &Heartbeat) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(beat)?)
}

/// Whether a frame has the heartbeat shape: a `type`, a timestamp, and
/// nothing else.
pub fn is_heartbeat_shape(obj: &Map<String, Value>) -> bool {
    obj.get("type").is_some_and(Value::is_string)
        && (obj.contains_key("ts") || obj.contains_key("timestamp"))
        && obj.keys().all(|k| HEARTBEAT_KEYS.contains(&k.as_str()))
}

/// Decode and classify one inbound socket text frame.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(obj) = &value else {
        return Err(ProtocolError::NotAnObject);
    };

    if is_heartbeat_shape(obj) {
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ts = obj
            .get("ts")
            .or_else(|| obj.get("timestamp"))
            .and_then(Value::as_i64)
            .unwrap_or_default();
        return Ok(ServerFrame::Heartbeat(Heartbeat { kind, ts }));
    }

    match obj.get("type").and_then(Value::as_str) {
        Some("ack") => {
            return Ok(ServerFrame::Ack(Ack {
                ok: obj.get("ok").and_then(Value::as_bool).unwrap_or(true),
                message_id: obj.get("message_id").and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                }),
            }));
        }
        Some("error") => {
            return Ok(ServerFrame::Error(RelayError {
                code: string_field(obj, "code"),
                message: string_field(obj, "message"),
            }));
        }
        _ => {}
    }

    if obj.contains_key("encrypted_message") {
        let envelope: InboundEnvelope = serde_json::from_value(value)?;
        return Ok(ServerFrame::Envelope(envelope));
    }

    trace!(kind = ?obj.get("type"), "unrecognised frame shape");
    Ok(ServerFrame::Unknown(value))
}

fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_frame_is_classified_as_heartbeat() {
        let frame = decode_server_frame(r#"{"type":"heartbeat","ts":1234}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Heartbeat(Heartbeat {
                kind: "heartbeat".into(),
                ts: 1234
            })
        );
    }

    #[test]
    fn pong_with_timestamp_key_is_heartbeat() {
        let frame = decode_server_frame(r#"{"type":"pong","timestamp":5}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Heartbeat(Heartbeat { ts: 5, .. })));
    }

    #[test]
    fn frame_with_message_fields_is_not_heartbeat() {
        let text = r#"{"type":"chat","ts":1,"id":"4","sender":1,"receiver":2,
            "encrypted_message":"YQ==","iv":"YQ==","mac":"YQ=="}"#;
        let frame = decode_server_frame(text).unwrap();
        assert!(matches!(frame, ServerFrame::Envelope(_)));
    }

    #[test]
    fn ack_frame() {
        let frame =
            decode_server_frame(r#"{"type":"ack","ok":true,"message_id":"88"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Ack(Ack {
                ok: true,
                message_id: Some("88".into())
            })
        );
    }

    #[test]
    fn error_frame() {
        let frame = decode_server_frame(
            r#"{"type":"error","code":"not_found","message":"Receiver not found."}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::Error(err) => {
                assert_eq!(err.code, "not_found");
                assert_eq!(err.message, "Receiver not found.");
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_shape_is_preserved() {
        let frame = decode_server_frame(r#"{"type":"presence","online":[1,2]}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Unknown(_)));
    }

    #[test]
    fn non_object_rejected() {
        assert!(matches!(
            decode_server_frame("[1,2,3]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            decode_server_frame("not json"),
            Err(ProtocolError::Serialization(_))
        ));
    }

    #[test]
    fn malformed_envelope_is_an_error() {
        let text = r#"{"id":"1","sender":1,"receiver":2,"encrypted_message":"YQ=="}"#;
        assert!(decode_server_frame(text).is_err());
    }

    #[test]
    fn heartbeat_encoding_matches_shape() {
        let text = encode_heartbeat(&Heartbeat {
            kind: "heartbeat".into(),
            ts: 42,
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(is_heartbeat_shape(value.as_object().unwrap()));
    }
}
