use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::payload::{BinaryEncoding, BinaryPayload, ErrorBody, ErrorPayload};
use crate::DecodeError;

pub const AUTH: &str = "AUTH";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const ERROR: &str = "ERROR";
pub const BINARY_DATA: &str = "BINARY_DATA";
pub const CHUNKED_DATA: &str = "CHUNKED_DATA";

const SESSION_ID: &str = "sessionId";

/// Envelope keys carried through `extra` untouched when they hold `null`, or a
/// non-string in the case of `sessionId`.
const VERBATIM_KEYS: [&str; 4] = ["id", SESSION_ID, "payload", "timestamp"];

/// One logical protocol message.
///
/// Only `type` is required. Top-level fields the bridge does not know about
/// are kept in `extra` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Number>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind<'a> {
    Auth,
    Ping,
    Pong,
    Error,
    BinaryData,
    ChunkedData,
    Other(&'a str),
}

impl Frame {
    pub fn new(frame_type: impl Into<String>) -> Self {
        Self {
            frame_type: frame_type.into(),
            id: None,
            session_id: None,
            payload: None,
            timestamp: None,
            extra: Map::new(),
        }
    }

    pub fn ping(timestamp_ms: u64) -> Self {
        let mut frame = Self::new(PING);
        frame.timestamp = Some(Number::from(timestamp_ms));
        frame
    }

    /// Reply to a ping, echoing its id and timestamp.
    pub fn pong_for(ping: &Frame) -> Self {
        let mut frame = Self::new(PONG);
        frame.id = ping.id.clone();
        frame.timestamp = ping.timestamp.clone();
        frame
    }

    pub fn error(
        request_id: Option<Value>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let payload = ErrorPayload {
            request_id,
            error: ErrorBody {
                error_type: error_type.into(),
                message: message.into(),
            },
        };
        let mut frame = Self::new(ERROR);
        frame.payload = serde_json::to_value(payload).ok();
        frame
    }

    /// Wraps opaque bytes into a single base64 `BINARY_DATA` frame.
    pub fn binary(
        bytes: &[u8],
        content_type: impl Into<String>,
        metadata: Option<Value>,
    ) -> Self {
        let payload = BinaryPayload {
            content_type: content_type.into(),
            encoding: BinaryEncoding::Base64,
            data: Some(crate::payload::encode_base64(bytes)),
            chunk_data: None,
            size: bytes.len() as u64,
            message_id: None,
            chunk_index: None,
            total_chunks: None,
            metadata,
        };
        let mut frame = Self::new(BINARY_DATA);
        frame.payload = serde_json::to_value(payload).ok();
        frame
    }

    pub fn kind(&self) -> FrameKind<'_> {
        match self.frame_type.as_str() {
            AUTH => FrameKind::Auth,
            PING => FrameKind::Ping,
            PONG => FrameKind::Pong,
            ERROR => FrameKind::Error,
            BINARY_DATA => FrameKind::BinaryData,
            CHUNKED_DATA => FrameKind::ChunkedData,
            other => FrameKind::Other(other),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.set_session(Some(session_id.into()));
        self
    }

    /// Replaces whatever `sessionId` the sender supplied; `None` strips it.
    pub fn set_session(&mut self, session_id: Option<String>) {
        self.extra.remove(SESSION_ID);
        self.session_id = session_id;
    }

    /// Validates an already-parsed JSON value against the frame schema.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(map) = value else {
            return Err(DecodeError::Schema("frame must be a JSON object".into()));
        };
        match map.get("type") {
            Some(Value::String(kind)) if !kind.is_empty() => {}
            Some(Value::String(_)) => {
                return Err(DecodeError::Schema("frame type must not be empty".into()))
            }
            Some(_) => return Err(DecodeError::Schema("frame type must be a string".into())),
            None => return Err(DecodeError::Schema("frame is missing a type".into())),
        }
        if let Some(ts) = map.get("timestamp") {
            if !ts.is_number() && !ts.is_null() {
                return Err(DecodeError::Schema("timestamp must be numeric".into()));
            }
        }
        let mut map = map;
        let mut verbatim = Map::new();
        for key in VERBATIM_KEYS {
            let keep = match map.get(key) {
                Some(Value::Null) => true,
                Some(value) => key == SESSION_ID && !value.is_string(),
                None => false,
            };
            if keep {
                if let Some(value) = map.remove(key) {
                    verbatim.insert(key.to_string(), value);
                }
            }
        }
        let mut frame: Frame = serde_json::from_value(Value::Object(map))
            .map_err(|err| DecodeError::Schema(err.to_string()))?;
        frame.extra.extend(verbatim);
        Ok(frame)
    }

    /// Typed view over the payload, if it parses as `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let value = self.payload.clone().ok_or_else(|| {
            DecodeError::Schema(format!("{} frame has no payload", self.frame_type))
        })?;
        serde_json::from_value(value).map_err(|err| DecodeError::Schema(err.to_string()))
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn unknown_fields_survive_a_round_trip() {
        let value = json!({
            "type": "CURSOR_MOVE",
            "id": 17,
            "sessionId": "ABC",
            "payload": {"x": 1, "y": 2},
            "timestamp": 1700000000123u64,
            "route": "/orders",
            "flags": [1, 2, 3]
        });
        let frame = Frame::from_value(value.clone()).expect("valid frame");
        assert_eq!(frame.kind(), FrameKind::Other("CURSOR_MOVE"));
        assert_eq!(frame.extra.get("route"), Some(&json!("/orders")));

        let back: Value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(back, value);
    }

    #[test_timeout::timeout]
    fn null_envelope_fields_survive_a_round_trip() {
        let value = json!({
            "type": "SAVE",
            "id": null,
            "payload": null,
            "timestamp": null,
            "sessionId": null
        });
        let frame = Frame::from_value(value.clone()).expect("valid frame");
        assert_eq!(frame.id, None);
        assert_eq!(frame.payload, None);
        let back: Value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(back, value);
    }

    #[test_timeout::timeout]
    fn non_string_session_id_is_accepted_and_kept() {
        let value = json!({"type": "SAVE", "sessionId": 42});
        let frame = Frame::from_value(value.clone()).expect("only type and timestamp are checked");
        assert_eq!(frame.session_id, None);
        let back: Value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(back, value);
    }

    #[test_timeout::timeout]
    fn set_session_replaces_any_sender_value() {
        let mut frame = Frame::from_value(json!({"type": "SAVE", "sessionId": 42})).expect("frame");
        frame.set_session(Some("OWN".into()));
        let back: Value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(back, json!({"type": "SAVE", "sessionId": "OWN"}));

        let mut frame =
            Frame::from_value(json!({"type": "SAVE", "sessionId": "SPOOFED"})).expect("frame");
        frame.set_session(None);
        let back: Value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(back, json!({"type": "SAVE"}));

        let mut frame =
            Frame::from_value(json!({"type": "SAVE", "sessionId": null})).expect("frame");
        frame.set_session(None);
        assert_eq!(frame.to_text().expect("text"), r#"{"type":"SAVE"}"#);
    }

    #[test_timeout::timeout]
    fn schema_rejects_missing_or_empty_type() {
        assert!(matches!(
            Frame::from_value(json!({"payload": {}})),
            Err(DecodeError::Schema(_))
        ));
        assert!(matches!(
            Frame::from_value(json!({"type": ""})),
            Err(DecodeError::Schema(_))
        ));
        assert!(matches!(
            Frame::from_value(json!({"type": 4})),
            Err(DecodeError::Schema(_))
        ));
        assert!(matches!(
            Frame::from_value(json!(["type", "PING"])),
            Err(DecodeError::Schema(_))
        ));
    }

    #[test_timeout::timeout]
    fn schema_rejects_non_numeric_timestamp() {
        let err = Frame::from_value(json!({"type": "PING", "timestamp": "yesterday"}))
            .expect_err("string timestamp");
        assert!(matches!(err, DecodeError::Schema(_)));
    }

    #[test_timeout::timeout]
    fn pong_echoes_ping_identity() {
        let mut ping = Frame::ping(42);
        ping.id = Some(json!("hb-1"));
        let pong = Frame::pong_for(&ping);
        assert_eq!(pong.kind(), FrameKind::Pong);
        assert_eq!(pong.id, Some(json!("hb-1")));
        assert_eq!(pong.timestamp, Some(Number::from(42u64)));
    }

    #[test_timeout::timeout]
    fn error_frame_shape() {
        let frame =
            Frame::error(Some(json!("req-9")), "INVALID_FRAME", "frame is missing a type");
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["payload"]["requestId"], "req-9");
        assert_eq!(value["payload"]["error"]["type"], "INVALID_FRAME");
        assert_eq!(value["payload"]["error"]["message"], "frame is missing a type");
    }
}
