use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chunk::{ChunkAssembler, ChunkProgress};
use crate::frame::{Frame, FrameKind, CHUNKED_DATA};
use crate::payload::{encode_base64, BinaryEncoding, BinaryPayload};
use crate::{DecodeError, EncodeError};

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);
pub const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_chunk_size: usize,
    pub max_message_size: usize,
    pub chunk_timeout: Duration,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
        }
    }
}

/// A message as it travels over a WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

impl WireMessage {
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(text) => text.len(),
            WireMessage::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete frame. Small opaque binary arrives here wrapped as `BINARY_DATA`.
    Frame(Frame),
    /// A chunk was stored; the transfer is not finished yet.
    Incomplete {
        message_id: String,
        received: u32,
        total: u32,
    },
    /// The last missing chunk arrived.
    Completed { frame: Frame, bytes: Bytes },
    /// Opaque binary above the chunk threshold; the caller splits it.
    Oversized(Bytes),
}

/// Stateful codec. Each connection owns one so reassembly state stays local.
#[derive(Debug)]
pub struct MessageCodec {
    config: CodecConfig,
    assembler: ChunkAssembler,
}

impl MessageCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            assembler: ChunkAssembler::new(
                config.max_chunk_size,
                config.max_message_size,
                config.chunk_timeout,
            ),
        }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn decode(&mut self, raw: &WireMessage, now: Instant) -> Result<Decoded, DecodeError> {
        self.check_size(raw.len())?;
        match raw {
            WireMessage::Text(text) => {
                let value: Value =
                    serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;
                let frame = Frame::from_value(value)?;
                self.route(frame, now)
            }
            WireMessage::Binary(bytes) => match structured_binary(bytes) {
                Some(frame) => self.route(frame, now),
                None => Ok(self.wrap_opaque(bytes.clone())),
            },
        }
    }

    fn check_size(&self, len: usize) -> Result<(), DecodeError> {
        if len > self.config.max_message_size {
            return Err(DecodeError::TooLarge {
                size: len,
                limit: self.config.max_message_size,
            });
        }
        Ok(())
    }

    fn route(&mut self, frame: Frame, now: Instant) -> Result<Decoded, DecodeError> {
        let kind = match frame.kind() {
            FrameKind::ChunkedData => RouteKind::Chunk,
            FrameKind::BinaryData => RouteKind::Binary,
            _ => RouteKind::Plain,
        };
        match kind {
            RouteKind::Chunk => {
                let payload: BinaryPayload = frame.payload_as()?;
                match self.assembler.ingest(&payload, now)? {
                    ChunkProgress::Incomplete {
                        message_id,
                        received,
                        total,
                    } => {
                        debug!(
                            message_id = %message_id,
                            received,
                            total,
                            "stored chunk"
                        );
                        Ok(Decoded::Incomplete {
                            message_id,
                            received,
                            total,
                        })
                    }
                    ChunkProgress::Complete(done) => {
                        let mut completed =
                            Frame::binary(&done.bytes, done.content_type, done.metadata);
                        completed.session_id = frame.session_id;
                        completed.id = frame.id;
                        Ok(Decoded::Completed {
                            frame: completed,
                            bytes: done.bytes,
                        })
                    }
                }
            }
            RouteKind::Binary => {
                let payload: BinaryPayload = frame.payload_as()?;
                payload.decode_bytes()?;
                Ok(Decoded::Frame(frame))
            }
            RouteKind::Plain => Ok(Decoded::Frame(frame)),
        }
    }

    fn wrap_opaque(&self, bytes: Bytes) -> Decoded {
        if bytes.len() > self.config.max_chunk_size {
            return Decoded::Oversized(bytes);
        }
        Decoded::Frame(Frame::binary(&bytes, OCTET_STREAM, None))
    }

    pub fn encode(&self, frame: &Frame) -> Result<WireMessage, EncodeError> {
        if frame.kind() == FrameKind::BinaryData {
            if let Ok(payload) = frame.payload_as::<BinaryPayload>() {
                if payload.encoding == BinaryEncoding::Raw {
                    let bytes = payload.decode_bytes().map_err(EncodeError::RawPayload)?;
                    return Ok(WireMessage::Binary(bytes));
                }
            }
        }
        Ok(WireMessage::Text(frame.to_text()?))
    }

    /// Splits `bytes` into ordered `CHUNKED_DATA` frames sharing one message id.
    pub fn create_chunks(
        &self,
        bytes: &[u8],
        content_type: &str,
        metadata: Option<Value>,
    ) -> Result<Vec<Frame>, DecodeError> {
        self.check_size(bytes.len())?;
        let message_id = Uuid::new_v4().to_string();
        let cap = self.config.max_chunk_size.max(1);
        let pieces: Vec<&[u8]> = if bytes.is_empty() {
            vec![&[][..]]
        } else {
            bytes.chunks(cap).collect()
        };
        let total = u32::try_from(pieces.len())
            .map_err(|_| crate::ChunkError::Malformed("chunk total overflowed u32"))?;

        let mut frames = Vec::with_capacity(pieces.len());
        for (index, piece) in pieces.into_iter().enumerate() {
            let payload = BinaryPayload {
                content_type: content_type.to_string(),
                encoding: BinaryEncoding::Base64,
                data: None,
                chunk_data: Some(encode_base64(piece)),
                size: piece.len() as u64,
                message_id: Some(message_id.clone()),
                chunk_index: Some(index as u32),
                total_chunks: Some(total),
                metadata: metadata.clone(),
            };
            let mut frame = Frame::new(CHUNKED_DATA);
            frame.payload = Some(serde_json::to_value(payload).map_err(|err| {
                DecodeError::Schema(format!("failed to build chunk payload: {err}"))
            })?);
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Purges transfers past the chunk timeout. No frame is produced for them.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let expired = self.assembler.sweep(now);
        for message_id in &expired {
            warn!(
                message_id = %message_id,
                timeout_secs = self.config.chunk_timeout.as_secs(),
                "discarding incomplete chunked transfer"
            );
        }
        expired
    }

    pub fn pending_transfers(&self) -> usize {
        self.assembler.pending()
    }

    pub fn has_transfer(&self, message_id: &str) -> bool {
        self.assembler.contains(message_id)
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

#[derive(Clone, Copy)]
enum RouteKind {
    Chunk,
    Binary,
    Plain,
}

/// Binary frames may still carry JSON; anything else is opaque.
fn structured_binary(bytes: &[u8]) -> Option<Frame> {
    let first = bytes.iter().find(|b| !b.is_ascii_whitespace())?;
    if *first != b'{' {
        return None;
    }
    let value: Value = serde_json::from_slice(bytes).ok()?;
    Frame::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BINARY_DATA;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    fn small_config() -> CodecConfig {
        CodecConfig {
            max_chunk_size: 16,
            max_message_size: 1024,
            chunk_timeout: Duration::from_secs(60),
        }
    }

    fn as_wire(frame: &Frame) -> WireMessage {
        WireMessage::Text(frame.to_text().expect("serialize frame"))
    }

    fn payload_bytes(frame: &Frame) -> Bytes {
        frame
            .payload_as::<BinaryPayload>()
            .expect("binary payload")
            .decode_bytes()
            .expect("bytes")
    }

    #[test_timeout::timeout]
    fn reassembles_any_permutation_exactly_once() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for round in 0..40 {
            let len = rng.gen_range(0..200);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let mut codec = MessageCodec::new(small_config());
            let mut chunks = codec
                .create_chunks(&data, OCTET_STREAM, None)
                .expect("split");
            chunks.shuffle(&mut rng);

            let last = chunks.len() - 1;
            let now = Instant::now();
            for (position, chunk) in chunks.iter().enumerate() {
                let decoded = codec.decode(&as_wire(chunk), now).expect("decode chunk");
                match decoded {
                    Decoded::Completed { bytes, frame } => {
                        assert_eq!(position, last, "round {round} completed early");
                        assert_eq!(bytes.as_ref(), data.as_slice());
                        assert_eq!(payload_bytes(&frame).as_ref(), data.as_slice());
                    }
                    Decoded::Incomplete { total, .. } => {
                        assert!(position < last, "round {round} never completed");
                        assert_eq!(total as usize, chunks.len());
                    }
                    other => panic!("unexpected decode outcome: {other:?}"),
                }
            }
            assert_eq!(codec.pending_transfers(), 0);
        }
    }

    #[test_timeout::timeout]
    fn duplicate_chunks_are_ignored() {
        let mut codec = MessageCodec::new(small_config());
        let data = b"abcdefghijklmnopqrstuvwxyz0123456789".to_vec();
        let chunks = codec.create_chunks(&data, OCTET_STREAM, None).expect("split");
        assert_eq!(chunks.len(), 3);
        let now = Instant::now();

        codec.decode(&as_wire(&chunks[0]), now).expect("first");
        let again = codec.decode(&as_wire(&chunks[0]), now).expect("duplicate");
        assert!(matches!(again, Decoded::Incomplete { received: 1, .. }));
        codec.decode(&as_wire(&chunks[2]), now).expect("third");
        let done = codec.decode(&as_wire(&chunks[1]), now).expect("second");
        assert!(matches!(
            done,
            Decoded::Completed { ref bytes, .. } if bytes.as_ref() == data.as_slice()
        ));
    }

    #[test_timeout::timeout]
    fn three_and_a_half_megabytes_make_four_chunks() {
        let mut codec = MessageCodec::default();
        let data: Vec<u8> = (0..(3 * 1024 * 1024 + 512 * 1024))
            .map(|i| (i % 251) as u8)
            .collect();
        let chunks = codec
            .create_chunks(&data, "video/mp4", Some(json!({"name": "clip"})))
            .expect("split");
        assert_eq!(chunks.len(), 4);

        let sizes: Vec<u64> = chunks
            .iter()
            .map(|c| c.payload_as::<BinaryPayload>().expect("payload").size)
            .collect();
        assert_eq!(sizes, vec![1_048_576, 1_048_576, 1_048_576, 524_288]);

        let message_id = chunks[0]
            .payload_as::<BinaryPayload>()
            .expect("payload")
            .message_id
            .expect("message id");

        let now = Instant::now();
        let mut completed = None;
        for chunk in &chunks {
            if let Decoded::Completed { frame, bytes } =
                codec.decode(&as_wire(chunk), now).expect("decode")
            {
                completed = Some((frame, bytes));
            }
        }
        let (frame, bytes) = completed.expect("transfer completed");
        assert_eq!(bytes.as_ref(), data.as_slice());
        let payload: BinaryPayload = frame.payload_as().expect("payload");
        assert_eq!(frame.frame_type, BINARY_DATA);
        assert_eq!(payload.content_type, "video/mp4");
        assert_eq!(payload.metadata, Some(json!({"name": "clip"})));
        assert!(!codec.has_transfer(&message_id));
    }

    #[test_timeout::timeout]
    fn chunk_zero_supplies_content_type() {
        let mut codec = MessageCodec::new(small_config());
        let data = vec![9u8; 40];
        let mut chunks = codec.create_chunks(&data, "image/png", None).expect("split");
        // a later chunk claims a different type; chunk 0 must win
        let mut tail: BinaryPayload = chunks[2].payload_as().expect("payload");
        tail.content_type = "text/plain".into();
        chunks[2].payload = Some(serde_json::to_value(tail).expect("payload"));

        let now = Instant::now();
        codec.decode(&as_wire(&chunks[2]), now).expect("tail");
        codec.decode(&as_wire(&chunks[1]), now).expect("middle");
        let done = codec.decode(&as_wire(&chunks[0]), now).expect("head");
        let Decoded::Completed { frame, .. } = done else {
            panic!("expected completion");
        };
        let payload: BinaryPayload = frame.payload_as().expect("payload");
        assert_eq!(payload.content_type, "image/png");
    }

    #[test_timeout::timeout]
    fn encode_decode_preserves_structured_fields() {
        let mut codec = MessageCodec::default();
        let text = json!({
            "type": "UPDATE_FIELD",
            "id": "m-1",
            "sessionId": "S",
            "payload": {"field": "qty", "value": 3},
            "timestamp": 1710000000000u64,
            "trace": {"span": "a1"}
        })
        .to_string();
        let Decoded::Frame(frame) = codec
            .decode(&WireMessage::Text(text.clone()), Instant::now())
            .expect("decode")
        else {
            panic!("expected frame");
        };
        let WireMessage::Text(encoded) = codec.encode(&frame).expect("encode") else {
            panic!("expected text");
        };
        let original: Value = serde_json::from_str(&text).expect("json");
        let round: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(original, round);
    }

    #[test_timeout::timeout]
    fn encode_decode_keeps_null_and_untyped_envelope_fields() {
        let mut codec = MessageCodec::default();
        for original in [
            json!({"type": "SAVE", "payload": null, "id": null}),
            json!({"type": "SAVE", "sessionId": 42, "timestamp": null}),
        ] {
            let decoded = codec
                .decode(&WireMessage::Text(original.to_string()), Instant::now())
                .expect("frame passes the schema");
            let Decoded::Frame(frame) = decoded else {
                panic!("expected frame");
            };
            let WireMessage::Text(encoded) = codec.encode(&frame).expect("encode") else {
                panic!("expected text");
            };
            let round: Value = serde_json::from_str(&encoded).expect("json");
            assert_eq!(round, original);
        }
    }

    #[test_timeout::timeout]
    fn invalid_json_and_schema_failures_are_distinct() {
        let mut codec = MessageCodec::default();
        let now = Instant::now();
        let err = codec
            .decode(&WireMessage::Text("{not json".into()), now)
            .expect_err("invalid json");
        assert!(matches!(err, DecodeError::InvalidJson(_)));

        let err = codec
            .decode(&WireMessage::Text(r#"{"payload":1}"#.into()), now)
            .expect_err("missing type");
        assert!(matches!(err, DecodeError::Schema(_)));
        assert!(err.reply_to_sender());
    }

    #[test_timeout::timeout]
    fn opaque_binary_is_wrapped_or_flagged_or_rejected() {
        let mut codec = MessageCodec::new(small_config());
        let now = Instant::now();

        let small = WireMessage::Binary(Bytes::from_static(&[0, 1, 2, 3]));
        let Decoded::Frame(frame) = codec.decode(&small, now).expect("small") else {
            panic!("expected wrapped frame");
        };
        assert_eq!(frame.frame_type, BINARY_DATA);
        assert_eq!(payload_bytes(&frame).as_ref(), &[0, 1, 2, 3]);

        let big = WireMessage::Binary(Bytes::from(vec![7u8; 100]));
        assert!(matches!(codec.decode(&big, now), Ok(Decoded::Oversized(b)) if b.len() == 100));

        let huge = WireMessage::Binary(Bytes::from(vec![7u8; 2048]));
        assert!(matches!(
            codec.decode(&huge, now),
            Err(DecodeError::TooLarge { size: 2048, limit: 1024 })
        ));
    }

    #[test_timeout::timeout]
    fn binary_json_frames_decode_as_structured() {
        let mut codec = MessageCodec::default();
        let raw = WireMessage::Binary(Bytes::from_static(br#"  {"type":"PING","timestamp":5}"#));
        let Decoded::Frame(frame) = codec.decode(&raw, Instant::now()).expect("decode") else {
            panic!("expected frame");
        };
        assert_eq!(frame.kind(), FrameKind::Ping);
    }

    #[test_timeout::timeout]
    fn raw_binary_frames_encode_as_binary() {
        let codec = MessageCodec::default();
        let mut frame = Frame::new(BINARY_DATA);
        frame.payload = Some(json!({
            "contentType": "text/plain",
            "encoding": "raw",
            "data": "bytes!",
            "size": 6
        }));
        assert_eq!(
            codec.encode(&frame).expect("encode"),
            WireMessage::Binary(Bytes::from_static(b"bytes!"))
        );
    }

    #[test_timeout::timeout]
    fn stale_transfers_are_swept() {
        let mut codec = MessageCodec::new(CodecConfig {
            chunk_timeout: Duration::from_secs(60),
            ..small_config()
        });
        let chunks = codec.create_chunks(&[1u8; 40], OCTET_STREAM, None).expect("split");
        let start = Instant::now();
        codec.decode(&as_wire(&chunks[0]), start).expect("first chunk");
        assert_eq!(codec.pending_transfers(), 1);

        assert!(codec.sweep(start + Duration::from_secs(30)).is_empty());
        let expired = codec.sweep(start + Duration::from_secs(61));
        assert_eq!(expired.len(), 1);
        assert_eq!(codec.pending_transfers(), 0);

        // late chunks start a fresh transfer rather than completing the purged one
        let outcome = codec
            .decode(&as_wire(&chunks[1]), start + Duration::from_secs(62))
            .expect("late chunk");
        assert!(matches!(outcome, Decoded::Incomplete { received: 1, .. }));
    }

    #[test_timeout::timeout]
    fn inconsistent_chunks_are_rejected() {
        let mut codec = MessageCodec::new(small_config());
        let chunks = codec.create_chunks(&[3u8; 40], OCTET_STREAM, None).expect("split");
        let now = Instant::now();
        codec.decode(&as_wire(&chunks[0]), now).expect("first");

        let mut wrong: BinaryPayload = chunks[1].payload_as().expect("payload");
        wrong.total_chunks = Some(5);
        let mut forged = chunks[1].clone();
        forged.payload = Some(serde_json::to_value(wrong).expect("payload"));
        let err = codec.decode(&as_wire(&forged), now).expect_err("total mismatch");
        assert!(matches!(err, DecodeError::Chunk(crate::ChunkError::TotalMismatch(_))));
        assert_eq!(codec.pending_transfers(), 0);

        let mut out_of_range: BinaryPayload = chunks[1].payload_as().expect("payload");
        out_of_range.chunk_index = Some(3);
        let mut forged = chunks[1].clone();
        forged.payload = Some(serde_json::to_value(out_of_range).expect("payload"));
        let err = codec.decode(&as_wire(&forged), now).expect_err("index out of range");
        assert!(matches!(
            err,
            DecodeError::Chunk(crate::ChunkError::IndexOutOfRange { index: 3, total: 3 })
        ));
    }

    #[test_timeout::timeout]
    fn empty_payload_yields_single_chunk() {
        let mut codec = MessageCodec::new(small_config());
        let chunks = codec.create_chunks(&[], OCTET_STREAM, None).expect("split");
        assert_eq!(chunks.len(), 1);
        let outcome = codec.decode(&as_wire(&chunks[0]), Instant::now()).expect("decode");
        assert!(matches!(outcome, Decoded::Completed { ref bytes, .. } if bytes.is_empty()));
    }
}
