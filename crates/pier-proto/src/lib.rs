//! Wire format for the beach-pier bridge.
//!
//! Frames are JSON objects keyed by `type`. Binary payloads travel either as a
//! single base64 `BINARY_DATA` frame or, above the chunk threshold, as an
//! ordered run of `CHUNKED_DATA` frames that [`MessageCodec`] reassembles.

pub mod chunk;
pub mod codec;
pub mod frame;
pub mod payload;

use thiserror::Error;

pub use chunk::{ChunkAssembler, ChunkError, ChunkProgress, Reassembled};
pub use codec::{CodecConfig, Decoded, MessageCodec, WireMessage, OCTET_STREAM};
pub use frame::{Frame, FrameKind};
pub use payload::{AuthPayload, BinaryEncoding, BinaryPayload, ErrorBody, ErrorPayload};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("invalid frame: {0}")]
    Schema(String),
    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("declared size {declared} does not match decoded length {actual}")]
    SizeMismatch { declared: u64, actual: usize },
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

impl DecodeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DecodeError::InvalidJson(_) => "invalid_json",
            DecodeError::Schema(_) => "schema",
            DecodeError::TooLarge { .. } => "too_large",
            DecodeError::SizeMismatch { .. } => "size_mismatch",
            DecodeError::InvalidBase64(_) => "invalid_base64",
            DecodeError::Chunk(_) => "chunk",
        }
    }

    /// Value of `error.type` in the `ERROR` frame sent back for this failure.
    pub fn error_type(&self) -> &'static str {
        match self {
            DecodeError::InvalidJson(_) => "INVALID_JSON",
            DecodeError::Schema(_) => "INVALID_FRAME",
            DecodeError::TooLarge { .. } => "MESSAGE_TOO_LARGE",
            DecodeError::SizeMismatch { .. } | DecodeError::InvalidBase64(_) => "INVALID_PAYLOAD",
            DecodeError::Chunk(_) => "INVALID_CHUNK",
        }
    }

    /// Unparseable text is dropped silently; everything else earns an `ERROR` reply.
    pub fn reply_to_sender(&self) -> bool {
        !matches!(self, DecodeError::InvalidJson(_))
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("raw binary frame could not be decoded: {0}")]
    RawPayload(#[source] DecodeError),
}
