use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DecodeError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryEncoding {
    #[default]
    Base64,
    Raw,
}

/// Payload of `BINARY_DATA` and `CHUNKED_DATA` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryPayload {
    pub content_type: String,
    #[serde(default)]
    pub encoding: BinaryEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_data: Option<String>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl BinaryPayload {
    /// Decodes the carried bytes and checks them against `size`.
    ///
    /// Chunk frames carry `chunkData`; whole frames carry `data`. Either field
    /// is accepted so a sender that mixes them up still decodes.
    pub fn decode_bytes(&self) -> Result<Bytes, DecodeError> {
        let encoded = self
            .chunk_data
            .as_deref()
            .or(self.data.as_deref())
            .ok_or_else(|| DecodeError::Schema("binary payload carries no data".into()))?;
        let bytes = match self.encoding {
            BinaryEncoding::Base64 => Bytes::from(STANDARD.decode(encoded)?),
            BinaryEncoding::Raw => Bytes::copy_from_slice(encoded.as_bytes()),
        };
        if bytes.len() as u64 != self.size {
            return Err(DecodeError::SizeMismatch {
                declared: self.size,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub session_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub request_id: Option<Value>,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

pub(crate) fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
