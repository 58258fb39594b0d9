use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::payload::BinaryPayload;
use crate::DecodeError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk frame malformed: {0}")]
    Malformed(&'static str),
    #[error("chunk {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("chunk total changed for message {0}")]
    TotalMismatch(String),
    #[error("chunk of {size} bytes exceeds chunk limit of {limit}")]
    ChunkTooLarge { size: usize, limit: usize },
    #[error("transfer of {size} bytes exceeds message limit of {limit}")]
    TransferTooLarge { size: usize, limit: usize },
}

/// Result of feeding one chunk to the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkProgress {
    Incomplete {
        message_id: String,
        received: u32,
        total: u32,
    },
    Complete(Reassembled),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reassembled {
    pub message_id: String,
    pub bytes: Bytes,
    pub content_type: String,
    pub metadata: Option<Value>,
    pub started_at: Instant,
}

#[derive(Debug)]
struct Assembly {
    chunks: Vec<Option<Bytes>>,
    total: u32,
    received: u32,
    received_bytes: usize,
    content_type: String,
    metadata: Option<Value>,
    created_at: Instant,
}

impl Assembly {
    fn new(total: u32, content_type: String, metadata: Option<Value>, created_at: Instant) -> Self {
        Self {
            chunks: vec![None; total as usize],
            total,
            received: 0,
            received_bytes: 0,
            content_type,
            metadata,
            created_at,
        }
    }
}

/// Per-message accumulators for in-flight chunked transfers.
#[derive(Debug)]
pub struct ChunkAssembler {
    assemblies: HashMap<String, Assembly>,
    max_chunk_size: usize,
    max_message_size: usize,
    timeout: Duration,
}

impl ChunkAssembler {
    pub fn new(max_chunk_size: usize, max_message_size: usize, timeout: Duration) -> Self {
        Self {
            assemblies: HashMap::new(),
            max_chunk_size,
            max_message_size,
            timeout,
        }
    }

    fn max_chunks(&self) -> usize {
        let cap = self.max_chunk_size.max(1);
        ((self.max_message_size + cap - 1) / cap).max(1)
    }

    pub fn ingest(
        &mut self,
        payload: &BinaryPayload,
        now: Instant,
    ) -> Result<ChunkProgress, DecodeError> {
        let message_id = payload
            .message_id
            .clone()
            .ok_or(ChunkError::Malformed("chunk is missing messageId"))?;
        let index = payload
            .chunk_index
            .ok_or(ChunkError::Malformed("chunk is missing chunkIndex"))?;
        let total = payload
            .total_chunks
            .ok_or(ChunkError::Malformed("chunk is missing totalChunks"))?;
        if total == 0 {
            return Err(ChunkError::Malformed("chunk total cannot be zero").into());
        }
        if index >= total {
            return Err(ChunkError::IndexOutOfRange { index, total }.into());
        }
        if total as usize > self.max_chunks() {
            return Err(ChunkError::TransferTooLarge {
                size: total as usize * self.max_chunk_size,
                limit: self.max_message_size,
            }
            .into());
        }

        let bytes = payload.decode_bytes()?;
        if bytes.len() > self.max_chunk_size {
            return Err(ChunkError::ChunkTooLarge {
                size: bytes.len(),
                limit: self.max_chunk_size,
            }
            .into());
        }

        let entry = self.assemblies.entry(message_id.clone()).or_insert_with(|| {
            Assembly::new(
                total,
                payload.content_type.clone(),
                payload.metadata.clone(),
                now,
            )
        });

        if entry.total != total {
            self.assemblies.remove(&message_id);
            return Err(ChunkError::TotalMismatch(message_id).into());
        }

        let slot = index as usize;
        if entry.chunks[slot].is_none() {
            entry.received_bytes = entry.received_bytes.saturating_add(bytes.len());
            entry.chunks[slot] = Some(bytes);
            entry.received += 1;
            if index == 0 {
                entry.content_type = payload.content_type.clone();
                entry.metadata = payload.metadata.clone();
            }
        }

        if entry.received_bytes > self.max_message_size {
            let size = entry.received_bytes;
            self.assemblies.remove(&message_id);
            return Err(ChunkError::TransferTooLarge {
                size,
                limit: self.max_message_size,
            }
            .into());
        }

        if entry.received < entry.total {
            return Ok(ChunkProgress::Incomplete {
                message_id,
                received: entry.received,
                total: entry.total,
            });
        }

        let Some(assembly) = self.assemblies.remove(&message_id) else {
            return Err(ChunkError::Malformed("assembly vanished during reassembly").into());
        };
        let mut combined = Vec::with_capacity(assembly.received_bytes);
        for chunk in assembly.chunks.iter() {
            match chunk {
                Some(bytes) => combined.extend_from_slice(bytes),
                None => return Err(ChunkError::Malformed("missing chunk during reassembly").into()),
            }
        }
        Ok(ChunkProgress::Complete(Reassembled {
            message_id,
            bytes: Bytes::from(combined),
            content_type: assembly.content_type,
            metadata: assembly.metadata,
            started_at: assembly.created_at,
        }))
    }

    /// Drops transfers older than the timeout and returns their message ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        self.assemblies.retain(|message_id, assembly| {
            let stale = now.saturating_duration_since(assembly.created_at) > timeout;
            if stale {
                expired.push(message_id.clone());
            }
            !stale
        });
        expired
    }

    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.assemblies.contains_key(message_id)
    }

    pub fn oldest_started(&self) -> Option<Instant> {
        self.assemblies.values().map(|a| a.created_at).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{encode_base64, BinaryEncoding};

    fn chunk(message_id: &str, index: u32, total: u32, bytes: &[u8]) -> BinaryPayload {
        BinaryPayload {
            content_type: "text/plain".into(),
            encoding: BinaryEncoding::Base64,
            data: None,
            chunk_data: Some(encode_base64(bytes)),
            size: bytes.len() as u64,
            message_id: Some(message_id.into()),
            chunk_index: Some(index),
            total_chunks: Some(total),
            metadata: None,
        }
    }

    fn assembler() -> ChunkAssembler {
        ChunkAssembler::new(4, 16, Duration::from_secs(60))
    }

    #[test_timeout::timeout]
    fn completes_once_every_index_is_present() {
        let mut assembler = assembler();
        let now = Instant::now();
        let first = assembler.ingest(&chunk("m", 1, 2, b"cd"), now).expect("ingest");
        assert_eq!(
            first,
            ChunkProgress::Incomplete {
                message_id: "m".into(),
                received: 1,
                total: 2
            }
        );
        match assembler.ingest(&chunk("m", 0, 2, b"ab"), now).expect("ingest") {
            ChunkProgress::Complete(done) => assert_eq!(&done.bytes[..], b"abcd"),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(assembler.pending(), 0);
    }

    #[test_timeout::timeout]
    fn out_of_range_and_oversized_chunks_are_rejected() {
        let mut assembler = assembler();
        let now = Instant::now();
        assert!(matches!(
            assembler.ingest(&chunk("m", 2, 2, b"ab"), now),
            Err(DecodeError::Chunk(ChunkError::IndexOutOfRange { index: 2, total: 2 }))
        ));
        assert!(matches!(
            assembler.ingest(&chunk("m", 0, 2, b"abcde"), now),
            Err(DecodeError::Chunk(ChunkError::ChunkTooLarge { size: 5, limit: 4 }))
        ));
        assert!(matches!(
            assembler.ingest(&chunk("m", 0, 5, b"ab"), now),
            Err(DecodeError::Chunk(ChunkError::TransferTooLarge { .. }))
        ));
        assert_eq!(assembler.pending(), 0);
    }

    #[test_timeout::timeout]
    fn total_mismatch_discards_the_assembly() {
        let mut assembler = assembler();
        let now = Instant::now();
        assembler.ingest(&chunk("m", 0, 3, b"ab"), now).expect("ingest");
        assert!(assembler.contains("m"));
        assert!(matches!(
            assembler.ingest(&chunk("m", 1, 2, b"cd"), now),
            Err(DecodeError::Chunk(ChunkError::TotalMismatch(_)))
        ));
        assert!(!assembler.contains("m"));
    }

    #[test_timeout::timeout]
    fn sweep_drops_only_expired_transfers() {
        let mut assembler = assembler();
        let start = Instant::now();
        assembler.ingest(&chunk("old", 0, 2, b"ab"), start).expect("ingest");
        let later = start + Duration::from_secs(30);
        assembler.ingest(&chunk("new", 0, 2, b"ab"), later).expect("ingest");
        assert_eq!(assembler.oldest_started(), Some(start));

        let expired = assembler.sweep(start + Duration::from_secs(61));
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(assembler.contains("new"));
    }
}
