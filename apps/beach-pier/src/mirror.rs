//! One-way copy of relayed traffic for offline compliance analysis.
//!
//! Nothing here feeds back into the relay path: events are dropped when no
//! one is subscribed and slow subscribers lag instead of applying backpressure.

use std::path::PathBuf;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::link::LinkId;

const REDACTED: &str = "<redacted>";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client_to_backend",
            Direction::BackendToClient => "backend_to_client",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredFrame {
    pub direction: Direction,
    pub link_id: LinkId,
    pub client_id: Option<Uuid>,
    pub frame_type: Option<String>,
    pub size: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredHandshake {
    pub link_id: LinkId,
    pub headers: Vec<(String, String)>,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum MirrorEvent {
    Frame(MirroredFrame),
    Handshake(MirroredHandshake),
}

#[derive(Clone, Debug)]
pub struct FrameMirror {
    tx: broadcast::Sender<MirrorEvent>,
}

impl FrameMirror {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MirrorEvent> {
        self.tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    pub fn record_frame(
        &self,
        direction: Direction,
        link_id: LinkId,
        client_id: Option<Uuid>,
        frame_type: Option<&str>,
        size: usize,
    ) {
        if !self.is_active() {
            return;
        }
        let _ = self.tx.send(MirrorEvent::Frame(MirroredFrame {
            direction,
            link_id,
            client_id,
            frame_type: frame_type.map(str::to_string),
            size,
            captured_at: OffsetDateTime::now_utc(),
        }));
    }

    /// Records a backend dial. Header values never leave the process.
    pub fn record_handshake(&self, link_id: LinkId, headers: &[(String, String)]) {
        if !self.is_active() {
            return;
        }
        let headers = headers
            .iter()
            .map(|(name, _)| (name.clone(), REDACTED.to_string()))
            .collect();
        let _ = self.tx.send(MirrorEvent::Handshake(MirroredHandshake {
            link_id,
            headers,
            captured_at: OffsetDateTime::now_utc(),
        }));
    }
}

impl Default for FrameMirror {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Appends mirror events to `path` as newline-delimited JSON.
pub fn spawn_ndjson_writer(
    path: PathBuf,
    mut events: broadcast::Receiver<MirrorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to open mirror file");
                return;
            }
        };
        info!(path = %path.display(), "writing frame mirror");
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "frame mirror writer lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "failed to serialize mirror event");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(err) = file.write_all(&line).await {
                warn!(path = %path.display(), error = %err, "failed to write mirror event");
                break;
            }
        }
        let _ = file.flush().await;
    })
}
