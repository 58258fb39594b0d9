//! Dialing the backend application server.
//!
//! A connector hands back a [`BackendSocket`]: an outbound sender and an
//! inbound receiver. The pool owns both ends and notices a dead socket when
//! the inbound side ends or the outbound side reports closed.

use std::time::Duration;

use async_trait::async_trait;
use pier_proto::WireMessage;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod websocket;

pub use self::memory::{MemoryBackend, MemoryPeer};
pub use self::websocket::WebSocketConnector;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid backend url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid dial header {0}")]
    InvalidHeader(String),
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend refused connection")]
    Refused,
}

impl ConnectError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ConnectError::InvalidUrl { .. } => "invalid_url",
            ConnectError::InvalidHeader(_) => "invalid_header",
            ConnectError::Handshake(_) => "handshake",
            ConnectError::Timeout(_) => "timeout",
            ConnectError::Refused => "refused",
        }
    }
}

/// Both directions of one open backend WebSocket.
#[derive(Debug)]
pub struct BackendSocket {
    pub outbound: mpsc::UnboundedSender<WireMessage>,
    pub inbound: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
pub trait BackendConnector: Send + Sync + 'static {
    async fn connect(&self, headers: &[(String, String)]) -> Result<BackendSocket, ConnectError>;
}
