//! In-process backend used by tests and local smoke runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pier_proto::{Frame, FrameKind, WireMessage};
use tokio::sync::{mpsc, oneshot};

use super::{BackendConnector, BackendSocket, ConnectError};

/// Backend end of one in-memory connection. Dropping it closes the connection.
pub struct MemoryPeer {
    pub index: usize,
    pub headers: Vec<(String, String)>,
    received: mpsc::UnboundedReceiver<WireMessage>,
    sender: Option<mpsc::UnboundedSender<WireMessage>>,
    close: Option<oneshot::Sender<()>>,
}

impl MemoryPeer {
    /// Pushes a message toward the bridge.
    pub fn send(&self, message: WireMessage) -> bool {
        self.sender
            .as_ref()
            .map(|sender| sender.send(message).is_ok())
            .unwrap_or(false)
    }

    pub fn send_frame(&self, frame: &Frame) -> bool {
        match frame.to_text() {
            Ok(text) => self.send(WireMessage::Text(text)),
            Err(_) => false,
        }
    }

    /// Next message the bridge wrote, heartbeat pings excluded when auto-pong is on.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.received.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WireMessage> {
        self.received.try_recv().ok()
    }

    /// Drops the connection from the backend side.
    pub fn close(&mut self) {
        self.sender = None;
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

struct MemoryInner {
    refuse: AtomicBool,
    auto_pong: AtomicBool,
    dials: AtomicUsize,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
}

/// Connector whose "server" lives in the same process.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
    peers: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MemoryInner {
                refuse: AtomicBool::new(false),
                auto_pong: AtomicBool::new(true),
                dials: AtomicUsize::new(0),
                accepted: tx,
            }),
            peers: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Makes subsequent dials fail with [`ConnectError::Refused`].
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        self.inner.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Number of dial attempts seen, refused ones included.
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Waits for the bridge to open a connection.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.peers.lock().await.recv().await
    }
}

#[async_trait]
impl BackendConnector for MemoryBackend {
    async fn connect(&self, headers: &[(String, String)]) -> Result<BackendSocket, ConnectError> {
        let index = self.inner.dials.fetch_add(1, Ordering::SeqCst);
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(ConnectError::Refused);
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        let responder = inbound_tx.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => break,
                    next = outbound_rx.recv() => {
                        let Some(message) = next else { break };
                        if inner.auto_pong.load(Ordering::SeqCst) {
                            if let Some(pong) = pong_for(&message) {
                                let _ = responder.send(pong);
                                continue;
                            }
                        }
                        let _ = received_tx.send(message);
                    }
                }
            }
        });

        let peer = MemoryPeer {
            index,
            headers: headers.to_vec(),
            received: received_rx,
            sender: Some(inbound_tx),
            close: Some(close_tx),
        };
        let _ = self.inner.accepted.send(peer);

        Ok(BackendSocket {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn pong_for(message: &WireMessage) -> Option<WireMessage> {
    let WireMessage::Text(text) = message else {
        return None;
    };
    let value = serde_json::from_str(text).ok()?;
    let frame = Frame::from_value(value).ok()?;
    if frame.kind() != FrameKind::Ping {
        return None;
    }
    Frame::pong_for(&frame).to_text().ok().map(WireMessage::Text)
}
