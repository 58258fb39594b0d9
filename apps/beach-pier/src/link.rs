use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use metrics::{counter, histogram};
use pier_proto::{
    AuthPayload, BinaryPayload, CodecConfig, DecodeError, Decoded, Frame, FrameKind,
    MessageCodec, WireMessage, OCTET_STREAM,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::liveness::{
    Disconnect, LinkState, LivenessAction, LivenessConfig, LivenessManager, Priority,
    QueuedMessage,
};
use crate::mirror::{Direction, FrameMirror};
use crate::session::SessionExtractor;

pub type LinkId = u64;
pub type ClientId = Uuid;

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
pub const CLOSE_BACKEND_CLOSED: u16 = 4001;
pub const CLOSE_LINK_FAILED: u16 = 4002;
pub const CLOSE_LINK_RETIRED: u16 = 4003;

/// What the bridge writes to a client socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Message(WireMessage),
    Close { code: u16, reason: String },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LinkOptions {
    pub liveness: LivenessConfig,
    pub codec: CodecConfig,
}

/// Write half of a backend socket as seen by a link.
pub trait BackendSink: Send {
    /// Hands the message back when the socket can no longer take it.
    fn send(&self, message: WireMessage) -> Result<(), WireMessage>;
    fn is_closed(&self) -> bool;
}

impl BackendSink for mpsc::UnboundedSender<WireMessage> {
    fn send(&self, message: WireMessage) -> Result<(), WireMessage> {
        mpsc::UnboundedSender::send(self, message).map_err(|err| err.0)
    }

    fn is_closed(&self) -> bool {
        mpsc::UnboundedSender::is_closed(self)
    }
}

struct ClientEntry {
    outbound: mpsc::UnboundedSender<Outbound>,
    session_id: Option<String>,
    codec: MessageCodec,
}

/// One persistent connection to the backend plus the clients riding on it.
///
/// The link never migrates clients: when its socket goes away every attached
/// client is closed and the link reconnects empty.
pub struct BackendLink {
    id: LinkId,
    generation: u64,
    socket: Option<Box<dyn BackendSink>>,
    liveness: LivenessManager,
    clients: HashMap<ClientId, ClientEntry>,
    active_session: Option<String>,
    codec: MessageCodec,
    mirror: FrameMirror,
}

impl BackendLink {
    pub fn new(id: LinkId, options: LinkOptions, mirror: FrameMirror) -> Self {
        Self {
            id,
            generation: 0,
            socket: None,
            liveness: LivenessManager::new(options.liveness),
            clients: HashMap::new(),
            active_session: None,
            codec: MessageCodec::new(options.codec),
            mirror,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> LinkState {
        self.liveness.state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.liveness.attempts()
    }

    pub fn queued_messages(&self) -> usize {
        self.liveness.queued()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn has_client(&self, client_id: &ClientId) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn active_session(&self) -> Option<&str> {
        self.active_session.as_deref()
    }

    pub fn set_active_session(&mut self, session_id: Option<String>) {
        if session_id.is_some() {
            self.active_session = session_id;
        }
    }

    /// Health probe: is the backend socket still writable.
    pub fn is_open(&self) -> bool {
        self.socket
            .as_ref()
            .map(|socket| !socket.is_closed())
            .unwrap_or(false)
    }

    pub fn is_dialing(&self) -> bool {
        self.liveness.state() == LinkState::Connecting
    }

    pub fn heartbeat_overdue(&self, now: Instant) -> bool {
        self.liveness.heartbeat_overdue(now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.liveness.next_deadline()
    }

    /// Starts a dial; results tagged with an older generation are ignored.
    pub fn begin_connect(&mut self) -> u64 {
        self.liveness.begin_connect();
        self.generation += 1;
        self.generation
    }

    /// Abandons any socket and backoff and dials again from a clean counter.
    pub fn restart(&mut self) -> u64 {
        self.socket = None;
        self.liveness.restart();
        self.generation += 1;
        self.generation
    }

    /// Installs a freshly dialed socket and flushes anything queued meanwhile.
    pub fn on_connected(
        &mut self,
        generation: u64,
        socket: impl BackendSink + 'static,
        now: Instant,
    ) -> bool {
        if generation != self.generation || self.liveness.state() != LinkState::Connecting {
            return false;
        }
        let queued = self.liveness.on_connected(now);
        self.socket = Some(Box::new(socket));
        info!(
            link_id = self.id,
            generation,
            flushed = queued.len(),
            "backend link connected"
        );

        let mut pending = queued.into_iter();
        while let Some(entry) = pending.next() {
            if let Err(message) = self.send_to_backend(entry.message.clone()) {
                let mut rest = vec![QueuedMessage { message, ..entry }];
                rest.extend(pending);
                warn!(
                    link_id = self.id,
                    remaining = rest.len(),
                    "flush interrupted; requeueing"
                );
                self.liveness.requeue_front(rest, now);
                break;
            }
        }
        true
    }

    /// A dial for this generation failed or timed out.
    pub fn on_connect_failed(
        &mut self,
        generation: u64,
        now: Instant,
    ) -> (Disconnect, Vec<ClientId>) {
        if generation != self.generation {
            return (Disconnect::Ignored, Vec::new());
        }
        self.socket = None;
        let outcome = self.liveness.on_disconnect(now);
        let closed = match outcome {
            Disconnect::Failed => self.evict_clients(CLOSE_LINK_FAILED, "backend link failed"),
            _ => Vec::new(),
        };
        (outcome, closed)
    }

    /// The backend side of the socket went away.
    pub fn on_backend_closed(
        &mut self,
        generation: u64,
        now: Instant,
    ) -> (Disconnect, Vec<ClientId>) {
        if generation != self.generation || self.socket.is_none() {
            return (Disconnect::Ignored, Vec::new());
        }
        self.socket = None;
        warn!(
            link_id = self.id,
            clients = self.clients.len(),
            "backend closed link; closing attached clients"
        );
        let closed = self.evict_clients(CLOSE_BACKEND_CLOSED, "backend closed");
        (self.liveness.on_disconnect(now), closed)
    }

    /// Tears the link down for good.
    pub fn close(&mut self, code: u16, reason: &str) -> Vec<ClientId> {
        self.liveness.close();
        self.socket = None;
        self.evict_clients(code, reason)
    }

    /// Closes and detaches every client while keeping the link itself.
    pub fn evict_clients(&mut self, code: u16, reason: &str) -> Vec<ClientId> {
        let mut closed = Vec::with_capacity(self.clients.len());
        for (client_id, client) in self.clients.drain() {
            let _ = client.outbound.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
            closed.push(client_id);
        }
        closed
    }

    pub fn add_client(
        &mut self,
        client_id: ClientId,
        outbound: mpsc::UnboundedSender<Outbound>,
        session_id: Option<String>,
        codec: CodecConfig,
    ) {
        if self.active_session.is_none() {
            self.active_session = session_id.clone();
        }
        self.clients.insert(
            client_id,
            ClientEntry {
                outbound,
                session_id,
                codec: MessageCodec::new(codec),
            },
        );
    }

    pub fn remove_client(&mut self, client_id: &ClientId) -> bool {
        self.clients.remove(client_id).is_some()
    }

    /// Runs due heartbeat and reconnect timers. Returns true when a redial is due.
    pub fn poll(&mut self, now: Instant) -> bool {
        let mut redial = false;
        for action in self.liveness.poll(now) {
            match action {
                LivenessAction::SendPing => {
                    let ping = Frame::ping(now_millis());
                    if let Ok(text) = ping.to_text() {
                        if self.send_to_backend(WireMessage::Text(text)).is_err() {
                            debug!(link_id = self.id, "heartbeat ping not sent; socket closed");
                        }
                    }
                }
                LivenessAction::Redial => redial = true,
            }
        }
        redial
    }

    /// Purges stale chunk transfers on the link and on every client.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let now = now.into_std();
        let mut expired = self.codec.sweep(now).len();
        for client in self.clients.values_mut() {
            expired += client.codec.sweep(now).len();
        }
        if expired > 0 {
            counter!("pier_chunks_expired_total", expired as u64);
        }
        expired
    }

    fn send_to_backend(&self, message: WireMessage) -> Result<(), WireMessage> {
        match &self.socket {
            Some(socket) => socket.send(message),
            None => Err(message),
        }
    }

    pub fn handle_client_message(
        &mut self,
        client_id: ClientId,
        raw: WireMessage,
        now: Instant,
        sessions: &mut SessionExtractor,
    ) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        let decoded = client.codec.decode(&raw, now.into_std());
        match decoded {
            Err(err) => self.reject_client_frame(client_id, None, &err),
            Ok(Decoded::Frame(frame)) => self.route_client_frame(client_id, frame, now, sessions),
            Ok(Decoded::Incomplete {
                message_id,
                received,
                total,
            }) => {
                debug!(
                    link_id = self.id,
                    client_id = %client_id,
                    message_id = %message_id,
                    received,
                    total,
                    "buffered client chunk"
                );
            }
            Ok(Decoded::Completed { frame, bytes }) => {
                if bytes.len() > self.codec.config().max_chunk_size {
                    let (content_type, metadata) = binary_meta(&frame);
                    self.forward_chunks(client_id, &bytes, &content_type, metadata, now);
                } else {
                    self.route_client_frame(client_id, frame, now, sessions);
                }
            }
            Ok(Decoded::Oversized(bytes)) => {
                self.forward_chunks(client_id, &bytes, OCTET_STREAM, None, now);
            }
        }
    }

    fn route_client_frame(
        &mut self,
        client_id: ClientId,
        mut frame: Frame,
        now: Instant,
        sessions: &mut SessionExtractor,
    ) {
        let kind = match frame.kind() {
            FrameKind::Ping => Route::Ping,
            FrameKind::Auth => Route::Auth,
            _ => Route::Forward,
        };
        match kind {
            Route::Ping => {
                let pong = Frame::pong_for(&frame);
                self.send_frame_to_client(client_id, &pong);
            }
            Route::Auth => {
                let auth: AuthPayload = match frame.payload_as() {
                    Ok(auth) => auth,
                    Err(err) => {
                        self.reject_client_frame(client_id, frame.id.clone(), &err);
                        return;
                    }
                };
                if let Some(session_id) = sessions.record_auth(&auth, now) {
                    if let Some(client) = self.clients.get_mut(&client_id) {
                        client.session_id = Some(session_id.clone());
                    }
                    self.active_session = Some(session_id);
                }
                self.forward_frame(client_id, &frame, Priority::High, now);
            }
            Route::Forward => {
                let session = self
                    .clients
                    .get(&client_id)
                    .and_then(|client| client.session_id.clone())
                    .or_else(|| self.active_session.clone());
                if let Some(session_id) = &session {
                    sessions.touch(session_id, now);
                }
                frame.set_session(session);
                self.forward_frame(client_id, &frame, Priority::Normal, now);
            }
        }
    }

    fn forward_frame(
        &mut self,
        client_id: ClientId,
        frame: &Frame,
        priority: Priority,
        now: Instant,
    ) {
        let message = match self.codec.encode(frame) {
            Ok(message) => message,
            Err(err) => {
                self.reply_error(client_id, frame.id.clone(), "ENCODE_FAILED", &err.to_string());
                return;
            }
        };
        self.mirror.record_frame(
            Direction::ClientToBackend,
            self.id,
            Some(client_id),
            Some(&frame.frame_type),
            message.len(),
        );
        let size = message.len();

        if self.liveness.state() != LinkState::Connected || self.socket.is_none() {
            self.enqueue(client_id, frame.id.clone(), message, priority, now);
            return;
        }
        match self.send_to_backend(message) {
            Ok(()) => record_relayed(Direction::ClientToBackend, size),
            Err(_) => {
                warn!(link_id = self.id, client_id = %client_id, "forward to backend failed");
                self.reply_error(
                    client_id,
                    frame.id.clone(),
                    "FORWARD_FAILED",
                    "backend link is unavailable",
                );
            }
        }
    }

    fn enqueue(
        &mut self,
        client_id: ClientId,
        request_id: Option<Value>,
        message: WireMessage,
        priority: Priority,
        now: Instant,
    ) {
        if self.liveness.queue_message(message, priority, now).is_err() {
            self.reply_error(client_id, request_id, "QUEUE_FULL", "backend link queue is full");
        } else {
            debug!(
                link_id = self.id,
                client_id = %client_id,
                queued = self.liveness.queued(),
                "queued message while disconnected"
            );
        }
    }

    /// Sends an oversized payload as ordered chunks; whatever cannot be sent is queued in order.
    fn forward_chunks(
        &mut self,
        client_id: ClientId,
        bytes: &Bytes,
        content_type: &str,
        metadata: Option<Value>,
        now: Instant,
    ) {
        let frames = match self.codec.create_chunks(bytes, content_type, metadata) {
            Ok(frames) => frames,
            Err(err) => {
                self.reject_client_frame(client_id, None, &err);
                return;
            }
        };
        let session = self
            .clients
            .get(&client_id)
            .and_then(|client| client.session_id.clone())
            .or_else(|| self.active_session.clone());

        let mut encoded = Vec::with_capacity(frames.len());
        for mut frame in frames {
            frame.set_session(session.clone());
            match self.codec.encode(&frame) {
                Ok(message) => encoded.push(message),
                Err(err) => {
                    self.reply_error(client_id, None, "ENCODE_FAILED", &err.to_string());
                    return;
                }
            }
        }
        histogram!("pier_chunk_sequence_len", encoded.len() as f64);

        let mut pending = encoded.into_iter();
        while let Some(message) = pending.next() {
            let size = message.len();
            self.mirror.record_frame(
                Direction::ClientToBackend,
                self.id,
                Some(client_id),
                Some(pier_proto::frame::CHUNKED_DATA),
                size,
            );
            let connected = self.liveness.state() == LinkState::Connected;
            let unsent = if connected {
                match self.send_to_backend(message) {
                    Ok(()) => {
                        record_relayed(Direction::ClientToBackend, size);
                        continue;
                    }
                    Err(message) => {
                        warn!(
                            link_id = self.id,
                            client_id = %client_id,
                            "backend send failed mid-transfer"
                        );
                        self.reply_error(
                            client_id,
                            None,
                            "FORWARD_FAILED",
                            "backend link dropped mid-transfer; remaining chunks queued",
                        );
                        message
                    }
                }
            } else {
                message
            };
            let remainder: Vec<WireMessage> = std::iter::once(unsent).chain(pending).collect();
            debug!(
                link_id = self.id,
                client_id = %client_id,
                remaining = remainder.len(),
                "queueing unsent chunks"
            );
            for message in remainder {
                self.enqueue(client_id, None, message, Priority::Normal, now);
            }
            break;
        }
    }

    pub fn handle_backend_message(
        &mut self,
        raw: WireMessage,
        now: Instant,
        sessions: &mut SessionExtractor,
    ) {
        let decoded = self.codec.decode(&raw, now.into_std());
        match decoded {
            Err(err) => {
                counter!(
                    "pier_frames_rejected_total", 1,
                    "reason" => err.metric_label(),
                    "source" => "backend"
                );
                warn!(link_id = self.id, error = %err, "rejected backend frame");
                if err.reply_to_sender() {
                    let reply = Frame::error(None, err.error_type(), err.to_string());
                    if let Ok(text) = reply.to_text() {
                        let _ = self.send_to_backend(WireMessage::Text(text));
                    }
                }
            }
            Ok(Decoded::Frame(frame)) => match frame.kind() {
                FrameKind::Pong => self.liveness.record_pong(now),
                FrameKind::Ping => {
                    if let Ok(text) = Frame::pong_for(&frame).to_text() {
                        let _ = self.send_to_backend(WireMessage::Text(text));
                    }
                }
                kind => {
                    if kind == FrameKind::Auth {
                        if let Ok(auth) = frame.payload_as::<AuthPayload>() {
                            if let Some(session_id) = sessions.record_auth(&auth, now) {
                                self.active_session = Some(session_id);
                            }
                        }
                    }
                    let outbound = match raw {
                        WireMessage::Text(_) => raw,
                        WireMessage::Binary(_) => match self.codec.encode(&frame) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!(
                                    link_id = self.id,
                                    error = %err,
                                    "failed to re-encode backend frame"
                                );
                                return;
                            }
                        },
                    };
                    self.relay(outbound, Some(&frame.frame_type));
                }
            },
            Ok(Decoded::Incomplete {
                message_id,
                received,
                total,
            }) => {
                debug!(
                    link_id = self.id,
                    message_id = %message_id,
                    received,
                    total,
                    "buffered backend chunk"
                );
            }
            Ok(Decoded::Completed { frame, bytes }) => {
                if bytes.len() > self.codec.config().max_chunk_size {
                    let (content_type, metadata) = binary_meta(&frame);
                    self.relay_chunks(&bytes, &content_type, metadata);
                } else {
                    match self.codec.encode(&frame) {
                        Ok(message) => self.relay(message, Some(&frame.frame_type)),
                        Err(err) => warn!(
                            link_id = self.id,
                            error = %err,
                            "failed to encode reassembled frame"
                        ),
                    }
                }
            }
            Ok(Decoded::Oversized(bytes)) => self.relay_chunks(&bytes, OCTET_STREAM, None),
        }
    }

    fn relay_chunks(&mut self, bytes: &Bytes, content_type: &str, metadata: Option<Value>) {
        let frames = match self.codec.create_chunks(bytes, content_type, metadata) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(link_id = self.id, error = %err, "failed to chunk backend payload");
                return;
            }
        };
        for frame in frames {
            match self.codec.encode(&frame) {
                Ok(message) => self.relay(message, Some(&frame.frame_type)),
                Err(err) => {
                    warn!(link_id = self.id, error = %err, "failed to encode chunk");
                    return;
                }
            }
        }
    }

    /// Fans a backend message out to every attached client in receipt order.
    fn relay(&mut self, message: WireMessage, frame_type: Option<&str>) {
        let size = message.len();
        let mut gone = Vec::new();
        for (client_id, client) in &self.clients {
            if client
                .outbound
                .send(Outbound::Message(message.clone()))
                .is_err()
            {
                gone.push(*client_id);
                continue;
            }
            record_relayed(Direction::BackendToClient, size);
            self.mirror.record_frame(
                Direction::BackendToClient,
                self.id,
                Some(*client_id),
                frame_type,
                size,
            );
        }
        for client_id in gone {
            debug!(link_id = self.id, client_id = %client_id, "evicting closed client");
            self.clients.remove(&client_id);
        }
    }

    fn send_frame_to_client(&self, client_id: ClientId, frame: &Frame) {
        let Some(client) = self.clients.get(&client_id) else {
            return;
        };
        if let Ok(text) = frame.to_text() {
            let _ = client.outbound.send(Outbound::Message(WireMessage::Text(text)));
        }
    }

    fn reject_client_frame(
        &self,
        client_id: ClientId,
        request_id: Option<Value>,
        err: &DecodeError,
    ) {
        counter!(
            "pier_frames_rejected_total", 1,
            "reason" => err.metric_label(),
            "source" => "client"
        );
        if !err.reply_to_sender() {
            warn!(
                link_id = self.id,
                client_id = %client_id,
                error = %err,
                "dropping unparseable client message"
            );
            return;
        }
        debug!(link_id = self.id, client_id = %client_id, error = %err, "rejected client frame");
        self.reply_error(client_id, request_id, err.error_type(), &err.to_string());
    }

    fn reply_error(
        &self,
        client_id: ClientId,
        request_id: Option<Value>,
        error_type: &str,
        message: &str,
    ) {
        self.send_frame_to_client(client_id, &Frame::error(request_id, error_type, message));
    }
}

#[derive(Clone, Copy)]
enum Route {
    Ping,
    Auth,
    Forward,
}

fn binary_meta(frame: &Frame) -> (String, Option<Value>) {
    match frame.payload_as::<BinaryPayload>() {
        Ok(payload) => (payload.content_type, payload.metadata),
        Err(_) => (OCTET_STREAM.to_string(), None),
    }
}

fn record_relayed(direction: Direction, bytes: usize) {
    counter!("pier_frames_relayed_total", 1, "direction" => direction.label());
    counter!("pier_bytes_relayed_total", bytes as u64, "direction" => direction.label());
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
