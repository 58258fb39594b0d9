//! The connection pool and the event loop that owns it.
//!
//! Every link, client registration, codec and the session cache live inside a
//! single tokio task. Everything else talks to it through [`PoolHandle`]
//! commands or, for backend sockets, [`BackendEvent`]s.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use pier_proto::WireMessage;
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{BackendConnector, BackendSocket, ConnectError};
use crate::link::{
    BackendLink, ClientId, LinkId, LinkOptions, Outbound, CLOSE_GOING_AWAY, CLOSE_LINK_FAILED,
    CLOSE_LINK_RETIRED,
};
use crate::liveness::{Disconnect, LinkState};
use crate::mirror::FrameMirror;
use crate::session::{SessionConfig, SessionExtractor};

/// Consecutive failed probes before a link is treated as unhealthy.
pub const UNHEALTHY_AFTER: u32 = 3;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const COMMAND_DEPTH: usize = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancePolicy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
}

impl FromStr for BalancePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" => Ok(BalancePolicy::RoundRobin),
            "least-connections" | "least_connections" => Ok(BalancePolicy::LeastConnections),
            "random" => Ok(BalancePolicy::Random),
            other => Err(format!(
                "unknown balance policy {other:?} \
                 (expected round-robin, least-connections or random)"
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    /// Links dialed at startup; between `min_connections` and `max_connections`.
    pub initial_connections: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
    pub breaker_threshold: u32,
    pub breaker_reset: Duration,
    pub degraded_max_clients: usize,
    pub balance: BalancePolicy,
    pub link: LinkOptions,
    pub session: SessionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            initial_connections: 2,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            breaker_threshold: 5,
            breaker_reset: Duration::from_secs(60),
            degraded_max_clients: 50,
            balance: BalancePolicy::RoundRobin,
            link: LinkOptions::default(),
            session: SessionConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfig("max_connections must be at least 1".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.initial_connections < self.min_connections
            || self.initial_connections > self.max_connections
        {
            return Err(PoolError::InvalidConfig(format!(
                "initial_connections ({}) must lie within [{}, {}]",
                self.initial_connections, self.min_connections, self.max_connections
            )));
        }
        if self.breaker_threshold == 0 {
            return Err(PoolError::InvalidConfig("breaker_threshold must be at least 1".into()));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "health_check_interval must be non-zero".into(),
            ));
        }
        if self.link.liveness.heartbeat_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "heartbeat_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to open startup link {index}: {source}")]
    Initialize {
        index: usize,
        #[source]
        source: ConnectError,
    },
    #[error("pool is closed")]
    Closed,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("pool is degraded and at its client cap")]
    DegradedCapacity,
    #[error("no backend link available")]
    NoLinkAvailable,
    #[error("pool is shutting down")]
    PoolClosed,
}

impl AdmissionError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            AdmissionError::CircuitOpen => "circuit_open",
            AdmissionError::DegradedCapacity => "degraded_capacity",
            AdmissionError::NoLinkAvailable => "no_link_available",
            AdmissionError::PoolClosed => "pool_closed",
        }
    }

    /// `type` of the `ERROR` frame sent before the socket is closed.
    pub fn error_type(&self) -> &'static str {
        match self {
            AdmissionError::CircuitOpen => "CIRCUIT_OPEN",
            AdmissionError::DegradedCapacity => "DEGRADED_CAPACITY",
            AdmissionError::NoLinkAvailable => "NO_LINK_AVAILABLE",
            AdmissionError::PoolClosed => "POOL_CLOSED",
        }
    }
}

/// Failure counter guarding admissions.
///
/// The reset window is only looked at when an admission asks, so an idle
/// pool keeps reporting the breaker as open after the window has passed.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_after: Duration,
    failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_after,
            failures: 0,
            opened_at: None,
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        match self.opened_at {
            None => true,
            Some(opened) if now.saturating_duration_since(opened) >= self.reset_after => {
                info!(failures = self.failures, "circuit breaker reset window elapsed; closing");
                self.opened_at = None;
                self.failures = 0;
                true
            }
            Some(_) => false,
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        if self.opened_at.is_none() && self.failures >= self.threshold {
            self.opened_at = Some(now);
            counter!("pier_breaker_open_total", 1);
            warn!(failures = self.failures, "circuit breaker opened");
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStats {
    pub link_id: LinkId,
    pub state: LinkState,
    pub health: LinkHealth,
    pub clients: usize,
    pub queued_messages: usize,
    pub reconnect_attempts: u32,
    pub consecutive_failures: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last moment the link carried at least one client.
    #[serde(with = "time::serde::rfc3339")]
    pub last_used_at: OffsetDateTime,
    pub idle_secs: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_connections: usize,
    pub healthy_connections: usize,
    pub degraded_connections: usize,
    pub unhealthy_connections: usize,
    pub total_clients: usize,
    pub degraded_mode: bool,
    pub circuit_breaker_open: bool,
    pub links: Vec<LinkStats>,
}

/// What the HTTP layer hands over when a client socket is upgraded.
#[derive(Debug)]
pub struct ClientRequest {
    pub cookie: Option<String>,
    pub query: Option<String>,
    pub outbound: mpsc::UnboundedSender<Outbound>,
}

type AdmissionReply = oneshot::Sender<Result<ClientId, AdmissionError>>;

enum Command {
    AddClient {
        request: ClientRequest,
        reply: AdmissionReply,
    },
    ClientMessage {
        client_id: ClientId,
        message: WireMessage,
    },
    ClientClosed {
        client_id: ClientId,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Posted into the loop by dial tasks and backend reader pumps.
pub enum BackendEvent {
    Dialed {
        link_id: LinkId,
        generation: u64,
        result: Result<BackendSocket, ConnectError>,
    },
    Message {
        link_id: LinkId,
        generation: u64,
        message: WireMessage,
    },
    Closed {
        link_id: LinkId,
        generation: u64,
    },
}

#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::Sender<Command>,
    stats: Arc<RwLock<PoolStats>>,
}

impl PoolHandle {
    /// Resolves once the client is attached to a link or rejected.
    pub async fn add_client(&self, request: ClientRequest) -> Result<ClientId, AdmissionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::AddClient { request, reply })
            .await
            .map_err(|_| AdmissionError::PoolClosed)?;
        rx.await.unwrap_or(Err(AdmissionError::PoolClosed))
    }

    pub async fn client_message(
        &self,
        client_id: ClientId,
        message: WireMessage,
    ) -> Result<(), PoolError> {
        self.commands
            .send(Command::ClientMessage { client_id, message })
            .await
            .map_err(|_| PoolError::Closed)
    }

    pub async fn client_closed(&self, client_id: ClientId) -> Result<(), PoolError> {
        self.commands
            .send(Command::ClientClosed { client_id })
            .await
            .map_err(|_| PoolError::Closed)
    }

    /// Last snapshot published by the loop.
    pub fn stats(&self) -> PoolStats {
        self.stats.read().clone()
    }

    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { ack })
            .await
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }
}

/// Dials the startup links and spawns the pool loop.
///
/// Fails without starting anything if any startup link cannot connect within
/// the connect timeout.
pub async fn start(
    config: PoolConfig,
    connector: Arc<dyn BackendConnector>,
    mirror: FrameMirror,
) -> Result<(PoolHandle, JoinHandle<()>), PoolError> {
    config.validate()?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut pool = Pool::new(config, connector, mirror, events_tx);
    pool.initialize().await?;

    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_DEPTH);
    let handle = PoolHandle {
        commands: commands_tx,
        stats: Arc::clone(&pool.snapshot),
    };
    let task = tokio::spawn(pool.run(commands_rx, events_rx));
    Ok((handle, task))
}

struct PendingClient {
    client_id: ClientId,
    session_id: Option<String>,
    outbound: mpsc::UnboundedSender<Outbound>,
    reply: AdmissionReply,
}

struct PooledLink {
    link: BackendLink,
    health: LinkHealth,
    consecutive_failures: u32,
    created_at: Instant,
    /// Refreshed while clients are attached; the idle clock runs from here.
    last_used_at: Instant,
    /// Whether the previous refresh saw any attached client.
    had_clients: bool,
    /// False until the first dial succeeds.
    established: bool,
    /// Set while an in-place recovery dial is outstanding.
    recovering: bool,
}

impl PooledLink {
    fn new(link: BackendLink, established: bool, now: Instant) -> Self {
        Self {
            link,
            health: LinkHealth::Healthy,
            consecutive_failures: 0,
            created_at: now,
            last_used_at: now,
            had_clients: false,
            established,
            recovering: false,
        }
    }

    fn is_healthy(&self) -> bool {
        self.established
            && self.health == LinkHealth::Healthy
            && self.link.state() == LinkState::Connected
    }

    fn idle_deadline(&self, idle_timeout: Duration) -> Option<Instant> {
        if !self.established || self.link.client_count() > 0 {
            return None;
        }
        Some(self.last_used_at + idle_timeout)
    }

    fn touch(&mut self, now: Instant) {
        self.last_used_at = now;
    }

    fn stats(&self, now: Instant) -> LinkStats {
        let wall = OffsetDateTime::now_utc();
        let at = |instant: Instant| wall - now.saturating_duration_since(instant);
        let idle = self.link.client_count() == 0;
        LinkStats {
            link_id: self.link.id(),
            state: self.link.state(),
            health: self.health,
            clients: self.link.client_count(),
            queued_messages: self.link.queued_messages(),
            reconnect_attempts: self.link.reconnect_attempts(),
            consecutive_failures: self.consecutive_failures,
            created_at: at(self.created_at),
            last_used_at: at(self.last_used_at),
            idle_secs: idle.then(|| now.saturating_duration_since(self.last_used_at).as_secs()),
        }
    }
}

struct Pool {
    config: PoolConfig,
    connector: Arc<dyn BackendConnector>,
    mirror: FrameMirror,
    events: mpsc::UnboundedSender<BackendEvent>,
    links: HashMap<LinkId, PooledLink>,
    waiting: HashMap<LinkId, Vec<PendingClient>>,
    clients: HashMap<ClientId, LinkId>,
    sessions: SessionExtractor,
    breaker: CircuitBreaker,
    next_link_id: LinkId,
    cursor: usize,
    degraded: bool,
    next_health_check: Instant,
    next_sweep: Instant,
    snapshot: Arc<RwLock<PoolStats>>,
}

impl Pool {
    fn new(
        config: PoolConfig,
        connector: Arc<dyn BackendConnector>,
        mirror: FrameMirror,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Self {
        let now = Instant::now();
        Self {
            sessions: SessionExtractor::new(config.session.clone()),
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_reset),
            next_health_check: now + config.health_check_interval,
            next_sweep: now + SWEEP_INTERVAL,
            config,
            connector,
            mirror,
            events,
            links: HashMap::new(),
            waiting: HashMap::new(),
            clients: HashMap::new(),
            next_link_id: 1,
            cursor: 0,
            degraded: false,
            snapshot: Arc::new(RwLock::new(PoolStats::default())),
        }
    }

    async fn initialize(&mut self) -> Result<(), PoolError> {
        let count = self.config.initial_connections;
        let timeout = self.config.connect_timeout;
        let ids: Vec<LinkId> = (0..count).map(|_| self.allocate_link_id()).collect();
        for link_id in &ids {
            self.mirror.record_handshake(*link_id, &[]);
        }

        let dials = ids.iter().enumerate().map(|(index, _)| {
            let connector = Arc::clone(&self.connector);
            async move {
                match tokio::time::timeout(timeout, connector.connect(&[])).await {
                    Ok(Ok(socket)) => Ok(socket),
                    Ok(Err(source)) => Err(PoolError::Initialize { index, source }),
                    Err(_) => Err(PoolError::Initialize {
                        index,
                        source: ConnectError::Timeout(timeout),
                    }),
                }
            }
        });
        let sockets = try_join_all(dials).await?;

        let now = Instant::now();
        for (link_id, socket) in ids.into_iter().zip(sockets) {
            let mut link = BackendLink::new(link_id, self.config.link, self.mirror.clone());
            let generation = link.begin_connect();
            let BackendSocket { outbound, inbound } = socket;
            link.on_connected(generation, outbound, now);
            self.links.insert(link_id, PooledLink::new(link, true, now));
            self.spawn_reader(link_id, generation, inbound);
        }
        info!(
            links = count,
            min = self.config.min_connections,
            max = self.config.max_connections,
            "backend pool initialized"
        );
        self.refresh(now);
        Ok(())
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<BackendEvent>,
    ) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command, Instant::now()) {
                            break;
                        }
                    }
                    None => {
                        debug!("all pool handles dropped");
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event, Instant::now()),
                _ = tokio::time::sleep_until(deadline) => self.tick(Instant::now()),
            }
            self.refresh(Instant::now());
        }
        info!("pool loop stopped");
    }

    fn allocate_link_id(&mut self) -> LinkId {
        let id = self.next_link_id;
        self.next_link_id += 1;
        id
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.next_health_check.min(self.next_sweep);
        for pooled in self.links.values() {
            if let Some(due) = pooled.link.next_deadline() {
                deadline = deadline.min(due);
            }
        }
        if self.links.len() > self.config.min_connections {
            for pooled in self.links.values() {
                if let Some(due) = pooled.idle_deadline(self.config.idle_timeout) {
                    deadline = deadline.min(due);
                }
            }
        }
        deadline
    }

    fn handle_command(&mut self, command: Command, now: Instant) -> bool {
        match command {
            Command::AddClient { request, reply } => self.admit(request, reply, now),
            Command::ClientMessage { client_id, message } => {
                let Some(link_id) = self.clients.get(&client_id).copied() else {
                    debug!(client_id = %client_id, "message from unregistered client dropped");
                    return true;
                };
                if let Some(pooled) = self.links.get_mut(&link_id) {
                    pooled.touch(now);
                    pooled
                        .link
                        .handle_client_message(client_id, message, now, &mut self.sessions);
                }
            }
            Command::ClientClosed { client_id } => self.detach(client_id),
            Command::Shutdown { ack } => {
                self.shutdown();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn admit(&mut self, request: ClientRequest, reply: AdmissionReply, now: Instant) {
        if !self.breaker.allow(now) {
            self.reject(reply, AdmissionError::CircuitOpen);
            return;
        }
        if self.degraded && self.clients.len() >= self.config.degraded_max_clients {
            self.reject(reply, AdmissionError::DegradedCapacity);
            return;
        }

        let session_id =
            self.sessions
                .extract(request.cookie.as_deref(), request.query.as_deref(), now);
        let pending = PendingClient {
            client_id: Uuid::new_v4(),
            session_id,
            outbound: request.outbound,
            reply,
        };

        if let Some(link_id) = self.select_link() {
            self.attach(link_id, pending, now);
            return;
        }
        if let Some(link_id) = self.first_dial_in_flight() {
            debug!(link_id, client_id = %pending.client_id, "client waiting on link dial");
            self.waiting.entry(link_id).or_default().push(pending);
            return;
        }
        if self.links.len() < self.config.max_connections {
            let link_id = self.open_link(pending.session_id.clone());
            self.waiting.entry(link_id).or_default().push(pending);
            return;
        }

        self.breaker.record_failure(now);
        self.reject(pending.reply, AdmissionError::NoLinkAvailable);
    }

    fn reject(&self, reply: AdmissionReply, err: AdmissionError) {
        counter!("pier_admissions_total", 1, "result" => err.metric_label());
        warn!(reason = err.metric_label(), "client admission rejected");
        let _ = reply.send(Err(err));
    }

    fn select_link(&mut self) -> Option<LinkId> {
        let mut candidates: Vec<(LinkId, usize)> = self
            .links
            .iter()
            .filter(|(_, pooled)| pooled.is_healthy())
            .map(|(id, pooled)| (*id, pooled.link.client_count()))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_unstable_by_key(|(id, _)| *id);
        match self.config.balance {
            BalancePolicy::RoundRobin => {
                let pick = candidates[self.cursor % candidates.len()].0;
                self.cursor = self.cursor.wrapping_add(1);
                Some(pick)
            }
            BalancePolicy::LeastConnections => candidates
                .iter()
                .min_by_key(|(id, clients)| (*clients, *id))
                .map(|(id, _)| *id),
            BalancePolicy::Random => candidates
                .choose(&mut rand::thread_rng())
                .map(|(id, _)| *id),
        }
    }

    fn first_dial_in_flight(&self) -> Option<LinkId> {
        self.links
            .iter()
            .filter(|(_, pooled)| !pooled.established && pooled.link.is_dialing())
            .map(|(id, _)| *id)
            .min()
    }

    fn attach(&mut self, link_id: LinkId, pending: PendingClient, now: Instant) {
        let PendingClient {
            client_id,
            session_id,
            outbound,
            reply,
        } = pending;
        let Some(pooled) = self.links.get_mut(&link_id) else {
            let _ = reply.send(Err(AdmissionError::NoLinkAvailable));
            return;
        };
        pooled
            .link
            .add_client(client_id, outbound, session_id.clone(), self.config.link.codec);
        pooled.touch(now);

        if reply.send(Ok(client_id)).is_err() {
            debug!(client_id = %client_id, "client went away during admission");
            pooled.link.remove_client(&client_id);
            return;
        }
        self.clients.insert(client_id, link_id);
        self.breaker.record_success();
        counter!("pier_admissions_total", 1, "result" => "accepted");
        info!(
            client_id = %client_id,
            link_id,
            session_id = ?session_id,
            "client attached"
        );
    }

    fn detach(&mut self, client_id: ClientId) {
        let Some(link_id) = self.clients.remove(&client_id) else {
            return;
        };
        if let Some(pooled) = self.links.get_mut(&link_id) {
            pooled.link.remove_client(&client_id);
            debug!(
                client_id = %client_id,
                link_id,
                remaining = pooled.link.client_count(),
                "client detached"
            );
        }
    }

    fn forget_clients(&mut self, closed: &[ClientId]) {
        for client_id in closed {
            self.clients.remove(client_id);
        }
    }

    /// Creates a link and starts its first dial. The pool owns it from here on.
    fn open_link(&mut self, session_id: Option<String>) -> LinkId {
        let link_id = self.allocate_link_id();
        let mut link = BackendLink::new(link_id, self.config.link, self.mirror.clone());
        link.set_active_session(session_id);
        let generation = link.begin_connect();
        self.links.insert(link_id, PooledLink::new(link, false, Instant::now()));
        info!(link_id, total = self.links.len(), "opening backend link");
        self.dial(link_id, generation);
        link_id
    }

    fn dial(&self, link_id: LinkId, generation: u64) {
        let Some(pooled) = self.links.get(&link_id) else {
            return;
        };
        let headers = self.sessions.backend_headers(pooled.link.active_session());
        self.mirror.record_handshake(link_id, &headers);
        debug!(link_id, generation, headers = headers.len(), "dialing backend");

        let connector = Arc::clone(&self.connector);
        let events = self.events.clone();
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(&headers)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout(timeout)),
            };
            let _ = events.send(BackendEvent::Dialed {
                link_id,
                generation,
                result,
            });
        });
    }

    fn spawn_reader(
        &self,
        link_id: LinkId,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<WireMessage>,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let event = BackendEvent::Message {
                    link_id,
                    generation,
                    message,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            let _ = events.send(BackendEvent::Closed {
                link_id,
                generation,
            });
        });
    }

    fn handle_event(&mut self, event: BackendEvent, now: Instant) {
        match event {
            BackendEvent::Dialed {
                link_id,
                generation,
                result,
            } => self.on_dialed(link_id, generation, result, now),
            BackendEvent::Message {
                link_id,
                generation,
                message,
            } => {
                if let Some(pooled) = self.links.get_mut(&link_id) {
                    if pooled.link.generation() == generation {
                        pooled
                            .link
                            .handle_backend_message(message, now, &mut self.sessions);
                    }
                }
            }
            BackendEvent::Closed {
                link_id,
                generation,
            } => {
                let Some(pooled) = self.links.get_mut(&link_id) else {
                    return;
                };
                let (outcome, closed) = pooled.link.on_backend_closed(generation, now);
                if outcome != Disconnect::Ignored {
                    warn!(link_id, outcome = ?outcome, "backend socket closed");
                }
                self.forget_clients(&closed);
            }
        }
    }

    fn on_dialed(
        &mut self,
        link_id: LinkId,
        generation: u64,
        result: Result<BackendSocket, ConnectError>,
        now: Instant,
    ) {
        let Some(pooled) = self.links.get_mut(&link_id) else {
            debug!(link_id, "dial finished for a removed link");
            return;
        };
        if pooled.link.generation() != generation {
            debug!(link_id, generation, "ignoring stale dial result");
            return;
        }

        match result {
            Ok(BackendSocket { outbound, inbound }) => {
                if !pooled.link.on_connected(generation, outbound, now) {
                    return;
                }
                pooled.established = true;
                pooled.recovering = false;
                pooled.health = LinkHealth::Healthy;
                pooled.consecutive_failures = 0;
                pooled.touch(now);
                self.spawn_reader(link_id, generation, inbound);
                for pending in self.waiting.remove(&link_id).unwrap_or_default() {
                    self.attach(link_id, pending, now);
                }
            }
            Err(err) => {
                counter!("pier_dial_failures_total", 1, "reason" => err.metric_label());
                warn!(link_id, generation, error = %err, "backend dial failed");

                if !pooled.established {
                    self.links.remove(&link_id);
                    for pending in self.waiting.remove(&link_id).unwrap_or_default() {
                        self.breaker.record_failure(now);
                        self.reject(pending.reply, AdmissionError::NoLinkAvailable);
                    }
                    return;
                }

                let recovering = std::mem::take(&mut pooled.recovering);
                let (outcome, closed) = pooled.link.on_connect_failed(generation, now);
                if outcome == Disconnect::Failed {
                    error!(link_id, "backend link exhausted its reconnect attempts");
                }
                self.forget_clients(&closed);
                if recovering {
                    self.breaker.record_failure(now);
                }
            }
        }
    }

    fn tick(&mut self, now: Instant) {
        let mut redials = Vec::new();
        for (link_id, pooled) in self.links.iter_mut() {
            if pooled.link.poll(now) {
                redials.push((*link_id, pooled.link.begin_connect()));
            }
        }
        for (link_id, generation) in redials {
            self.dial(link_id, generation);
        }

        if now >= self.next_health_check {
            self.run_health_checks(now);
            self.next_health_check = now + self.config.health_check_interval;
        }
        if now >= self.next_sweep {
            let expired = self
                .links
                .values_mut()
                .map(|pooled| pooled.link.sweep(now))
                .sum::<usize>();
            let sessions = self.sessions.sweep(now);
            if expired > 0 || sessions > 0 {
                debug!(expired_transfers = expired, expired_sessions = sessions, "sweep finished");
            }
            self.next_sweep = now + SWEEP_INTERVAL;
        }
        self.reclaim_idle(now);
    }

    fn run_health_checks(&mut self, now: Instant) {
        let mut ids: Vec<LinkId> = self.links.keys().copied().collect();
        ids.sort_unstable();
        for link_id in ids {
            let Some(pooled) = self.links.get_mut(&link_id) else {
                continue;
            };
            if !pooled.established {
                continue;
            }
            let probe_ok = pooled.link.is_open() && !pooled.link.heartbeat_overdue(now);
            if probe_ok {
                pooled.consecutive_failures = 0;
                pooled.health = LinkHealth::Healthy;
                continue;
            }
            pooled.consecutive_failures += 1;
            pooled.health = if pooled.consecutive_failures >= UNHEALTHY_AFTER {
                LinkHealth::Unhealthy
            } else {
                LinkHealth::Degraded
            };
            debug!(
                link_id,
                failures = pooled.consecutive_failures,
                state = ?pooled.link.state(),
                "health probe failed"
            );
            if pooled.health == LinkHealth::Unhealthy {
                self.handle_unhealthy(link_id);
            }
        }
        self.top_up();
    }

    fn handle_unhealthy(&mut self, link_id: LinkId) {
        let healthy_others = self
            .links
            .iter()
            .filter(|(id, pooled)| **id != link_id && pooled.is_healthy())
            .count();
        if healthy_others >= self.config.min_connections {
            info!(link_id, healthy_others, "retiring unhealthy backend link");
            self.retire(link_id, CLOSE_LINK_RETIRED, "backend link retired");
            return;
        }

        let Some(pooled) = self.links.get_mut(&link_id) else {
            return;
        };
        warn!(link_id, healthy_others, "recovering unhealthy backend link in place");
        let closed = pooled
            .link
            .evict_clients(CLOSE_LINK_FAILED, "backend link unresponsive");
        pooled.recovering = true;
        pooled.consecutive_failures = 0;
        let generation = pooled.link.restart();
        self.forget_clients(&closed);
        self.dial(link_id, generation);
    }

    /// Dials replacements while the pool sits below its floor.
    fn top_up(&mut self) {
        while self.links.len() < self.config.min_connections
            && self.links.len() < self.config.max_connections
        {
            let link_id = self.open_link(None);
            info!(link_id, "dialing replacement link to restore the floor");
        }
    }

    fn retire(&mut self, link_id: LinkId, code: u16, reason: &str) {
        let Some(mut pooled) = self.links.remove(&link_id) else {
            return;
        };
        let closed = pooled.link.close(code, reason);
        self.forget_clients(&closed);
        for pending in self.waiting.remove(&link_id).unwrap_or_default() {
            self.reject(pending.reply, AdmissionError::NoLinkAvailable);
        }
    }

    fn reclaim_idle(&mut self, now: Instant) {
        if self.links.len() <= self.config.min_connections {
            return;
        }
        let timeout = self.config.idle_timeout;
        let mut expired: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, pooled)| {
                pooled
                    .idle_deadline(timeout)
                    .map(|due| due <= now)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for link_id in expired {
            if self.links.len() <= self.config.min_connections {
                break;
            }
            info!(link_id, idle_secs = timeout.as_secs(), "reclaiming idle backend link");
            self.retire(link_id, CLOSE_GOING_AWAY, "idle link reclaimed");
        }
    }

    fn shutdown(&mut self) {
        info!(
            links = self.links.len(),
            clients = self.clients.len(),
            "shutting down backend pool"
        );
        for (_, waiters) in self.waiting.drain() {
            for pending in waiters {
                let _ = pending.reply.send(Err(AdmissionError::PoolClosed));
            }
        }
        for (_, mut pooled) in self.links.drain() {
            pooled.link.close(CLOSE_GOING_AWAY, "bridge shutting down");
        }
        self.clients.clear();
        self.refresh(Instant::now());
    }

    /// Re-arms idle timers, tracks degraded mode and publishes the snapshot.
    fn refresh(&mut self, now: Instant) {
        let mut stats = PoolStats {
            total_connections: self.links.len(),
            total_clients: self.clients.len(),
            circuit_breaker_open: self.breaker.is_open(),
            ..PoolStats::default()
        };
        for pooled in self.links.values_mut() {
            let has_clients = pooled.link.client_count() > 0;
            if has_clients || pooled.had_clients {
                pooled.touch(now);
            }
            pooled.had_clients = has_clients;
            if pooled.is_healthy() {
                stats.healthy_connections += 1;
            } else if pooled.health == LinkHealth::Unhealthy {
                stats.unhealthy_connections += 1;
            } else {
                stats.degraded_connections += 1;
            }
            stats.links.push(pooled.stats(now));
        }
        stats.links.sort_unstable_by_key(|link| link.link_id);

        let degraded = stats.healthy_connections < self.config.min_connections;
        if degraded != self.degraded {
            if degraded {
                warn!(
                    healthy = stats.healthy_connections,
                    min = self.config.min_connections,
                    "entering degraded mode"
                );
            } else {
                info!(healthy = stats.healthy_connections, "leaving degraded mode");
            }
            self.degraded = degraded;
        }
        stats.degraded_mode = degraded;

        gauge!("pier_links_active", stats.total_connections as f64);
        gauge!("pier_links_healthy", stats.healthy_connections as f64);
        gauge!("pier_clients_active", stats.total_clients as f64);
        *self.snapshot.write() = stats;
    }
}
