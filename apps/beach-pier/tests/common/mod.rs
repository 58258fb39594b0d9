#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use beach_pier::backend::{MemoryBackend, MemoryPeer};
use beach_pier::link::{ClientId, Outbound};
use beach_pier::mirror::FrameMirror;
use beach_pier::pool::{self, AdmissionError, ClientRequest, PoolConfig, PoolHandle, PoolStats};
use pier_proto::WireMessage;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type TestResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub const SESSION: &str = "SESSIONID12345678901234567890123";

pub struct Bridge {
    pub pool: PoolHandle,
    pub backend: MemoryBackend,
    pub task: JoinHandle<()>,
}

pub fn pool_config(min: usize, max: usize, initial: usize) -> PoolConfig {
    PoolConfig {
        min_connections: min,
        max_connections: max,
        initial_connections: initial,
        ..PoolConfig::default()
    }
}

pub async fn start(config: PoolConfig) -> Result<Bridge, pool::PoolError> {
    start_with(config, MemoryBackend::new(), FrameMirror::default()).await
}

pub async fn start_with(
    config: PoolConfig,
    backend: MemoryBackend,
    mirror: FrameMirror,
) -> Result<Bridge, pool::PoolError> {
    let (pool, task) = pool::start(config, Arc::new(backend.clone()), mirror).await?;
    Ok(Bridge {
        pool,
        backend,
        task,
    })
}

pub struct TestClient {
    pub id: ClientId,
    pub rx: mpsc::UnboundedReceiver<Outbound>,
}

impl TestClient {
    pub async fn next(&mut self) -> Option<Outbound> {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn next_json(&mut self) -> Option<Value> {
        match self.next().await? {
            Outbound::Message(WireMessage::Text(text)) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }
}

pub async fn connect(
    pool: &PoolHandle,
    cookie: Option<&str>,
) -> Result<TestClient, AdmissionError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = pool
        .add_client(ClientRequest {
            cookie: cookie.map(str::to_string),
            query: None,
            outbound: tx,
        })
        .await?;
    Ok(TestClient { id, rx })
}

pub async fn peer_json(peer: &mut MemoryPeer) -> Option<Value> {
    match tokio::time::timeout(Duration::from_secs(5), peer.recv()).await.ok()?? {
        WireMessage::Text(text) => serde_json::from_str(&text).ok(),
        WireMessage::Binary(_) => None,
    }
}

/// Polls the published snapshot until `check` holds.
pub async fn eventually(pool: &PoolHandle, check: impl Fn(&PoolStats) -> bool) -> PoolStats {
    for _ in 0..500 {
        let stats = pool.stats();
        if check(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached expected state: {:?}", pool.stats());
}
