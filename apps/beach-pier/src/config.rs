use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pier_proto::CodecConfig;

use crate::link::LinkOptions;
use crate::liveness::LivenessConfig;
use crate::pool::{BalancePolicy, PoolConfig};
use crate::session::SessionConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub backend_url: String,
    pub pool: PoolConfig,
    pub shutdown_grace: Duration,
    pub mirror_path: Option<PathBuf>,
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "WebSocket bridge multiplexing browser sessions over pooled backend links"
)]
pub struct Cli {
    /// Address to bind the client websocket listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "127.0.0.1:9480")]
    pub listen_addr: String,

    /// ws:// or wss:// url of the backend application server.
    #[arg(long, env = "BEACH_PIER_BACKEND_URL")]
    pub backend_url: String,

    /// Links the pool never drops below.
    #[arg(long, env = "BEACH_PIER_MIN_CONNECTIONS", default_value_t = 2)]
    pub min_connections: usize,

    #[arg(long, env = "BEACH_PIER_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: usize,

    /// Links dialed at startup. Defaults to --min-connections.
    #[arg(long, env = "BEACH_PIER_INITIAL_CONNECTIONS")]
    pub initial_connections: Option<usize>,

    /// Link selection policy: round-robin, least-connections or random.
    #[arg(long, env = "BEACH_PIER_BALANCE", default_value = "round-robin")]
    pub balance: String,

    #[arg(long, env = "BEACH_PIER_CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    pub connect_timeout_secs: u64,

    /// How long a link may sit without clients before it is reclaimed.
    #[arg(long, env = "BEACH_PIER_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub idle_timeout_secs: u64,

    #[arg(long, env = "BEACH_PIER_HEALTH_CHECK_INTERVAL_SECS", default_value_t = 30)]
    pub health_check_interval_secs: u64,

    #[arg(long, env = "BEACH_PIER_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "BEACH_PIER_MAX_RECONNECT_ATTEMPTS", default_value_t = 10)]
    pub max_reconnect_attempts: u32,

    #[arg(long, env = "BEACH_PIER_RECONNECT_BASE_DELAY_MS", default_value_t = 1_000)]
    pub reconnect_base_delay_ms: u64,

    #[arg(long, env = "BEACH_PIER_RECONNECT_MAX_DELAY_MS", default_value_t = 30_000)]
    pub reconnect_max_delay_ms: u64,

    /// Messages held per link while it is reconnecting.
    #[arg(long, env = "BEACH_PIER_QUEUE_CAPACITY", default_value_t = 100)]
    pub queue_capacity: usize,

    #[arg(long, env = "BEACH_PIER_MAX_CHUNK_SIZE", default_value_t = 1024 * 1024)]
    pub max_chunk_size: usize,

    #[arg(long, env = "BEACH_PIER_MAX_MESSAGE_SIZE", default_value_t = 100 * 1024 * 1024)]
    pub max_message_size: usize,

    #[arg(long, env = "BEACH_PIER_CHUNK_TIMEOUT_SECS", default_value_t = 60)]
    pub chunk_timeout_secs: u64,

    #[arg(long, env = "BEACH_PIER_BREAKER_THRESHOLD", default_value_t = 5)]
    pub breaker_threshold: u32,

    #[arg(long, env = "BEACH_PIER_BREAKER_RESET_SECS", default_value_t = 60)]
    pub breaker_reset_secs: u64,

    /// Client cap while fewer than --min-connections links are healthy.
    #[arg(long, env = "BEACH_PIER_DEGRADED_MAX_CLIENTS", default_value_t = 50)]
    pub degraded_max_clients: usize,

    #[arg(long, env = "BEACH_PIER_SESSION_COOKIE", default_value = "session")]
    pub session_cookie: String,

    #[arg(long, env = "BEACH_PIER_SESSION_QUERY_PARAM", default_value = "session")]
    pub session_query_param: String,

    #[arg(long, env = "BEACH_PIER_SESSION_TTL_SECS", default_value_t = 1_800)]
    pub session_ttl_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Append mirrored frame metadata to this file as NDJSON.
    #[arg(long, env = "BEACH_PIER_MIRROR_PATH")]
    pub mirror_path: Option<PathBuf>,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if !(cli.backend_url.starts_with("ws://") || cli.backend_url.starts_with("wss://")) {
            bail!("backend url must use ws:// or wss://: {}", cli.backend_url);
        }
        let balance: BalancePolicy = cli
            .balance
            .parse()
            .map_err(anyhow::Error::msg)
            .context("invalid --balance")?;
        if cli.max_chunk_size == 0 || cli.max_message_size == 0 {
            bail!("chunk and message size limits must be non-zero");
        }
        if cli.max_chunk_size > cli.max_message_size {
            bail!(
                "max chunk size ({}) exceeds max message size ({})",
                cli.max_chunk_size,
                cli.max_message_size
            );
        }
        if cli.heartbeat_interval_secs == 0 {
            bail!("heartbeat interval must be non-zero");
        }
        if cli.queue_capacity == 0 {
            bail!("queue capacity must be non-zero");
        }
        if cli.session_cookie.is_empty() || cli.session_query_param.is_empty() {
            bail!("session cookie and query parameter names must be non-empty");
        }

        let pool = PoolConfig {
            min_connections: cli.min_connections,
            max_connections: cli.max_connections,
            initial_connections: cli.initial_connections.unwrap_or(cli.min_connections),
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            health_check_interval: Duration::from_secs(cli.health_check_interval_secs),
            breaker_threshold: cli.breaker_threshold,
            breaker_reset: Duration::from_secs(cli.breaker_reset_secs),
            degraded_max_clients: cli.degraded_max_clients,
            balance,
            link: LinkOptions {
                liveness: LivenessConfig {
                    heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
                    max_reconnect_attempts: cli.max_reconnect_attempts,
                    reconnect_base_delay: Duration::from_millis(cli.reconnect_base_delay_ms),
                    reconnect_max_delay: Duration::from_millis(cli.reconnect_max_delay_ms),
                    queue_capacity: cli.queue_capacity,
                },
                codec: CodecConfig {
                    max_chunk_size: cli.max_chunk_size,
                    max_message_size: cli.max_message_size,
                    chunk_timeout: Duration::from_secs(cli.chunk_timeout_secs),
                },
            },
            session: SessionConfig {
                cookie_name: cli.session_cookie,
                query_param: cli.session_query_param,
                ttl: Duration::from_secs(cli.session_ttl_secs),
            },
        };
        pool.validate().context("invalid pool settings")?;

        Ok(ServerConfig {
            listen_addr,
            backend_url: cli.backend_url,
            pool,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            mirror_path: cli.mirror_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let mut argv = vec!["beach-pier", "--backend-url", "ws://127.0.0.1:8080/app"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test_timeout::timeout]
    fn defaults_match_documented_values() {
        let config = parse(&[]).expect("defaults");
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:9480");
        assert_eq!(config.pool.min_connections, 2);
        assert_eq!(config.pool.max_connections, 10);
        assert_eq!(config.pool.initial_connections, 2);
        assert_eq!(config.pool.balance, BalancePolicy::RoundRobin);
        assert_eq!(config.pool.link.liveness, LivenessConfig::default());
        assert_eq!(config.pool.link.codec, CodecConfig::default());
        assert_eq!(config.pool.session, SessionConfig::default());
        assert!(config.mirror_path.is_none());
    }

    #[test_timeout::timeout]
    fn initial_connections_follow_the_floor_unless_set() {
        let config = parse(&["--min-connections", "3"]).expect("config");
        assert_eq!(config.pool.initial_connections, 3);
        let config =
            parse(&["--min-connections", "1", "--initial-connections", "4"]).expect("config");
        assert_eq!(config.pool.initial_connections, 4);
    }

    #[test_timeout::timeout]
    fn rejects_inconsistent_limits() {
        assert!(parse(&["--min-connections", "5", "--max-connections", "2"]).is_err());
        assert!(parse(&["--max-chunk-size", "2048", "--max-message-size", "1024"]).is_err());
        assert!(parse(&["--balance", "sticky"]).is_err());
        assert!(parse(&["--listen-addr", "nope"]).is_err());
        assert!(parse(&["--heartbeat-interval-secs", "0"]).is_err());
    }

    #[test_timeout::timeout]
    fn backend_url_must_be_websocket() {
        let cli = Cli::try_parse_from(["beach-pier", "--backend-url", "http://127.0.0.1:8080"])
            .expect("cli");
        assert!(ServerConfig::try_from(cli).is_err());
    }
}
