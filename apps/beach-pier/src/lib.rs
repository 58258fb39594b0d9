//! Bridge between browser WebSocket clients and a backend application server.
//!
//! Clients are assigned to a small pool of persistent backend links. Each link
//! stamps the owning session onto forwarded frames, splits oversized binary
//! into chunks, keeps itself alive with heartbeats and queues outbound traffic
//! while it reconnects.

pub mod backend;
pub mod config;
pub mod link;
pub mod liveness;
pub mod mirror;
pub mod pool;
pub mod server;
pub mod session;
pub mod telemetry;
