//! neopool - caller-side connection pool for the Neofabric RPC fabric.
//!
//! High-throughput callers keep a pool of fabric connections to one
//! endpoint instead of a single multiplexed socket. The pool owns the
//! lifecycle (min/max bounds, auto-scaling, idle/age expiry, heartbeat
//! probing); a pluggable [`balancer::Balancer`] picks which idle connection
//! serves each checkout.

pub mod balancer;
pub mod connection;
pub mod pool;

pub use balancer::{create_balancer, Balancer, Candidate, Strategy};
pub use connection::{ConnState, ConnStats, PoolConnection};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConn, ReleaseOutcome};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// No idle connection and none could be created.
    #[error("no available connection")]
    NoAvailableConnection,

    /// The pool has been closed.
    #[error("pool is closed")]
    Closed,

    /// Connection-level failure (connect, send, or receive).
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// A request on a pooled connection hit its deadline.
    #[error("request timed out")]
    RequestTimeout,
}
