//! neodisco - service-discovery client, registrar, and health checker.
//!
//! The caller-side half of the fabric's discovery layer: a client for the
//! hub's discovery endpoint, a [`Registrar`] that keeps a registration's
//! TTL lease renewed, and a [`HealthChecker`] whose verdicts the registrar
//! mirrors into the registered status.

pub mod client;
pub mod health;
pub mod registrar;

pub use client::DiscoveryClient;
pub use health::{CheckConfig, HealthChecker, HealthResult, HealthStatus, Probe};
pub use registrar::{Registrar, ServiceCheck};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket-level failure reaching the endpoint.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or corrupted discovery traffic.
    #[error(transparent)]
    Protocol(#[from] neoproto::ProtocolError),

    /// The endpoint answered with an error envelope.
    #[error("discovery error: {0}")]
    Server(String),

    /// The exchange did not complete in time.
    #[error("discovery request timed out")]
    Timeout,
}
