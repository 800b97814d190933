//! neoproto - Wire protocol types and peer glue for the Neofabric RPC fabric.
//!
//! Two framings coexist:
//!
//! - [`frame`]: the NEO01 framing, the canonical protocol between workers,
//!   callers, and the hub (little-endian, length-prefixed).
//! - [`disco`]: the discovery framing spoken only at the hub's discovery
//!   endpoint (big-endian, magic `0xAEBD`, CRC-32 trailer).
//!
//! On top of the codecs sit the two peer roles: [`client::IpcClient`]
//! (caller async bridge with a pending-request table) and
//! [`worker::Worker`] (register a service, serve its methods).

pub mod client;
pub mod compression;
pub mod disco;
pub mod error;
pub mod frame;
pub mod types;
pub mod worker;

pub use client::{ClientConfig, ConnectionState, HealthTracker, IpcClient};
pub use compression::Compression;
pub use disco::{DiscoveryReply, DiscoveryRequest, DISCOVERY_MAGIC, DISCOVERY_VERSION};
pub use error::{ClientError, ProtocolError};
pub use frame::{
    meta, read_frame, write_frame, Frame, FrameKind, Priority, DEFAULT_MAX_FRAME_BYTES,
};
pub use types::{error_code, RegisterAck, RegisterPayload, ServiceInfo, ServiceStatus};
pub use worker::{Worker, WorkerConfig};

/// Default hub port for fabric traffic.
pub const DEFAULT_HUB_PORT: u16 = 9999;

/// Default port for the discovery endpoint.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9090;
