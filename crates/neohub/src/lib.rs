//! neohub - the Neofabric broker.
//!
//! Workers hold long-lived connections to the hub and register a service
//! name; callers send requests naming a service; the hub routes frames
//! between them by correlation id. A discovery endpoint (separate port,
//! separate framing) exposes the same registry to out-of-band peers.

pub mod discovery;
pub mod dispatcher;
pub mod registry;
pub mod session;

pub use discovery::DiscoveryServer;
pub use dispatcher::Hub;
pub use registry::{RegistryEvent, ServiceRegistry, Watch};
pub use session::{SessionHandle, SessionState};
