//! The discovery endpoint: a small request/response server over the
//! checksummed discovery framing, backed by the hub's registry.
//!
//! Each connection carries requests serially; a protocol error (bad magic,
//! checksum mismatch) gets a best-effort error reply and closes the
//! connection.

use std::sync::Arc;

use neoproto::disco::{self, DiscoveryReply, DiscoveryRequest};
use neoproto::{ProtocolError, ServiceInfo};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::registry::ServiceRegistry;

/// Parameter/body cap for discovery traffic; registrations are small.
const MAX_DISCO_BYTES: usize = 1024 * 1024;

/// Framing B server over the shared registry.
pub struct DiscoveryServer {
    registry: Arc<ServiceRegistry>,
}

impl DiscoveryServer {
    pub fn new(registry: Arc<ServiceRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    /// Bind `(host, port)` and serve until shutdown.
    pub async fn serve(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind((host, port)).await?;
        self.serve_listener(listener, shutdown_rx).await
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn serve_listener(
        self: &Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        info!("discovery endpoint listening on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("discovery connection from {}", peer);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    debug!("discovery connection ended: {}", e);
                                }
                            });
                        }
                        Err(e) => warn!("discovery accept failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("discovery endpoint stopped");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = stream.split();
        let mut reader = BufReader::new(read_half);

        loop {
            let request = match disco::read_request(&mut reader, MAX_DISCO_BYTES).await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    // Protocol errors close the connection after a
                    // best-effort error body. Checksum failures especially
                    // must never be swallowed.
                    warn!("discovery protocol error: {}", e);
                    let reply = DiscoveryReply::err(protocol_error_text(&e));
                    if let Ok(encoded) = disco::encode_response(&reply) {
                        let _ = write_half.write_all(&encoded).await;
                    }
                    break;
                }
            };

            debug!(
                "discovery request {} ({})",
                request.method, request.msg_id
            );
            let reply = self.dispatch(&request);
            let encoded = disco::encode_response(&reply)?;
            write_half.write_all(&encoded).await?;
        }
        Ok(())
    }

    fn dispatch(&self, request: &DiscoveryRequest) -> DiscoveryReply {
        match request.method.as_str() {
            "register" => self.register(&request.params),
            "deregister" => self.deregister(&request.params),
            "discover" => self.discover(&request.params),
            other => DiscoveryReply::err(format!("unknown method: {}", other)),
        }
    }

    fn register(&self, params: &Value) -> DiscoveryReply {
        let service: ServiceInfo = match serde_json::from_value(params["service"].clone()) {
            Ok(service) => service,
            Err(e) => return DiscoveryReply::err(format!("invalid service info: {}", e)),
        };
        let id = service.id.clone();
        // Renewals are idempotent on the instance id: register simply
        // replaces the entry and restarts the lease.
        self.registry.register(service);
        DiscoveryReply::ok(serde_json::json!({ "id": id }))
    }

    fn deregister(&self, params: &Value) -> DiscoveryReply {
        let Some(id) = params["id"].as_str() else {
            return DiscoveryReply::err("deregister requires an id");
        };
        let removed = self.registry.deregister_by_id(id);
        DiscoveryReply::ok(Value::Bool(removed))
    }

    fn discover(&self, params: &Value) -> DiscoveryReply {
        let Some(name) = params["name"].as_str() else {
            return DiscoveryReply::err("discover requires a name");
        };
        let include_unhealthy = params["include_unhealthy"].as_bool().unwrap_or(false);
        let found = self.registry.discover(name, include_unhealthy);
        match serde_json::to_value(found) {
            Ok(list) => DiscoveryReply::ok(list),
            Err(e) => DiscoveryReply::err(format!("serialization failed: {}", e)),
        }
    }
}

fn protocol_error_text(e: &ProtocolError) -> String {
    match e {
        ProtocolError::ChecksumMismatch => "checksum mismatch".to_string(),
        ProtocolError::UnsupportedVersion(v) => format!("unsupported version: {}", v),
        other => format!("invalid request: {}", other),
    }
}
