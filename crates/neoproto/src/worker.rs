//! Worker-side runtime: register a service with the hub, then serve
//! forwarded requests from a method-handler table.
//!
//! The handler table is fixed before `register` is called; the registration
//! frame advertises the method names, and the hub dispatches against that
//! static capability set. Responses may complete out of order — each request
//! runs on its own task and replies through the shared writer queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, ProtocolError};
use crate::frame::{self, meta, Frame, FrameKind, DEFAULT_MAX_FRAME_BYTES};
use crate::types::{error_code, RegisterAck};

/// A method handler: JSON params in, JSON result or error message out.
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Configuration for a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    /// How often to heartbeat the hub. Must stay well inside the hub's
    /// session timeout (90 s by default).
    pub heartbeat_interval: Duration,
    pub max_frame_bytes: usize,
}

impl WorkerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            heartbeat_interval: Duration::from_secs(30),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// A connected, registerable service worker.
pub struct Worker {
    config: WorkerConfig,
    reader: BufReader<OwnedReadHalf>,
    write_tx: mpsc::Sender<Frame>,
    handlers: HashMap<String, Handler>,
    service_name: Option<String>,
    instance_id: Option<String>,
}

impl Worker {
    /// Connect to the hub. Registration is a separate step so handlers can
    /// be attached first (their names go into the registration frame).
    pub async fn connect(config: WorkerConfig) -> Result<Self, ClientError> {
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| ClientError::Protocol(ProtocolError::Io(e)))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (write_tx, write_rx) = mpsc::channel(64);
        tokio::spawn(write_task(write_half, write_rx, config.max_frame_bytes));

        Ok(Self {
            config,
            reader: BufReader::new(read_half),
            write_tx,
            handlers: HashMap::new(),
            service_name: None,
            instance_id: None,
        })
    }

    /// Attach a handler for `method`.
    pub fn handle<F>(&mut self, method: &str, handler: F)
    where
        F: Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync + 'static,
    {
        self.handlers.insert(method.to_string(), Arc::new(handler));
    }

    /// Register `service_name` with the hub and wait for the acknowledgement.
    ///
    /// Returns the hub-assigned instance id.
    pub async fn register(
        &mut self,
        service_name: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<String, ClientError> {
        let methods: Vec<String> = self.handlers.keys().cloned().collect();
        let register = Frame::register(service_name, &metadata, &methods)?;
        self.write_tx
            .send(register)
            .await
            .map_err(|_| ClientError::ConnectionLost)?;

        // The ack is the first frame the hub sends us.
        let ack = loop {
            match frame::read_frame(&mut self.reader, self.config.max_frame_bytes).await? {
                Some(f) if f.kind == FrameKind::Response => break f,
                Some(f) if f.kind == FrameKind::Heartbeat => continue,
                Some(_) => return Err(ClientError::remote("", "unexpected frame before ack")),
                None => return Err(ClientError::ConnectionLost),
            }
        };

        let parsed: RegisterAck =
            serde_json::from_slice(&ack.payload).map_err(|e| ProtocolError::Json {
                context: "register ack",
                source: e,
            })?;
        if let Some(err) = parsed.error {
            return Err(ClientError::remote(
                ack.error_code().unwrap_or(""),
                err,
            ));
        }
        let id = parsed
            .id
            .ok_or_else(|| ClientError::remote("", "register ack without id"))?;

        info!("service '{}' registered (instance {})", service_name, id);
        self.service_name = Some(service_name.to_string());
        self.instance_id = Some(id.clone());
        Ok(id)
    }

    /// Hub-assigned instance id, once registered.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Serve requests until the hub disconnects or sends a shutdown notice.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let service = self
            .service_name
            .clone()
            .ok_or_else(|| ClientError::remote("", "run() before register()"))?;
        let handlers = Arc::new(self.handlers);

        // Liveness towards the hub.
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_tx = self.write_tx.clone();
        let heartbeat_service = service.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                if heartbeat_tx
                    .send(Frame::heartbeat(heartbeat_service.clone()))
                    .await
                    .is_err()
                {
                    break;
                }
                debug!("{}: heartbeat sent", heartbeat_service);
            }
        });

        let result = loop {
            match frame::read_frame(&mut self.reader, self.config.max_frame_bytes).await {
                Ok(Some(request)) => match request.kind {
                    FrameKind::Request => {
                        dispatch(handlers.clone(), request, self.write_tx.clone());
                    }
                    FrameKind::Heartbeat => {
                        if request.metadata.contains_key(meta::SHUTDOWN) {
                            info!("{}: hub is shutting down, draining", service);
                            break Ok(());
                        }
                        // Hub heartbeats need no reply.
                    }
                    other => {
                        debug!("{}: ignoring {:?} frame", service, other);
                    }
                },
                Ok(None) => {
                    info!("{}: hub closed the connection", service);
                    break Ok(());
                }
                Err(e) => {
                    error!("{}: read error: {}", service, e);
                    break Err(e.into());
                }
            }
        };

        heartbeat.abort();
        result
    }
}

/// Run one request on its own task and queue the response.
fn dispatch(handlers: Arc<HashMap<String, Handler>>, request: Frame, write_tx: mpsc::Sender<Frame>) {
    tokio::spawn(async move {
        let reply = match handlers.get(&request.method) {
            Some(handler) => {
                let params: Value = if request.payload.is_empty() {
                    Value::Null
                } else {
                    match serde_json::from_slice(&request.payload) {
                        Ok(v) => v,
                        Err(e) => {
                            let reply = Frame::error_response(
                                request.correlation_id,
                                "",
                                format!("invalid request payload: {}", e),
                            );
                            let _ = write_tx.send(reply).await;
                            return;
                        }
                    }
                };
                match handler(params).await {
                    Ok(result) => Frame::response(
                        request.correlation_id,
                        Bytes::from(result.to_string().into_bytes()),
                    ),
                    Err(message) => Frame::error_response(
                        request.correlation_id,
                        "",
                        message,
                    ),
                }
            }
            None => Frame::error_response(
                request.correlation_id,
                error_code::METHOD_NOT_FOUND,
                format!("Method '{}' not found", request.method),
            ),
        };
        let _ = write_tx.send(reply).await;
    });
}

/// Serialize all writes through one task so frame bytes never interleave.
async fn write_task(
    mut writer: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<Frame>,
    max_frame_bytes: usize,
) {
    use tokio::io::AsyncWriteExt;
    while let Some(outgoing) = write_rx.recv().await {
        match outgoing.encode(max_frame_bytes) {
            Ok(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!("write failed: {}", e);
                    break;
                }
            }
            Err(e) => warn!("dropping unencodable frame: {}", e),
        }
    }
}
