//! Caller-side async bridge over a fabric TCP connection.
//!
//! Architecture: reactor pattern to avoid lock contention.
//! - The socket is owned by a dedicated reactor task
//! - Requests flow through an mpsc channel
//! - Responses are routed via oneshot channels keyed by correlation id
//! - A 1 s sweeper completes expired entries with `Timeout`
//!
//! Retries happen in the caller (Lazy Pirate): each retry gets a fresh
//! correlation id so a late response to an abandoned attempt is dropped as
//! an orphan instead of being misdelivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{ClientError, ProtocolError};
use crate::frame::{self, meta, Frame, FrameKind, DEFAULT_MAX_FRAME_BYTES};

/// Default cap on concurrent in-flight requests per caller.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Configuration for [`IpcClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Caller name, used in logs.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Per-attempt request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Retries before failing a request (Lazy Pirate).
    pub max_retries: u32,
    /// In-flight request cap; beyond it `call` fails fast with `Overloaded`.
    pub max_pending: usize,
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            timeout_ms: 30_000,
            max_retries: 3,
            max_pending: DEFAULT_MAX_PENDING,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }
}

/// Peer responsiveness, tracked from request outcomes rather than socket
/// state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown = 0,
    Connected = 1,
    Dead = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Dead,
            _ => ConnectionState::Unknown,
        }
    }
}

/// Health tracking based on request/response success.
#[derive(Debug, Default)]
pub struct HealthTracker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
}

impl HealthTracker {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.state
            .store(ConnectionState::Connected as u8, Ordering::Relaxed);
    }

    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn mark_dead(&self) {
        self.state
            .store(ConnectionState::Dead as u8, Ordering::Relaxed);
    }
}

enum ReactorCommand {
    Issue {
        frame: Frame,
        deadline: Instant,
        response_tx: oneshot::Sender<Result<Value, ClientError>>,
    },
    Cancel {
        correlation_id: Bytes,
    },
    Shutdown,
}

struct PendingRequest {
    response_tx: oneshot::Sender<Result<Value, ClientError>>,
    deadline: Instant,
}

/// Asynchronous fabric client with a pending-request table.
pub struct IpcClient {
    config: ClientConfig,
    cmd_tx: mpsc::Sender<ReactorCommand>,
    pub health: Arc<HealthTracker>,
    in_flight: Arc<AtomicUsize>,
}

impl IpcClient {
    /// Connect and spawn the reactor task that owns the socket.
    pub async fn connect(config: ClientConfig) -> Result<Arc<Self>, ClientError> {
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| ClientError::Protocol(ProtocolError::Io(e)))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let health = Arc::new(HealthTracker::default());
        let in_flight = Arc::new(AtomicUsize::new(0));

        // Frame reads live in their own task: a read in progress is never
        // dropped mid-frame, so the stream cannot desynchronize.
        tokio::spawn(read_task(
            BufReader::new(read_half),
            frame_tx,
            config.name.clone(),
            config.max_frame_bytes,
        ));
        tokio::spawn(reactor_task(
            write_half,
            cmd_rx,
            frame_rx,
            health.clone(),
            in_flight.clone(),
            config.name.clone(),
            config.max_frame_bytes,
        ));

        info!("{}: connected to {}:{}", config.name, config.host, config.port);

        Ok(Arc::new(Self {
            config,
            cmd_tx,
            health,
            in_flight,
        }))
    }

    /// Issue one frame and wait for the correlated response. No retries.
    ///
    /// Assigns a fresh correlation id when the frame has none.
    pub async fn issue(&self, mut frame: Frame, timeout: Duration) -> Result<Value, ClientError> {
        if self.in_flight.load(Ordering::Relaxed) >= self.config.max_pending {
            return Err(ClientError::Overloaded);
        }
        if frame.correlation_id.is_empty() {
            frame.correlation_id = Bytes::from(Uuid::new_v4().to_string().into_bytes());
        }

        let (response_tx, response_rx) = oneshot::channel();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let sent = self
            .cmd_tx
            .send(ReactorCommand::Issue {
                frame,
                deadline: Instant::now() + timeout,
                response_tx,
            })
            .await;
        if sent.is_err() {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            return Err(ClientError::ConnectionLost);
        }

        response_rx.await.map_err(|_| ClientError::ConnectionLost)?
    }

    /// Call `service.method` with JSON params, retrying timeouts with a
    /// fresh correlation id (Lazy Pirate).
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: &Value,
    ) -> Result<Value, ClientError> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let max_attempts = self.config.max_retries + 1;
        let payload = Bytes::from(serde_json::to_vec(params).map_err(|e| {
            ClientError::Protocol(ProtocolError::Json {
                context: "call params",
                source: e,
            })
        })?);

        let mut attempts = 0;
        loop {
            attempts += 1;
            let frame = Frame::request(service, method, payload.clone());
            debug!(
                "{}: calling {}.{} (attempt {}/{})",
                self.config.name, service, method, attempts, max_attempts
            );

            match self.issue(frame, timeout).await {
                Ok(value) => {
                    self.health.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    warn!(
                        "{}: {}.{} attempt {} failed: {}, retrying",
                        self.config.name, service, method, attempts, e
                    );
                    self.health.record_failure();
                    tokio::time::sleep(Duration::from_millis(100 * attempts as u64)).await;
                }
                Err(e) => {
                    self.health.record_failure();
                    return Err(e);
                }
            }
        }
    }

    /// Cancel a pending request. The local completion fires with
    /// `Cancelled`; a cancellation marker is sent to the hub best-effort.
    pub async fn cancel(&self, correlation_id: Bytes) {
        let _ = self
            .cmd_tx
            .send(ReactorCommand::Cancel { correlation_id })
            .await;
    }

    /// Application-level liveness probe: heartbeat with a 5 s timeout.
    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        let frame = Frame::heartbeat("")
            .with_correlation_id(Bytes::from(Uuid::new_v4().to_string().into_bytes()));
        self.issue(frame, Duration::from_secs(5)).await.map(|_| ())
    }

    /// Gracefully stop the reactor, failing all pending requests.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ReactorCommand::Shutdown).await;
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of requests currently awaiting a response.
    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Pump decoded frames from the socket into the reactor. Exits (closing the
/// channel) on EOF or the first protocol error.
async fn read_task(
    mut reader: BufReader<OwnedReadHalf>,
    frame_tx: mpsc::Sender<Frame>,
    name: String,
    max_frame_bytes: usize,
) {
    loop {
        match frame::read_frame(&mut reader, max_frame_bytes).await {
            Ok(Some(frame)) => {
                if frame_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("{}: peer closed the connection", name);
                break;
            }
            Err(e) => {
                warn!("{}: receive error: {}", name, e);
                break;
            }
        }
    }
}

/// The reactor task: owns the write half and the pending table.
async fn reactor_task(
    mut writer: OwnedWriteHalf,
    mut cmd_rx: mpsc::Receiver<ReactorCommand>,
    mut frame_rx: mpsc::Receiver<Frame>,
    health: Arc<HealthTracker>,
    in_flight: Arc<AtomicUsize>,
    name: String,
    max_frame_bytes: usize,
) {
    let mut pending: HashMap<Bytes, PendingRequest> = HashMap::new();
    let mut sweep = tokio::time::interval(Duration::from_secs(1));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!("{}: reactor task started", name);

    let complete = |in_flight: &AtomicUsize,
                    req: PendingRequest,
                    result: Result<Value, ClientError>| {
        in_flight.fetch_sub(1, Ordering::Relaxed);
        let _ = req.response_tx.send(result);
    };

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ReactorCommand::Issue { frame, deadline, response_tx }) => {
                        let id = frame.correlation_id.clone();
                        trace!("{}: sending request {}", name, display_id(&id));
                        match frame.encode(max_frame_bytes) {
                            Ok(bytes) => {
                                if let Err(e) = writer.write_all(&bytes).await {
                                    warn!("{}: send failed for {}: {}", name, display_id(&id), e);
                                    in_flight.fetch_sub(1, Ordering::Relaxed);
                                    let _ = response_tx.send(Err(ClientError::ConnectionLost));
                                    continue;
                                }
                                // One entry per correlation id: a duplicate
                                // replaces (and cancels) the older request.
                                if let Some(old) =
                                    pending.insert(id, PendingRequest { response_tx, deadline })
                                {
                                    complete(&in_flight, old, Err(ClientError::Cancelled));
                                }
                            }
                            Err(e) => {
                                in_flight.fetch_sub(1, Ordering::Relaxed);
                                let _ = response_tx.send(Err(e.into()));
                            }
                        }
                    }
                    Some(ReactorCommand::Cancel { correlation_id }) => {
                        if let Some(req) = pending.remove(&correlation_id) {
                            debug!("{}: cancelled {}", name, display_id(&correlation_id));
                            complete(&in_flight, req, Err(ClientError::Cancelled));
                            // Best-effort: tell the hub to drop the routing entry.
                            let marker = Frame::request("", "", Bytes::new())
                                .with_metadata(meta::CANCEL, hex::encode(&correlation_id));
                            if let Ok(bytes) = marker.encode(max_frame_bytes) {
                                let _ = writer.write_all(&bytes).await;
                            }
                        }
                    }
                    Some(ReactorCommand::Shutdown) | None => {
                        info!("{}: reactor shutting down, failing {} pending", name, pending.len());
                        for (_, req) in pending.drain() {
                            complete(&in_flight, req, Err(ClientError::ConnectionLost));
                        }
                        break;
                    }
                }
            }

            received = frame_rx.recv() => {
                match received {
                    Some(frame) => {
                        let id = frame.correlation_id.clone();
                        if let Some(req) = pending.remove(&id) {
                            let outcome = response_to_result(&frame);
                            if outcome.is_ok() {
                                health.record_success();
                            }
                            complete(&in_flight, req, outcome);
                        } else {
                            debug!("{}: orphan response {}", name, display_id(&id));
                        }
                    }
                    None => {
                        // Read task exited: EOF or protocol error.
                        health.mark_dead();
                        for (_, req) in pending.drain() {
                            complete(&in_flight, req, Err(ClientError::ConnectionLost));
                        }
                        break;
                    }
                }
            }

            _ = sweep.tick() => {
                let now = Instant::now();
                let expired: Vec<Bytes> = pending
                    .iter()
                    .filter(|(_, req)| now > req.deadline)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    if let Some(req) = pending.remove(&id) {
                        debug!("{}: request {} timed out", name, display_id(&id));
                        complete(&in_flight, req, Err(ClientError::Timeout));
                    }
                }
            }
        }
    }

    debug!("{}: reactor task exiting", name);
}

/// Translate a received frame into the caller-visible result.
fn response_to_result(frame: &Frame) -> Result<Value, ClientError> {
    if frame.kind == FrameKind::Heartbeat {
        return Ok(Value::Null);
    }
    if frame.is_error() {
        let code = frame.error_code().unwrap_or("").to_string();
        let message = serde_json::from_slice::<Value>(&frame.payload)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(&frame.payload).into_owned());
        return Err(ClientError::Remote { code, message });
    }
    if frame.payload.is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_slice(&frame.payload) {
        Ok(value) => Ok(value),
        Err(_) => Ok(Value::String(
            String::from_utf8_lossy(&frame.payload).into_owned(),
        )),
    }
}

fn display_id(id: &Bytes) -> String {
    match std::str::from_utf8(id) {
        Ok(s) => s.to_string(),
        Err(_) => hex::encode(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal responder: answers every request with `{"ok":true}` echoing
    /// the correlation id, echoes heartbeats, ignores everything else.
    async fn spawn_responder() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.split();
            let mut reader = BufReader::new(read_half);
            while let Ok(Some(request)) =
                frame::read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await
            {
                let reply = match request.kind {
                    FrameKind::Heartbeat => {
                        Frame::heartbeat("").with_correlation_id(request.correlation_id)
                    }
                    _ => Frame::response(
                        request.correlation_id,
                        Bytes::from_static(br#"{"ok":true}"#),
                    ),
                };
                let bytes = reply.encode(DEFAULT_MAX_FRAME_BYTES).unwrap();
                write_half.write_all(&bytes).await.unwrap();
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn call_roundtrip() {
        let (addr, _server) = spawn_responder().await;
        let client = IpcClient::connect(ClientConfig::new("t", "127.0.0.1", addr.port()))
            .await
            .unwrap();

        let result = client
            .call("math", "add", &serde_json::json!({"a": 1, "b": 2}))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
        assert!(client.health.is_connected());
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn heartbeat_echo() {
        let (addr, _server) = spawn_responder().await;
        let client = IpcClient::connect(ClientConfig::new("t", "127.0.0.1", addr.port()))
            .await
            .unwrap();
        client.heartbeat().await.unwrap();
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let config = ClientConfig::new("t", "127.0.0.1", addr.port())
            .with_timeout(200)
            .with_retries(0);
        let client = IpcClient::connect(config).await.unwrap();
        let err = client
            .call("ghost", "noop", &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn overload_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let config = ClientConfig::new("t", "127.0.0.1", addr.port()).with_max_pending(2);
        let client = IpcClient::connect(config).await.unwrap();

        // Fill the table with requests nobody will answer.
        let c1 = client.clone();
        let h1 = tokio::spawn(async move {
            c1.issue(
                Frame::request("s", "m", Bytes::new()),
                Duration::from_secs(30),
            )
            .await
        });
        let c2 = client.clone();
        let h2 = tokio::spawn(async move {
            c2.issue(
                Frame::request("s", "m", Bytes::new()),
                Duration::from_secs(30),
            )
            .await
        });

        // Wait until both are registered in flight.
        for _ in 0..50 {
            if client.pending() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = client
            .issue(Frame::request("s", "m", Bytes::new()), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Overloaded));

        client.shutdown().await;
        assert!(matches!(h1.await.unwrap(), Err(ClientError::ConnectionLost)));
        assert!(matches!(h2.await.unwrap(), Err(ClientError::ConnectionLost)));
    }

    #[tokio::test]
    async fn error_responses_surface_code_and_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.split();
            let mut reader = BufReader::new(read_half);
            if let Ok(Some(request)) =
                frame::read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await
            {
                let reply = Frame::error_response(
                    request.correlation_id,
                    "SERVICE_UNAVAILABLE",
                    "service unavailable",
                );
                let bytes = reply.encode(DEFAULT_MAX_FRAME_BYTES).unwrap();
                write_half.write_all(&bytes).await.unwrap();
            }
        });

        let config = ClientConfig::new("t", "127.0.0.1", addr.port()).with_retries(0);
        let client = IpcClient::connect(config).await.unwrap();
        let err = client
            .call("ghost", "noop", &Value::Null)
            .await
            .unwrap_err();
        match err {
            ClientError::Remote { code, message } => {
                assert_eq!(code, "SERVICE_UNAVAILABLE");
                assert_eq!(message, "service unavailable");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }
}
