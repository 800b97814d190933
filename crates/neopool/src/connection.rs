//! One pooled TCP connection and its running statistics.

use std::time::{Duration, Instant};

use bytes::Bytes;
use neoproto::frame::{self, Frame};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::PoolError;

/// Connection state as tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Eligible for selection.
    Idle,
    /// Checked out by exactly one caller (or being probed).
    Busy,
    /// Failed; the health loop removes it.
    Error,
    Closed,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Idle => "idle",
            ConnState::Busy => "busy",
            ConnState::Error => "error",
            ConnState::Closed => "closed",
        }
    }
}

/// Per-connection counters. `avg_response_time` is total/requests.
#[derive(Debug, Clone)]
pub struct ConnStats {
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub total_requests: u64,
    pub total_errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub total_response_time: Duration,
    pub avg_response_time: Duration,
    pub last_response_time: Duration,
}

impl ConnStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_used_at: now,
            total_requests: 0,
            total_errors: 0,
            bytes_sent: 0,
            bytes_received: 0,
            total_response_time: Duration::ZERO,
            avg_response_time: Duration::ZERO,
            last_response_time: Duration::ZERO,
        }
    }

    fn record_response(&mut self, elapsed: Duration) {
        self.total_requests += 1;
        self.total_response_time += elapsed;
        self.last_response_time = elapsed;
        self.avg_response_time = self.total_response_time / self.total_requests as u32;
    }
}

/// A live connection to the pool's endpoint.
#[derive(Debug)]
pub struct PoolConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    pub stats: ConnStats,
    max_frame_bytes: usize,
    last_error: Option<String>,
}

impl PoolConnection {
    /// Connect within `timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Self, PoolError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| PoolError::ConnectFailed("connect timed out".to_string()))?
            .map_err(|e| PoolError::ConnectFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            stats: ConnStats::new(),
            max_frame_bytes,
            last_error: None,
        })
    }

    /// Send one frame, counting bytes.
    pub async fn send_frame(&mut self, outgoing: &Frame) -> Result<(), PoolError> {
        let bytes = match outgoing.encode(self.max_frame_bytes) {
            Ok(b) => b,
            Err(e) => return Err(self.fail(e.to_string())),
        };
        if let Err(e) = self.writer.write_all(&bytes).await {
            return Err(self.fail(e.to_string()));
        }
        self.stats.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    /// Receive one frame, counting payload bytes. `None` on clean EOF.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>, PoolError> {
        match frame::read_frame(&mut self.reader, self.max_frame_bytes).await {
            Ok(Some(received)) => {
                self.stats.bytes_received += received.payload.len() as u64;
                Ok(Some(received))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    /// One request/response exchange, timing the round trip.
    pub async fn request(
        &mut self,
        mut outgoing: Frame,
        timeout: Duration,
    ) -> Result<Frame, PoolError> {
        if outgoing.correlation_id.is_empty() {
            outgoing.correlation_id = Bytes::from(Uuid::new_v4().to_string().into_bytes());
        }
        let started = Instant::now();
        self.stats.last_used_at = started;
        self.send_frame(&outgoing).await?;

        let wanted = outgoing.correlation_id.clone();
        let deadline = started + timeout;
        // Skip unrelated frames until ours arrives or the deadline passes.
        let reply = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.stats.total_errors += 1;
                return Err(PoolError::RequestTimeout);
            }
            match tokio::time::timeout(remaining, self.recv_frame()).await {
                Ok(Ok(Some(received))) if received.correlation_id == wanted => break received,
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) => {
                    return Err(self.fail("peer closed".to_string()));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    self.stats.total_errors += 1;
                    return Err(PoolError::RequestTimeout);
                }
            }
        };

        self.stats.record_response(started.elapsed());
        Ok(reply)
    }

    /// Heartbeat probe with the given timeout. Returns the round trip time.
    pub async fn probe(&mut self, timeout: Duration) -> Result<Duration, PoolError> {
        let started = Instant::now();
        let ping = Frame::heartbeat("")
            .with_correlation_id(Bytes::from(Uuid::new_v4().to_string().into_bytes()));
        self.send_frame(&ping).await?;
        let received = match tokio::time::timeout(timeout, self.recv_frame()).await {
            Ok(result) => result?,
            Err(_) => return Err(PoolError::RequestTimeout),
        };
        if received.is_none() {
            return Err(self.fail("peer closed".to_string()));
        }
        Ok(started.elapsed())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn fail(&mut self, message: String) -> PoolError {
        self.stats.total_errors += 1;
        self.last_error = Some(message.clone());
        PoolError::ConnectFailed(message)
    }
}
