//! Per-connection session state and the single-writer queue.
//!
//! Each accepted socket gets one reader task (owned by the dispatcher) and
//! one writer task (owned here). All writes to the socket flow through the
//! writer queue, so two frames never interleave bytes. When frames pile up
//! because the peer is slow to drain, the queue reorders by priority
//! (descending), FIFO within a class.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use neoproto::{Frame, Priority};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registered,
    Closed,
}

/// Shared handle to one accepted connection.
pub struct SessionHandle {
    pub id: Uuid,
    pub peer: SocketAddr,
    writer_tx: mpsc::Sender<Frame>,
    /// Millisecond epoch of the last frame seen from this peer. Written by
    /// the reader task, read by the reaper.
    last_seen_ms: AtomicI64,
    state: Mutex<SessionState>,
    service: Mutex<Option<String>>,
    /// Cancelling this token tears the session down (reader exits, socket
    /// drops).
    pub cancel: CancellationToken,
}

impl SessionHandle {
    /// Wrap an accepted socket's write half; spawns the writer task.
    pub fn spawn(peer: SocketAddr, writer: OwnedWriteHalf, max_frame_bytes: usize) -> std::sync::Arc<Self> {
        let (writer_tx, writer_rx) = mpsc::channel(256);
        let session = std::sync::Arc::new(Self {
            id: Uuid::new_v4(),
            peer,
            writer_tx,
            last_seen_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            state: Mutex::new(SessionState::Unregistered),
            service: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(write_task(
            writer,
            writer_rx,
            session.cancel.clone(),
            session.id,
            max_frame_bytes,
        ));
        session
    }

    /// Queue a frame for this peer. Fails when the session is going away.
    pub async fn send(&self, frame: Frame) -> Result<(), ()> {
        self.writer_tx.send(frame).await.map_err(|_| ())
    }

    /// Best-effort queue without waiting for capacity.
    pub fn try_send(&self, frame: Frame) -> bool {
        self.writer_tx.try_send(frame).is_ok()
    }

    /// Record peer activity. Any received frame counts as liveness.
    pub fn touch(&self) {
        self.last_seen_ms
            .store(chrono::Utc::now().timestamp_millis(), AtomicOrdering::Relaxed);
    }

    /// Milliseconds since the peer was last heard from.
    pub fn silent_for_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.last_seen_ms.load(AtomicOrdering::Relaxed)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn service(&self) -> Option<String> {
        self.service.lock().unwrap().clone()
    }

    /// Mark registered for `name`. A session serves at most one service;
    /// re-registering under a new name just moves the label.
    pub fn set_registered(&self, name: &str) {
        *self.state.lock().unwrap() = SessionState::Registered;
        *self.service.lock().unwrap() = Some(name.to_string());
    }

    /// Tear the session down.
    pub fn close(&self) {
        *self.state.lock().unwrap() = SessionState::Closed;
        self.cancel.cancel();
    }
}

/// Heap entry: highest priority first, then arrival order.
struct Queued {
    seq: u64,
    frame: Frame,
}

impl Queued {
    fn priority(&self) -> Priority {
        self.frame.priority
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins; equal priority, earlier seq wins.
        self.priority()
            .cmp(&other.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Drain the writer queue onto the socket.
///
/// Frames already queued when the previous write completes are reordered
/// by priority; an empty queue just forwards in arrival order.
async fn write_task(
    mut writer: OwnedWriteHalf,
    mut writer_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    session_id: Uuid,
    max_frame_bytes: usize,
) {
    let mut heap: BinaryHeap<Queued> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        if heap.is_empty() {
            let frame = tokio::select! {
                received = writer_rx.recv() => match received {
                    Some(frame) => frame,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };
            heap.push(Queued { seq, frame });
            seq += 1;
        }
        // Anything else already waiting competes on priority.
        while let Ok(frame) = writer_rx.try_recv() {
            heap.push(Queued { seq, frame });
            seq += 1;
        }

        let next = heap.pop().expect("heap refilled above");
        let bytes = match next.frame.encode(max_frame_bytes) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("session {}: dropping unencodable frame: {}", session_id, e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&bytes).await {
            debug!("session {}: write failed: {}", session_id, e);
            break;
        }
        trace!("session {}: wrote {} bytes", session_id, bytes.len());
    }

    debug!("session {}: writer exiting", session_id);
}
