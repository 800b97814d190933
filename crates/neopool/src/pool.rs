//! Connection pool lifecycle: selection, auto-scaling, health sweeps.
//!
//! Concurrency discipline: one pool-wide mutex guards the member list,
//! per-connection state, and the aggregate counters. The lock is never held
//! across I/O — `acquire` flips a connection to `Busy` and releases the lock
//! before the caller touches the socket; connection creation reserves a slot
//! under the lock, connects outside it, then fills or abandons the slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::balancer::{create_balancer, Balancer, Candidate, Strategy};
use crate::connection::{ConnState, ConnStats, PoolConnection};
use crate::PoolError;

/// Pool tuning knobs. The defaults match the fabric's documented behavior.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub health_check_interval: Duration,
    pub strategy: Strategy,
    /// Scale up when busy/total exceeds this.
    pub scale_up_threshold: f64,
    /// Connections added per scale-up.
    pub scale_step: usize,
    /// Scale down when idle connections exceed this.
    pub scale_down_idle_threshold: usize,
    pub scale_interval: Duration,
    /// Probe idle connections with a heartbeat during health sweeps.
    pub heartbeat_probe: bool,
    pub max_frame_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            connection_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(30),
            strategy: Strategy::WeightedResponseTime,
            scale_up_threshold: 0.7,
            scale_step: 2,
            scale_down_idle_threshold: 2,
            scale_interval: Duration::from_secs(5),
            heartbeat_probe: true,
            max_frame_bytes: neoproto::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl PoolConfig {
    pub fn with_sizes(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_scale_interval(mut self, interval: Duration) -> Self {
        self.scale_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_heartbeat_probe(mut self, enabled: bool) -> Self {
        self.heartbeat_probe = enabled;
        self
    }
}

/// Snapshot of pool counts and aggregate statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub error_connections: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub average_response_time_ms: f64,
    pub connection_usage_ratio: f64,
    pub scaling_operations: u64,
    pub avg_rtt_ms: f64,
}

/// One member slot. `conn` is `None` exactly while the connection is
/// checked out (or reserved during creation) — which is also when `state`
/// is `Busy`.
struct Entry {
    id: u64,
    state: ConnState,
    conn: Option<PoolConnection>,
    created_at: Instant,
    last_used_at: Instant,
    /// Stats as of the last checkout/checkin, used while `conn` is out.
    stats_cache: Option<ConnStats>,
}

impl Entry {
    fn stats(&self) -> Option<&ConnStats> {
        self.conn
            .as_ref()
            .map(|c| &c.stats)
            .or(self.stats_cache.as_ref())
    }
}

struct PoolInner {
    entries: Vec<Entry>,
    balancer: Box<dyn Balancer>,
    next_id: u64,
    scaling_operations: u64,
    avg_rtt_ms: f64,
}

/// A connection checked out of the pool. Hand it back with
/// [`ConnectionPool::release`]; dropping it without releasing leaks the
/// slot until the pool is closed.
#[derive(Debug)]
pub struct PooledConn {
    id: u64,
    pub conn: PoolConnection,
}

impl PooledConn {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::ops::Deref for PooledConn {
    type Target = PoolConnection;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// How a checkout ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Ok,
    Error,
}

enum AcquirePlan {
    Selected(PooledConn),
    Create { reserved_id: u64 },
    Full,
}

/// Multiplexed, auto-scaled pool of connections to one endpoint.
pub struct ConnectionPool {
    host: String,
    port: u16,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create the pool, fill it to `min_size`, and start the management
    /// loops. Connections that fail to open at startup are logged and left
    /// for the scaler to backfill.
    pub async fn new(host: &str, port: u16, config: PoolConfig) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let pool = Arc::new(Self {
            host: host.to_string(),
            port,
            inner: Mutex::new(PoolInner {
                entries: Vec::new(),
                balancer: create_balancer(config.strategy),
                next_id: 0,
                scaling_operations: 0,
                avg_rtt_ms: 0.0,
            }),
            config,
            shutdown_tx: shutdown_tx.clone(),
            closed: AtomicBool::new(false),
        });

        for _ in 0..pool.config.min_size {
            if let Err(e) = pool.add_connection().await {
                warn!("{}:{}: initial connection failed: {}", pool.host, pool.port, e);
            }
        }

        let scaler = pool.clone();
        let mut scaler_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scaler.config.scale_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => scaler.auto_scale().await,
                    _ = scaler_shutdown.recv() => break,
                }
            }
        });

        let health = pool.clone();
        let mut health_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health.config.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => health.health_sweep().await,
                    _ = health_shutdown.recv() => break,
                }
            }
        });

        pool
    }

    /// Check out an idle connection, creating one when allowed.
    pub async fn acquire(&self) -> Result<PooledConn, PoolError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(PoolError::Closed);
        }

        let plan = {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();

            let mut indexes = Vec::new();
            let mut candidates = Vec::new();
            for (i, entry) in inner.entries.iter().enumerate() {
                if entry.state != ConnState::Idle {
                    continue;
                }
                let Some(stats) = entry.stats() else { continue };
                indexes.push(i);
                candidates.push(Candidate {
                    id: entry.id,
                    total_requests: stats.total_requests,
                    avg_response_time: stats.avg_response_time,
                    last_response_time: stats.last_response_time,
                    created_at: entry.created_at,
                    idle_secs: now.duration_since(stats.last_used_at).as_secs_f64(),
                });
            }

            match inner.balancer.select(&candidates) {
                Some(pick) => {
                    let entry = &mut inner.entries[indexes[pick]];
                    let conn = entry.conn.take().expect("idle entry always holds a connection");
                    entry.state = ConnState::Busy;
                    entry.last_used_at = now;
                    entry.stats_cache = Some(conn.stats.clone());
                    AcquirePlan::Selected(PooledConn { id: entry.id, conn })
                }
                None if inner.entries.len() < self.config.max_size => {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    inner.entries.push(Entry {
                        id,
                        state: ConnState::Busy,
                        conn: None,
                        created_at: now,
                        last_used_at: now,
                        stats_cache: None,
                    });
                    AcquirePlan::Create { reserved_id: id }
                }
                None => AcquirePlan::Full,
            }
        };

        match plan {
            AcquirePlan::Selected(conn) => Ok(conn),
            AcquirePlan::Full => Err(PoolError::NoAvailableConnection),
            AcquirePlan::Create { reserved_id } => match self.connect_with_retry().await {
                Ok(conn) => Ok(PooledConn {
                    id: reserved_id,
                    conn,
                }),
                Err(e) => {
                    warn!("{}:{}: connection creation failed: {}", self.host, self.port, e);
                    let mut inner = self.inner.lock().unwrap();
                    inner.entries.retain(|entry| entry.id != reserved_id);
                    Err(PoolError::NoAvailableConnection)
                }
            },
        }
    }

    /// Return a checked-out connection.
    pub fn release(&self, pooled: PooledConn, outcome: ReleaseOutcome) {
        let mut inner = self.inner.lock().unwrap();
        let Some(position) = inner.entries.iter().position(|e| e.id == pooled.id) else {
            // The slot was reaped while checked out (pool closed); just drop.
            return;
        };
        match outcome {
            ReleaseOutcome::Ok => {
                let entry = &mut inner.entries[position];
                entry.stats_cache = Some(pooled.conn.stats.clone());
                entry.last_used_at = Instant::now();
                entry.state = ConnState::Idle;
                entry.conn = Some(pooled.conn);
            }
            ReleaseOutcome::Error => {
                debug!(
                    "{}:{}: dropping failed connection {}",
                    self.host, self.port, pooled.id
                );
                inner.entries.remove(position);
            }
        }
    }

    /// Snapshot the pool counters.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let total = inner.entries.len();
        let mut active = 0;
        let mut idle = 0;
        let mut error = 0;
        let mut requests = 0u64;
        let mut errors = 0u64;
        let mut sent = 0u64;
        let mut received = 0u64;
        let mut response_time = Duration::ZERO;

        for entry in &inner.entries {
            match entry.state {
                ConnState::Busy => active += 1,
                ConnState::Idle => idle += 1,
                ConnState::Error => error += 1,
                ConnState::Closed => {}
            }
            if let Some(stats) = entry.stats() {
                requests += stats.total_requests;
                errors += stats.total_errors;
                sent += stats.bytes_sent;
                received += stats.bytes_received;
                response_time += stats.total_response_time;
            }
        }

        PoolStats {
            total_connections: total,
            active_connections: active,
            idle_connections: idle,
            error_connections: error,
            total_requests: requests,
            total_errors: errors,
            total_bytes_sent: sent,
            total_bytes_received: received,
            average_response_time_ms: if requests > 0 {
                response_time.as_secs_f64() * 1000.0 / requests as f64
            } else {
                0.0
            },
            connection_usage_ratio: if total > 0 {
                active as f64 / total as f64
            } else {
                0.0
            },
            scaling_operations: inner.scaling_operations,
            avg_rtt_ms: inner.avg_rtt_ms,
        }
    }

    /// JSON form of [`Self::stats`], for scraping.
    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or_default()
    }

    /// Stop the management loops and close every connection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let mut inner = self.inner.lock().unwrap();
        let count = inner.entries.len();
        inner.entries.clear();
        info!("{}:{}: pool closed ({} connections)", self.host, self.port, count);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// One scaler tick: grow under load, shrink when idle.
    async fn auto_scale(&self) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }

        enum Plan {
            Grow(usize),
            Shrink(Vec<u64>),
            Hold,
        }

        let plan = {
            let mut inner = self.inner.lock().unwrap();
            let total = inner.entries.len();
            let busy = inner
                .entries
                .iter()
                .filter(|e| e.state == ConnState::Busy)
                .count();
            let idle = inner
                .entries
                .iter()
                .filter(|e| e.state == ConnState::Idle)
                .count();
            let usage = if total > 0 { busy as f64 / total as f64 } else { 1.0 };

            if usage > self.config.scale_up_threshold && total < self.config.max_size {
                let add = self.config.scale_step.min(self.config.max_size - total);
                inner.scaling_operations += 1;
                Plan::Grow(add)
            } else if idle > self.config.scale_down_idle_threshold && total > self.config.min_size {
                let remove = (idle - 1).min(total - self.config.min_size);
                // Close oldest first; the newest survivors keep their warmup.
                let mut idle_entries: Vec<(Instant, u64)> = inner
                    .entries
                    .iter()
                    .filter(|e| e.state == ConnState::Idle)
                    .map(|e| (e.created_at, e.id))
                    .collect();
                idle_entries.sort();
                let victims: Vec<u64> =
                    idle_entries.into_iter().take(remove).map(|(_, id)| id).collect();
                if victims.is_empty() {
                    Plan::Hold
                } else {
                    inner.scaling_operations += 1;
                    Plan::Shrink(victims)
                }
            } else {
                Plan::Hold
            }
        };

        match plan {
            Plan::Grow(add) => {
                debug!("{}:{}: scaling up by {}", self.host, self.port, add);
                for _ in 0..add {
                    if let Err(e) = self.add_connection().await {
                        warn!("{}:{}: scale-up connect failed: {}", self.host, self.port, e);
                    }
                }
            }
            Plan::Shrink(victims) => {
                debug!("{}:{}: scaling down by {}", self.host, self.port, victims.len());
                let mut inner = self.inner.lock().unwrap();
                inner.entries.retain(|entry| !victims.contains(&entry.id));
            }
            Plan::Hold => {}
        }
    }

    /// One health tick: expire idle/over-age/failed members, then probe.
    async fn health_sweep(&self) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();

        {
            let mut inner = self.inner.lock().unwrap();
            let idle_timeout = self.config.idle_timeout;
            let max_lifetime = self.config.max_lifetime;
            inner.entries.retain(|entry| {
                if entry.state == ConnState::Error {
                    debug!("dropping failed connection {}", entry.id);
                    return false;
                }
                if entry.state != ConnState::Idle {
                    return true;
                }
                if now.duration_since(entry.last_used_at) > idle_timeout {
                    debug!("dropping idle connection {}", entry.id);
                    return false;
                }
                if now.duration_since(entry.created_at) > max_lifetime {
                    debug!("dropping aged connection {}", entry.id);
                    return false;
                }
                true
            });
        }

        if !self.config.heartbeat_probe {
            return;
        }

        // Check out every idle connection for probing so acquire cannot
        // race a probe in progress.
        let mut probes = {
            let mut inner = self.inner.lock().unwrap();
            let mut out = Vec::new();
            for entry in inner.entries.iter_mut() {
                if entry.state == ConnState::Idle {
                    if let Some(conn) = entry.conn.take() {
                        entry.state = ConnState::Busy;
                        entry.stats_cache = Some(conn.stats.clone());
                        out.push((entry.id, conn));
                    }
                }
            }
            out
        };

        let mut results = Vec::with_capacity(probes.len());
        for (id, conn) in probes.iter_mut() {
            let outcome = conn.probe(Duration::from_millis(500)).await;
            results.push((*id, outcome.map(|rtt| rtt.as_secs_f64() * 1000.0)));
        }

        let mut inner = self.inner.lock().unwrap();
        for ((id, conn), (_, outcome)) in probes.into_iter().zip(results) {
            let Some(position) = inner.entries.iter().position(|e| e.id == id) else {
                continue;
            };
            match outcome {
                Ok(rtt_ms) => {
                    inner.avg_rtt_ms = inner.avg_rtt_ms * 0.9 + rtt_ms * 0.1;
                    let entry = &mut inner.entries[position];
                    entry.state = ConnState::Idle;
                    entry.conn = Some(conn);
                }
                Err(e) => {
                    debug!("probe failed for connection {}: {}", id, e);
                    inner.entries.remove(position);
                }
            }
        }
    }

    /// Open one connection and insert it as idle.
    async fn add_connection(&self) -> Result<(), PoolError> {
        let conn = self.connect_with_retry().await?;
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        let now = Instant::now();
        inner.entries.push(Entry {
            id,
            state: ConnState::Idle,
            conn: Some(conn),
            created_at: now,
            last_used_at: now,
            stats_cache: None,
        });
        Ok(())
    }

    /// Connect with up to three attempts on transient failure.
    async fn connect_with_retry(&self) -> Result<PoolConnection, PoolError> {
        let mut last_error = None;
        for attempt in 1..=3u32 {
            match PoolConnection::connect(
                &self.host,
                self.port,
                self.config.connection_timeout,
                self.config.max_frame_bytes,
            )
            .await
            {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(
                        "{}:{}: connect attempt {} failed: {}",
                        self.host, self.port, attempt, e
                    );
                    last_error = Some(e);
                    if attempt < 3 {
                        tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or(PoolError::NoAvailableConnection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts connections and parks them; the pool only needs live sockets.
    async fn spawn_sink() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                held.push(stream);
            }
        });
        addr
    }

    fn quick_config() -> PoolConfig {
        PoolConfig::default()
            .with_sizes(2, 5)
            .with_scale_interval(Duration::from_millis(100))
            .with_heartbeat_probe(false)
    }

    #[tokio::test]
    async fn initial_fill_reaches_min_size() {
        let addr = spawn_sink().await;
        let pool = ConnectionPool::new("127.0.0.1", addr.port(), quick_config()).await;
        let stats = pool.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.active_connections, 0);
        pool.close();
    }

    #[tokio::test]
    async fn acquire_release_state_machine() {
        let addr = spawn_sink().await;
        let pool = ConnectionPool::new("127.0.0.1", addr.port(), quick_config()).await;

        let conn = pool.acquire().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(
            stats.active_connections + stats.idle_connections + stats.error_connections,
            stats.total_connections
        );

        pool.release(conn, ReleaseOutcome::Ok);
        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 2);
        pool.close();
    }

    #[tokio::test]
    async fn acquire_grows_to_max_then_fails() {
        let addr = spawn_sink().await;
        let config = PoolConfig::default()
            .with_sizes(1, 2)
            .with_scale_interval(Duration::from_secs(3600))
            .with_heartbeat_probe(false);
        let pool = ConnectionPool::new("127.0.0.1", addr.port(), config).await;

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap(); // created on demand
        assert_eq!(pool.stats().total_connections, 2);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::NoAvailableConnection));

        pool.release(first, ReleaseOutcome::Ok);
        pool.release(second, ReleaseOutcome::Ok);
        pool.close();
    }

    #[tokio::test]
    async fn error_release_removes_the_connection() {
        let addr = spawn_sink().await;
        let pool = ConnectionPool::new("127.0.0.1", addr.port(), quick_config()).await;

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, ReleaseOutcome::Error);
        assert_eq!(pool.stats().total_connections, 1);
        pool.close();
    }

    #[tokio::test]
    async fn scaler_grows_under_load_and_shrinks_when_idle() {
        let addr = spawn_sink().await;
        let config = PoolConfig::default()
            .with_sizes(2, 5)
            .with_scale_interval(Duration::from_millis(100))
            .with_heartbeat_probe(false);
        let pool = ConnectionPool::new("127.0.0.1", addr.port(), config).await;

        // Saturate: usage 2/2 = 1.0 > 0.7, so one tick adds scale_step = 2.
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(pool.stats().total_connections, 4);

        // Release both: idle 4 > threshold 2, shrink to min_size.
        pool.release(a, ReleaseOutcome::Ok);
        pool.release(b, ReleaseOutcome::Ok);
        tokio::time::sleep(Duration::from_millis(350)).await;
        let stats = pool.stats();
        assert_eq!(stats.total_connections, 2);
        assert!(stats.scaling_operations >= 2);
        pool.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_acquire_fails_after() {
        let addr = spawn_sink().await;
        let pool = ConnectionPool::new("127.0.0.1", addr.port(), quick_config()).await;
        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
        assert_eq!(pool.stats().total_connections, 0);
    }

    #[tokio::test]
    async fn unreachable_endpoint_does_not_fault_the_pool() {
        // Nothing is listening on this port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = PoolConfig {
            connection_timeout: Duration::from_millis(200),
            ..quick_config()
        };
        let pool = ConnectionPool::new("127.0.0.1", addr.port(), config).await;
        assert_eq!(pool.stats().total_connections, 0);
        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::NoAvailableConnection)
        ));
        pool.close();
    }
}
