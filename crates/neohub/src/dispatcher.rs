//! The hub dispatcher: accept loop, per-session readers, frame routing.
//!
//! Routing state is two maps: `bindings` (service name -> the worker
//! session serving it, plus its method table) and `routes`
//! (`(worker_session, correlation_id)` -> waiting caller). A request
//! inserts a route and forwards the frame verbatim; the matching response
//! clears the route and flows back. Everything else is lifecycle: register
//! (with supersede), heartbeats, reaping, and draining on shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use neoconf::NeoConfig;
use neoproto::{
    error_code, frame, meta, Compression, Frame, FrameKind, RegisterPayload, ServiceInfo,
};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::ServiceRegistry;
use crate::session::SessionHandle;

/// The worker session currently serving a service name.
struct ServiceBinding {
    session_id: Uuid,
    instance_id: String,
    /// Advertised method table; `None` means the worker did not advertise
    /// one and every method is forwarded.
    methods: Option<HashSet<String>>,
}

/// One in-flight forwarded request.
struct RouteEntry {
    caller: Uuid,
    expires_at: Instant,
}

/// The broker: owns the registry, sessions, and routing state.
pub struct Hub {
    config: NeoConfig,
    registry: Arc<ServiceRegistry>,
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    bindings: Mutex<HashMap<String, ServiceBinding>>,
    routes: Mutex<HashMap<(Uuid, Bytes), RouteEntry>>,
}

impl Hub {
    pub fn new(config: NeoConfig) -> Arc<Self> {
        let registry = Arc::new(ServiceRegistry::new(config.discovery.service_ttl()));
        Arc::new(Self {
            config,
            registry,
            sessions: RwLock::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// The registry this hub maintains (shared with the discovery endpoint).
    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.registry.clone()
    }

    fn max_frame_bytes(&self) -> usize {
        self.config.protocol.max_frame_bytes
    }

    /// Bind the configured endpoint and serve until shutdown.
    pub async fn serve(
        self: &Arc<Self>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let addr = (self.config.hub.host.as_str(), self.config.hub.port);
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, shutdown_rx).await
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn serve_listener(
        self: &Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        info!("hub listening on {}", listener.local_addr()?);

        let tasks = CancellationToken::new();
        self.spawn_route_sweeper(tasks.child_token());
        self.spawn_reaper(tasks.child_token());
        self.spawn_registry_expiry(tasks.child_token());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let (read_half, write_half) = stream.into_split();
                            let session =
                                SessionHandle::spawn(peer, write_half, self.max_frame_bytes());
                            debug!("session {} accepted from {}", session.id, peer);
                            self.sessions.write().await.insert(session.id, session.clone());
                            let hub = self.clone();
                            tokio::spawn(async move {
                                hub.session_loop(session, read_half).await;
                            });
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        drop(listener);
        self.drain().await;
        tasks.cancel();
        info!("hub stopped");
        Ok(())
    }

    /// Read frames from one session until it dies.
    async fn session_loop(
        self: Arc<Self>,
        session: Arc<SessionHandle>,
        read_half: tokio::net::tcp::OwnedReadHalf,
    ) {
        let mut reader = BufReader::new(read_half);
        loop {
            tokio::select! {
                biased;
                _ = session.cancel.cancelled() => break,
                result = frame::read_frame(&mut reader, self.max_frame_bytes()) => {
                    match result {
                        Ok(Some(received)) => {
                            session.touch();
                            self.dispatch(&session, received).await;
                        }
                        Ok(None) => {
                            debug!("session {}: peer closed", session.id);
                            break;
                        }
                        Err(e) => {
                            // Protocol errors are fatal: no partial recovery.
                            warn!("session {}: protocol error, closing: {}", session.id, e);
                            break;
                        }
                    }
                }
            }
        }
        self.cleanup_session(&session).await;
    }

    async fn dispatch(&self, session: &Arc<SessionHandle>, received: Frame) {
        match received.kind {
            FrameKind::Register => self.handle_register(session, received).await,
            FrameKind::Request => {
                if received.metadata.contains_key(meta::CANCEL) {
                    self.handle_cancel(session, &received);
                } else {
                    self.handle_request(session, received).await;
                }
            }
            FrameKind::Response | FrameKind::Error => self.handle_response(session, received).await,
            FrameKind::Heartbeat => self.handle_heartbeat(session, received).await,
        }
    }

    async fn handle_register(&self, session: &Arc<SessionHandle>, received: Frame) {
        let payload: RegisterPayload = match serde_json::from_slice(&received.payload) {
            Ok(p) => p,
            Err(e) => {
                self.reply_error(
                    session,
                    received.correlation_id,
                    error_code::INVALID_REGISTRATION,
                    format!("invalid registration payload: {}", e),
                )
                .await;
                return;
            }
        };
        if payload.name.is_empty() {
            self.reply_error(
                session,
                received.correlation_id,
                error_code::INVALID_REGISTRATION,
                "registration requires a service name",
            )
            .await;
            return;
        }
        // A worker that plans to speak an algorithm this hub cannot decode
        // must not register at all.
        if let Some(requested) = payload.metadata.get("compression") {
            if Compression::parse(requested).is_err() {
                self.reply_error(
                    session,
                    received.correlation_id,
                    error_code::UNSUPPORTED_COMPRESSION,
                    format!("unsupported compression algorithm: {}", requested),
                )
                .await;
                return;
            }
        }

        let methods: Option<HashSet<String>> = received.metadata.get(meta::METHODS).map(|joined| {
            joined
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect()
        });

        let instance_id = Uuid::new_v4().to_string();
        let superseded = {
            let mut bindings = self.bindings.lock().unwrap();
            let old = bindings.insert(
                payload.name.clone(),
                ServiceBinding {
                    session_id: session.id,
                    instance_id: instance_id.clone(),
                    methods,
                },
            );
            old.filter(|b| b.session_id != session.id).map(|b| b.session_id)
        };

        if let Some(old_sid) = superseded {
            info!(
                "service '{}': session {} supersedes {}",
                payload.name, session.id, old_sid
            );
            // In-flight requests routed through the old worker complete
            // with SUPERSEDED, then the old session is closed.
            let victims = self.take_routes_for_worker(old_sid);
            for (correlation_id, caller) in victims {
                self.send_to_session(
                    caller,
                    Frame::error_response(
                        correlation_id,
                        error_code::SUPERSEDED,
                        "service superseded by a newer registration",
                    ),
                )
                .await;
            }
            if let Some(old) = self.sessions.read().await.get(&old_sid) {
                old.close();
            }
        }

        self.registry.register(ServiceInfo::new(
            instance_id.clone(),
            payload.name.clone(),
            session.peer.ip().to_string(),
            session.peer.port(),
            payload.metadata,
            self.config.discovery.service_ttl(),
        ));
        session.set_registered(&payload.name);

        let ack = Frame::response(
            received.correlation_id,
            Bytes::from(
                serde_json::json!({ "id": instance_id })
                    .to_string()
                    .into_bytes(),
            ),
        );
        if session.send(ack).await.is_err() {
            warn!("session {}: failed to send register ack", session.id);
        }
    }

    async fn handle_request(&self, session: &Arc<SessionHandle>, mut received: Frame) {
        let service = received.service.clone();

        enum Target {
            Unknown,
            MethodMissing,
            Worker(Uuid),
        }

        let target = {
            let bindings = self.bindings.lock().unwrap();
            match bindings.get(&service) {
                None => Target::Unknown,
                Some(binding) => {
                    let known = binding
                        .methods
                        .as_ref()
                        .map(|table| received.method.is_empty() || table.contains(&received.method))
                        .unwrap_or(true);
                    if !known {
                        Target::MethodMissing
                    } else {
                        Target::Worker(binding.session_id)
                    }
                }
            }
        };

        let worker_sid = match target {
            Target::Unknown => {
                self.reply_error(
                    session,
                    received.correlation_id,
                    error_code::SERVICE_UNAVAILABLE,
                    "service unavailable",
                )
                .await;
                return;
            }
            Target::MethodMissing => {
                self.reply_error(
                    session,
                    received.correlation_id,
                    error_code::METHOD_NOT_FOUND,
                    format!("Method '{}' not found", received.method),
                )
                .await;
                return;
            }
            Target::Worker(sid) => sid,
        };

        // The registry lease is the source of truth for liveness; a bound
        // worker whose lease lapsed is unavailable even if its socket lives.
        if !self.registry.contains_live(&service) {
            self.reply_error(
                session,
                received.correlation_id,
                error_code::SERVICE_UNAVAILABLE,
                "service unavailable",
            )
            .await;
            return;
        }

        if received.correlation_id.is_empty() {
            received.correlation_id = Bytes::from(Uuid::new_v4().to_string().into_bytes());
        }
        let correlation_id = received.correlation_id.clone();

        let duplicate = {
            let mut routes = self.routes.lock().unwrap();
            let key = (worker_sid, correlation_id.clone());
            if routes.contains_key(&key) {
                true
            } else {
                routes.insert(
                    key,
                    RouteEntry {
                        caller: session.id,
                        expires_at: Instant::now() + self.config.hub.request_timeout(),
                    },
                );
                false
            }
        };
        if duplicate {
            self.reply_error(
                session,
                correlation_id,
                error_code::DUPLICATE_CORRELATION,
                "correlation id already in flight",
            )
            .await;
            return;
        }

        let worker = self.sessions.read().await.get(&worker_sid).cloned();
        let delivered = match worker {
            Some(worker) => worker.send(received).await.is_ok(),
            None => false,
        };
        if !delivered {
            self.routes
                .lock()
                .unwrap()
                .remove(&(worker_sid, correlation_id.clone()));
            self.reply_error(
                session,
                correlation_id,
                error_code::UNAVAILABLE,
                "worker unavailable",
            )
            .await;
        }
    }

    async fn handle_response(&self, session: &Arc<SessionHandle>, received: Frame) {
        let key = (session.id, received.correlation_id.clone());
        let entry = self.routes.lock().unwrap().remove(&key);
        match entry {
            Some(route) => {
                self.send_to_session(route.caller, received).await;
            }
            None => {
                // Late response to a timed-out or cancelled request.
                warn!(
                    "session {}: orphan response {}",
                    session.id,
                    String::from_utf8_lossy(&received.correlation_id)
                );
            }
        }
    }

    async fn handle_heartbeat(&self, session: &Arc<SessionHandle>, received: Frame) {
        if let Some(service) = session.service() {
            self.registry.touch(&service);
        }
        // Correlated heartbeats are pings (pool probes, client liveness
        // checks) and get an echo; plain worker heartbeats need no reply.
        if !received.correlation_id.is_empty() {
            let echo = Frame::heartbeat(received.service).with_correlation_id(received.correlation_id);
            let _ = session.send(echo).await;
        }
    }

    fn handle_cancel(&self, session: &Arc<SessionHandle>, received: &Frame) {
        let Some(encoded) = received.metadata.get(meta::CANCEL) else {
            return;
        };
        let Ok(correlation_id) = hex::decode(encoded) else {
            return;
        };
        let correlation_id = Bytes::from(correlation_id);
        let mut routes = self.routes.lock().unwrap();
        let key = routes
            .iter()
            .find(|((_, corr), entry)| entry.caller == session.id && *corr == correlation_id)
            .map(|(key, _)| key.clone());
        if let Some(key) = key {
            routes.remove(&key);
            debug!(
                "session {}: cancelled request {}",
                session.id,
                String::from_utf8_lossy(&correlation_id)
            );
        }
    }

    /// Remove a dead session and fail everything that depended on it.
    async fn cleanup_session(&self, session: &Arc<SessionHandle>) {
        session.close();
        self.sessions.write().await.remove(&session.id);

        if let Some(service) = session.service() {
            let owned = {
                let mut bindings = self.bindings.lock().unwrap();
                match bindings.get(&service) {
                    Some(binding) if binding.session_id == session.id => {
                        let binding = bindings.remove(&service).unwrap();
                        Some(binding.instance_id)
                    }
                    _ => None,
                }
            };
            if let Some(instance_id) = owned {
                self.registry.deregister(&service, &instance_id);
            }
        }

        // Requests waiting on this worker complete exactly once, with
        // UNAVAILABLE; a later worker for the same name must not see them.
        let victims = self.take_routes_for_worker(session.id);
        for (correlation_id, caller) in victims {
            self.send_to_session(
                caller,
                Frame::error_response(
                    correlation_id,
                    error_code::UNAVAILABLE,
                    "worker disconnected",
                ),
            )
            .await;
        }
        // Requests this session was waiting on have nobody to deliver to.
        self.routes
            .lock()
            .unwrap()
            .retain(|_, entry| entry.caller != session.id);

        info!("session {} closed", session.id);
    }

    /// Pull every route through the given worker session.
    fn take_routes_for_worker(&self, worker_sid: Uuid) -> Vec<(Bytes, Uuid)> {
        let mut routes = self.routes.lock().unwrap();
        let keys: Vec<(Uuid, Bytes)> = routes
            .keys()
            .filter(|(sid, _)| *sid == worker_sid)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| routes.remove(&key).map(|entry| (key.1, entry.caller)))
            .collect()
    }

    async fn reply_error(
        &self,
        session: &Arc<SessionHandle>,
        correlation_id: Bytes,
        code: &str,
        message: impl AsRef<str>,
    ) {
        let reply = Frame::error_response(correlation_id, code, message);
        if session.send(reply).await.is_err() {
            debug!("session {}: error reply undeliverable", session.id);
        }
    }

    async fn send_to_session(&self, session_id: Uuid, outgoing: Frame) {
        let target = self.sessions.read().await.get(&session_id).cloned();
        match target {
            Some(target) => {
                if target.send(outgoing).await.is_err() {
                    debug!("session {}: frame undeliverable", session_id);
                }
            }
            None => debug!("session {}: gone, dropping frame", session_id),
        }
    }

    /// Graceful shutdown: notify sessions, drain in-flight work, close.
    async fn drain(self: &Arc<Self>) {
        let sessions: Vec<Arc<SessionHandle>> =
            self.sessions.read().await.values().cloned().collect();
        info!("draining {} sessions", sessions.len());

        let notice = Frame::heartbeat("").with_metadata(meta::SHUTDOWN, "true");
        for session in &sessions {
            session.try_send(notice.clone());
        }

        let deadline = Instant::now() + self.config.hub.drain_timeout();
        while Instant::now() < deadline {
            if self.routes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for session in sessions {
            session.close();
        }
    }

    /// Age out routing entries past `request_timeout`.
    fn spawn_route_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let expired: Vec<(Bytes, Uuid)> = {
                            let mut routes = hub.routes.lock().unwrap();
                            let keys: Vec<(Uuid, Bytes)> = routes
                                .iter()
                                .filter(|(_, entry)| now > entry.expires_at)
                                .map(|(key, _)| key.clone())
                                .collect();
                            keys.into_iter()
                                .filter_map(|key| {
                                    routes.remove(&key).map(|entry| (key.1, entry.caller))
                                })
                                .collect()
                        };
                        for (correlation_id, caller) in expired {
                            debug!(
                                "request {} timed out at the hub",
                                String::from_utf8_lossy(&correlation_id)
                            );
                            hub.send_to_session(
                                caller,
                                Frame::error_response(
                                    correlation_id,
                                    error_code::TIMEOUT,
                                    "request timed out",
                                ),
                            )
                            .await;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Close sessions that have gone silent past `session_timeout`.
    fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.hub.reap_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let timeout_ms = hub.config.hub.session_timeout().as_millis() as i64;
                        let stale: Vec<Arc<SessionHandle>> = hub
                            .sessions
                            .read()
                            .await
                            .values()
                            .filter(|s| s.silent_for_ms() > timeout_ms)
                            .cloned()
                            .collect();
                        for session in stale {
                            warn!(
                                "session {}: heartbeat lost ({} ms silent), closing",
                                session.id,
                                session.silent_for_ms()
                            );
                            session.close();
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Expire registry leases on a 1 s cadence.
    fn spawn_registry_expiry(self: &Arc<Self>, cancel: CancellationToken) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        hub.registry.expire_once();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}
