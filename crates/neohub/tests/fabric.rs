//! End-to-end fabric scenarios: a real hub on an ephemeral port, real
//! workers and callers over TCP.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use neoconf::NeoConfig;
use neohub::{DiscoveryServer, Hub};
use neoproto::{
    frame, error_code, ClientConfig, ClientError, Frame, FrameKind, IpcClient, Worker,
    WorkerConfig, DEFAULT_MAX_FRAME_BYTES,
};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

struct Fabric {
    hub_port: u16,
    disco_port: u16,
    shutdown_tx: broadcast::Sender<()>,
}

impl Fabric {
    async fn start(mut config: NeoConfig) -> Self {
        let hub_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let disco_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub_port = hub_listener.local_addr().unwrap().port();
        let disco_port = disco_listener.local_addr().unwrap().port();
        config.hub.host = "127.0.0.1".to_string();
        config.hub.port = hub_port;
        config.hub.discovery_port = disco_port;

        let (shutdown_tx, _) = broadcast::channel(1);
        let hub = Hub::new(config);

        let discovery = DiscoveryServer::new(hub.registry());
        let disco_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            discovery
                .serve_listener(disco_listener, disco_shutdown)
                .await
                .unwrap();
        });

        let hub_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            hub.serve_listener(hub_listener, hub_shutdown).await.unwrap();
        });

        Self {
            hub_port,
            disco_port,
            shutdown_tx,
        }
    }

    async fn start_default() -> Self {
        Self::start(NeoConfig::default()).await
    }

    /// A math worker serving `add`, running in the background.
    async fn spawn_math_worker(&self) -> tokio::task::JoinHandle<()> {
        let mut worker = Worker::connect(WorkerConfig::new("127.0.0.1", self.hub_port))
            .await
            .unwrap();
        worker.handle("add", |params: Value| {
            async move {
                let a = params["a"].as_i64().unwrap_or(0);
                let b = params["b"].as_i64().unwrap_or(0);
                Ok(json!({"result": a + b}))
            }
            .boxed()
        });
        worker.register("math", BTreeMap::new()).await.unwrap();
        tokio::spawn(async move {
            let _ = worker.run().await;
        })
    }

    async fn caller(&self, name: &str) -> Arc<IpcClient> {
        IpcClient::connect(ClientConfig::new(name, "127.0.0.1", self.hub_port))
            .await
            .unwrap()
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[tokio::test]
async fn happy_path_request() {
    let fabric = Fabric::start_default().await;
    let _worker = fabric.spawn_math_worker().await;

    let caller = fabric.caller("caller-1").await;
    let result = caller
        .call("math", "add", &json!({"a": 10, "b": 5}))
        .await
        .unwrap();
    assert_eq!(result["result"], 15);
}

#[tokio::test]
async fn service_unavailable() {
    let fabric = Fabric::start_default().await;
    let caller = fabric.caller("caller-2").await;

    let err = caller
        .call("ghost", "noop", &json!({}))
        .await
        .unwrap_err();
    match err {
        ClientError::Remote { code, message } => {
            assert_eq!(code, error_code::SERVICE_UNAVAILABLE);
            assert_eq!(message, "service unavailable");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn method_not_in_capability_set() {
    let fabric = Fabric::start_default().await;
    let _worker = fabric.spawn_math_worker().await;

    let caller = fabric.caller("caller-3").await;
    let err = caller.call("math", "pow", &json!({})).await.unwrap_err();
    match err {
        ClientError::Remote { code, .. } => assert_eq!(code, error_code::METHOD_NOT_FOUND),
        other => panic!("expected remote error, got {other:?}"),
    }
}

/// Register a service with raw frames and return the connection; the
/// "worker" never answers requests.
async fn raw_silent_worker(hub_port: u16, service: &str) -> tokio::net::TcpStream {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", hub_port))
        .await
        .unwrap();
    let register = Frame::register(service, &BTreeMap::new(), &[]).unwrap();
    stream
        .write_all(&register.encode(DEFAULT_MAX_FRAME_BYTES).unwrap())
        .await
        .unwrap();
    // Wait for the ack so the registration is visible before returning.
    let (read_half, _) = stream.split();
    let mut reader = BufReader::new(read_half);
    let ack = frame::read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.kind, FrameKind::Response);
    stream
}

#[tokio::test]
async fn worker_disconnect_fails_inflight_exactly_once() {
    let fabric = Fabric::start_default().await;
    let worker_conn = raw_silent_worker(fabric.hub_port, "math").await;

    let caller = fabric.caller("caller-4").await;
    let pending = {
        let caller = caller.clone();
        tokio::spawn(async move {
            caller
                .issue(
                    Frame::request("math", "add", Bytes::from_static(br#"{"a":1,"b":2}"#))
                        .with_correlation_id(Bytes::from_static(b"c2")),
                    Duration::from_secs(30),
                )
                .await
        })
    };

    // Let the request reach the worker, then kill the worker socket.
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(worker_conn);

    let err = pending.await.unwrap().unwrap_err();
    match err {
        ClientError::Remote { code, .. } => assert_eq!(code, error_code::UNAVAILABLE),
        other => panic!("expected UNAVAILABLE, got {other:?}"),
    }

    // A replacement worker must not see the dead request.
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let mut worker = Worker::connect(WorkerConfig::new("127.0.0.1", fabric.hub_port))
        .await
        .unwrap();
    worker.handle("add", move |_params: Value| {
        counted.fetch_add(1, Ordering::SeqCst);
        async { Ok(json!({"result": 0})) }.boxed()
    });
    worker.register("math", BTreeMap::new()).await.unwrap();
    tokio::spawn(async move {
        let _ = worker.run().await;
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn newer_registration_supersedes_older() {
    let fabric = Fabric::start_default().await;
    let _old = raw_silent_worker(fabric.hub_port, "math").await;

    // In-flight request routed to the silent old worker.
    let caller = fabric.caller("caller-5").await;
    let pending = {
        let caller = caller.clone();
        tokio::spawn(async move {
            caller
                .issue(
                    Frame::request("math", "add", Bytes::from_static(br#"{"a":3,"b":4}"#))
                        .with_correlation_id(Bytes::from_static(b"c3")),
                    Duration::from_secs(30),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Worker B takes over the name.
    let _new = fabric.spawn_math_worker().await;

    let err = pending.await.unwrap().unwrap_err();
    match err {
        ClientError::Remote { code, .. } => assert_eq!(code, error_code::SUPERSEDED),
        other => panic!("expected SUPERSEDED, got {other:?}"),
    }

    // New traffic flows to B.
    let result = caller
        .call("math", "add", &json!({"a": 20, "b": 22}))
        .await
        .unwrap();
    assert_eq!(result["result"], 42);
}

#[tokio::test]
async fn hub_times_out_unanswered_requests() {
    let mut config = NeoConfig::default();
    config.hub.request_timeout_secs = 1;
    let fabric = Fabric::start(config).await;
    let _worker = raw_silent_worker(fabric.hub_port, "math").await;

    let caller = fabric.caller("caller-6").await;
    let err = caller
        .issue(
            Frame::request("math", "add", Bytes::from_static(b"{}"))
                .with_correlation_id(Bytes::from_static(b"c-slow")),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
    match err {
        ClientError::Remote { code, .. } => assert_eq!(code, error_code::TIMEOUT),
        other => panic!("expected hub TIMEOUT, got {other:?}"),
    }
}

#[tokio::test]
async fn correlated_heartbeats_are_echoed() {
    let fabric = Fabric::start_default().await;
    let caller = fabric.caller("caller-7").await;
    caller.heartbeat().await.unwrap();
}

#[tokio::test]
async fn pool_probes_survive_against_the_hub() {
    let fabric = Fabric::start_default().await;
    let config = neopool::PoolConfig {
        health_check_interval: Duration::from_millis(200),
        ..neopool::PoolConfig::default().with_sizes(2, 4)
    };
    let pool = neopool::ConnectionPool::new("127.0.0.1", fabric.hub_port, config).await;

    // Several probe rounds pass without the pool shedding connections.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let stats = pool.stats();
    assert_eq!(stats.total_connections, 2);
    assert!(stats.avg_rtt_ms > 0.0);
    pool.close();
}

#[tokio::test]
async fn discovery_ttl_expires_without_renewal() {
    let mut config = NeoConfig::default();
    config.discovery.service_ttl_secs = 2;
    let fabric = Fabric::start(config).await;

    let client = neodisco::DiscoveryClient::new("127.0.0.1", fabric.disco_port);
    let info = neoproto::ServiceInfo::new(
        "i-ttl",
        "flash",
        "127.0.0.1",
        9091,
        BTreeMap::new(),
        Duration::from_secs(2),
    );
    client.register(&info).await.unwrap();
    assert_eq!(client.discover("flash").await.unwrap().len(), 1);

    // No renewals: gone no later than 3 s after the last one.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(client.discover("flash").await.unwrap().is_empty());
}

#[tokio::test]
async fn worker_heartbeats_keep_the_lease_alive() {
    let mut config = NeoConfig::default();
    config.discovery.service_ttl_secs = 1;
    let fabric = Fabric::start(config).await;

    let mut worker = Worker::connect(
        WorkerConfig::new("127.0.0.1", fabric.hub_port)
            .with_heartbeat_interval(Duration::from_millis(200)),
    )
    .await
    .unwrap();
    worker.handle("noop", |_| async { Ok(Value::Null) }.boxed());
    worker.register("steady", BTreeMap::new()).await.unwrap();
    tokio::spawn(async move {
        let _ = worker.run().await;
    });

    let client = neodisco::DiscoveryClient::new("127.0.0.1", fabric.disco_port);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(client.discover("steady").await.unwrap().len(), 1);
}

#[tokio::test]
async fn graceful_shutdown_notifies_workers() {
    let fabric = Fabric::start_default().await;

    let mut worker = Worker::connect(WorkerConfig::new("127.0.0.1", fabric.hub_port))
        .await
        .unwrap();
    worker.handle("noop", |_| async { Ok(Value::Null) }.boxed());
    worker.register("math", BTreeMap::new()).await.unwrap();
    let running = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    fabric.shutdown_tx.send(()).unwrap();

    // The worker sees the shutdown notice and exits cleanly.
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("worker did not drain in time")
        .unwrap();
    assert!(result.is_ok());
}
