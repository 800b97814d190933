//! Health checker: user-supplied probes on their own schedules.
//!
//! Each check runs initial delay -> { probe with timeout -> retry with 1 s
//! backoff -> publish } on an `interval` cadence. Results are delivered to
//! subscribers at publish time without blocking the checker: a subscriber
//! whose buffer is full is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Probe outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// A user-supplied probe. `Ok(details)` is healthy; `Err(message)` is not.
pub type Probe = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Scheduling parameters for one check.
#[derive(Debug, Clone, Copy)]
pub struct CheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub initial_delay: Duration,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            retries: 3,
            initial_delay: Duration::ZERO,
        }
    }
}

/// Latest outcome of one check.
#[derive(Debug, Clone)]
pub struct HealthResult {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub details: Value,
    pub error: Option<String>,
}

impl Default for HealthResult {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            checked_at: Utc::now(),
            details: Value::Null,
            error: None,
        }
    }
}

struct Inner {
    results: HashMap<String, HealthResult>,
    tasks: HashMap<String, CancellationToken>,
    subscribers: Vec<mpsc::Sender<(String, HealthResult)>>,
}

/// Owns check schedules and their latest results.
pub struct HealthChecker {
    inner: Mutex<Inner>,
}

impl HealthChecker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                results: HashMap::new(),
                tasks: HashMap::new(),
                subscribers: Vec::new(),
            }),
        })
    }

    /// Add a check and start its schedule. Re-adding a name replaces the
    /// previous schedule.
    pub fn add_check(self: &Arc<Self>, name: &str, probe: Probe, config: CheckConfig) {
        let cancel = CancellationToken::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(previous) = inner.tasks.insert(name.to_string(), cancel.clone()) {
                previous.cancel();
            }
            inner.results.insert(name.to_string(), HealthResult::default());
        }

        let checker = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if !config.initial_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(config.initial_delay) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            loop {
                let result = run_probe(&probe, &config).await;
                if result.status == HealthStatus::Unhealthy {
                    warn!(
                        "health check failed: {} (error={:?})",
                        name, result.error
                    );
                } else {
                    debug!("health check passed: {}", name);
                }
                checker.publish(&name, result);

                tokio::select! {
                    _ = tokio::time::sleep(config.interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Stop and forget a check.
    pub fn remove_check(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cancel) = inner.tasks.remove(name) {
            cancel.cancel();
        }
        inner.results.remove(name);
    }

    /// Latest result for a check.
    pub fn result(&self, name: &str) -> Option<HealthResult> {
        self.inner.lock().unwrap().results.get(name).cloned()
    }

    /// All latest results.
    pub fn all_results(&self) -> HashMap<String, HealthResult> {
        self.inner.lock().unwrap().results.clone()
    }

    /// Receive `(check name, result)` at every publish. A receiver that
    /// stops draining its buffer is dropped.
    pub fn subscribe(&self) -> mpsc::Receiver<(String, HealthResult)> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    /// Stop every check.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, cancel) in inner.tasks.drain() {
            cancel.cancel();
        }
        inner.results.clear();
        inner.subscribers.clear();
    }

    fn publish(&self, name: &str, result: HealthResult) {
        let mut inner = self.inner.lock().unwrap();
        inner.results.insert(name.to_string(), result.clone());
        inner.subscribers.retain(|tx| {
            match tx.try_send((name.to_string(), result.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("dropping slow health subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// One scheduled run: probe with timeout, retrying with 1 s backoff.
async fn run_probe(probe: &Probe, config: &CheckConfig) -> HealthResult {
    let mut error = None;
    let attempts = config.retries.max(1);
    for attempt in 0..attempts {
        match tokio::time::timeout(config.timeout, probe()).await {
            Ok(Ok(details)) => {
                return HealthResult {
                    status: HealthStatus::Healthy,
                    checked_at: Utc::now(),
                    details,
                    error: None,
                };
            }
            Ok(Err(message)) => error = Some(message),
            Err(_) => error = Some("check timed out".to_string()),
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
    HealthResult {
        status: HealthStatus::Unhealthy,
        checked_at: Utc::now(),
        details: Value::Null,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_config() -> CheckConfig {
        CheckConfig {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(200),
            retries: 1,
            initial_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn healthy_probe_publishes_healthy() {
        let checker = HealthChecker::new();
        checker.add_check(
            "ok",
            Arc::new(|| async { Ok(serde_json::json!({"up": true})) }.boxed()),
            quick_config(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = checker.result("ok").unwrap();
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.details["up"], true);
        checker.close();
    }

    #[tokio::test]
    async fn failing_probe_retries_then_reports_unhealthy() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let checker = HealthChecker::new();
        checker.add_check(
            "down",
            Arc::new(move || {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Err("boom".to_string()) }.boxed()
            }),
            CheckConfig {
                interval: Duration::from_secs(3600),
                timeout: Duration::from_millis(200),
                retries: 3,
                initial_delay: Duration::ZERO,
            },
        );

        // Two retries at 1 s apart, then the publish.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let result = checker.result("down").unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        checker.close();
    }

    #[tokio::test]
    async fn hung_probe_times_out() {
        let checker = HealthChecker::new();
        checker.add_check(
            "hung",
            Arc::new(|| {
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }
                .boxed()
            }),
            CheckConfig {
                interval: Duration::from_secs(3600),
                timeout: Duration::from_millis(50),
                retries: 1,
                initial_delay: Duration::ZERO,
            },
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let result = checker.result("hung").unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.error.as_deref(), Some("check timed out"));
        checker.close();
    }

    #[tokio::test]
    async fn subscribers_receive_publishes() {
        let checker = HealthChecker::new();
        let mut rx = checker.subscribe();
        checker.add_check(
            "ok",
            Arc::new(|| async { Ok(Value::Null) }.boxed()),
            quick_config(),
        );

        let (name, result) = rx.recv().await.unwrap();
        assert_eq!(name, "ok");
        assert_eq!(result.status, HealthStatus::Healthy);
        checker.close();
    }

    #[tokio::test]
    async fn removed_check_stops_publishing() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let checker = HealthChecker::new();
        checker.add_check(
            "gone",
            Arc::new(move || {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok(Value::Null) }.boxed()
            }),
            quick_config(),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        checker.remove_check("gone");
        assert!(checker.result("gone").is_none());

        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
        checker.close();
    }
}
