//! Registrar: keep a service's registration alive and honest.
//!
//! `register` issues the initial registration, then a renewal task
//! re-registers every `service_ttl / 3` (renewals are idempotent on the
//! instance id; a failed renewal is retried at the next tick — re-register
//! *is* the recovery). When health checks are attached, a monitor task
//! mirrors their verdict into the registered status.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use neoproto::{ServiceInfo, ServiceStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::DiscoveryClient;
use crate::health::{CheckConfig, HealthChecker, HealthStatus, Probe};
use crate::DiscoveryError;

/// A health check to attach at registration time.
pub struct ServiceCheck {
    pub name: String,
    pub probe: Probe,
    pub config: CheckConfig,
}

struct Registration {
    info: ServiceInfo,
    cancel: CancellationToken,
    check_names: Vec<String>,
}

/// Caller-side registration agent.
pub struct Registrar {
    client: DiscoveryClient,
    health: Arc<HealthChecker>,
    service_ttl: Duration,
    registered: Arc<Mutex<HashMap<String, Registration>>>,
}

impl Registrar {
    pub fn new(client: DiscoveryClient, health: Arc<HealthChecker>, service_ttl: Duration) -> Self {
        Self {
            client,
            health,
            service_ttl,
            registered: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a service instance and start its renewal (and, with
    /// checks, its status monitor). Returns the instance id.
    pub async fn register(
        &self,
        name: &str,
        address: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
        checks: Vec<ServiceCheck>,
    ) -> Result<String, DiscoveryError> {
        let instance_id = Uuid::new_v4().to_string();
        let info = ServiceInfo::new(
            instance_id.clone(),
            name,
            address,
            port,
            metadata,
            self.service_ttl,
        );

        // At-most-once creation: the first register must succeed before
        // any renewal machinery exists for it.
        self.client.register(&info).await?;

        let cancel = CancellationToken::new();
        let mut check_names = Vec::with_capacity(checks.len());
        for check in &checks {
            let scoped = format!("{}_{}", instance_id, check.name);
            self.health
                .add_check(&scoped, check.probe.clone(), check.config);
            check_names.push(scoped);
        }

        self.registered.lock().unwrap().insert(
            instance_id.clone(),
            Registration {
                info,
                cancel: cancel.clone(),
                check_names: check_names.clone(),
            },
        );

        self.spawn_renewal(instance_id.clone(), cancel.clone());
        if !check_names.is_empty() {
            self.spawn_status_monitor(instance_id.clone(), check_names, cancel);
        }

        info!("registered service '{}' (id={})", name, instance_id);
        Ok(instance_id)
    }

    /// Deregister and stop all tasks for the instance.
    pub async fn deregister(&self, instance_id: &str) -> Result<bool, DiscoveryError> {
        let registration = self.registered.lock().unwrap().remove(instance_id);
        let Some(registration) = registration else {
            return Ok(false);
        };
        registration.cancel.cancel();
        for check in &registration.check_names {
            self.health.remove_check(check);
        }
        let removed = self.client.deregister(instance_id).await?;
        info!(
            "deregistered service '{}' (id={})",
            registration.info.name, instance_id
        );
        Ok(removed)
    }

    /// Deregister everything and stop the health checker.
    pub async fn close(&self) {
        let ids: Vec<String> = self.registered.lock().unwrap().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.deregister(&id).await {
                warn!("deregister failed for {}: {}", id, e);
            }
        }
        self.health.close();
    }

    /// Renew the lease every `service_ttl / 3`.
    fn spawn_renewal(&self, instance_id: String, cancel: CancellationToken) {
        let client = self.client.clone();
        let registered = self.registered.clone();
        let service_ttl = self.service_ttl;
        let period = service_ttl / 3;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let renewed = {
                            let mut table = registered.lock().unwrap();
                            let Some(registration) = table.get_mut(&instance_id) else { break };
                            registration.info.renew(service_ttl);
                            registration.info.clone()
                        };
                        match client.register(&renewed).await {
                            Ok(_) => debug!("renewed lease for {}", instance_id),
                            Err(e) => {
                                // The next tick re-registers; nothing else
                                // to do here.
                                warn!("lease renewal failed for {}: {}", instance_id, e);
                            }
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Mirror health-check verdicts into the registered status.
    fn spawn_status_monitor(
        &self,
        instance_id: String,
        check_names: Vec<String>,
        cancel: CancellationToken,
    ) {
        let client = self.client.clone();
        let health = self.health.clone();
        let registered = self.registered.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let unhealthy = check_names.iter().any(|name| {
                            health
                                .result(name)
                                .map(|r| r.status == HealthStatus::Unhealthy)
                                .unwrap_or(false)
                        });
                        let new_status = if unhealthy {
                            ServiceStatus::Unhealthy
                        } else {
                            ServiceStatus::Healthy
                        };

                        let changed = {
                            let mut table = registered.lock().unwrap();
                            let Some(registration) = table.get_mut(&instance_id) else { break };
                            if registration.info.status == new_status {
                                None
                            } else {
                                registration.info.status = new_status;
                                registration.info.updated_at = Utc::now();
                                Some(registration.info.clone())
                            }
                        };

                        if let Some(info) = changed {
                            info!(
                                "service '{}' status -> {}",
                                info.name,
                                info.status.as_str()
                            );
                            if let Err(e) = client.register(&info).await {
                                warn!("status sync failed for {}: {}", instance_id, e);
                            }
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}
