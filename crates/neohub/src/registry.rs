//! In-memory service registry with TTL leases and watch notifications.
//!
//! One live entry per service name; a newer registration for the same name
//! replaces the older one. Leases are renewed by heartbeat or re-register
//! and scanned for expiry once a second; `discover` also filters by lease
//! so an expired entry is never returned between scans.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use neoproto::{ServiceInfo, ServiceStatus};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Registry change notifications delivered to watchers.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(ServiceInfo),
    Removed(ServiceInfo),
    StatusChanged(ServiceInfo),
    /// Full re-delivery after a watcher fell behind.
    Resync(Vec<ServiceInfo>),
}

impl RegistryEvent {
    /// Service name this event concerns; `None` for resyncs.
    pub fn service_name(&self) -> Option<&str> {
        match self {
            RegistryEvent::Added(info)
            | RegistryEvent::Removed(info)
            | RegistryEvent::StatusChanged(info) => Some(&info.name),
            RegistryEvent::Resync(_) => None,
        }
    }
}

/// Mapping from service name to its live entry.
pub struct ServiceRegistry {
    entries: Mutex<HashMap<String, ServiceInfo>>,
    events_tx: broadcast::Sender<RegistryEvent>,
    service_ttl: Duration,
}

impl ServiceRegistry {
    pub fn new(service_ttl: Duration) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            events_tx,
            service_ttl,
        }
    }

    pub fn service_ttl(&self) -> Duration {
        self.service_ttl
    }

    /// Insert or replace the entry for `info.name`, restarting its lease.
    pub fn register(&self, mut info: ServiceInfo) {
        info.renew(self.service_ttl);
        let mut entries = self.entries.lock().unwrap();
        let previous = entries.insert(info.name.clone(), info.clone());
        drop(entries);

        match previous {
            Some(old) if old.id == info.id => {
                // Renewal. Only worth announcing when the status flipped.
                if old.status != info.status {
                    let _ = self.events_tx.send(RegistryEvent::StatusChanged(info));
                }
            }
            Some(old) => {
                info!(
                    "service '{}' replaced: {} -> {}",
                    info.name, old.id, info.id
                );
                let _ = self.events_tx.send(RegistryEvent::Removed(old));
                let _ = self.events_tx.send(RegistryEvent::Added(info));
            }
            None => {
                info!("service '{}' registered ({})", info.name, info.id);
                let _ = self.events_tx.send(RegistryEvent::Added(info));
            }
        }
    }

    /// Remove `name` if it is still held by `instance_id`. No-op otherwise.
    pub fn deregister(&self, name: &str, instance_id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(name) {
            Some(info) if info.id == instance_id => {
                let removed = entries.remove(name).unwrap();
                drop(entries);
                info!("service '{}' deregistered ({})", name, instance_id);
                let _ = self.events_tx.send(RegistryEvent::Removed(removed));
                true
            }
            _ => false,
        }
    }

    /// Remove whichever entry holds `instance_id`.
    pub fn deregister_by_id(&self, instance_id: &str) -> bool {
        let name = {
            let entries = self.entries.lock().unwrap();
            entries
                .values()
                .find(|info| info.id == instance_id)
                .map(|info| info.name.clone())
        };
        match name {
            Some(name) => self.deregister(&name, instance_id),
            None => false,
        }
    }

    /// Live entries for `name`. Unhealthy entries are skipped unless asked
    /// for. (One entry per name in this core, hence zero or one result.)
    pub fn discover(&self, name: &str, include_unhealthy: bool) -> Vec<ServiceInfo> {
        let now = Utc::now();
        let entries = self.entries.lock().unwrap();
        entries
            .get(name)
            .filter(|info| !info.is_expired(now))
            .filter(|info| include_unhealthy || info.status != ServiceStatus::Unhealthy)
            .cloned()
            .into_iter()
            .collect()
    }

    /// Whether `name` resolves to a live (unexpired) entry of any status.
    pub fn contains_live(&self, name: &str) -> bool {
        let now = Utc::now();
        let entries = self.entries.lock().unwrap();
        entries.get(name).is_some_and(|info| !info.is_expired(now))
    }

    /// Renew the lease for `name` (heartbeat path).
    pub fn touch(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(info) = entries.get_mut(name) {
            info.renew(self.service_ttl);
        }
    }

    /// Flip the status of `name` when still held by `instance_id`.
    pub fn set_status(&self, name: &str, instance_id: &str, status: ServiceStatus) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(info) = entries.get_mut(name) else {
            return false;
        };
        if info.id != instance_id || info.status == status {
            return false;
        }
        info.status = status;
        info.updated_at = Utc::now();
        let changed = info.clone();
        drop(entries);
        let _ = self.events_tx.send(RegistryEvent::StatusChanged(changed));
        true
    }

    /// All live entries.
    pub fn snapshot(&self) -> Vec<ServiceInfo> {
        let now = Utc::now();
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter(|info| !info.is_expired(now))
            .cloned()
            .collect()
    }

    /// Drop entries whose lease elapsed, announcing each removal. Returns
    /// how many were dropped. Run this on a ~1 s cadence.
    pub fn expire_once(&self) -> usize {
        let now = Utc::now();
        let mut expired = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            let names: Vec<String> = entries
                .iter()
                .filter(|(_, info)| info.is_expired(now))
                .map(|(name, _)| name.clone())
                .collect();
            for name in names {
                if let Some(info) = entries.remove(&name) {
                    expired.push(info);
                }
            }
        }
        for info in &expired {
            debug!("service '{}' lease expired ({})", info.name, info.id);
            let _ = self.events_tx.send(RegistryEvent::Removed(info.clone()));
        }
        expired.len()
    }

    /// Subscribe to all registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events_tx.subscribe()
    }

    /// Watch one service name.
    pub fn watch(&self, name: &str) -> Watch<'_> {
        Watch {
            registry: self,
            name: name.to_string(),
            rx: self.events_tx.subscribe(),
        }
    }
}

/// A filtered event stream for one service name.
///
/// A watcher that falls behind the broadcast buffer gets a
/// [`RegistryEvent::Resync`] carrying the full current list for its name
/// instead of the lost events.
pub struct Watch<'a> {
    registry: &'a ServiceRegistry,
    name: String,
    rx: broadcast::Receiver<RegistryEvent>,
}

impl Watch<'_> {
    /// Next event for the watched name. `None` when the registry is gone.
    pub async fn next(&mut self) -> Option<RegistryEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => match event.service_name() {
                    Some(name) if name == self.name => return Some(event),
                    Some(_) => continue,
                    None => return Some(event),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("watcher for '{}' lagged by {}, resyncing", self.name, skipped);
                    let list = self.registry.discover(&self.name, true);
                    return Some(RegistryEvent::Resync(list));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn info(name: &str, id: &str) -> ServiceInfo {
        ServiceInfo::new(
            id,
            name,
            "127.0.0.1",
            9091,
            BTreeMap::new(),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn register_then_discover() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry.register(info("math", "i-1"));
        let found = registry.discover("math", false);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "i-1");
        assert!(registry.discover("ghost", false).is_empty());
    }

    #[test]
    fn latest_registration_wins() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry.register(info("math", "i-1"));
        registry.register(info("math", "i-2"));
        let found = registry.discover("math", false);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "i-2");
    }

    #[test]
    fn deregister_checks_instance_id() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry.register(info("math", "i-1"));
        assert!(!registry.deregister("math", "i-wrong"));
        assert_eq!(registry.discover("math", false).len(), 1);
        assert!(registry.deregister("math", "i-1"));
        assert!(registry.discover("math", false).is_empty());
    }

    #[test]
    fn deregister_by_id_finds_the_name() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry.register(info("math", "i-1"));
        registry.register(info("echo", "i-2"));
        assert!(registry.deregister_by_id("i-2"));
        assert!(registry.discover("echo", false).is_empty());
        assert_eq!(registry.discover("math", false).len(), 1);
    }

    #[test]
    fn unhealthy_entries_are_opt_in() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry.register(info("math", "i-1"));
        registry.set_status("math", "i-1", ServiceStatus::Unhealthy);
        assert!(registry.discover("math", false).is_empty());
        assert_eq!(registry.discover("math", true).len(), 1);
    }

    #[test]
    fn expired_entries_vanish() {
        let registry = ServiceRegistry::new(Duration::from_millis(10));
        registry.register(info("math", "i-1"));
        std::thread::sleep(Duration::from_millis(50));
        // Filtered out even before the sweep runs.
        assert!(registry.discover("math", false).is_empty());
        assert!(!registry.contains_live("math"));
        assert_eq!(registry.expire_once(), 1);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn touch_renews_the_lease() {
        let registry = ServiceRegistry::new(Duration::from_millis(80));
        registry.register(info("math", "i-1"));
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(40));
            registry.touch("math");
        }
        assert_eq!(registry.discover("math", false).len(), 1);
    }

    #[tokio::test]
    async fn watch_sees_lifecycle_events() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        let mut watch = registry.watch("math");

        registry.register(info("other", "i-9"));
        registry.register(info("math", "i-1"));
        registry.set_status("math", "i-1", ServiceStatus::Unhealthy);
        registry.deregister("math", "i-1");

        // The "other" registration is filtered out.
        assert!(matches!(watch.next().await, Some(RegistryEvent::Added(i)) if i.id == "i-1"));
        assert!(matches!(
            watch.next().await,
            Some(RegistryEvent::StatusChanged(i)) if i.status == ServiceStatus::Unhealthy
        ));
        assert!(matches!(watch.next().await, Some(RegistryEvent::Removed(i)) if i.id == "i-1"));
    }

    #[tokio::test]
    async fn lagged_watcher_gets_a_resync() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        let mut watch = registry.watch("math");

        // Overflow the 256-slot broadcast buffer.
        for i in 0..600 {
            registry.register(info("math", &format!("i-{}", i)));
        }

        match watch.next().await {
            Some(RegistryEvent::Resync(list)) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].id, "i-599");
            }
            other => panic!("expected resync, got {other:?}"),
        }
    }
}
