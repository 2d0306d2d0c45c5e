//! Instance registry for discovered service instances.
//!
//! This module provides a thread-safe cache of every instance seen under the
//! configured root, plus the least-recently-used picker over it. Entries are
//! only ever confirmed by refreshes; an entry not confirmed within the expiry
//! window is dead and is evicted the next time a query walks past it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::{DiscoveryError, Result};
use crate::types::{DiscoveredInstance, ServiceDescriptor, ServiceSummary, DEFAULT_EXPIRY_WINDOW};

/// Registry for discovered service instances.
///
/// Refreshes write liveness, pickers write `pick_stamp`. No lock is held
/// across I/O.
pub struct InstanceRegistry {
    /// Map of store key to instance.
    instances: DashMap<String, DiscoveredInstance>,
    clock: Arc<dyn Clock>,
    expiry_window: u64,
    /// Per-name locks serializing LRU selection, so two pickers of one
    /// service never take the same entry.
    pick_locks: DashMap<String, Arc<Mutex<()>>>,
    last_stamp: AtomicU64,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.instances.len())
            .field("expiry_window_ns", &self.expiry_window)
            .finish()
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    /// Create a new empty registry on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), DEFAULT_EXPIRY_WINDOW)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, expiry_window: Duration) -> Self {
        Self {
            instances: DashMap::new(),
            clock,
            expiry_window: expiry_window.as_nanos() as u64,
            pick_locks: DashMap::new(),
            last_stamp: AtomicU64::new(0),
        }
    }

    fn is_expired(&self, instance: &DiscoveredInstance, now: u64) -> bool {
        now.saturating_sub(instance.active_at) >= self.expiry_window
    }

    /// Record a sighting of `key` in the store.
    ///
    /// New keys are inserted with an empty pick history; known keys only get
    /// their liveness bumped. Returns `true` for a new key.
    pub fn observe(&self, key: &str, name: &str, descriptor: &ServiceDescriptor) -> bool {
        let now = self.clock.now();
        match self.instances.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().active_at = now;
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DiscoveredInstance::from_descriptor(key, name, descriptor, now));
                true
            }
        }
    }

    /// Remove `keys` that are still expired. Re-checking under the shard lock
    /// keeps a concurrent refresh from being clobbered.
    fn evict(&self, keys: Vec<String>, now: u64) {
        for key in keys {
            if let Some((key, instance)) = self
                .instances
                .remove_if(&key, |_, instance| self.is_expired(instance, now))
            {
                debug!(
                    "Evicted expired instance {} | service: {} | address: {}",
                    key, instance.name, instance.address
                );
            }
        }
    }

    /// Live instances registered under `name`. Expired ones are evicted.
    pub fn candidates(&self, name: &str) -> Vec<DiscoveredInstance> {
        let now = self.clock.now();
        let mut live = Vec::new();
        let mut expired = Vec::new();

        for entry in self.instances.iter().filter(|e| e.name == name) {
            if self.is_expired(&entry, now) {
                expired.push(entry.key().clone());
            } else {
                live.push(entry.value().clone());
            }
        }

        self.evict(expired, now);
        live
    }

    /// Strictly increasing stamp, close to the clock.
    fn next_stamp(&self) -> u64 {
        let now = self.clock.now();
        let prev = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(prev.saturating_add(1).max(now))
            })
            .unwrap_or_default();
        prev.saturating_add(1).max(now)
    }

    fn pick_lock(&self, name: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.pick_locks.get(name) {
            return lock.clone();
        }
        self.pick_locks
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Select the least recently picked live instance of `name` and stamp it.
    pub fn select(&self, name: &str) -> Result<DiscoveredInstance> {
        let lock = self.pick_lock(name);
        let _guard = lock.lock();

        let mut chosen = self
            .candidates(name)
            .into_iter()
            .min_by(|a, b| a.pick_stamp.cmp(&b.pick_stamp).then_with(|| a.key.cmp(&b.key)))
            .ok_or_else(|| DiscoveryError::NotFound(format!("no matching server: {name}")))?;

        chosen.pick_stamp = self.next_stamp();
        if let Some(mut entry) = self.instances.get_mut(&chosen.key) {
            entry.pick_stamp = chosen.pick_stamp;
        }

        Ok(chosen)
    }

    /// Address of the least recently picked live instance of `name`.
    pub fn pick(&self, name: &str) -> Result<String> {
        self.select(name).map(|instance| instance.address)
    }

    /// Like [`pick`](Self::pick), but prefixed with the scheme for http-family
    /// interfaces.
    pub fn pick_detail(&self, name: &str) -> Result<String> {
        self.select(name).map(|instance| instance.endpoint())
    }

    /// Every live address for `name`, without touching pick history.
    pub fn pick_all(&self, name: &str) -> Vec<String> {
        self.candidates(name)
            .into_iter()
            .map(|instance| instance.address)
            .collect()
    }

    /// Drop every entry at `address`, fresh or not. Returns how many went.
    pub fn report_dead_server(&self, address: &str) -> usize {
        let mut removed = 0;
        self.instances.retain(|_, instance| {
            let keep = instance.address != address;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!("Dropped {} instance(s) reported dead at {}", removed, address);
        }
        removed
    }

    /// Live instances grouped by service name. Expired ones are evicted.
    pub fn all_services(&self) -> BTreeMap<String, Vec<ServiceSummary>> {
        let now = self.clock.now();
        let mut services: BTreeMap<String, Vec<ServiceSummary>> = BTreeMap::new();
        let mut expired = Vec::new();

        for entry in self.instances.iter() {
            if self.is_expired(&entry, now) {
                expired.push(entry.key().clone());
            } else {
                services
                    .entry(entry.name.clone())
                    .or_default()
                    .push(ServiceSummary::from(entry.value()));
            }
        }

        self.evict(expired, now);
        for summaries in services.values_mut() {
            summaries.sort_by(|a, b| a.address.cmp(&b.address));
        }
        services
    }

    /// [`all_services`](Self::all_services) as a JSON object.
    pub fn all_services_json(&self) -> String {
        serde_json::to_string(&self.all_services()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Get an instance by key, live or not.
    pub fn get(&self, key: &str) -> Option<DiscoveredInstance> {
        self.instances.get(key).map(|r| r.clone())
    }

    /// Get the number of cached instances, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::clock::ManualClock;

    fn registry() -> (InstanceRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000_000_000));
        let registry = InstanceRegistry::with_clock(clock.clone(), Duration::from_secs(5));
        (registry, clock)
    }

    fn descriptor(name: &str, ip: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(name, ip, "9000")
            .with_interface("http")
            .with_protocol("json")
    }

    #[test]
    fn test_instance_registry() {
        let (registry, _clock) = registry();

        assert!(registry.observe("/r/svcA/svcA_1", "svcA", &descriptor("svcA", "10.0.0.1")));
        assert!(registry.observe("/r/svcA/svcA_2", "svcA", &descriptor("svcA", "10.0.0.2")));
        assert!(registry.observe("/r/svcB/svcB_1", "svcB", &descriptor("svcB", "10.0.0.3")));
        assert!(!registry.observe("/r/svcA/svcA_1", "svcA", &descriptor("svcA", "10.0.0.1")));

        assert_eq!(registry.len(), 3);
        let all: HashSet<_> = registry.pick_all("svcA").into_iter().collect();
        assert_eq!(
            all,
            HashSet::from(["10.0.0.1:9000".to_string(), "10.0.0.2:9000".to_string()])
        );
        assert_eq!(registry.pick_all("svcB"), vec!["10.0.0.3:9000".to_string()]);
        assert!(registry.pick_all("svcC").is_empty());
    }

    #[test]
    fn test_pick_is_least_recently_used() {
        let (registry, clock) = registry();
        for i in 1..=3 {
            registry.observe(
                &format!("/r/svcA/svcA_{i}"),
                "svcA",
                &descriptor("svcA", &format!("10.0.0.{i}")),
            );
        }

        let first: Vec<String> = (0..3).map(|_| registry.pick("svcA").unwrap()).collect();
        let distinct: HashSet<_> = first.iter().cloned().collect();
        assert_eq!(distinct.len(), 3);

        // Second round repeats the first in the same order.
        clock.advance(Duration::from_millis(1));
        let second: Vec<String> = (0..3).map(|_| registry.pick("svcA").unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_pick_stamps_survive_refresh() {
        let (registry, _clock) = registry();
        registry.observe("/r/svcA/svcA_1", "svcA", &descriptor("svcA", "10.0.0.1"));
        registry.observe("/r/svcA/svcA_2", "svcA", &descriptor("svcA", "10.0.0.2"));

        let first = registry.pick("svcA").unwrap();
        let stamp = registry
            .candidates("svcA")
            .into_iter()
            .find(|i| i.address == first)
            .unwrap()
            .pick_stamp;
        assert!(stamp > 0);

        registry.observe("/r/svcA/svcA_1", "svcA", &descriptor("svcA", "10.0.0.1"));
        registry.observe("/r/svcA/svcA_2", "svcA", &descriptor("svcA", "10.0.0.2"));

        let second = registry.pick("svcA").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_pick_not_found() {
        let (registry, _clock) = registry();
        let err = registry.pick("svcB").unwrap_err();
        assert_eq!(err, DiscoveryError::NotFound("no matching server: svcB".to_string()));
        assert!(registry.pick_detail("svcB").is_err());
    }

    #[test]
    fn test_pick_detail_formats_endpoint() {
        let (registry, _clock) = registry();
        registry.observe("/r/svcA/svcA_1", "svcA", &descriptor("svcA", "10.0.0.1"));
        registry.observe(
            "/r/svcT/svcT_1",
            "svcT",
            &ServiceDescriptor::new("svcT", "10.0.0.5", "7000").with_interface("tcp"),
        );

        assert_eq!(registry.pick_detail("svcA").unwrap(), "http://10.0.0.1:9000");
        assert_eq!(registry.pick_detail("svcT").unwrap(), "10.0.0.5:7000");
    }

    #[test]
    fn test_expired_entries_are_evicted() {
        let (registry, clock) = registry();
        registry.observe("/r/svcA/svcA_1", "svcA", &descriptor("svcA", "10.0.0.1"));
        registry.observe("/r/svcA/svcA_2", "svcA", &descriptor("svcA", "10.0.0.2"));

        clock.advance(Duration::from_secs(3));
        registry.observe("/r/svcA/svcA_2", "svcA", &descriptor("svcA", "10.0.0.2"));

        // svcA_1 is now 5s old, exactly at the threshold.
        clock.advance(Duration::from_secs(2));
        assert_eq!(registry.pick_all("svcA"), vec!["10.0.0.2:9000".to_string()]);
        assert!(registry.get("/r/svcA/svcA_1").is_none());
        assert_eq!(registry.len(), 1);

        clock.advance(Duration::from_secs(3));
        assert!(registry.all_services().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_report_dead_server() {
        let (registry, _clock) = registry();
        registry.observe("/r/svcA/svcA_1", "svcA", &descriptor("svcA", "10.0.0.1"));
        registry.observe("/r/svcA/svcA_2", "svcA", &descriptor("svcA", "10.0.0.2"));

        assert_eq!(registry.report_dead_server("10.0.0.1:9000"), 1);
        assert_eq!(registry.report_dead_server("10.0.0.1:9000"), 0);
        for _ in 0..4 {
            assert_eq!(registry.pick("svcA").unwrap(), "10.0.0.2:9000");
        }

        // A later sighting brings it back.
        registry.observe("/r/svcA/svcA_1", "svcA", &descriptor("svcA", "10.0.0.1"));
        assert_eq!(registry.pick_all("svcA").len(), 2);
    }

    #[test]
    fn test_all_services_groups_by_name() {
        let (registry, _clock) = registry();
        registry.observe(
            "/r/svcA/svcA_1",
            "svcA",
            &descriptor("svcA", "10.0.0.1").with_alias("alpha").with_source("192.168.0.1"),
        );
        registry.observe("/r/svcA/svcA_2", "svcA", &descriptor("svcA", "10.0.0.2"));
        registry.observe("/r/svcB/svcB_1", "svcB", &descriptor("svcB", "10.0.0.3"));

        let services = registry.all_services();
        assert_eq!(services.len(), 2);
        assert_eq!(services["svcA"].len(), 2);
        assert_eq!(services["svcA"][0].alias, "alpha");
        assert_eq!(services["svcA"][0].source_ip, "192.168.0.1");
        assert_eq!(services["svcA"][1].alias, "svcA");

        let json: serde_json::Value = serde_json::from_str(&registry.all_services_json()).unwrap();
        assert_eq!(json["svcB"][0]["address"], "10.0.0.3:9000");
    }

    #[test]
    fn test_stamps_strictly_increase_on_frozen_clock() {
        let (registry, _clock) = registry();
        let a = registry.next_stamp();
        let b = registry.next_stamp();
        let c = registry.next_stamp();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_pick_locks_are_per_service() {
        let (registry, _clock) = registry();
        let registry = Arc::new(registry);
        registry.observe("/r/svcA/svcA_1", "svcA", &descriptor("svcA", "10.0.0.1"));
        registry.observe("/r/svcB/svcB_1", "svcB", &descriptor("svcB", "10.0.0.2"));

        let held = registry.pick_lock("svcA");
        let _guard = held.lock();

        let (tx, rx) = std::sync::mpsc::channel();
        let picker = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let _ = tx.send(registry.pick("svcB"));
            })
        };

        let picked = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("svcB pick blocked behind svcA");
        assert_eq!(picked.unwrap(), "10.0.0.2:9000");
        picker.join().unwrap();
        assert!(Arc::ptr_eq(&held, &registry.pick_lock("svcA")));
    }

    #[test]
    fn test_registry_operations() {
        let registry = InstanceRegistry::new();
        assert!(registry.is_empty());

        registry.observe("/r/test/test_1", "test", &descriptor("test", "10.0.0.1"));
        assert!(!registry.is_empty());
        assert_eq!(registry.len(), 1);

        let got = registry.get("/r/test/test_1");
        assert!(got.is_some());
        assert_eq!(got.unwrap().address, "10.0.0.1:9000");

        assert_eq!(registry.report_dead_server("10.0.0.1:9000"), 1);
        assert!(registry.is_empty());
    }
}
