//! Common test utilities for rendezvous-core tests.

#![allow(dead_code)]

use std::sync::{Arc, Barrier};
use std::time::Duration;

use rendezvous_core::{
    ClientConfig, CoordinationStore, DiscoveryClient, LeaseId, ManualClock, MemoryStore,
    ServiceDescriptor,
};

/// Root namespace used by all tests.
pub const TEST_ROOT: &str = "rendezvous-test";

/// A client over an in-memory store, both driven by one manual clock.
pub struct Harness {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub client: Arc<DiscoveryClient>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryStore::with_clock(clock.clone())
            .with_keepalive_period(Duration::from_millis(10));
        let config = ClientConfig::new()
            .with_root(TEST_ROOT)
            .with_refresh_interval(Duration::from_millis(20));
        let client = Arc::new(DiscoveryClient::with_store_and_clock(
            Arc::new(store.clone()),
            config,
            clock.clone(),
        ));

        Self {
            store,
            clock,
            client,
        }
    }

    /// Publish an instance directly into the store, as another process would.
    pub async fn publish(&self, descriptor: &ServiceDescriptor) -> (String, LeaseId) {
        let key = format!(
            "/{TEST_ROOT}/{}/{}_{}",
            descriptor.name,
            descriptor.name,
            descriptor.ip.replace('.', "-")
        );
        let lease = self.store.grant_lease(7).await.unwrap();
        self.store
            .put_with_lease(&key, descriptor.to_json().unwrap().into_bytes(), lease)
            .await
            .unwrap();
        (key, lease)
    }

    /// Keep refreshing until `name` has `count` live instances.
    pub async fn wait_for_instances(&self, name: &str, count: usize) {
        for _ in 0..200 {
            self.client.refresh().await.unwrap();
            if self.client.picker_all(name).len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "{name} never reached {count} instances: {:?}",
            self.client.picker_all(name)
        );
    }
}

pub fn http_descriptor(name: &str, ip: &str, port: &str) -> ServiceDescriptor {
    ServiceDescriptor::new(name, ip, port)
        .with_interface("http")
        .with_protocol("json")
}

/// Create a barrier shared by `n` threads.
pub fn shared_barrier(n: usize) -> Arc<Barrier> {
    Arc::new(Barrier::new(n))
}
