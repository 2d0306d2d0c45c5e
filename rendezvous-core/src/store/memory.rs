//! In-process coordination store.
//!
//! Keeps etcd's lease semantics (keys vanish with their lease, leases expire
//! when not renewed) on a [`Clock`], so registration and discovery can be
//! exercised without a cluster. With the `testing` feature, faults can be
//! injected per operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::time::{self, MissedTickBehavior};

use super::{CoordinationStore, KeepAliveStream, LeaseAck, LeaseId};
use crate::clock::{Clock, SystemClock};
use crate::error::{DiscoveryError, Result};

/// Store operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Put,
    Grant,
    KeepAlive,
    Revoke,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl_secs: i64,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: i64,
    faults: HashSet<StoreOp>,
}

impl State {
    /// Drop leases past their deadline together with their keys.
    fn purge(&mut self, now: u64) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let existed = self.leases.remove(&id).is_some();
        self.entries.retain(|_, entry| entry.lease != Some(id));
        existed
    }

    fn check(&self, op: StoreOp) -> Result<()> {
        if !self.faults.contains(&op) {
            return Ok(());
        }
        let msg = format!("injected {op:?} fault");
        Err(match op {
            StoreOp::Get => DiscoveryError::Connection(msg),
            StoreOp::Put | StoreOp::Revoke => DiscoveryError::Store(msg),
            StoreOp::Grant => DiscoveryError::LeaseGrant(msg),
            StoreOp::KeepAlive => DiscoveryError::LeaseFailure(msg),
        })
    }
}

/// In-memory [`CoordinationStore`].
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    keepalive_period: Option<Duration>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_lease: 1,
                ..Default::default()
            })),
            clock,
            keepalive_period: None,
        }
    }

    /// Renew on a fixed period instead of a third of the lease TTL.
    pub fn with_keepalive_period(mut self, period: Duration) -> Self {
        self.keepalive_period = Some(period);
        self
    }

    /// Write a key with no lease attached.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.state.lock().entries.insert(
            key.into(),
            Entry {
                value: value.into(),
                lease: None,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Lease attached to `key`, if any.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut state = self.state.lock();
        state.purge(self.clock.now());
        state.entries.get(key).and_then(|entry| entry.lease)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut state = self.state.lock();
        state.purge(self.clock.now());
        state.entries.keys().cloned().collect()
    }

    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock();
        state.purge(self.clock.now());
        state.leases.len()
    }

    /// Kill a lease as if its TTL ran out.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        self.state.lock().drop_lease(lease)
    }

    /// Make every later `op` fail until [`clear_faults`](Self::clear_faults).
    #[cfg(any(test, feature = "testing"))]
    pub fn inject_fault(&self, op: StoreOp) {
        self.state.lock().faults.insert(op);
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Renew `lease`, returning its TTL, or `None` once it is gone.
    fn renew(&self, lease: LeaseId) -> Result<Option<i64>> {
        let mut state = self.state.lock();
        state.check(StoreOp::KeepAlive)?;
        let now = self.clock.now();
        state.purge(now);
        Ok(state.leases.get_mut(&lease).map(|entry| {
            entry.expires_at = now + secs_to_nanos(entry.ttl_secs);
            entry.ttl_secs
        }))
    }
}

fn secs_to_nanos(secs: i64) -> u64 {
    Duration::from_secs(secs.max(0) as u64).as_nanos() as u64
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut state = self.state.lock();
        state.check(StoreOp::Get)?;
        state.purge(self.clock.now());
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        state.check(StoreOp::Put)?;
        state.purge(self.clock.now());
        if !state.leases.contains_key(&lease) {
            return Err(DiscoveryError::Store(format!(
                "put {key}: lease {lease} not found"
            )));
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                lease: Some(lease),
            },
        );
        Ok(())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut state = self.state.lock();
        state.check(StoreOp::Grant)?;
        if ttl_secs <= 0 {
            return Err(DiscoveryError::LeaseGrant(format!(
                "ttl must be positive, got {ttl_secs}"
            )));
        }
        let id = LeaseId(state.next_lease);
        state.next_lease += 1;
        state.leases.insert(
            id,
            Lease {
                ttl_secs,
                expires_at: self.clock.now() + secs_to_nanos(ttl_secs),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let ttl = self.renew(lease)?.ok_or_else(|| {
            DiscoveryError::LeaseFailure(format!("lease {lease} not found"))
        })?;

        let period = self
            .keepalive_period
            .unwrap_or_else(|| Duration::from_millis((ttl as u64 * 1000 / 3).max(1)));
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let store = self.clone();
        let acks = stream::unfold(Some(ticker), move |ticker| {
            let store = store.clone();
            async move {
                let mut ticker = ticker?;
                ticker.tick().await;
                match store.renew(lease) {
                    Ok(Some(ttl)) => Some((Ok(LeaseAck { id: lease, ttl }), Some(ticker))),
                    Ok(None) => None,
                    Err(e) => Some((Err(e), None)),
                }
            }
        });

        Ok(acks.boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        state.check(StoreOp::Revoke)?;
        state.drop_lease(lease);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manual_store() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryStore::with_clock(clock.clone())
            .with_keepalive_period(Duration::from_millis(10));
        (store, clock)
    }

    #[tokio::test]
    async fn test_put_and_prefix_get() {
        let (store, _clock) = manual_store();
        let lease = store.grant_lease(7).await.unwrap();

        store
            .put_with_lease("/root/a/a_1", b"one".to_vec(), lease)
            .await
            .unwrap();
        store
            .put_with_lease("/root/b/b_1", b"two".to_vec(), lease)
            .await
            .unwrap();
        store.put("/rootless/x", "three");

        let entries = store.get_prefix("/root/").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("/root/a/a_1".to_string(), b"one".to_vec()));

        let entries = store.get_prefix("/root/b/").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_lease_expiry_removes_keys() {
        let (store, clock) = manual_store();
        let lease = store.grant_lease(7).await.unwrap();
        store
            .put_with_lease("/root/a/a_1", b"one".to_vec(), lease)
            .await
            .unwrap();

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.keys().len(), 1);

        clock.advance(Duration::from_secs(2));
        assert!(store.keys().is_empty());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_put_requires_live_lease() {
        let (store, _clock) = manual_store();
        let result = store
            .put_with_lease("/root/a/a_1", b"one".to_vec(), LeaseId(99))
            .await;
        assert!(matches!(result, Err(DiscoveryError::Store(_))));
    }

    #[tokio::test]
    async fn test_keepalive_renews_and_ends_on_expiry() {
        let (store, clock) = manual_store();
        let lease = store.grant_lease(7).await.unwrap();
        store
            .put_with_lease("/root/a/a_1", b"one".to_vec(), lease)
            .await
            .unwrap();

        let mut acks = store.keep_alive(lease).await.unwrap();
        let ack = acks.next().await.unwrap().unwrap();
        assert_eq!(ack, LeaseAck { id: lease, ttl: 7 });

        // Renewal pushes the deadline past the original TTL.
        clock.advance(Duration::from_secs(5));
        acks.next().await.unwrap().unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.keys().len(), 1);

        store.expire_lease(lease);
        assert!(acks.next().await.is_none());
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let (store, _clock) = manual_store();
        store.inject_fault(StoreOp::Grant);
        assert!(matches!(
            store.grant_lease(7).await,
            Err(DiscoveryError::LeaseGrant(_))
        ));

        store.inject_fault(StoreOp::Get);
        assert!(matches!(
            store.get_prefix("/").await,
            Err(DiscoveryError::Connection(_))
        ));

        store.clear_faults();
        assert!(store.grant_lease(7).await.is_ok());
    }

    #[tokio::test]
    async fn test_revoke_drops_keys() {
        let (store, _clock) = manual_store();
        let lease = store.grant_lease(7).await.unwrap();
        store
            .put_with_lease("/root/a/a_1", b"one".to_vec(), lease)
            .await
            .unwrap();
        assert_eq!(store.lease_of("/root/a/a_1"), Some(lease));

        store.revoke_lease(lease).await.unwrap();
        assert!(store.keys().is_empty());
        assert!(matches!(
            store.keep_alive(lease).await,
            Err(DiscoveryError::LeaseFailure(_))
        ));
    }
}
