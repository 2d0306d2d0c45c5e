//! Lease lifecycle for this process's own instance.
//!
//! The registrar grants a lease, publishes the instance descriptor under it
//! and then drains the keepalive stream for as long as the lease lives. Losing
//! the lease is fatal to the attempt: `register` returns and an outer loop is
//! expected to call it again, which publishes under a fresh key.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::error::{DiscoveryError, Result};
use crate::store::{bounded, CoordinationStore, LeaseId};
use crate::types::{
    instance_key, local_ip, normalize_root, ServiceDescriptor, DEFAULT_LEASE_TTL,
    DEFAULT_REFRESH_INTERVAL, DEFAULT_RPC_TIMEOUT,
};
use crate::watcher::Watcher;

/// Where a registration attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Disconnected,
    LeaseGranted,
    Registered,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Disconnected => write!(f, "disconnected"),
            RegistrationState::LeaseGranted => write!(f, "lease-granted"),
            RegistrationState::Registered => write!(f, "registered"),
        }
    }
}

/// Validate `descriptor` and fill in the fields a caller may leave empty.
pub fn prepare_descriptor(
    mut descriptor: ServiceDescriptor,
    clock: &dyn Clock,
) -> Result<ServiceDescriptor> {
    if descriptor.name.trim().is_empty() {
        return Err(DiscoveryError::Config("service name is required".to_string()));
    }
    if descriptor.name.contains('/') {
        return Err(DiscoveryError::Config(format!(
            "service name must not contain '/': {}",
            descriptor.name
        )));
    }
    if descriptor.ip.trim().is_empty() {
        return Err(DiscoveryError::Config(format!(
            "service address is required for {}",
            descriptor.name
        )));
    }

    if descriptor.alias.is_empty() {
        descriptor.alias = descriptor.name.clone();
    }
    if descriptor.source.is_empty() {
        descriptor.source = local_ip().map(|ip| ip.to_string()).unwrap_or_default();
    }

    let now = clock.now_secs();
    if descriptor.time_connect == 0 {
        descriptor.time_connect = now;
    }
    if descriptor.time_active == 0 {
        descriptor.time_active = now;
    }

    Ok(descriptor)
}

/// Publishes and keeps alive this process's instance.
pub struct Registrar {
    store: Arc<dyn CoordinationStore>,
    root: String,
    lease_ttl: Duration,
    refresh_interval: Duration,
    rpc_timeout: Duration,
    clock: Arc<dyn Clock>,
    /// Refreshed on every tick while registered, if set.
    watcher: Option<Watcher>,
}

impl Registrar {
    pub fn new(store: Arc<dyn CoordinationStore>, root: impl AsRef<str>) -> Self {
        Self {
            store,
            root: normalize_root(root.as_ref()),
            lease_ttl: DEFAULT_LEASE_TTL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            clock: Arc::new(SystemClock),
            watcher: None,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Also refresh `watcher`'s registry on every tick while registered.
    pub fn with_watcher(mut self, watcher: Watcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Register `descriptor` and hold the lease until it is lost or `cancel`
    /// fires.
    ///
    /// Returns `Ok(())` only after a cancellation, once the lease has been
    /// released. Every other exit is an error.
    pub async fn register(
        &self,
        descriptor: ServiceDescriptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let descriptor = prepare_descriptor(descriptor, self.clock.as_ref())?;
        let key = instance_key(&self.root, &descriptor.name);
        let value = descriptor.to_json()?.into_bytes();
        let mut state = RegistrationState::Disconnected;

        if cancel.is_cancelled() {
            debug!("Registration of {} cancelled before lease grant", key);
            return Ok(());
        }

        let ttl = self.lease_ttl.as_secs().max(1) as i64;
        let lease = bounded(self.rpc_timeout, "lease grant", self.store.grant_lease(ttl))
            .await
            .inspect_err(|e| error!("Registrar: lease grant for {} failed: {}", key, e))?;
        state = self.transition(state, RegistrationState::LeaseGranted, &key);

        if let Err(e) = bounded(
            self.rpc_timeout,
            "put",
            self.store.put_with_lease(&key, value, lease),
        )
        .await
        {
            error!("Registrar: publishing {} failed: {}", key, e);
            self.release(lease, &key).await;
            return Err(e);
        }

        let mut acks = match bounded(self.rpc_timeout, "keepalive", self.store.keep_alive(lease))
            .await
        {
            Ok(acks) => acks,
            Err(e) => {
                error!("Registrar: keepalive for {} could not start: {}", key, e);
                self.release(lease, &key).await;
                return Err(e);
            }
        };
        state = self.transition(state, RegistrationState::Registered, &key);

        info!(
            "Registered service instance | service: {} | address: {} | key: {} | lease: {} | ttl: {}s",
            descriptor.name,
            descriptor.address(),
            key,
            lease,
            ttl
        );

        let mut ticker = time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let failure = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.release(lease, &key).await;
                    self.transition(state, RegistrationState::Disconnected, &key);
                    info!("Deregistered {} (lease {} released)", key, lease);
                    return Ok(());
                }
                ack = acks.next() => match ack {
                    Some(Ok(ack)) if ack.ttl > 0 => {
                        debug!("Lease {} renewed, ttl {}s", ack.id, ack.ttl);
                    }
                    Some(Ok(ack)) => break format!("lease {} expired (ttl {})", ack.id, ack.ttl),
                    Some(Err(e)) => break e.to_string(),
                    None => break format!("keepalive stream for lease {lease} closed"),
                },
                _ = ticker.tick(), if self.watcher.is_some() => {
                    if let Some(watcher) = &self.watcher {
                        if let Err(e) = watcher.refresh_once().await {
                            warn!("Registrar: discovery refresh under /{}/ failed: {}", watcher.root(), e);
                        }
                    }
                }
            }
        };

        self.transition(state, RegistrationState::Disconnected, &key);
        error!("Registrar: lost registration for {}: {}", key, failure);
        Err(DiscoveryError::LeaseFailure(failure))
    }

    fn transition(
        &self,
        from: RegistrationState,
        to: RegistrationState,
        key: &str,
    ) -> RegistrationState {
        debug!("Registration {}: {} -> {}", key, from, to);
        to
    }

    /// Best-effort lease release.
    async fn release(&self, lease: LeaseId, key: &str) {
        if let Err(e) = bounded(self.rpc_timeout, "lease revoke", self.store.revoke_lease(lease)).await
        {
            warn!("Registrar: releasing lease {} for {} failed: {}", lease, key, e);
        }
    }
}
