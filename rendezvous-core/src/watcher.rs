//! Periodic refresh of the instance registry from the coordination store.
//!
//! Every tick scans the whole root prefix and confirms what it finds in the
//! [`InstanceRegistry`]. Refreshes never remove entries; stale entries age out
//! through the registry's expiry window.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::InstanceRegistry;
use crate::store::{bounded, CoordinationStore};
use crate::types::{name_from_key, normalize_root, root_prefix, ServiceDescriptor};

/// Scan `/{root}/` once and fold every well-formed entry into `registry`.
///
/// Returns the number of entries confirmed. Malformed values are skipped.
pub async fn refresh(
    store: &dyn CoordinationStore,
    registry: &InstanceRegistry,
    root: &str,
    rpc_timeout: Duration,
) -> Result<usize> {
    let prefix = root_prefix(root);
    let entries = bounded(rpc_timeout, "get", store.get_prefix(&prefix)).await?;

    let mut observed = 0;
    for (key, value) in entries {
        let descriptor = match ServiceDescriptor::from_json(&value) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!("Skipping malformed entry {}: {}", key, e);
                continue;
            }
        };

        let name = if descriptor.name.is_empty() {
            match name_from_key(root, &key) {
                Some(name) => name,
                None => {
                    debug!("Skipping entry {} with no service name", key);
                    continue;
                }
            }
        } else {
            descriptor.name.clone()
        };

        if registry.observe(&key, &name, &descriptor) {
            info!(
                "Discovered instance | service: {} | address: {} | key: {}",
                name,
                descriptor.address(),
                key
            );
        }
        observed += 1;
    }

    Ok(observed)
}

/// Ticking task that keeps a registry in sync with the store.
#[derive(Clone)]
pub struct Watcher {
    store: Arc<dyn CoordinationStore>,
    registry: Arc<InstanceRegistry>,
    root: String,
    interval: Duration,
    rpc_timeout: Duration,
}

impl Watcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        registry: Arc<InstanceRegistry>,
        root: impl AsRef<str>,
        interval: Duration,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            root: normalize_root(root.as_ref()),
            interval,
            rpc_timeout,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub async fn refresh_once(&self) -> Result<usize> {
        refresh(
            self.store.as_ref(),
            &self.registry,
            &self.root,
            self.rpc_timeout,
        )
        .await
    }

    /// Spawn the refresh loop. The first refresh runs immediately; the loop
    /// exits when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> task::JoinHandle<()> {
        info!(
            "Starting watcher | root: /{}/ | interval: {:?}",
            self.root, self.interval
        );
        task::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Watcher for /{}/ stopped", self.root);
                    return;
                }
                _ = ticker.tick() => {
                    match self.refresh_once().await {
                        Ok(count) => debug!("Watcher refreshed {} entries under /{}/", count, self.root),
                        Err(e) => warn!("Watcher refresh under /{}/ failed: {}", self.root, e),
                    }
                }
            }
        }
    }
}
