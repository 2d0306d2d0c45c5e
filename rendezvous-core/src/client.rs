//! Discovery client facade.
//!
//! Ties a coordination store, a local registry, the registrar and the watcher
//! together behind one handle, so application code only deals with service
//! names and addresses.

use std::sync::Arc;

use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::registrar::Registrar;
use crate::registry::InstanceRegistry;
use crate::store::{CoordinationStore, EtcdStore};
use crate::types::{normalize_root, ClientConfig, ServiceDescriptor};
use crate::watcher::Watcher;

/// Registration and discovery handle for one process.
///
/// Each client owns its registry, so several independent clients can live in
/// one process.
pub struct DiscoveryClient {
    store: Arc<dyn CoordinationStore>,
    registry: Arc<InstanceRegistry>,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl DiscoveryClient {
    /// Connect to the etcd cluster described by `config`.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let store = EtcdStore::connect(&config).await?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Build a client over any store backend.
    pub fn with_store(store: Arc<dyn CoordinationStore>, config: ClientConfig) -> Self {
        Self::with_store_and_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_store_and_clock(
        store: Arc<dyn CoordinationStore>,
        mut config: ClientConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        config.root = normalize_root(&config.root);
        let registry = Arc::new(InstanceRegistry::with_clock(
            clock.clone(),
            config.expiry_window,
        ));

        Self {
            store,
            registry,
            config,
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    /// Change the namespace used by later registrations and refreshes.
    pub fn set_root(&mut self, root: impl AsRef<str>) {
        self.config.root = normalize_root(root.as_ref());
    }

    pub fn root(&self) -> &str {
        &self.config.root
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    fn make_watcher(&self) -> Watcher {
        Watcher::new(
            self.store.clone(),
            self.registry.clone(),
            &self.config.root,
            self.config.refresh_interval,
            self.config.rpc_timeout,
        )
    }

    fn make_registrar(&self) -> Registrar {
        Registrar::new(self.store.clone(), &self.config.root)
            .with_lease_ttl(self.config.lease_ttl)
            .with_refresh_interval(self.config.refresh_interval)
            .with_rpc_timeout(self.config.rpc_timeout)
            .with_clock(self.clock.clone())
            .with_watcher(self.make_watcher())
    }

    /// Register `descriptor` and block until the lease is lost or the client
    /// is shut down.
    pub async fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        self.register_until(descriptor, self.shutdown.child_token())
            .await
    }

    /// Like [`register`](Self::register), stopping when either `cancel` fires
    /// or the client is shut down.
    pub async fn register_until(
        &self,
        descriptor: ServiceDescriptor,
        cancel: CancellationToken,
    ) -> Result<()> {
        let registrar = self.make_registrar();
        let combined = self.shutdown.child_token();

        let register = registrar.register(descriptor, &combined);
        tokio::pin!(register);

        // The registrar only watches one token; forward `cancel` into it and
        // keep driving the registration so the lease is released.
        tokio::select! {
            result = &mut register => return result,
            _ = cancel.cancelled() => combined.cancel(),
        }
        register.await
    }

    /// Start the background refresh loop. It stops on [`shutdown`](Self::shutdown).
    pub fn watcher(&self) -> task::JoinHandle<()> {
        self.make_watcher().spawn(self.shutdown.child_token())
    }

    /// Refresh the registry once, now.
    pub async fn refresh(&self) -> Result<usize> {
        self.make_watcher().refresh_once().await
    }

    /// Address of the least recently picked live instance of `name`.
    pub fn picker(&self, name: &str) -> Result<String> {
        self.registry.pick(name)
    }

    /// Like [`picker`](Self::picker), with `scheme://` for http-family interfaces.
    pub fn picker_detail(&self, name: &str) -> Result<String> {
        self.registry.pick_detail(name)
    }

    /// Every live address for `name`.
    pub fn picker_all(&self, name: &str) -> Vec<String> {
        self.registry.pick_all(name)
    }

    /// JSON snapshot of every live service: `{name: [{address, sourceIp, alias}]}`.
    pub fn all_services(&self) -> String {
        self.registry.all_services_json()
    }

    /// Forget every instance at `address` until it is seen again.
    pub fn report_dead_server(&self, address: &str) -> usize {
        self.registry.report_dead_server(address)
    }

    /// Stop the watcher and release any held lease.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
