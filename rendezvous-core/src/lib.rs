//! Lease-based service registration and discovery for Rendezvous.
//!
//! This crate provides functionality for:
//! - Registering this process's service instance in a coordination store
//!   (etcd) under a lease that is kept alive for the life of the process
//! - Keeping a local, continuously refreshed registry of every instance
//!   published under a root namespace
//! - Picking one live instance per service name, least recently used first
//!
//! # Module Structure
//!
//! - [`types`]: Wire descriptor, registry records, keys and configuration
//! - [`registry`]: Thread-safe instance registry and LRU picker
//! - [`watcher`]: Periodic registry refresh from the store
//! - [`registrar`]: Lease grant, publish and keepalive for the local instance
//! - [`store`]: Coordination store trait with etcd and in-memory backends
//! - [`client`]: [`DiscoveryClient`], the facade used by applications
//!
//! # Liveness
//!
//! Instances are published at `/{root}/{name}/{name}_{uuid}` under a 7 second
//! lease. When a process stops renewing, the store drops its key; other
//! processes stop seeing it on their next refresh and the entry ages out of
//! their registries after 5 seconds without confirmation.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use rendezvous_core::{ClientConfig, DiscoveryClient, ServiceDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new().with_endpoints(["http://127.0.0.1:2379"]);
//!     let client = std::sync::Arc::new(DiscoveryClient::connect(config).await?);
//!
//!     // Discovery only
//!     let _watcher = client.watcher();
//!
//!     // Registration runs until the lease is lost
//!     let registrar = client.clone();
//!     tokio::spawn(async move {
//!         let descriptor = ServiceDescriptor::new("billing", "10.0.0.1", "9000")
//!             .with_interface("http")
//!             .with_protocol("json");
//!         registrar.register(descriptor).await
//!     });
//!
//!     let endpoint = client.picker_detail("billing")?;
//!     println!("Calling billing at {endpoint}");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod clock;
pub mod error;
pub mod registrar;
pub mod registry;
pub mod store;
pub mod types;
pub mod watcher;

// Re-export commonly used types for convenience
pub use client::DiscoveryClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DiscoveryError, Result};
pub use registrar::{Registrar, RegistrationState};
pub use registry::InstanceRegistry;
pub use store::{CoordinationStore, EtcdStore, LeaseAck, LeaseId, MemoryStore, StoreOp};
pub use types::{
    local_ip, ClientConfig, Credentials, DiscoveredInstance, ServiceDescriptor, ServiceSummary,
    TlsConfig, DEFAULT_EXPIRY_WINDOW, DEFAULT_LEASE_TTL, DEFAULT_REFRESH_INTERVAL, DEFAULT_ROOT,
    DEFAULT_RPC_TIMEOUT,
};
pub use watcher::Watcher;
