//! Coordination store abstraction.
//!
//! Registration and discovery only need a handful of primitives from the
//! store: prefix scans, lease-bound writes and lease management. Two backends
//! are provided:
//!
//! - [`etcd`]: the production backend on top of `etcd-client`
//! - [`memory`]: an in-process store with the same lease semantics, used by
//!   tests and local development

pub mod etcd;
pub mod memory;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{DiscoveryError, Result};

pub use etcd::EtcdStore;
pub use memory::{MemoryStore, StoreOp};

/// Opaque lease handle issued by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// One keepalive acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseAck {
    pub id: LeaseId,
    /// Remaining TTL in seconds. Zero or less means the lease is gone.
    pub ttl: i64,
}

/// Stream of keepalive acknowledgements. It must be drained for the lease to
/// stay alive; it ends (or yields an error) when the lease is lost.
pub type KeepAliveStream = BoxStream<'static, Result<LeaseAck>>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// All `(key, value)` pairs whose key starts with `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Write `value` under `key`, bound to `lease`.
    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()>;

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Start renewing `lease`; the returned stream yields one ack per renewal.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Release `lease` and every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;
}

/// Run a store RPC with an upper bound on its duration.
pub async fn bounded<T, F>(timeout: Duration, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(DiscoveryError::Connection(format!(
            "{op} timed out after {timeout:?}"
        ))),
    }
}
