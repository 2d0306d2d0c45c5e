//! Common types for registration and discovery.
//!
//! This module contains the wire descriptor published into the coordination
//! store, the richer record kept in the local registry, key helpers and the
//! client configuration.

use std::net::{IpAddr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default namespace under which instances are published.
pub const DEFAULT_ROOT: &str = "rendezvous";

/// Default etcd endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";

/// TTL of the lease bound to this process's own key.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(7);

/// Interval between registry refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3);

/// Age after which an unconfirmed registry entry is dead.
pub const DEFAULT_EXPIRY_WINDOW: Duration = Duration::from_secs(5);

/// Upper bound on any single store RPC.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for establishing the store connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Wire Types
// ============================================================================

/// What a process publishes about itself.
///
/// Serialized as the JSON value stored under this instance's key. Fields
/// missing from legacy entries decode to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDescriptor {
    pub ip: String,
    pub port: String,
    pub name: String,
    pub alias: String,
    /// Transport/scheme tag, e.g. "http", "https", "tcp".
    #[serde(rename = "INTFC")]
    pub interface: String,
    /// Payload encoding tag, e.g. "json".
    pub protocol: String,
    #[serde(rename = "timeConnect")]
    pub time_connect: i64,
    #[serde(rename = "timeActive")]
    pub time_active: i64,
    /// Originating host IP, diagnostic only.
    pub source: String,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port: port.into(),
            ..Default::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// `ip:port`, or the bare ip when no port is published.
    pub fn address(&self) -> String {
        if self.port.is_empty() {
            self.ip.clone()
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}

// ============================================================================
// Registry Types
// ============================================================================

/// A service instance as seen by the local registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInstance {
    /// Store key, the registry identity.
    pub key: String,
    pub name: String,
    pub alias: String,
    pub address: String,
    pub interface: String,
    pub protocol: String,
    pub source_ip: String,
    /// LRU ordering key. Zero until first picked.
    pub pick_stamp: u64,
    /// Clock value (ns) of the last sighting in the store.
    pub active_at: u64,
}

impl DiscoveredInstance {
    pub fn from_descriptor(
        key: impl Into<String>,
        name: impl Into<String>,
        descriptor: &ServiceDescriptor,
        now: u64,
    ) -> Self {
        let name = name.into();
        let alias = if descriptor.alias.is_empty() {
            name.clone()
        } else {
            descriptor.alias.clone()
        };

        Self {
            key: key.into(),
            name,
            alias,
            address: descriptor.address(),
            interface: descriptor.interface.clone(),
            protocol: descriptor.protocol.clone(),
            source_ip: descriptor.source.clone(),
            pick_stamp: 0,
            active_at: now,
        }
    }

    /// `interface://address` for http-family interfaces, the bare address otherwise.
    pub fn endpoint(&self) -> String {
        if self.interface.starts_with("http") {
            format!("{}://{}", self.interface, self.address)
        } else {
            self.address.clone()
        }
    }
}

/// Diagnostic view of one instance, as returned by `all_services`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub address: String,
    #[serde(rename = "sourceIp")]
    pub source_ip: String,
    pub alias: String,
}

impl From<&DiscoveredInstance> for ServiceSummary {
    fn from(instance: &DiscoveredInstance) -> Self {
        Self {
            address: instance.address.clone(),
            source_ip: instance.source_ip.clone(),
            alias: instance.alias.clone(),
        }
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Strip surrounding slashes so `"/svc/"`, `"svc"` and `"svc/"` mean the same root.
pub fn normalize_root(root: &str) -> String {
    root.trim_matches('/').to_string()
}

/// Prefix covering every instance under `root`.
pub fn root_prefix(root: &str) -> String {
    format!("/{}/", normalize_root(root))
}

/// Globally unique key for one instance of `name`.
pub fn instance_key(root: &str, name: &str) -> String {
    format!(
        "{}{}/{}_{}",
        root_prefix(root),
        name,
        name,
        Uuid::new_v4()
    )
}

/// Recover the service name from a key shaped like `/{root}/{name}/...`.
pub fn name_from_key(root: &str, key: &str) -> Option<String> {
    let rest = key.strip_prefix(&root_prefix(root))?;
    let (name, _) = rest.split_once('/')?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// The local IP the OS would use for outbound traffic.
///
/// Connecting a UDP socket sends no packets; it only asks the kernel to pick a
/// route.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

// ============================================================================
// Client Configuration
// ============================================================================

/// Username/password authentication for the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// PEM files for a TLS connection to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Override for the server name checked against the certificate.
    pub domain: Option<String>,
}

/// Configuration for a discovery client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoints: Vec<String>,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsConfig>,
    /// Namespace under which instances are published and scanned.
    pub root: String,
    pub lease_ttl: Duration,
    pub refresh_interval: Duration,
    pub expiry_window: Duration,
    pub rpc_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            credentials: None,
            tls: None,
            root: DEFAULT_ROOT.to_string(),
            lease_ttl: DEFAULT_LEASE_TTL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            expiry_window: DEFAULT_EXPIRY_WINDOW,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_root(mut self, root: impl AsRef<str>) -> Self {
        self.root = normalize_root(root.as_ref());
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_expiry_window(mut self, window: Duration) -> Self {
        self.expiry_window = window;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}
