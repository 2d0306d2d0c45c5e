//! etcd backend for the coordination store.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, GetOptions, Identity, PutOptions, TlsOptions,
};
use futures::{stream, StreamExt};
use log::{debug, info};
use tokio::time::{self, MissedTickBehavior};

use super::{CoordinationStore, KeepAliveStream, LeaseAck, LeaseId};
use crate::error::{DiscoveryError, Result};
use crate::types::{ClientConfig, TlsConfig};

/// Coordination store backed by an etcd cluster.
///
/// `etcd_client::Client` is a cheap handle over a shared channel, so every
/// call works on its own clone.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the endpoints in `config`, with credentials and TLS if set.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(DiscoveryError::Config(
                "at least one store endpoint is required".to_string(),
            ));
        }

        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout)
            .with_timeout(config.rpc_timeout)
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10));

        if let Some(credentials) = &config.credentials {
            options = options.with_user(credentials.user.clone(), credentials.password.clone());
        }

        if let Some(tls) = &config.tls {
            options = options.with_tls(load_tls(tls)?);
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| {
                DiscoveryError::Connection(format!(
                    "failed to connect to etcd {:?}: {e}",
                    config.endpoints
                ))
            })?;

        info!("Connected to etcd | endpoints: {:?}", config.endpoints);

        Ok(Self { client })
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn read_pem(path: &std::path::Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| DiscoveryError::Config(format!("cannot read {}: {e}", path.display())))
}

fn load_tls(tls: &TlsConfig) -> Result<TlsOptions> {
    let mut options = TlsOptions::new();

    if let Some(ca) = &tls.ca_cert {
        options = options.ca_certificate(Certificate::from_pem(read_pem(ca)?));
    }

    match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => {
            options = options.identity(Identity::from_pem(read_pem(cert)?, read_pem(key)?));
        }
        (None, None) => {}
        _ => {
            return Err(DiscoveryError::Config(
                "client certificate and key must be given together".to_string(),
            ));
        }
    }

    if let Some(domain) = &tls.domain {
        options = options.domain_name(domain.clone());
    }

    Ok(options)
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| DiscoveryError::Connection(format!("get {prefix}: {e}")))?;

        let entries = response
            .kvs()
            .iter()
            .filter_map(|kv| match kv.key_str() {
                Ok(key) => Some((key.to_string(), kv.value().to_vec())),
                Err(e) => {
                    debug!("Skipping non-utf8 key under {prefix}: {e}");
                    None
                }
            })
            .collect();

        Ok(entries)
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease.0)))
            .await
            .map_err(|e| DiscoveryError::Store(format!("put {key}: {e}")))?;
        Ok(())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let response = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(|e| DiscoveryError::LeaseGrant(e.to_string()))?;
        Ok(LeaseId(response.id()))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let mut client = self.client.clone();

        // Ask for the remaining TTL so renewals go out at a third of it.
        let ttl = client
            .lease_time_to_live(lease.0, None)
            .await
            .map_err(|e| DiscoveryError::LeaseFailure(format!("lease {lease}: {e}")))?
            .ttl();
        if ttl <= 0 {
            return Err(DiscoveryError::LeaseFailure(format!(
                "lease {lease} already expired"
            )));
        }

        let (keeper, responses) = client
            .lease_keep_alive(lease.0)
            .await
            .map_err(|e| DiscoveryError::LeaseFailure(format!("lease {lease}: {e}")))?;

        let period = Duration::from_millis((ttl as u64 * 1000 / 3).max(500));
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let acks = stream::unfold(
            Some((keeper, responses, ticker)),
            move |state| async move {
                let (mut keeper, mut responses, mut ticker) = state?;
                ticker.tick().await;

                if let Err(e) = keeper.keep_alive().await {
                    let err = DiscoveryError::LeaseFailure(format!("renew lease {lease}: {e}"));
                    return Some((Err(err), None));
                }

                match responses.message().await {
                    Ok(Some(response)) => {
                        let ack = LeaseAck {
                            id: LeaseId(response.id()),
                            ttl: response.ttl(),
                        };
                        Some((Ok(ack), Some((keeper, responses, ticker))))
                    }
                    Ok(None) => None,
                    Err(e) => {
                        let err = DiscoveryError::LeaseFailure(format!(
                            "keepalive stream for lease {lease}: {e}"
                        ));
                        Some((Err(err), None))
                    }
                }
            },
        );

        Ok(acks.boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease.0)
            .await
            .map_err(|e| DiscoveryError::Store(format!("revoke lease {lease}: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_requires_endpoints() {
        let config = ClientConfig::new().with_endpoints(Vec::<String>::new());
        let result = EtcdStore::connect(&config).await;
        assert!(matches!(result, Err(DiscoveryError::Config(_))));
    }

    #[test]
    fn test_tls_requires_cert_and_key_together() {
        let tls = TlsConfig {
            client_cert: Some("/nonexistent/cert.pem".into()),
            ..Default::default()
        };
        assert!(matches!(load_tls(&tls), Err(DiscoveryError::Config(_))));
    }

    #[test]
    fn test_tls_missing_ca_file() {
        let tls = TlsConfig {
            ca_cert: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        match load_tls(&tls) {
            Err(DiscoveryError::Config(msg)) => assert!(msg.contains("/nonexistent/ca.pem")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
