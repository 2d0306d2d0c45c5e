use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors surfaced by registration and discovery.
///
/// Registration failures (`Connection`, `LeaseGrant`, `LeaseFailure`, `Store`)
/// end the current `register` attempt and are expected to be retried by an
/// outer restart loop. `NotFound` is returned to picker callers. `Parse` never
/// escapes a refresh; malformed entries are skipped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("coordination store unreachable: {0}")]
    Connection(String),
    #[error("lease grant failed: {0}")]
    LeaseGrant(String),
    #[error("lease lost: {0}")]
    LeaseFailure(String),
    #[error("store write failed: {0}")]
    Store(String),
    #[error("malformed service descriptor: {0}")]
    Parse(String),
    #[error("{0}")]
    NotFound(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DiscoveryError {
    /// Whether this error ends a registration attempt.
    pub fn is_registration_fatal(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Connection(_)
                | DiscoveryError::LeaseGrant(_)
                | DiscoveryError::LeaseFailure(_)
                | DiscoveryError::Store(_)
        )
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        DiscoveryError::Parse(err.to_string())
    }
}
