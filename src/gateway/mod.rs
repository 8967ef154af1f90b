//! Backend gateway: the only seam between the facade and the coordination backend.
//!
//! Every other component (CAS mutator, discovery aggregator, watches, locks)
//! talks to the backend exclusively through [`BackendGateway`]. A gateway is
//! constructed once and shared as `Arc<dyn BackendGateway>`; calls are
//! independent of one another.

pub mod inmemory;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::GatewayError;
use crate::types::KeyEntry;
use crate::types::ServiceFragment;
use crate::types::ServiceHealth;

pub use inmemory::DeterministicBackend;

/// Resource a blocking query (and therefore a watch) is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchQuery {
    /// Catalog-wide list of service names and their tags.
    CatalogServices,
    /// Every key under a prefix.
    KeyPrefix { prefix: String },
    /// Instances of one service with their health checks.
    HealthService { service: String, passing_only: bool },
}

impl fmt::Display for WatchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchQuery::CatalogServices => f.write_str("catalog-services"),
            WatchQuery::KeyPrefix { prefix } => write!(f, "kv:{prefix}"),
            WatchQuery::HealthService { service, passing_only } => {
                write!(f, "health:{service}")?;
                if *passing_only {
                    f.write_str("?passing")?;
                }
                Ok(())
            }
        }
    }
}

/// Body of a blocking-query response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchPayload {
    /// Service name -> union of tags across instances.
    Services(BTreeMap<String, Vec<String>>),
    Keys(Vec<KeyEntry>),
    Health(Vec<ServiceHealth>),
}

/// Result of a blocking query: the resource's current index and contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    /// Version of the queried resource. Advances whenever it changes.
    pub index: u64,
    pub payload: WatchPayload,
}

/// Capabilities required from the coordination backend.
///
/// Implementations must be safe for concurrent use. Expected races (a CAS
/// write losing, a lock held elsewhere) are reported through return values,
/// never as errors; `GatewayError` is reserved for transport failures and
/// malformed requests.
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// Read a single key.
    async fn get_key(&self, key: &str) -> Result<Option<KeyEntry>, GatewayError>;

    /// Read every key under `prefix` (recursive read), ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyEntry>, GatewayError>;

    /// Write a key.
    ///
    /// `expected_index` guards the write:
    /// - `None`: unconditional,
    /// - `Some(0)`: only if the key does not exist,
    /// - `Some(n)`: only if the key's modify index is exactly `n`.
    ///
    /// Returns `false` when the guard rejected the write.
    async fn set_key(&self, key: &str, value: Vec<u8>, expected_index: Option<u64>) -> Result<bool, GatewayError>;

    /// Delete a key, or every key under it when `recursive` is set.
    async fn delete_key(&self, key: &str, recursive: bool) -> Result<(), GatewayError>;

    /// Names of every node in the catalog.
    async fn list_nodes(&self) -> Result<Vec<String>, GatewayError>;

    /// Services registered on one node, keyed by service id.
    async fn list_services_on_node(&self, node: &str) -> Result<BTreeMap<String, ServiceFragment>, GatewayError>;

    /// Instances of `service` with their checks; optionally only passing ones.
    async fn health_service(&self, service: &str, passing_only: bool) -> Result<Vec<ServiceHealth>, GatewayError>;

    /// Long-poll read of `query`.
    ///
    /// Returns as soon as the resource's index is greater than `min_index`,
    /// or once `wait` elapses with the current (possibly unchanged) index.
    async fn blocking_query(
        &self,
        query: &WatchQuery,
        min_index: u64,
        wait: Duration,
    ) -> Result<QueryResponse, GatewayError>;

    /// Try to take the lock at `key` for `holder`.
    ///
    /// Returns a fresh fencing index when acquired and `None` while any
    /// unexpired holder owns it, `holder` included. Not re-entrant: a term
    /// is identified by its index, never by the holder name alone.
    async fn lock_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<u64>, GatewayError>;

    /// Extend the term `(holder, index)` of the lock at `key` by `ttl`.
    /// Returns false if that term expired or was released.
    async fn lock_renew(&self, key: &str, holder: &str, index: u64, ttl: Duration) -> Result<bool, GatewayError>;

    /// Release the term `(holder, index)` of the lock at `key`. Returns
    /// whether that term was still live.
    async fn lock_release(&self, key: &str, holder: &str, index: u64) -> Result<bool, GatewayError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: BackendGateway + ?Sized> BackendGateway for std::sync::Arc<T> {
    async fn get_key(&self, key: &str) -> Result<Option<KeyEntry>, GatewayError> {
        (**self).get_key(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyEntry>, GatewayError> {
        (**self).get_prefix(prefix).await
    }

    async fn set_key(&self, key: &str, value: Vec<u8>, expected_index: Option<u64>) -> Result<bool, GatewayError> {
        (**self).set_key(key, value, expected_index).await
    }

    async fn delete_key(&self, key: &str, recursive: bool) -> Result<(), GatewayError> {
        (**self).delete_key(key, recursive).await
    }

    async fn list_nodes(&self) -> Result<Vec<String>, GatewayError> {
        (**self).list_nodes().await
    }

    async fn list_services_on_node(&self, node: &str) -> Result<BTreeMap<String, ServiceFragment>, GatewayError> {
        (**self).list_services_on_node(node).await
    }

    async fn health_service(&self, service: &str, passing_only: bool) -> Result<Vec<ServiceHealth>, GatewayError> {
        (**self).health_service(service, passing_only).await
    }

    async fn blocking_query(
        &self,
        query: &WatchQuery,
        min_index: u64,
        wait: Duration,
    ) -> Result<QueryResponse, GatewayError> {
        (**self).blocking_query(query, min_index, wait).await
    }

    async fn lock_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<u64>, GatewayError> {
        (**self).lock_acquire(key, holder, ttl).await
    }

    async fn lock_renew(&self, key: &str, holder: &str, index: u64, ttl: Duration) -> Result<bool, GatewayError> {
        (**self).lock_renew(key, holder, index, ttl).await
    }

    async fn lock_release(&self, key: &str, holder: &str, index: u64) -> Result<bool, GatewayError> {
        (**self).lock_release(key, holder, index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_query_display() {
        assert_eq!(WatchQuery::CatalogServices.to_string(), "catalog-services");
        assert_eq!(
            WatchQuery::KeyPrefix {
                prefix: "cfg/".to_string()
            }
            .to_string(),
            "kv:cfg/"
        );
        assert_eq!(
            WatchQuery::HealthService {
                service: "web".to_string(),
                passing_only: true
            }
            .to_string(),
            "health:web?passing"
        );
    }
}
