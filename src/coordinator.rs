//! The caller-facing surface: one gateway shared by every component.
//!
//! ```ignore
//! let coordinator = Coordinator::new(gateway, WaypointConfig::load_with_layers()?);
//!
//! let web = coordinator.addresses_for_service("web").await?;
//! let mut services = coordinator.watch_all_services()?;
//! while let Some(snapshot) = services.next().await {
//!     let snapshot = snapshot?;
//!     println!("{:?}", snapshot.addresses("web"));
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::cas::CasMutator;
use crate::cas::CasTicket;
use crate::config::WaypointConfig;
use crate::discovery::DiscoveryAggregator;
use crate::error::CoordinationError;
use crate::gateway::BackendGateway;
use crate::gateway::WatchPayload;
use crate::gateway::WatchQuery;
use crate::lock::DistributedLock;
use crate::types::KeyEntry;
use crate::types::ServiceHealth;
use crate::types::ServiceRecord;
use crate::watch::ServiceSnapshot;
use crate::watch::ServiceWatch;
use crate::watch::Watch;
use crate::watch::WatchOptions;
use crate::watch::spawn_watch;

/// Coordination facade over a [`BackendGateway`].
///
/// Cheap to clone; clones share the gateway.
#[derive(Clone)]
pub struct Coordinator {
    gateway: Arc<dyn BackendGateway>,
    cas: CasMutator,
    discovery: DiscoveryAggregator,
    config: WaypointConfig,
}

impl Coordinator {
    pub fn new(gateway: Arc<dyn BackendGateway>, config: WaypointConfig) -> Self {
        Self {
            cas: CasMutator::new(gateway.clone()),
            discovery: DiscoveryAggregator::new(gateway.clone(), &config.discovery),
            gateway,
            config,
        }
    }

    pub fn config(&self) -> &WaypointConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<dyn BackendGateway> {
        &self.gateway
    }

    fn watch_options(&self) -> WatchOptions {
        WatchOptions::from(&self.config.watch)
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Every service instance on every node. Fails if any node fails.
    pub async fn list_all_services(&self) -> Result<Vec<ServiceRecord>, CoordinationError> {
        self.discovery.list_all_services().await
    }

    /// `"<address>:<port>"` of every instance named exactly `service_name`.
    pub async fn addresses_for_service(&self, service_name: &str) -> Result<Vec<String>, CoordinationError> {
        self.discovery.addresses_for_service(service_name).await
    }

    pub async fn service_health(
        &self,
        service_name: &str,
        passing_only: bool,
    ) -> Result<Vec<ServiceHealth>, CoordinationError> {
        self.discovery.service_health(service_name, passing_only).await
    }

    pub async fn healthy_addresses(&self, service_name: &str) -> Result<Vec<String>, CoordinationError> {
        self.discovery.healthy_addresses(service_name).await
    }

    // ========================================================================
    // Watches
    //
    // Each watch runs on a task spawned onto the current tokio runtime.
    // Starting one outside a runtime returns `InvalidArgument`.
    // ========================================================================

    /// Watch the aggregated catalog; every change delivers a fresh snapshot.
    pub fn watch_all_services(&self) -> Result<Watch<ServiceSnapshot>, CoordinationError> {
        self.service_watch().start()
    }

    /// An idle catalog watch, for callers that want the handle before starting.
    pub fn service_watch(&self) -> ServiceWatch {
        ServiceWatch::new(self.gateway.clone(), self.discovery.clone(), self.watch_options())
    }

    /// Watch the catalog's service names and tags without re-aggregating.
    pub fn watch_service_names(&self) -> Result<Watch<BTreeMap<String, Vec<String>>>, CoordinationError> {
        spawn_watch(self.gateway.clone(), WatchQuery::CatalogServices, self.watch_options(), |response| async move {
            match response.payload {
                WatchPayload::Services(names) => Ok(names),
                other => Err(unexpected_payload("service names", &other)),
            }
        })
    }

    /// Watch the instances of one service and their health.
    pub fn watch_service_health(
        &self,
        service_name: &str,
        passing_only: bool,
    ) -> Result<Watch<Vec<ServiceHealth>>, CoordinationError> {
        if service_name.is_empty() {
            return Err(CoordinationError::InvalidArgument {
                reason: "service name must not be empty".to_string(),
            });
        }
        let query = WatchQuery::HealthService {
            service: service_name.to_string(),
            passing_only,
        };
        spawn_watch(self.gateway.clone(), query, self.watch_options(), |response| async move {
            match response.payload {
                WatchPayload::Health(health) => Ok(health),
                other => Err(unexpected_payload("service health", &other)),
            }
        })
    }

    /// Watch every key under `prefix`.
    pub fn watch_key(&self, prefix: &str) -> Result<Watch<Vec<KeyEntry>>, CoordinationError> {
        require_key(prefix)?;
        let query = WatchQuery::KeyPrefix {
            prefix: prefix.to_string(),
        };
        spawn_watch(self.gateway.clone(), query, self.watch_options(), |response| async move {
            match response.payload {
                WatchPayload::Keys(entries) => Ok(entries),
                other => Err(unexpected_payload("keys", &other)),
            }
        })
    }

    // ========================================================================
    // Key/value
    // ========================================================================

    /// See [`CasMutator::get_then_set`].
    pub async fn get_then_set<F>(&self, key: &str, mutate: F) -> Result<bool, CoordinationError>
    where
        F: FnOnce(Option<&KeyEntry>) -> Option<Vec<u8>>,
    {
        require_key(key)?;
        self.cas.get_then_set(key, mutate).await
    }

    /// See [`CasMutator::begin`].
    pub async fn begin_cas(&self, key: &str) -> Result<CasTicket, CoordinationError> {
        require_key(key)?;
        self.cas.begin(key).await
    }

    pub async fn get_key(&self, key: &str) -> Result<Option<KeyEntry>, CoordinationError> {
        require_key(key)?;
        Ok(self.gateway.get_key(key).await?)
    }

    /// Every key under `prefix`, ordered by key.
    pub async fn get_key_recursive(&self, prefix: &str) -> Result<Vec<KeyEntry>, CoordinationError> {
        Ok(self.gateway.get_prefix(prefix).await?)
    }

    pub async fn set_key(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), CoordinationError> {
        require_key(key)?;
        self.cas.set_key(key, value.into()).await
    }

    pub async fn delete_key(&self, key: &str) -> Result<(), CoordinationError> {
        require_key(key)?;
        self.gateway.delete_key(key, false).await?;
        debug!(key, "key deleted");
        Ok(())
    }

    /// Delete every key under `prefix`. An empty prefix is refused.
    pub async fn delete_key_recursive(&self, prefix: &str) -> Result<(), CoordinationError> {
        if prefix.is_empty() {
            return Err(CoordinationError::InvalidArgument {
                reason: "refusing recursive delete of the whole keyspace".to_string(),
            });
        }
        self.gateway.delete_key(prefix, true).await?;
        debug!(prefix, "prefix deleted");
        Ok(())
    }

    // ========================================================================
    // Locks
    // ========================================================================

    /// A lock on `key` for this coordinator's configured holder.
    ///
    /// Nothing is acquired until [`DistributedLock::acquire`] or
    /// [`DistributedLock::try_acquire`].
    pub fn acquire_lock(&self, key: &str) -> Result<DistributedLock, CoordinationError> {
        require_key(key)?;
        Ok(DistributedLock::new(self.gateway.clone(), key, self.config.lock.clone()))
    }
}

fn require_key(key: &str) -> Result<(), CoordinationError> {
    if key.is_empty() {
        return Err(CoordinationError::InvalidArgument {
            reason: "key must not be empty".to_string(),
        });
    }
    Ok(())
}

fn unexpected_payload(expected: &str, payload: &WatchPayload) -> CoordinationError {
    let got = match payload {
        WatchPayload::Services(_) => "services",
        WatchPayload::Keys(_) => "keys",
        WatchPayload::Health(_) => "health",
    };
    CoordinationError::WatchFailed {
        reason: format!("expected {expected} payload, backend sent {got}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::DeterministicBackend;

    fn coordinator() -> (Arc<DeterministicBackend>, Coordinator) {
        let backend = DeterministicBackend::new();
        (backend.clone(), Coordinator::new(backend, WaypointConfig::default()))
    }

    #[tokio::test]
    async fn test_empty_keys_rejected() {
        let (_backend, coordinator) = coordinator();
        assert!(matches!(coordinator.get_key("").await, Err(CoordinationError::InvalidArgument { .. })));
        assert!(matches!(coordinator.set_key("", "v").await, Err(CoordinationError::InvalidArgument { .. })));
        assert!(matches!(
            coordinator.get_then_set("", |_| None).await,
            Err(CoordinationError::InvalidArgument { .. })
        ));
        assert!(coordinator.acquire_lock("").is_err());
        assert!(coordinator.watch_key("").is_err());
        assert!(coordinator.watch_service_health("", false).is_err());
    }

    #[tokio::test]
    async fn test_recursive_delete_requires_prefix() {
        let (backend, coordinator) = coordinator();
        coordinator.set_key("a", "1").await.unwrap();

        assert!(coordinator.delete_key_recursive("").await.is_err());
        assert!(backend.get_key("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_kv_round_trip() {
        let (_backend, coordinator) = coordinator();
        coordinator.set_key("app/a", "1").await.unwrap();
        coordinator.set_key("app/b", "2").await.unwrap();

        let all = coordinator.get_key_recursive("app/").await.unwrap();
        assert_eq!(all.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(), vec!["app/a", "app/b"]);

        coordinator.delete_key("app/a").await.unwrap();
        assert!(coordinator.get_key("app/a").await.unwrap().is_none());

        coordinator.delete_key_recursive("app/").await.unwrap();
        assert!(coordinator.get_key_recursive("app/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_service_names() {
        let (backend, coordinator) = coordinator();
        backend.register_service(
            "n1",
            "web-1",
            crate::types::ServiceFragment::new("web", "10.0.0.1", 80).with_tags(["primary"]),
        );

        let mut watch = coordinator.watch_service_names().unwrap();
        let names = watch.next().await.unwrap().unwrap();
        assert_eq!(names["web"], vec!["primary"]);
        // No re-aggregation for the raw form.
        assert_eq!(backend.stats().list_nodes_calls, 0);
    }

    #[test]
    fn test_watches_need_a_runtime() {
        let (backend, coordinator) = coordinator();
        assert!(matches!(coordinator.watch_all_services(), Err(CoordinationError::InvalidArgument { .. })));
        assert!(matches!(coordinator.watch_key("cfg/"), Err(CoordinationError::InvalidArgument { .. })));
        assert!(matches!(
            coordinator.watch_service_health("web", true),
            Err(CoordinationError::InvalidArgument { .. })
        ));
        assert_eq!(backend.stats().blocking_queries, 0);
    }
}
