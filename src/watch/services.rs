//! Service watch: re-aggregates the catalog on every change.
//!
//! The backend only says "the catalog changed"; callers want the full,
//! flattened service list. [`ServiceWatch`] turns each catalog change into
//! exactly one fresh [`DiscoveryAggregator::list_all_services`] and hands
//! the result out as a [`ServiceSnapshot`].

use std::sync::Arc;

use tracing::debug;

use super::Watch;
use super::WatchHandle;
use super::WatchOptions;
use super::WatchState;
use super::start_watch;
use crate::discovery::DiscoveryAggregator;
use crate::discovery::addresses_of;
use crate::discovery::filter_by_name;
use crate::error::CoordinationError;
use crate::gateway::BackendGateway;
use crate::gateway::WatchQuery;
use crate::types::ServiceRecord;

/// Watch over the aggregated service catalog. Idle until [`Self::start`].
pub struct ServiceWatch {
    gateway: Arc<dyn BackendGateway>,
    aggregator: DiscoveryAggregator,
    options: WatchOptions,
    handle: WatchHandle,
}

impl ServiceWatch {
    pub fn new(gateway: Arc<dyn BackendGateway>, aggregator: DiscoveryAggregator, options: WatchOptions) -> Self {
        Self {
            gateway,
            aggregator,
            options,
            handle: WatchHandle::new(WatchQuery::CatalogServices.to_string()),
        }
    }

    pub fn state(&self) -> WatchState {
        self.handle.state()
    }

    /// Handle to the watch this will become. Cancelling it before
    /// [`Self::start`] means the watch never starts.
    pub fn handle(&self) -> WatchHandle {
        self.handle.clone()
    }

    /// Begin watching. The first snapshot is the catalog as it is now.
    ///
    /// Must be called from within a tokio runtime; otherwise returns
    /// `InvalidArgument` and nothing is spawned.
    pub fn start(self) -> Result<Watch<ServiceSnapshot>, CoordinationError> {
        let Self {
            gateway,
            aggregator,
            options,
            handle,
        } = self;
        let snapshot_handle = handle.clone();

        start_watch(handle, gateway, WatchQuery::CatalogServices, options, move |response| {
            let aggregator = aggregator.clone();
            let handle = snapshot_handle.clone();
            async move {
                let services = aggregator.list_all_services().await?;
                debug!(index = response.index, services = services.len(), "catalog re-aggregated");
                Ok::<_, CoordinationError>(ServiceSnapshot {
                    services,
                    index: response.index,
                    handle,
                })
            }
        })
    }
}

/// One aggregated view of the catalog, delivered by a [`ServiceWatch`].
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    services: Vec<ServiceRecord>,
    index: u64,
    handle: WatchHandle,
}

impl ServiceSnapshot {
    pub fn services(&self) -> &[ServiceRecord] {
        &self.services
    }

    pub fn into_services(self) -> Vec<ServiceRecord> {
        self.services
    }

    /// Catalog index this snapshot was aggregated at.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Records named exactly `service_name`.
    pub fn filter(&self, service_name: &str) -> Vec<&ServiceRecord> {
        filter_by_name(&self.services, service_name)
    }

    /// `"<address>:<port>"` of every instance named exactly `service_name`.
    pub fn addresses(&self, service_name: &str) -> Vec<String> {
        addresses_of(&self.services, service_name)
    }

    /// Stop the watch that produced this snapshot. Idempotent.
    pub fn end(&self) {
        self.handle.cancel();
    }

    /// Same as [`Self::end`].
    pub fn cancel(&self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::gateway::DeterministicBackend;
    use crate::types::ServiceFragment;

    fn service_watch(backend: &Arc<DeterministicBackend>) -> ServiceWatch {
        let aggregator = DiscoveryAggregator::new(backend.clone(), &DiscoveryConfig::default());
        ServiceWatch::new(backend.clone(), aggregator, WatchOptions {
            wait: Duration::from_secs(30),
            channel_capacity: 4,
        })
    }

    #[tokio::test]
    async fn test_idle_until_started() {
        let backend = DeterministicBackend::new();
        let watch = service_watch(&backend);
        assert_eq!(watch.state(), WatchState::Idle);
        assert_eq!(backend.stats().blocking_queries, 0);

        let started = watch.start().unwrap();
        assert_eq!(started.state(), WatchState::Watching);
    }

    #[tokio::test]
    async fn test_each_change_aggregates_once() {
        let backend = DeterministicBackend::new();
        backend.register_service("n1", "web-1", ServiceFragment::new("web", "10.0.0.1", 8080));
        let mut watch = service_watch(&backend).start().unwrap();

        let first = watch.next().await.unwrap().unwrap();
        assert_eq!(first.addresses("web"), vec!["10.0.0.1:8080"]);
        assert_eq!(backend.stats().list_nodes_calls, 1);

        backend.register_service("n2", "web-2", ServiceFragment::new("web", "10.0.0.2", 8080));
        let second = watch.next().await.unwrap().unwrap();
        assert!(second.index() > first.index());
        assert_eq!(second.filter("web").len(), 2);
        assert_eq!(backend.stats().list_nodes_calls, 2);
    }

    #[tokio::test]
    async fn test_snapshot_end_cancels_watch() {
        let backend = DeterministicBackend::new();
        let mut watch = service_watch(&backend).start().unwrap();

        let snapshot = watch.next().await.unwrap().unwrap();
        snapshot.end();
        snapshot.end();
        assert_eq!(watch.state(), WatchState::Ended);

        backend.add_node("n1");
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_reaggregation_failure_escalates() {
        let backend = DeterministicBackend::new();
        backend.register_service("n1", "web-1", ServiceFragment::new("web", "10.0.0.1", 8080));
        let mut watch = service_watch(&backend).start().unwrap();
        watch.next().await.unwrap().unwrap();

        backend.fail_node("n2");
        backend.register_service("n2", "db-1", ServiceFragment::new("db", "10.0.0.3", 5432));

        let item = watch.next().await.unwrap();
        assert!(matches!(item, Err(CoordinationError::WatchFailed { .. })));
        assert_eq!(watch.state(), WatchState::Failed);
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let backend = DeterministicBackend::new();
        let watch = service_watch(&backend);
        watch.handle().cancel();

        let mut started = watch.start().unwrap();
        assert!(started.next().await.is_none());
        assert_eq!(backend.stats().blocking_queries, 0);
    }

    #[test]
    fn test_start_outside_runtime_stays_idle() {
        let backend = DeterministicBackend::new();
        let watch = service_watch(&backend);
        let handle = watch.handle();

        assert!(matches!(watch.start(), Err(CoordinationError::InvalidArgument { .. })));
        assert_eq!(handle.state(), WatchState::Idle);
        assert_eq!(backend.stats().blocking_queries, 0);
    }
}
