//! Discovery aggregation: one consistent view out of per-node catalog fragments.
//!
//! The catalog answers "which nodes exist" and "what runs on node X"
//! separately. [`DiscoveryAggregator::list_all_services`] fans the per-node
//! queries out concurrently, joins them in node order, and fails as a whole
//! if any single node fails.

use std::sync::Arc;

use futures::StreamExt;
use futures::TryStreamExt;
use futures::stream;
use snafu::ResultExt;
use tracing::debug;

use crate::config::DiscoveryConfig;
use crate::error::CoordinationError;
use crate::error::NodeFetchFailedSnafu;
use crate::gateway::BackendGateway;
use crate::types::ServiceHealth;
use crate::types::ServiceRecord;

/// Fans out catalog queries and derives filtered views.
#[derive(Clone)]
pub struct DiscoveryAggregator {
    gateway: Arc<dyn BackendGateway>,
    max_concurrent: usize,
}

impl DiscoveryAggregator {
    pub fn new(gateway: Arc<dyn BackendGateway>, config: &DiscoveryConfig) -> Self {
        Self {
            gateway,
            max_concurrent: config.max_concurrent_node_fetches.max(1),
        }
    }

    /// Every service instance on every node.
    ///
    /// Records come out grouped by node in the order the catalog lists
    /// nodes, so a fixed backend state always yields the same sequence.
    /// The first failing node aborts the aggregation and drops the fetches
    /// still in flight.
    pub async fn list_all_services(&self) -> Result<Vec<ServiceRecord>, CoordinationError> {
        let nodes = self.gateway.list_nodes().await?;
        if nodes.is_empty() {
            debug!("catalog has no nodes");
            return Ok(Vec::new());
        }
        let node_count = nodes.len();

        let per_node: Vec<Vec<ServiceRecord>> = stream::iter(nodes)
            .map(|node| {
                let gateway = self.gateway.clone();
                async move {
                    let services = gateway.list_services_on_node(&node).await.context(NodeFetchFailedSnafu {
                        node: node.clone(),
                    })?;
                    let records: Vec<ServiceRecord> =
                        services.into_values().map(|fragment| ServiceRecord::from_fragment(&node, fragment)).collect();
                    Ok::<_, CoordinationError>(records)
                }
            })
            .buffered(self.max_concurrent)
            .try_collect()
            .await?;

        let records: Vec<ServiceRecord> = per_node.into_iter().flatten().collect();
        debug!(nodes = node_count, services = records.len(), "catalog aggregated");
        Ok(records)
    }

    /// `"<address>:<port>"` of every instance named exactly `service_name`.
    pub async fn addresses_for_service(&self, service_name: &str) -> Result<Vec<String>, CoordinationError> {
        require_service_name(service_name)?;
        let records = self.list_all_services().await?;
        Ok(addresses_of(&records, service_name))
    }

    /// Instances of `service_name` with their health checks.
    pub async fn service_health(
        &self,
        service_name: &str,
        passing_only: bool,
    ) -> Result<Vec<ServiceHealth>, CoordinationError> {
        require_service_name(service_name)?;
        Ok(self.gateway.health_service(service_name, passing_only).await?)
    }

    /// Addresses of the instances whose checks all pass.
    pub async fn healthy_addresses(&self, service_name: &str) -> Result<Vec<String>, CoordinationError> {
        let healthy = self.service_health(service_name, true).await?;
        Ok(healthy.iter().map(|h| h.service.socket_address()).collect())
    }
}

/// Records named exactly `service_name`.
pub fn filter_by_name<'a>(records: &'a [ServiceRecord], service_name: &str) -> Vec<&'a ServiceRecord> {
    records.iter().filter(|record| record.is_named(service_name)).collect()
}

/// Socket addresses of the records named exactly `service_name`.
pub fn addresses_of(records: &[ServiceRecord], service_name: &str) -> Vec<String> {
    filter_by_name(records, service_name).into_iter().map(ServiceRecord::socket_address).collect()
}

fn require_service_name(service_name: &str) -> Result<(), CoordinationError> {
    if service_name.is_empty() {
        return Err(CoordinationError::InvalidArgument {
            reason: "service name must not be empty".to_string(),
        });
    }
    Ok(())
}
