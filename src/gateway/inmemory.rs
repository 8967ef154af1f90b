//! Deterministic in-memory backend.
//!
//! Behaves like a single-server coordination backend: one global index that
//! advances on every mutation, per-resource indexes derived from it, and
//! blocking queries that park until a relevant mutation or their wait
//! elapses. Used by the test suite and by applications running without a
//! cluster.
//!
//! Fault injection (`set_unavailable`, `fail_node`) and call counters
//! (`stats`) exist so that error escalation and re-aggregation can be
//! observed from tests.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::BackendGateway;
use super::QueryResponse;
use super::WatchPayload;
use super::WatchQuery;
use crate::constants::MAX_KEY_SIZE;
use crate::constants::MAX_VALUE_SIZE;
use crate::error::GatewayError;
use crate::types::HealthCheck;
use crate::types::KeyEntry;
use crate::types::ServiceFragment;
use crate::types::ServiceHealth;
use crate::types::ServiceRecord;

#[derive(Clone)]
struct StoredValue {
    value: Vec<u8>,
    create_index: u64,
    modify_index: u64,
}

#[derive(Clone)]
struct HeldLock {
    holder: String,
    index: u64,
    expires_at: Instant,
}

impl HeldLock {
    fn is_term(&self, holder: &str, index: u64) -> bool {
        self.holder == holder && self.index == index
    }
}

struct State {
    /// Global index, advanced by every mutation. Index 1 is the bootstrap entry.
    index: u64,
    kv: BTreeMap<String, StoredValue>,
    /// Delete index per removed key, so prefix indexes move on deletion too.
    tombstones: BTreeMap<String, u64>,
    /// node -> (service id -> fragment)
    nodes: BTreeMap<String, BTreeMap<String, ServiceFragment>>,
    catalog_index: u64,
    /// (node, check id) -> check
    checks: BTreeMap<(String, String), HealthCheck>,
    health_index: u64,
    locks: BTreeMap<String, HeldLock>,
    unavailable: Option<String>,
    failing_nodes: BTreeSet<String>,
}

impl State {
    fn new() -> Self {
        Self {
            index: 1,
            kv: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            nodes: BTreeMap::new(),
            catalog_index: 1,
            checks: BTreeMap::new(),
            health_index: 1,
            locks: BTreeMap::new(),
            unavailable: None,
            failing_nodes: BTreeSet::new(),
        }
    }

    /// The lock at `key` unless it has expired by `now`.
    fn live_lock(&self, key: &str, now: Instant) -> Option<&HeldLock> {
        self.locks.get(key).filter(|held| held.expires_at > now)
    }

    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn check_available(&self) -> Result<(), GatewayError> {
        match &self.unavailable {
            Some(reason) => Err(GatewayError::unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn entry(&self, key: &str, stored: &StoredValue) -> KeyEntry {
        KeyEntry {
            key: key.to_string(),
            value: stored.value.clone(),
            create_index: stored.create_index,
            modify_index: stored.modify_index,
        }
    }

    fn prefix_entries(&self, prefix: &str) -> Vec<KeyEntry> {
        self.kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| self.entry(k, v))
            .collect()
    }

    fn prefix_index(&self, prefix: &str) -> u64 {
        let live = self
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.modify_index);
        let deleted = self
            .tombstones
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, idx)| *idx);
        // Untouched prefixes report the bootstrap index so a watch on them parks.
        live.chain(deleted).max().unwrap_or(1)
    }

    fn service_names(&self) -> BTreeMap<String, Vec<String>> {
        let mut names: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for services in self.nodes.values() {
            for fragment in services.values() {
                names.entry(fragment.service.clone()).or_default().extend(fragment.tags.iter().cloned());
            }
        }
        names.into_iter().map(|(name, tags)| (name, tags.into_iter().collect())).collect()
    }

    fn service_health(&self, service: &str, passing_only: bool) -> Vec<ServiceHealth> {
        let mut result = Vec::new();
        for (node, services) in &self.nodes {
            for fragment in services.values().filter(|f| f.service == service) {
                let checks = self
                    .checks
                    .range((node.clone(), String::new())..)
                    .take_while(|((n, _), _)| n == node)
                    .map(|(_, check)| check)
                    .filter(|check| check.service_name.as_deref().is_none_or(|s| s == service))
                    .cloned()
                    .collect();
                let health = ServiceHealth {
                    service: ServiceRecord::from_fragment(node, fragment.clone()),
                    checks,
                };
                if !passing_only || health.is_passing() {
                    result.push(health);
                }
            }
        }
        result
    }

    fn query(&self, query: &WatchQuery) -> QueryResponse {
        match query {
            WatchQuery::CatalogServices => QueryResponse {
                index: self.catalog_index,
                payload: WatchPayload::Services(self.service_names()),
            },
            WatchQuery::KeyPrefix { prefix } => QueryResponse {
                index: self.prefix_index(prefix),
                payload: WatchPayload::Keys(self.prefix_entries(prefix)),
            },
            WatchQuery::HealthService { service, passing_only } => QueryResponse {
                index: self.health_index,
                payload: WatchPayload::Health(self.service_health(service, *passing_only)),
            },
        }
    }
}

/// Counters of gateway calls, for observing fan-out and re-aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub list_nodes_calls: u64,
    pub node_service_calls: u64,
    pub blocking_queries: u64,
    /// Writes that landed; rejected guarded writes are not counted.
    pub kv_writes: u64,
}

#[derive(Default)]
struct Counters {
    list_nodes_calls: AtomicU64,
    node_service_calls: AtomicU64,
    blocking_queries: AtomicU64,
    kv_writes: AtomicU64,
}

/// A deterministic in-memory coordination backend.
pub struct DeterministicBackend {
    state: Mutex<State>,
    changes: watch::Sender<u64>,
    counters: Counters,
}

impl Default for DeterministicBackend {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl DeterministicBackend {
    /// Create a new backend wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    fn new_inner() -> Self {
        let (changes, _) = watch::channel(1);
        Self {
            state: Mutex::new(State::new()),
            changes,
            counters: Counters::default(),
        }
    }

    /// Apply a mutation under the state lock, then wake blocked queries.
    fn mutate<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let (result, index) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, state.index)
        };
        self.changes.send_replace(index);
        result
    }

    /// Current global index.
    pub fn current_index(&self) -> u64 {
        self.state.lock().index
    }

    /// Snapshot of call counters.
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            list_nodes_calls: self.counters.list_nodes_calls.load(Ordering::SeqCst),
            node_service_calls: self.counters.node_service_calls.load(Ordering::SeqCst),
            blocking_queries: self.counters.blocking_queries.load(Ordering::SeqCst),
            kv_writes: self.counters.kv_writes.load(Ordering::SeqCst),
        }
    }

    /// Register a node with no services. No-op if it already exists.
    pub fn add_node(&self, node: &str) {
        self.mutate(|state| {
            if !state.nodes.contains_key(node) {
                state.nodes.insert(node.to_string(), BTreeMap::new());
                let index = state.next_index();
                state.catalog_index = index;
                state.health_index = index;
            }
        });
    }

    /// Remove a node together with its services and checks.
    pub fn remove_node(&self, node: &str) {
        self.mutate(|state| {
            if state.nodes.remove(node).is_some() {
                state.checks.retain(|(n, _), _| n != node);
                let index = state.next_index();
                state.catalog_index = index;
                state.health_index = index;
            }
        });
    }

    /// Register (or replace) service `service_id` on `node`, creating the node if needed.
    pub fn register_service(&self, node: &str, service_id: &str, fragment: ServiceFragment) {
        self.mutate(|state| {
            state.nodes.entry(node.to_string()).or_default().insert(service_id.to_string(), fragment);
            let index = state.next_index();
            state.catalog_index = index;
            state.health_index = index;
            debug!(node, service_id, index, "service registered");
        });
    }

    /// Remove service `service_id` from `node`. Returns whether it existed.
    pub fn deregister_service(&self, node: &str, service_id: &str) -> bool {
        self.mutate(|state| {
            let removed = state.nodes.get_mut(node).and_then(|services| services.remove(service_id)).is_some();
            if removed {
                let index = state.next_index();
                state.catalog_index = index;
                state.health_index = index;
            }
            removed
        })
    }

    /// Insert or update a health check.
    pub fn set_check(&self, check: HealthCheck) {
        self.mutate(|state| {
            let changed = state.checks.get(&(check.node.clone(), check.check_id.clone())) != Some(&check);
            if changed {
                state.checks.insert((check.node.clone(), check.check_id.clone()), check);
                state.health_index = state.next_index();
            }
        });
    }

    /// Make every subsequent call fail with `BackendUnavailable`.
    pub fn set_unavailable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.mutate(|state| state.unavailable = Some(reason));
    }

    /// Undo [`Self::set_unavailable`].
    pub fn set_available(&self) {
        self.mutate(|state| state.unavailable = None);
    }

    /// Make per-node service listing fail for `node`.
    pub fn fail_node(&self, node: &str) {
        self.state.lock().failing_nodes.insert(node.to_string());
    }

    /// Undo [`Self::fail_node`].
    pub fn heal_node(&self, node: &str) {
        self.state.lock().failing_nodes.remove(node);
    }
}

fn validate_key(key: &str) -> Result<(), GatewayError> {
    if key.len() > MAX_KEY_SIZE {
        return Err(GatewayError::KeyTooLarge {
            size: key.len(),
            max: MAX_KEY_SIZE,
        });
    }
    Ok(())
}

#[async_trait]
impl BackendGateway for DeterministicBackend {
    async fn get_key(&self, key: &str) -> Result<Option<KeyEntry>, GatewayError> {
        validate_key(key)?;
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.kv.get(key).map(|stored| state.entry(key, stored)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyEntry>, GatewayError> {
        validate_key(prefix)?;
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.prefix_entries(prefix))
    }

    async fn set_key(&self, key: &str, value: Vec<u8>, expected_index: Option<u64>) -> Result<bool, GatewayError> {
        if key.is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "key must not be empty".to_string(),
            });
        }
        validate_key(key)?;
        if value.len() > MAX_VALUE_SIZE {
            return Err(GatewayError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        self.mutate(|state| {
            state.check_available()?;
            let current = state.kv.get(key).map(|v| v.modify_index);
            let allowed = match expected_index {
                None => true,
                Some(0) => current.is_none(),
                Some(expected) => current == Some(expected),
            };
            if !allowed {
                debug!(key, ?expected_index, ?current, "guarded write rejected");
                return Ok(false);
            }

            self.counters.kv_writes.fetch_add(1, Ordering::SeqCst);
            let index = state.next_index();
            let create_index = state.kv.get(key).map(|v| v.create_index).unwrap_or(index);
            state.kv.insert(key.to_string(), StoredValue {
                value,
                create_index,
                modify_index: index,
            });
            state.tombstones.remove(key);
            Ok(true)
        })
    }

    async fn delete_key(&self, key: &str, recursive: bool) -> Result<(), GatewayError> {
        validate_key(key)?;
        self.mutate(|state| {
            state.check_available()?;
            let doomed: Vec<String> = if recursive {
                state.kv.range(key.to_string()..).take_while(|(k, _)| k.starts_with(key)).map(|(k, _)| k.clone()).collect()
            } else if state.kv.contains_key(key) {
                vec![key.to_string()]
            } else {
                Vec::new()
            };
            if doomed.is_empty() {
                return Ok(());
            }
            let index = state.next_index();
            for k in doomed {
                state.kv.remove(&k);
                state.tombstones.insert(k, index);
            }
            Ok(())
        })
    }

    async fn list_nodes(&self) -> Result<Vec<String>, GatewayError> {
        self.counters.list_nodes_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.nodes.keys().cloned().collect())
    }

    async fn list_services_on_node(&self, node: &str) -> Result<BTreeMap<String, ServiceFragment>, GatewayError> {
        self.counters.node_service_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        state.check_available()?;
        if state.failing_nodes.contains(node) {
            return Err(GatewayError::unavailable(format!("node '{node}' did not respond")));
        }
        Ok(state.nodes.get(node).cloned().unwrap_or_default())
    }

    async fn health_service(&self, service: &str, passing_only: bool) -> Result<Vec<ServiceHealth>, GatewayError> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.service_health(service, passing_only))
    }

    async fn blocking_query(
        &self,
        query: &WatchQuery,
        min_index: u64,
        wait: Duration,
    ) -> Result<QueryResponse, GatewayError> {
        self.counters.blocking_queries.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + wait;
        // Subscribe before the first snapshot so no mutation slips between them.
        let mut changes = self.changes.subscribe();

        loop {
            let response = {
                let state = self.state.lock();
                state.check_available()?;
                state.query(query)
            };
            if min_index == 0 || response.index > min_index {
                return Ok(response);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                // Sender dropped or wait elapsed: answer with the unchanged index.
                Ok(Err(_)) | Err(_) => return Ok(response),
            }
        }
    }

    async fn lock_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<u64>, GatewayError> {
        validate_key(key)?;
        let now = Instant::now();
        self.mutate(|state| {
            state.check_available()?;
            if state.live_lock(key, now).is_some() {
                return Ok(None);
            }
            let index = state.next_index();
            state.locks.insert(key.to_string(), HeldLock {
                holder: holder.to_string(),
                index,
                expires_at: now + ttl,
            });
            Ok(Some(index))
        })
    }

    async fn lock_renew(&self, key: &str, holder: &str, index: u64, ttl: Duration) -> Result<bool, GatewayError> {
        validate_key(key)?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check_available()?;
        match state.locks.get_mut(key) {
            Some(held) if held.is_term(holder, index) && held.expires_at > now => {
                held.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lock_release(&self, key: &str, holder: &str, index: u64) -> Result<bool, GatewayError> {
        validate_key(key)?;
        let now = Instant::now();
        self.mutate(|state| {
            state.check_available()?;
            let owns = state.live_lock(key, now).is_some_and(|held| held.is_term(holder, index));
            if !owns {
                return Ok(false);
            }
            state.locks.remove(key);
            state.next_index();
            Ok(true)
        })
    }
}
