//! Client-side coordination facade over a service-discovery and KV backend.
//!
//! Consensus, replication and blocking-query delivery all belong to the
//! backend. This crate adds the pieces applications keep rewriting on top:
//!
//! - **CAS**: read-modify-write guarded by the modify index ([`cas`])
//! - **Discovery**: per-node catalog fan-out joined into one view ([`discovery`])
//! - **Watches**: long-poll loops with a small state machine and
//!   idempotent cancel, including a catalog watch that re-aggregates on
//!   every change ([`watch`])
//! - **Locks**: backoff-and-retry acquisition with fencing tokens ([`lock`])
//!
//! # Architecture
//!
//! ```text
//! Coordinator
//!    |-- CasMutator ----------+
//!    |-- DiscoveryAggregator -+
//!    |-- ServiceWatch / Watch +--> Arc<dyn BackendGateway>
//!    +-- DistributedLock -----+         |
//!                                       v
//!                    coordination backend (or DeterministicBackend)
//! ```
//!
//! Components only ever talk to the backend through [`BackendGateway`].
//! One gateway is constructed by the application and injected everywhere.
//!
//! # Tiger Style
//!
//! - Bounded fan-out (`max_concurrent_node_fetches`)
//! - Bounded watch delivery channels
//! - Key and value sizes validated before they reach the backend

pub mod cas;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod types;
pub mod watch;

pub use cas::CasMutator;
pub use cas::CasTicket;
pub use config::WaypointConfig;
pub use coordinator::Coordinator;
pub use discovery::DiscoveryAggregator;
pub use error::CoordinationError;
pub use error::GatewayError;
pub use gateway::BackendGateway;
pub use gateway::DeterministicBackend;
pub use gateway::QueryResponse;
pub use gateway::WatchPayload;
pub use gateway::WatchQuery;
pub use lock::DistributedLock;
pub use lock::FencingToken;
pub use lock::LockGuard;
pub use types::HealthCheck;
pub use types::HealthStatus;
pub use types::KeyEntry;
pub use types::ServiceFragment;
pub use types::ServiceHealth;
pub use types::ServiceRecord;
pub use watch::ServiceSnapshot;
pub use watch::ServiceWatch;
pub use watch::Watch;
pub use watch::WatchHandle;
pub use watch::WatchState;
