//! Defaults and bounds for waypoint operations.
//!
//! Tiger Style: Constants are fixed and immutable, enforced at compile time.
//! Each constant has explicit bounds to prevent unbounded resource allocation.

// ============================================================================
// Watch (long-poll) Limits
// ============================================================================

/// Default long-poll wait for a single blocking query (5 minutes).
///
/// The backend holds the request open until the resource changes or this
/// much time passes, after which the watcher re-issues the query.
pub const DEFAULT_WATCH_WAIT_MS: u64 = 5 * 60 * 1000;

/// Maximum long-poll wait accepted from configuration (10 minutes).
pub const MAX_WATCH_WAIT_MS: u64 = 10 * 60 * 1000;

/// Default number of undelivered watch results buffered per watch.
pub const DEFAULT_WATCH_CHANNEL_CAPACITY: usize = 16;

/// Upper bound on the per-watch delivery buffer.
pub const MAX_WATCH_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Discovery Limits
// ============================================================================

/// Default number of per-node catalog fetches kept in flight at once.
pub const DEFAULT_MAX_CONCURRENT_NODE_FETCHES: usize = 32;

/// Upper bound on concurrent per-node catalog fetches.
pub const MAX_CONCURRENT_NODE_FETCHES: usize = 512;

// ============================================================================
// Key-Value Limits
// ============================================================================

/// Maximum size of a single key in bytes (1 KB).
pub const MAX_KEY_SIZE: usize = 1024;

/// Maximum size of a single value in bytes (512 KB, the usual backend cap).
pub const MAX_VALUE_SIZE: usize = 512 * 1024;

/// Expected-index value meaning "write only if the key does not exist".
pub const CAS_INDEX_ABSENT: u64 = 0;

// ============================================================================
// Lock Defaults
// ============================================================================

/// Default lock TTL (15 seconds).
pub const DEFAULT_LOCK_TTL_MS: u64 = 15_000;

/// Default time to keep retrying lock acquisition (10 seconds).
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS: u64 = 10_000;

/// Default initial acquisition backoff.
pub const DEFAULT_LOCK_INITIAL_BACKOFF_MS: u64 = 10;

/// Default maximum acquisition backoff.
pub const DEFAULT_LOCK_MAX_BACKOFF_MS: u64 = 1_000;

// ============================================================================
// Compile-time assertions
// ============================================================================

const _: () = assert!(DEFAULT_WATCH_WAIT_MS > 0);
const _: () = assert!(DEFAULT_WATCH_WAIT_MS <= MAX_WATCH_WAIT_MS);
const _: () = assert!(DEFAULT_WATCH_CHANNEL_CAPACITY > 0);
const _: () = assert!(DEFAULT_WATCH_CHANNEL_CAPACITY <= MAX_WATCH_CHANNEL_CAPACITY);
const _: () = assert!(DEFAULT_MAX_CONCURRENT_NODE_FETCHES > 0);
const _: () = assert!(DEFAULT_MAX_CONCURRENT_NODE_FETCHES <= MAX_CONCURRENT_NODE_FETCHES);
const _: () = assert!(MAX_KEY_SIZE > 0);
const _: () = assert!(MAX_VALUE_SIZE > 0);
const _: () = assert!(DEFAULT_LOCK_TTL_MS > 0);
const _: () = assert!(DEFAULT_LOCK_INITIAL_BACKOFF_MS <= DEFAULT_LOCK_MAX_BACKOFF_MS);
