//! Distributed lock on top of the backend's lock primitive.
//!
//! Mutual exclusion itself is the backend's job; this module adds:
//! - retrying acquisition with exponential backoff and jitter,
//! - a fencing token per acquisition for downstream stale-holder checks,
//! - an RAII guard that releases on drop.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::constants::DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS;
use crate::constants::DEFAULT_LOCK_INITIAL_BACKOFF_MS;
use crate::constants::DEFAULT_LOCK_MAX_BACKOFF_MS;
use crate::constants::DEFAULT_LOCK_TTL_MS;
use crate::error::CoordinationError;
use crate::gateway::BackendGateway;

/// Configuration for distributed locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Time-to-live for a held lock in milliseconds.
    pub ttl_ms: u64,
    /// Maximum time to keep retrying acquisition.
    pub acquire_timeout_ms: u64,
    /// First retry delay; doubles per attempt.
    pub initial_backoff_ms: u64,
    /// Cap on the retry delay.
    pub max_backoff_ms: u64,
    /// Identity presented to the backend as lock holder.
    pub holder_id: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_LOCK_TTL_MS,
            acquire_timeout_ms: DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS,
            initial_backoff_ms: DEFAULT_LOCK_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_LOCK_MAX_BACKOFF_MS,
            holder_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Backend index at which a lock was granted.
///
/// Strictly increases across successive holders of the same key, so a
/// downstream service can reject writes carrying a smaller token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FencingToken(pub u64);

impl FencingToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FencingToken({})", self.0)
    }
}

/// Mutual exclusion on one key, shared by every holder using the same key.
///
/// Each successful acquisition is its own term, identified by its fencing
/// token. Two acquisitions never overlap, even under the same holder id or
/// through the same `DistributedLock`.
pub struct DistributedLock {
    gateway: Arc<dyn BackendGateway>,
    key: String,
    holder_id: String,
    config: LockConfig,
}

impl DistributedLock {
    /// Create a lock handle. Nothing is acquired until [`Self::acquire`].
    ///
    /// The holder identity comes from `config.holder_id`.
    pub fn new(gateway: Arc<dyn BackendGateway>, key: impl Into<String>, config: LockConfig) -> Self {
        Self {
            gateway,
            key: key.into(),
            holder_id: config.holder_id.clone(),
            config,
        }
    }

    /// Same as [`Self::new`] with an explicit holder identity.
    pub fn with_holder(
        gateway: Arc<dyn BackendGateway>,
        key: impl Into<String>,
        holder_id: impl Into<String>,
        config: LockConfig,
    ) -> Self {
        Self {
            gateway,
            key: key.into(),
            holder_id: holder_id.into(),
            config,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Acquire the lock, retrying with exponential backoff until
    /// `acquire_timeout_ms` elapses.
    pub async fn acquire(&self) -> Result<LockGuard, CoordinationError> {
        let deadline = Instant::now() + Duration::from_millis(self.config.acquire_timeout_ms);
        let mut backoff_ms = self.config.initial_backoff_ms.max(1);

        loop {
            match self.try_acquire().await {
                Ok(guard) => return Ok(guard),
                Err(CoordinationError::LockHeld { .. }) => {
                    if Instant::now() >= deadline {
                        return Err(CoordinationError::Timeout {
                            operation: format!("lock acquisition for '{}'", self.key),
                        });
                    }

                    // ThreadRng is !Send: draw and drop it before sleeping.
                    let jitter = rand::rng().random_range(0..=backoff_ms / 2);
                    let sleep_ms = backoff_ms + jitter;
                    debug!(key = %self.key, holder = %self.holder_id, backoff_ms = sleep_ms, "lock held, backing off");

                    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(self.config.max_backoff_ms.max(1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single acquisition attempt. `LockHeld` if someone else owns it.
    pub async fn try_acquire(&self) -> Result<LockGuard, CoordinationError> {
        let ttl = Duration::from_millis(self.config.ttl_ms);
        match self.gateway.lock_acquire(&self.key, &self.holder_id, ttl).await? {
            Some(index) => {
                debug!(key = %self.key, holder = %self.holder_id, fencing_token = index, ttl_ms = self.config.ttl_ms, "lock acquired");
                Ok(LockGuard {
                    gateway: self.gateway.clone(),
                    key: self.key.clone(),
                    holder_id: self.holder_id.clone(),
                    ttl,
                    fencing_token: FencingToken(index),
                    released: false,
                })
            }
            None => Err(CoordinationError::LockHeld { key: self.key.clone() }),
        }
    }
}

/// Proof of holding a lock. Dropping it releases the lock in the background.
pub struct LockGuard {
    gateway: Arc<dyn BackendGateway>,
    key: String,
    holder_id: String,
    ttl: Duration,
    fencing_token: FencingToken,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("holder_id", &self.holder_id)
            .field("fencing_token", &self.fencing_token)
            .finish()
    }
}

impl LockGuard {
    pub fn fencing_token(&self) -> FencingToken {
        self.fencing_token
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Extend the lock's TTL. `LockLost` if this term expired or was released.
    pub async fn renew(&self) -> Result<(), CoordinationError> {
        let token = self.fencing_token.value();
        if self.gateway.lock_renew(&self.key, &self.holder_id, token, self.ttl).await? {
            debug!(key = %self.key, fencing_token = token, "lock renewed");
            return Ok(());
        }
        Err(CoordinationError::LockLost {
            key: self.key.clone(),
            holder: self.holder_id.clone(),
        })
    }

    /// Explicitly release the lock.
    ///
    /// Called automatically on drop; call it directly to observe errors.
    pub async fn release(mut self) -> Result<(), CoordinationError> {
        self.released = true;
        if self.gateway.lock_release(&self.key, &self.holder_id, self.fencing_token.value()).await? {
            debug!(key = %self.key, fencing_token = self.fencing_token.value(), "lock released");
        } else {
            warn!(
                key = %self.key,
                fencing_token = self.fencing_token.value(),
                "lock release failed: already expired or taken"
            );
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Best-effort release - the lock expires via TTL anyway.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let gateway = self.gateway.clone();
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder_id);
        let token = self.fencing_token.value();

        runtime.spawn(async move {
            match gateway.lock_release(&key, &holder, token).await {
                Ok(_) => debug!(key = %key, fencing_token = token, "lock released on drop"),
                Err(e) => debug!(key = %key, error = %e, "lock release on drop failed (will expire via TTL)"),
            }
        });
    }
}
