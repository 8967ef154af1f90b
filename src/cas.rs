//! Compare-and-swap read-modify-write over the gateway.
//!
//! A write is guarded by the modify index observed at read time, so it only
//! lands if nobody else wrote the key in between. The guard is the only
//! concurrency-safety mechanism: there is no internal retry and no local lock.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tracing::debug;

use crate::constants::CAS_INDEX_ABSENT;
use crate::error::CoordinationError;
use crate::error::SerializationSnafu;
use crate::gateway::BackendGateway;
use crate::types::KeyEntry;

/// Safe read-modify-write on single keys.
#[derive(Clone)]
pub struct CasMutator {
    gateway: Arc<dyn BackendGateway>,
}

impl CasMutator {
    pub fn new(gateway: Arc<dyn BackendGateway>) -> Self {
        Self { gateway }
    }

    /// Read `key`, compute a new value, write it guarded by the read's index.
    ///
    /// `mutate` receives the current entry (`None` if the key is absent) and
    /// returns the value to write, or `None` to abort without writing.
    /// Returns whether the backend accepted the write; a concurrent writer
    /// makes this `Ok(false)`, never an error.
    pub async fn get_then_set<F>(&self, key: &str, mutate: F) -> Result<bool, CoordinationError>
    where
        F: FnOnce(Option<&KeyEntry>) -> Option<Vec<u8>>,
    {
        let ticket = self.begin(key).await?;
        let Some(value) = mutate(ticket.current()) else {
            debug!(key, "cas aborted by caller");
            return Ok(false);
        };
        ticket.commit(value).await
    }

    /// [`Self::get_then_set`] over a JSON-encoded value.
    pub async fn get_then_set_json<T, F>(&self, key: &str, mutate: F) -> Result<bool, CoordinationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Option<T>,
    {
        let ticket = self.begin(key).await?;
        let current = match ticket.current() {
            Some(entry) => Some(serde_json::from_slice(&entry.value).context(SerializationSnafu { key })?),
            None => None,
        };
        let Some(next) = mutate(current) else {
            debug!(key, "cas aborted by caller");
            return Ok(false);
        };
        let value = serde_json::to_vec(&next).context(SerializationSnafu { key })?;
        ticket.commit(value).await
    }

    /// First half of a read-modify-write: read `key` and capture its index.
    ///
    /// The caller can inspect the value for as long as it likes, then
    /// [`CasTicket::commit`]. Any write to the key in between makes the
    /// commit fail.
    pub async fn begin(&self, key: &str) -> Result<CasTicket, CoordinationError> {
        let current = self.gateway.get_key(key).await?;
        debug!(
            key,
            modify_index = current.as_ref().map_or(CAS_INDEX_ABSENT, |e| e.modify_index),
            "cas read"
        );
        Ok(CasTicket {
            gateway: self.gateway.clone(),
            key: key.to_string(),
            current,
        })
    }

    /// Unconditional write.
    pub async fn set_key(&self, key: &str, value: Vec<u8>) -> Result<(), CoordinationError> {
        self.gateway.set_key(key, value, None).await?;
        debug!(key, "unconditional write");
        Ok(())
    }
}

/// A read captured by [`CasMutator::begin`], waiting to be committed.
pub struct CasTicket {
    gateway: Arc<dyn BackendGateway>,
    key: String,
    current: Option<KeyEntry>,
}

impl std::fmt::Debug for CasTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CasTicket")
            .field("key", &self.key)
            .field("modify_index", &self.modify_index())
            .finish()
    }
}

impl CasTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The entry as read, `None` if the key did not exist.
    pub fn current(&self) -> Option<&KeyEntry> {
        self.current.as_ref()
    }

    /// Index the commit is guarded by. `0` means "only if still absent".
    pub fn modify_index(&self) -> u64 {
        self.current.as_ref().map_or(CAS_INDEX_ABSENT, |entry| entry.modify_index)
    }

    /// Write `value` if the key is unchanged since the read.
    pub async fn commit(self, value: Vec<u8>) -> Result<bool, CoordinationError> {
        let expected = self.modify_index();
        let accepted = self.gateway.set_key(&self.key, value, Some(expected)).await?;
        if accepted {
            debug!(key = %self.key, expected_index = expected, "cas write accepted");
        } else {
            debug!(key = %self.key, expected_index = expected, "cas write rejected: index moved");
        }
        Ok(accepted)
    }

    /// Like [`Self::commit`], but a rejected write is a `CasConflict` error.
    pub async fn commit_strict(self, value: Vec<u8>) -> Result<(), CoordinationError> {
        let key = self.key.clone();
        let expected_index = self.modify_index();
        if self.commit(value).await? {
            Ok(())
        } else {
            Err(CoordinationError::CasConflict { key, expected_index })
        }
    }
}
