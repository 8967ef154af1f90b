//! Long-poll watches and their handles.
//!
//! A watch is a background task that repeatedly issues blocking queries
//! against the gateway and forwards each observed change to the caller
//! through a bounded channel. Callers own a [`Watch`] (to receive) and may
//! hand out clones of its [`WatchHandle`] (to cancel).
//!
//! # State machine
//!
//! ```text
//! Idle --start--> Watching --change--> Watching
//!                 Watching --error---> Failed   (terminal)
//!                 Watching --cancel--> Ended    (terminal)
//! ```
//!
//! Any other transition is refused. Once a watch is cancelled no further
//! items are delivered, including ones already buffered.

pub mod services;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::WatchConfig;
use crate::error::CoordinationError;
use crate::gateway::BackendGateway;
use crate::gateway::QueryResponse;
use crate::gateway::WatchQuery;

pub use services::ServiceSnapshot;
pub use services::ServiceWatch;

/// Lifecycle of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Constructed, not yet issuing queries.
    Idle,
    /// Issuing blocking queries and delivering changes.
    Watching,
    /// The backend reported an error. Terminal.
    Failed,
    /// Cancelled by the caller. Terminal.
    Ended,
}

impl WatchState {
    /// Whether `self -> next` is one of the permitted transitions.
    pub fn can_transition_to(self, next: WatchState) -> bool {
        matches!(
            (self, next),
            (WatchState::Idle, WatchState::Watching)
                | (WatchState::Watching, WatchState::Watching)
                | (WatchState::Watching, WatchState::Failed)
                | (WatchState::Watching, WatchState::Ended)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WatchState::Failed | WatchState::Ended)
    }
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatchState::Idle => "idle",
            WatchState::Watching => "watching",
            WatchState::Failed => "failed",
            WatchState::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Per-watch tuning, derived from [`WatchConfig`].
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Long-poll wait passed to every blocking query.
    pub wait: Duration,
    /// Capacity of the delivery channel.
    pub channel_capacity: usize,
}

impl From<&WatchConfig> for WatchOptions {
    fn from(config: &WatchConfig) -> Self {
        Self {
            wait: Duration::from_millis(config.wait_ms),
            channel_capacity: config.channel_capacity,
        }
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

struct HandleInner {
    state: Mutex<WatchState>,
    token: CancellationToken,
    resource: String,
}

/// Cloneable cancel handle for a running watch.
#[derive(Clone)]
pub struct WatchHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("resource", &self.inner.resource)
            .field("state", &self.state())
            .finish()
    }
}

impl WatchHandle {
    fn new(resource: String) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                state: Mutex::new(WatchState::Idle),
                token: CancellationToken::new(),
                resource,
            }),
        }
    }

    /// Apply `next` if permitted. Returns whether the state changed hands.
    fn transition(&self, next: WatchState) -> bool {
        let mut state = self.inner.state.lock();
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WatchState {
        *self.inner.state.lock()
    }

    /// True while the watch is delivering changes.
    pub fn is_active(&self) -> bool {
        self.state() == WatchState::Watching
    }

    /// Resource this watch observes, for diagnostics.
    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Stop the watch. Idempotent: later calls are no-ops.
    pub fn cancel(&self) {
        if self.transition(WatchState::Ended) {
            info!(resource = %self.inner.resource, "watch ended");
        }
        self.inner.token.cancel();
    }

    fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}

/// Receiving side of a watch.
///
/// Dropping a `Watch` cancels it.
pub struct Watch<T> {
    handle: WatchHandle,
    rx: mpsc::Receiver<Result<T, CoordinationError>>,
}

impl<T> fmt::Debug for Watch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch").field("handle", &self.handle).finish()
    }
}

impl<T> Watch<T> {
    /// Next change, or the watch's failure.
    ///
    /// Returns `None` once the watch has been cancelled, or after a failure
    /// has been delivered.
    pub async fn next(&mut self) -> Option<Result<T, CoordinationError>> {
        if self.handle.state() == WatchState::Ended {
            return None;
        }
        let item = tokio::select! {
            biased;
            _ = self.handle.token().cancelled() => return None,
            item = self.rx.recv() => item,
        };
        // A cancel that raced the receive still wins.
        if self.handle.state() == WatchState::Ended {
            return None;
        }
        item
    }

    /// A cloneable handle that can cancel this watch from elsewhere.
    pub fn handle(&self) -> WatchHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> WatchState {
        self.handle.state()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    /// Stop the watch. Idempotent.
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl<T> Drop for Watch<T> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

/// Decide whether a blocking-query response is a change worth delivering.
///
/// Returns the index to use for the next query, or `None` when the index did
/// not move (the long-poll simply timed out).
fn advance_index(previous: u64, returned: u64) -> Option<u64> {
    // Never block on index 0: it would return immediately forever.
    let returned = returned.max(1);
    if previous == 0 {
        return Some(returned);
    }
    if returned == previous {
        return None;
    }
    if returned < previous {
        warn!(previous, returned, "watch index went backwards, resetting");
    }
    Some(returned)
}

/// Start a watch on `query`, mapping every change through `on_change`.
///
/// `on_change` may itself call the gateway (re-aggregation); its failure is
/// escalated like a gateway failure and ends the watch in `Failed`.
pub(crate) fn spawn_watch<T, F, Fut>(
    gateway: Arc<dyn BackendGateway>,
    query: WatchQuery,
    options: WatchOptions,
    on_change: F,
) -> Result<Watch<T>, CoordinationError>
where
    T: Send + 'static,
    F: FnMut(QueryResponse) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, CoordinationError>> + Send + 'static,
{
    let handle = WatchHandle::new(query.to_string());
    start_watch(handle, gateway, query, options, on_change)
}

/// Move an idle `handle` to `Watching` and spawn its query loop on the
/// current tokio runtime.
///
/// A handle cancelled while still idle never starts; the returned watch
/// yields nothing. Without a runtime the handle stays `Idle` and
/// `InvalidArgument` is returned.
fn start_watch<T, F, Fut>(
    handle: WatchHandle,
    gateway: Arc<dyn BackendGateway>,
    query: WatchQuery,
    options: WatchOptions,
    on_change: F,
) -> Result<Watch<T>, CoordinationError>
where
    T: Send + 'static,
    F: FnMut(QueryResponse) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, CoordinationError>> + Send + 'static,
{
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return Err(CoordinationError::InvalidArgument {
            reason: format!("watch on {query} needs a running tokio runtime"),
        });
    };
    let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
    if handle.token().is_cancelled() || !handle.transition(WatchState::Watching) {
        debug!(resource = %query, state = %handle.state(), "watch not started");
        return Ok(Watch { handle, rx });
    }
    info!(resource = %query, wait_ms = options.wait.as_millis() as u64, "watch started");

    runtime.spawn(run_watch(gateway, query, options.wait, handle.clone(), tx, on_change));

    Ok(Watch { handle, rx })
}

/// Start a watch delivering raw blocking-query responses.
///
/// Must be called from within a tokio runtime.
pub fn watch_raw(
    gateway: Arc<dyn BackendGateway>,
    query: WatchQuery,
    options: WatchOptions,
) -> Result<Watch<QueryResponse>, CoordinationError> {
    spawn_watch(gateway, query, options, |response| async move { Ok::<_, CoordinationError>(response) })
}

async fn run_watch<T, F, Fut>(
    gateway: Arc<dyn BackendGateway>,
    query: WatchQuery,
    wait: Duration,
    handle: WatchHandle,
    tx: mpsc::Sender<Result<T, CoordinationError>>,
    mut on_change: F,
) where
    F: FnMut(QueryResponse) -> Fut,
    Fut: Future<Output = Result<T, CoordinationError>>,
{
    let token = handle.token().clone();
    let mut index = 0u64;

    loop {
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            response = gateway.blocking_query(&query, index, wait) => response,
        };

        let item = match response {
            Ok(response) => {
                let Some(next_index) = advance_index(index, response.index) else {
                    debug!(resource = %query, index, "long-poll returned without change");
                    continue;
                };
                index = next_index;
                debug!(resource = %query, index, "change observed");

                let mapped = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    mapped = on_change(response) => mapped,
                };
                mapped.map_err(|e| CoordinationError::WatchFailed {
                    reason: format!("{query}: {e}"),
                })
            }
            Err(e) => Err(CoordinationError::WatchFailed {
                reason: format!("{query}: {e}"),
            }),
        };

        let failed = item.is_err();
        if failed {
            if !handle.transition(WatchState::Failed) {
                // Cancelled concurrently; nothing to escalate to.
                return;
            }
            if let Err(e) = &item {
                warn!(resource = %query, error = %e, "watch failed");
            }
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            sent = tx.send(item) => {
                if sent.is_err() {
                    return;
                }
            }
        }

        if failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::DeterministicBackend;
    use crate::gateway::WatchPayload;

    fn options() -> WatchOptions {
        WatchOptions {
            wait: Duration::from_secs(30),
            channel_capacity: 4,
        }
    }

    #[test]
    fn test_valid_transitions() {
        use WatchState::*;
        assert!(Idle.can_transition_to(Watching));
        assert!(Watching.can_transition_to(Watching));
        assert!(Watching.can_transition_to(Failed));
        assert!(Watching.can_transition_to(Ended));

        assert!(!Idle.can_transition_to(Ended));
        assert!(!Idle.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Watching));
        assert!(!Failed.can_transition_to(Ended));
        assert!(!Ended.can_transition_to(Watching));
        assert!(!Ended.can_transition_to(Failed));
    }

    #[test]
    fn test_advance_index() {
        assert_eq!(advance_index(0, 7), Some(7));
        assert_eq!(advance_index(0, 0), Some(1));
        assert_eq!(advance_index(1, 0), None);
        assert_eq!(advance_index(7, 7), None);
        assert_eq!(advance_index(7, 9), Some(9));
        // Backend state reset: deliver and follow the new index.
        assert_eq!(advance_index(9, 3), Some(3));
    }

    #[test]
    fn test_handle_cancel_idempotent() {
        let handle = WatchHandle::new("kv:x".to_string());
        assert!(handle.transition(WatchState::Watching));
        assert!(handle.is_active());

        handle.cancel();
        handle.cancel();
        assert_eq!(handle.state(), WatchState::Ended);
        assert!(!handle.is_active());
    }

    #[test]
    fn test_cancel_after_failure_keeps_failed() {
        let handle = WatchHandle::new("kv:x".to_string());
        handle.transition(WatchState::Watching);
        assert!(handle.transition(WatchState::Failed));

        handle.cancel();
        assert_eq!(handle.state(), WatchState::Failed);
    }

    #[tokio::test]
    async fn test_raw_watch_delivers_initial_and_changes() {
        let backend = DeterministicBackend::new();
        backend.set_key("cfg/a", b"1".to_vec(), None).await.unwrap();

        let mut watch = watch_raw(
            backend.clone(),
            WatchQuery::KeyPrefix {
                prefix: "cfg/".to_string(),
            },
            options(),
        )
        .unwrap();

        let first = watch.next().await.unwrap().unwrap();
        assert!(matches!(&first.payload, WatchPayload::Keys(keys) if keys.len() == 1));

        backend.set_key("cfg/b", b"2".to_vec(), None).await.unwrap();
        let second = watch.next().await.unwrap().unwrap();
        assert!(second.index > first.index);
        assert!(matches!(&second.payload, WatchPayload::Keys(keys) if keys.len() == 2));
    }

    #[tokio::test]
    async fn test_raw_watch_escalates_error() {
        let backend = DeterministicBackend::new();
        backend.set_unavailable("connection reset");

        let mut watch = watch_raw(backend.clone(), WatchQuery::CatalogServices, options()).unwrap();
        let item = watch.next().await.unwrap();
        assert!(matches!(item, Err(CoordinationError::WatchFailed { .. })));
        assert_eq!(watch.state(), WatchState::Failed);
        assert!(watch.next().await.is_none());
    }

    #[test]
    fn test_watch_outside_runtime_is_refused() {
        let backend = DeterministicBackend::new();
        let err = watch_raw(backend, WatchQuery::CatalogServices, options()).unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_raw_watch_cancel_stops_delivery() {
        let backend = DeterministicBackend::new();
        let mut watch = watch_raw(backend.clone(), WatchQuery::CatalogServices, options()).unwrap();
        watch.next().await.unwrap().unwrap();

        watch.cancel();
        backend.add_node("n1");
        assert!(watch.next().await.is_none());
        assert_eq!(watch.state(), WatchState::Ended);
    }
}
