//! Background refresh loop driving either cache variant.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

/// A cache state the refresh loop can renew.
pub(crate) trait Refresh: Send + Sync + 'static {
    /// Starts one refresh round on `tasks`. Must not wait for the retrievals
    /// themselves; failures are handled inside the spawned tasks.
    fn refresh(self: Arc<Self>, tasks: &mut JoinSet<()>);
}

/// Owns the refresh loop of one cache. Dropping it stops the loop.
#[derive(Debug)]
pub(crate) struct RefreshTask {
    interval: Duration,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    /// Starts the loop on the current Tokio runtime.
    pub(crate) fn spawn<R: Refresh>(interval: Duration, target: Arc<R>) -> Result<Self, ConfigError> {
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let token = CancellationToken::new();
        let handle = runtime.spawn(run(interval, token.clone(), target));

        Ok(Self {
            interval,
            token,
            handle,
        })
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    /// Signals the loop to stop. Calling it again has no effect.
    pub(crate) fn stop(&self) {
        self.token.cancel();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Ticks every `interval` until cancelled. Refreshes started by a tick run on
/// their own and are aborted when the loop stops.
async fn run<R: Refresh>(interval: Duration, token: CancellationToken, target: Arc<R>) {
    tracing::debug!(?interval, "refresh loop started");
    let mut tasks = JoinSet::new();

    'ticks: loop {
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = token.cancelled() => break 'ticks,
                () = &mut sleep => break,
                Some(finished) = tasks.join_next() => {
                    if let Err(error) = finished {
                        tracing::warn!(%error, "refresh task did not complete");
                    }
                }
            }
        }

        target.clone().refresh(&mut tasks);
    }

    tasks.shutdown().await;
    tracing::debug!("refresh loop stopped");
}

/// Set of keys with a background refresh in flight.
#[derive(Debug)]
pub(crate) struct InFlight<K> {
    keys: Arc<Mutex<HashSet<K>>>,
}

impl<K: Hash + Eq + Clone> InFlight<K> {
    pub(crate) fn new() -> Self {
        Self {
            keys: Arc::default(),
        }
    }

    /// Marks `key` as refreshing. Returns `None` if it already is.
    pub(crate) fn claim(&self, key: &K) -> Option<InFlightGuard<K>> {
        if !self.keys.lock().insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            keys: self.keys.clone(),
            key: key.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.keys.lock().len()
    }
}

/// Releases its key when dropped, including when the refresh is aborted.
#[derive(Debug)]
pub(crate) struct InFlightGuard<K: Hash + Eq> {
    keys: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K: Hash + Eq> Drop for InFlightGuard<K> {
    fn drop(&mut self) {
        self.keys.lock().remove(&self.key);
    }
}
