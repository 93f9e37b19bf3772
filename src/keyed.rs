use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt};
use tokio::task::JoinSet;

use crate::config::CacheConfig;
use crate::error::{BoxError, ConfigError, RetrievalError};
use crate::refresh::{InFlight, Refresh, RefreshTask};
use crate::slot::Slot;

type Retrieve<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, BoxError>> + Send + Sync>;
type Slots<K, V> = HashMap<K, Slot<V>>;

/// Caches one value per key, each refreshed in the background independently.
///
/// Every key follows the rules of [`ValueCache`](crate::ValueCache): concurrent
/// callers for one key share a retrieval, successful values are served until a
/// refresh replaces them, failed retrievals are forgotten. Keys never wait on
/// each other. The mapping is an immutable snapshot replaced by
/// compare-and-swap, so reads take no lock.
///
/// Keys stay known for the lifetime of the cache once a retrieval for them
/// succeeded; the refresh loop renews all of them on every tick. A key whose
/// previous refresh is still running is skipped until it finishes.
pub struct KeyedCache<K, V> {
    state: Arc<KeyedState<K, V>>,
    task: RefreshTask,
}

struct KeyedState<K, V> {
    slots: ArcSwap<Slots<K, V>>,
    retrieve: Retrieve<K, V>,
    config: CacheConfig,
    refreshing: InFlight<K>,
}

impl<K, V> KeyedCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Starts configuring a cache.
    pub fn builder() -> KeyedCacheBuilder<K, V> {
        KeyedCacheBuilder {
            config: CacheConfig::default(),
            retrieve: None,
        }
    }

    /// Creates the cache and starts its refresh loop on the current Tokio runtime.
    pub fn new<F, Fut, E>(config: CacheConfig, retrieve: F) -> Result<Self, ConfigError>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::builder().config(config).retrieve(retrieve).build()
    }

    /// Returns the cached value for `key`, joining or starting a retrieval when
    /// there is none.
    pub async fn get(&self, key: K) -> Result<V, RetrievalError> {
        let slot = self.state.get_or_start(&key);

        let result = slot.wait().await;
        if let Err(error) = &result {
            if self.state.remove_if_same(&key, &slot) {
                tracing::debug!(?key, %error, "retrieval failed, clearing cached value");
            }
        }
        result
    }

    /// Returns the value for `key` if a retrieval has already succeeded,
    /// without starting one.
    pub fn cached(&self, key: &K) -> Option<V> {
        let slot = self.state.slots.load().get(key).cloned()?;
        slot.peek()?.ok()
    }

    /// Whether `key` currently holds a retrieval, pending or done.
    pub fn contains_key(&self, key: &K) -> bool {
        self.state.slots.load().contains_key(key)
    }

    /// Snapshot of the keys currently holding a retrieval.
    pub fn keys(&self) -> Vec<K> {
        self.state.slots.load().keys().cloned().collect()
    }

    /// Number of keys currently holding a retrieval.
    pub fn len(&self) -> usize {
        self.state.slots.load().len()
    }

    /// Whether no key holds a retrieval.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interval between background refreshes.
    pub fn refresh_interval(&self) -> Duration {
        self.task.interval()
    }

    /// Stops the background refresh. Retrievals already handed to callers still complete.
    pub fn dispose(&self) {
        self.task.stop();
    }

    /// Whether [`dispose`](KeyedCache::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.task.is_stopped()
    }
}

impl<K, V> KeyedState<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn start(&self, key: &K) -> Slot<V> {
        let retrieve = self.retrieve.clone();
        let key = key.clone();
        Slot::start(async move {
            tracing::debug!(?key, "retrieving value");
            retrieve(key).await.map_err(RetrievalError::new)
        })
    }

    /// Returns the slot for `key`, installing a new one if there is none.
    ///
    /// A slot losing the race to a concurrent writer is dropped before it was
    /// ever polled, so its retrieval never runs.
    fn get_or_start(&self, key: &K) -> Slot<V> {
        loop {
            let current = self.slots.load_full();
            if let Some(slot) = current.get(key) {
                return slot.clone();
            }

            let slot = self.start(key);
            let mut next = (*current).clone();
            next.insert(key.clone(), slot.clone());

            if self.swap(&current, next) {
                return slot;
            }
            tracing::trace!(?key, "slots changed concurrently, retrying insert");
        }
    }

    /// Removes `key` if it still holds `failed`. Returns whether it did.
    fn remove_if_same(&self, key: &K, failed: &Slot<V>) -> bool {
        loop {
            let current = self.slots.load_full();
            match current.get(key) {
                Some(installed) if installed.same(failed) => {}
                _ => return false,
            }

            let mut next = (*current).clone();
            next.remove(key);

            if self.swap(&current, next) {
                return true;
            }
            tracing::trace!(?key, "slots changed concurrently, retrying removal");
        }
    }

    /// Installs `slot` for `key`, whatever was there before.
    fn install(&self, key: &K, slot: Slot<V>) {
        loop {
            let current = self.slots.load_full();
            let mut next = (*current).clone();
            next.insert(key.clone(), slot.clone());

            if self.swap(&current, next) {
                return;
            }
            tracing::trace!(?key, "slots changed concurrently, retrying install");
        }
    }

    /// Replaces the snapshot with `next` unless another writer got there first.
    fn swap(&self, current: &Arc<Slots<K, V>>, next: Slots<K, V>) -> bool {
        let previous = self.slots.compare_and_swap(current, Arc::new(next));
        Arc::ptr_eq(&*previous, current)
    }

    async fn refresh_key(&self, key: K) {
        let slot = self.start(&key);
        let result = slot.wait().await;
        match result {
            Ok(_) => self.install(&key, slot),
            Err(error) => {
                tracing::warn!(?key, %error, "background refresh failed");
                self.config.report(&error);
            }
        }
    }
}

impl<K, V> Refresh for KeyedState<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn refresh(self: Arc<Self>, tasks: &mut JoinSet<()>) {
        let keys: Vec<K> = self.slots.load().keys().cloned().collect();
        let mut started = 0;

        for key in keys {
            let Some(guard) = self.refreshing.claim(&key) else {
                tracing::trace!(?key, "previous refresh still running, skipping key");
                continue;
            };

            let state = self.clone();
            tasks.spawn(async move {
                let _guard = guard;
                state.refresh_key(key).await;
            });
            started += 1;
        }

        if started > 0 {
            tracing::debug!(keys = started, "refreshing cached values");
        }
    }
}

impl<K, V> fmt::Debug for KeyedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCache")
            .field("keys", &self.state.slots.load().len())
            .field("refresh_interval", &self.task.interval())
            .field("disposed", &self.task.is_stopped())
            .field("running", &!self.task.is_finished())
            .finish_non_exhaustive()
    }
}

/// Builds a [`KeyedCache`].
pub struct KeyedCacheBuilder<K, V> {
    config: CacheConfig,
    retrieve: Option<Retrieve<K, V>>,
}

impl<K, V> KeyedCacheBuilder<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Replaces all settings with `config`.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets how often every known key is refreshed in the background.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval = Some(interval);
        self
    }

    /// Sets the function producing the value for a key. It is called by
    /// callers and by the refresh loop, possibly concurrently for the same key.
    pub fn retrieve<F, Fut, E>(mut self, retrieve: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.retrieve = Some(Arc::new(move |key: K| {
            retrieve(key).map(|result| result.map_err(Into::<BoxError>::into)).boxed()
        }));
        self
    }

    /// Sets the handler called when a background refresh fails.
    pub fn on_background_failure<H>(mut self, handler: H) -> Self
    where
        H: Fn(&RetrievalError) + Send + Sync + 'static,
    {
        self.config = self.config.on_background_failure(handler);
        self
    }

    /// Validates the settings and starts the refresh loop.
    pub fn build(self) -> Result<KeyedCache<K, V>, ConfigError> {
        let interval = self.config.validate()?;
        let retrieve = self.retrieve.ok_or(ConfigError::MissingRetrieval)?;

        let state = Arc::new(KeyedState {
            slots: ArcSwap::from_pointee(HashMap::new()),
            retrieve,
            config: self.config,
            refreshing: InFlight::new(),
        });
        let task = RefreshTask::spawn(interval, state.clone())?;

        Ok(KeyedCache { state, task })
    }
}

impl<K, V> fmt::Debug for KeyedCacheBuilder<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCacheBuilder")
            .field("config", &self.config)
            .field("retrieve", &self.retrieve.as_ref().map(|_| ".."))
            .finish()
    }
}
