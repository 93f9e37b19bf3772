use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::task::JoinSet;

use crate::config::CacheConfig;
use crate::error::{BoxError, ConfigError, RetrievalError};
use crate::refresh::{InFlight, Refresh, RefreshTask};
use crate::slot::Slot;

type Retrieve<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<V, BoxError>> + Send + Sync>;

/// Caches a single value, refreshing it in the background.
///
/// Concurrent callers of [`get_value`](ValueCache::get_value) share one
/// retrieval. A successful value keeps being served until a background refresh
/// replaces it; a failed retrieval is handed to everyone who waited on it and
/// then forgotten, so the next caller starts a new one.
pub struct ValueCache<V> {
    state: Arc<ValueState<V>>,
    task: RefreshTask,
}

struct ValueState<V> {
    slot: Mutex<Option<Slot<V>>>,
    retrieve: Retrieve<V>,
    config: CacheConfig,
    refreshing: InFlight<()>,
}

impl<V> ValueCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Starts configuring a cache.
    pub fn builder() -> ValueCacheBuilder<V> {
        ValueCacheBuilder {
            config: CacheConfig::default(),
            retrieve: None,
        }
    }

    /// Creates the cache and starts its refresh loop on the current Tokio runtime.
    pub fn new<F, Fut, E>(config: CacheConfig, retrieve: F) -> Result<Self, ConfigError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::builder().config(config).retrieve(retrieve).build()
    }

    /// Returns the cached value, joining or starting a retrieval when there is none.
    pub async fn get_value(&self) -> Result<V, RetrievalError> {
        let slot = {
            let mut current = self.state.slot.lock();
            current.get_or_insert_with(|| self.state.start()).clone()
        };

        let result = slot.wait().await;
        if let Err(error) = &result {
            let mut current = self.state.slot.lock();
            if current.as_ref().is_some_and(|installed| installed.same(&slot)) {
                tracing::debug!(%error, "retrieval failed, clearing cached value");
                *current = None;
            }
        }
        result
    }

    /// Returns the cached value if a retrieval has already succeeded, without
    /// starting one.
    pub fn cached(&self) -> Option<V> {
        let slot = self.state.slot.lock().clone()?;
        slot.peek()?.ok()
    }

    /// Interval between background refreshes.
    pub fn refresh_interval(&self) -> Duration {
        self.task.interval()
    }

    /// Stops the background refresh. Retrievals already handed to callers still complete.
    pub fn dispose(&self) {
        self.task.stop();
    }

    /// Whether [`dispose`](ValueCache::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.task.is_stopped()
    }
}

impl<V> ValueState<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn start(&self) -> Slot<V> {
        let retrieve = self.retrieve.clone();
        Slot::start(async move {
            tracing::debug!("retrieving value");
            retrieve().await.map_err(RetrievalError::new)
        })
    }
}

impl<V> Refresh for ValueState<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn refresh(self: Arc<Self>, tasks: &mut JoinSet<()>) {
        let Some(guard) = self.refreshing.claim(&()) else {
            tracing::trace!("previous refresh still running, skipping tick");
            return;
        };

        tasks.spawn(async move {
            let _guard = guard;
            let slot = self.start();
            let result = slot.wait().await;
            match result {
                Ok(_) => *self.slot.lock() = Some(slot),
                Err(error) => {
                    tracing::warn!(%error, "background refresh failed");
                    self.config.report(&error);
                }
            }
        });
    }
}

impl<V> fmt::Debug for ValueCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCache")
            .field("refresh_interval", &self.task.interval())
            .field("disposed", &self.task.is_stopped())
            .field("running", &!self.task.is_finished())
            .finish_non_exhaustive()
    }
}

/// Builds a [`ValueCache`].
pub struct ValueCacheBuilder<V> {
    config: CacheConfig,
    retrieve: Option<Retrieve<V>>,
}

impl<V> ValueCacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Replaces all settings with `config`.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets how often the value is refreshed in the background.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval = Some(interval);
        self
    }

    /// Sets the function producing the value. It is called by callers and by
    /// the refresh loop, possibly concurrently.
    pub fn retrieve<F, Fut, E>(mut self, retrieve: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.retrieve = Some(Arc::new(move || {
            retrieve().map(|result| result.map_err(Into::<BoxError>::into)).boxed()
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
    pub fn build(self) -> Result<ValueCache<V>, ConfigError> {
        let interval = self.config.validate()?;
        let retrieve = self.retrieve.ok_or(ConfigError::MissingRetrieval)?;

        let state = Arc::new(ValueState {
            slot: Mutex::new(None),
            retrieve,
            config: self.config,
            refreshing: InFlight::new(),
        });
        let task = RefreshTask::spawn(interval, state.clone())?;

        Ok(ValueCache { state, task })
    }
}

impl<V> fmt::Debug for ValueCacheBuilder<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCacheBuilder")
            .field("config", &self.config)
            .field("retrieve", &self.retrieve.as_ref().map(|_| ".."))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn() -> BoxFuture<'static, Result<String, BoxError>> + Send + Sync + 'static {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n.to_string()) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_missing_retrieval() {
        let result = ValueCache::<String>::builder()
            .refresh_interval(Duration::from_secs(60))
            .build();
        assert_eq!(result.unwrap_err(), ConfigError::MissingRetrieval);
    }

    #[tokio::test]
    async fn test_missing_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = ValueCache::builder().retrieve(counting(calls.clone())).build();
        assert_eq!(result.unwrap_err(), ConfigError::MissingRefreshInterval);
    }

    #[tokio::test]
    async fn test_cached_does_not_retrieve() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ValueCache::builder()
            .refresh_interval(Duration::from_secs(300))
            .retrieve(counting(calls.clone()))
            .build()
            .unwrap();

        assert_eq!(cache.cached(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(cache.get_value().await.unwrap(), "1");
        assert_eq!(cache.cached().as_deref(), Some("1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_slot_is_cleared() {
        let cache = ValueCache::<String>::builder()
            .refresh_interval(Duration::from_secs(300))
            .retrieve(|| async { Err::<String, _>("down") })
            .build()
            .unwrap();

        assert!(cache.get_value().await.is_err());
        assert!(cache.state.slot.lock().is_none());
        assert_eq!(cache.cached(), None);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ValueCache::new(
            CacheConfig::new().with_refresh_interval(Duration::from_secs(1)),
            counting(calls.clone()),
        )
        .unwrap();

        assert!(!cache.is_disposed());
        cache.dispose();
        cache.dispose();
        assert!(cache.is_disposed());
        assert_eq!(cache.refresh_interval(), Duration::from_secs(1));

        // disposal only stops the refresh loop
        assert_eq!(cache.get_value().await.unwrap(), "1");
    }
}
