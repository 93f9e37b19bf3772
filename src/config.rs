use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, RetrievalError};

/// Callback invoked with the error of every failed background refresh.
pub type FailureHandler = Arc<dyn Fn(&RetrievalError) + Send + Sync>;

/// Construction-time settings shared by [`ValueCache`](crate::ValueCache) and
/// [`KeyedCache`](crate::KeyedCache).
///
/// Can be embedded in an application config file:
///
/// ```
/// # use refresh_cache::CacheConfig;
/// let config: CacheConfig = serde_json::from_str(r#"{ "refresh_interval": "5m" }"#).unwrap();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time between background refresh attempts. Required, and must not be zero.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Option<Duration>,

    /// Receives background refresh failures. Without it they are only logged.
    #[serde(skip)]
    pub on_background_failure: Option<FailureHandler>,
}

impl CacheConfig {
    /// Empty settings. A refresh interval must still be set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the time between background refresh attempts.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Sets the handler receiving background refresh failures.
    pub fn on_background_failure<H>(mut self, handler: H) -> Self
    where
        H: Fn(&RetrievalError) + Send + Sync + 'static,
    {
        self.on_background_failure = Some(Arc::new(handler));
        self
    }

    /// Checks the refresh interval and returns it.
    pub fn validate(&self) -> Result<Duration, ConfigError> {
        match self.refresh_interval {
            None => Err(ConfigError::MissingRefreshInterval),
            Some(interval) if interval.is_zero() => Err(ConfigError::ZeroRefreshInterval),
            Some(interval) => Ok(interval),
        }
    }

    pub(crate) fn report(&self, error: &RetrievalError) {
        if let Some(handler) = &self.on_background_failure {
            handler(error);
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("refresh_interval", &self.refresh_interval)
            .field(
                "on_background_failure",
                &self.on_background_failure.as_ref().map(|_| ".."),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_missing_interval() {
        assert_eq!(
            CacheConfig::new().validate(),
            Err(ConfigError::MissingRefreshInterval)
        );
    }

    #[test]
    fn test_zero_interval() {
        let config = CacheConfig::new().with_refresh_interval(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroRefreshInterval));
    }

    #[test]
    fn test_valid_interval() {
        let config = CacheConfig::new().with_refresh_interval(Duration::from_secs(300));
        assert_eq!(config.validate(), Ok(Duration::from_secs(300)));
    }

    #[test]
    fn test_deserialize_humantime() {
        let config: CacheConfig =
            serde_json::from_str(r#"{ "refresh_interval": "250ms" }"#).unwrap();
        assert_eq!(config.refresh_interval, Some(Duration::from_millis(250)));
        assert!(config.on_background_failure.is_none());

        let config: CacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.validate(), Err(ConfigError::MissingRefreshInterval));
    }

    #[test]
    fn test_report_without_handler_is_noop() {
        let config = CacheConfig::new();
        config.report(&RetrievalError::new("boom".into()));
    }

    #[test]
    fn test_report_invokes_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let config = CacheConfig::new().on_background_failure(move |error| {
            assert_eq!(error.to_string(), "retrieval failed: boom");
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        config.report(&RetrievalError::new("boom".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
