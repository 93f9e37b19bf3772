use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// The error type retrieval functions may fail with.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// A cache could not be constructed from the given configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("refresh interval is not configured")]
    MissingRefreshInterval,
    #[error("refresh interval must be greater than zero")]
    ZeroRefreshInterval,
    #[error("retrieval function is not configured")]
    MissingRetrieval,
    #[error("cache must be constructed within a Tokio runtime")]
    NoRuntime,
}

/// A retrieval attempt failed.
///
/// Every caller that joined the same attempt receives a clone of the same
/// error, so [`RetrievalError::same_failure`] holds between them.
#[derive(Clone, thiserror::Error)]
#[error("retrieval failed: {source}")]
pub struct RetrievalError {
    #[source]
    source: Arc<dyn Error + Send + Sync>,
}

impl RetrievalError {
    pub(crate) fn new(source: BoxError) -> Self {
        Self {
            source: Arc::from(source),
        }
    }

    /// Returns `true` if both errors stem from the same failed attempt.
    pub fn same_failure(&self, other: &RetrievalError) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
    }

    /// Returns the upstream error as a concrete type, if it is one.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.source.downcast_ref::<E>()
    }
}

impl fmt::Debug for RetrievalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetrievalError").field(&self.source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[derive(Debug, thiserror::Error)]
    #[error("upstream unavailable")]
    struct Unavailable;

    #[test]
    fn test_clones_share_failure() {
        let error = RetrievalError::new(Box::new(Unavailable));
        let clone = error.clone();
        let other = RetrievalError::new(Box::new(Unavailable));

        assert!(error.same_failure(&clone));
        assert!(!error.same_failure(&other));
    }

    #[test]
    fn test_source_is_upstream_error() {
        let error = RetrievalError::new(Box::new(Unavailable));

        assert_eq!(error.to_string(), "retrieval failed: upstream unavailable");
        assert!(error.downcast_ref::<Unavailable>().is_some());
        assert_eq!(
            error.source().map(|source| source.to_string()),
            Some("upstream unavailable".to_owned())
        );
    }

    #[test]
    fn test_string_errors_are_accepted() {
        let error = RetrievalError::new("boom".into());
        assert_eq!(error.to_string(), "retrieval failed: boom");
    }
}
