//! The single-flight unit shared by both cache variants.

use std::fmt;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::RetrievalError;

type Handle<V> = Shared<BoxFuture<'static, Result<V, RetrievalError>>>;

/// One retrieval attempt, in flight or completed, shared by every caller that
/// observed it.
///
/// A slot knows nothing about what should happen when its attempt fails; the
/// caller and the refresh loop each apply their own policy.
pub(crate) struct Slot<V> {
    handle: Handle<V>,
}

impl<V> Clone for Slot<V> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<V> Slot<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Wraps a retrieval. Nothing runs until the slot is first awaited.
    pub(crate) fn start<F>(retrieval: F) -> Self
    where
        F: Future<Output = Result<V, RetrievalError>> + Send + 'static,
    {
        Self {
            handle: retrieval.boxed().shared(),
        }
    }

    /// Joins the attempt and returns its outcome.
    pub(crate) async fn wait(&self) -> Result<V, RetrievalError> {
        self.handle.clone().await
    }

    /// Returns `true` if both slots share the same attempt.
    pub(crate) fn same(&self, other: &Self) -> bool {
        self.handle.ptr_eq(&other.handle)
    }

    /// The outcome, if the attempt has completed.
    pub(crate) fn peek(&self) -> Option<Result<V, RetrievalError>> {
        self.handle.peek().cloned()
    }
}

impl<V> fmt::Debug for Slot<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").finish_non_exhaustive()
    }
}
