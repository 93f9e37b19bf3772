//! Single-flight async caches that keep serving the last good value while
//! refreshing it in the background.
//!
//! Two variants share the same rules:
//!
//! - [`ValueCache`] holds one value.
//! - [`KeyedCache`] holds one value per key, each with its own lifecycle.
//!
//! Concurrent requests for a missing value collapse into a single call of the
//! retrieval function. Once a retrieval succeeds its value is served to every
//! later caller, while a background task re-runs the retrieval every
//! refresh interval and swaps in the result when it succeeds. A failed
//! retrieval reaches every caller that waited on it and is then forgotten, so
//! the next caller tries again. A failed background refresh never reaches a
//! caller; it is logged, passed to the optional failure handler, and the
//! previous value stays in place.
//!
//! ```no_run
//! use std::time::Duration;
//! use refresh_cache::KeyedCache;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let cache = KeyedCache::builder()
//!     .refresh_interval(Duration::from_secs(300))
//!     .retrieve(|user_id: u32| async move {
//!         Ok::<_, std::io::Error>(format!("user {user_id}"))
//!     })
//!     .on_background_failure(|error| eprintln!("refresh failed: {error}"))
//!     .build()?;
//!
//! let name = cache.get(42).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Caches must be built inside a Tokio runtime, which hosts the refresh loop.
//! Dropping or [disposing](KeyedCache::dispose) a cache stops its loop.

pub mod config;
pub mod error;
pub mod keyed;
mod refresh;
mod slot;
pub mod value;

pub use config::{CacheConfig, FailureHandler};
pub use error::{BoxError, ConfigError, RetrievalError};
pub use keyed::{KeyedCache, KeyedCacheBuilder};
pub use value::{ValueCache, ValueCacheBuilder};
