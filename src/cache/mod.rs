//! Caching of classification decisions.

mod classification;

pub use classification::{CacheStats, CachedClassifier, DEFAULT_CAPACITY, MAX_LOGGED_HOSTS};
