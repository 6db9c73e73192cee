//! Storage layer for Basalt
//!
//! All backends are byte-bounded LRU maps. [`SimpleLru`] is the single-threaded
//! core; [`ThreadSafeLru`] and [`StripedLru`] are the shareable backends the
//! server runs on.

mod lru;
mod striped;

use crate::config::StorageConfig;
use crate::error::StorageError;
use bytes::Bytes;
use std::sync::Arc;

pub use lru::SimpleLru;
pub use striped::{MIN_STRIPE_SIZE, StripedLru, ThreadSafeLru};

/// Key-value map shared by every connection and worker thread
pub trait Storage: Send + Sync {
    /// Insert or overwrite `key`
    fn put(&self, key: &[u8], value: &[u8]) -> bool;

    /// Insert `key` only if it is not present
    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> bool;

    /// Overwrite `key` only if it is present
    fn set(&self, key: &[u8], value: &[u8]) -> bool;

    /// Remove `key`, returning whether it was present
    fn delete(&self, key: &[u8]) -> bool;

    /// Fetch the value stored under `key`
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Replace the value of an existing `key` with `f(current)` as one step:
    /// no other operation on `key` runs between the read and the write.
    ///
    /// Returns `None` when `key` is absent, `Some(false)` when `f` declines
    /// (returns `None`) or the new value cannot fit, `Some(true)` once stored.
    fn update(&self, key: &[u8], f: &mut dyn FnMut(&[u8]) -> Option<Vec<u8>>) -> Option<bool>;
}

/// Build the storage backend described by `config`
pub fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    if config.stripes <= 1 {
        Ok(Arc::new(ThreadSafeLru::new(config.max_size)))
    } else {
        Ok(Arc::new(StripedLru::new(config.max_size, config.stripes)?))
    }
}
