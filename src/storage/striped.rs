//! Thread-safe LRU backends

use super::{SimpleLru, Storage};
use crate::error::StorageError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::hash::{BuildHasher, RandomState};

/// Smallest byte budget a single stripe may have
pub const MIN_STRIPE_SIZE: usize = 1024 * 1024;

/// [`SimpleLru`] behind a single mutex
#[derive(Debug)]
pub struct ThreadSafeLru {
    inner: Mutex<SimpleLru>,
}

impl ThreadSafeLru {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(SimpleLru::new(max_size)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Storage for ThreadSafeLru {
    fn put(&self, key: &[u8], value: &[u8]) -> bool {
        self.inner.lock().put(key, value)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> bool {
        self.inner.lock().put_if_absent(key, value)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> bool {
        self.inner.lock().set(key, value)
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.inner.lock().delete(key)
    }

    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.inner.lock().get(key)
    }

    fn update(&self, key: &[u8], f: &mut dyn FnMut(&[u8]) -> Option<Vec<u8>>) -> Option<bool> {
        self.inner.lock().update_with(key, f)
    }
}

/// Keys spread by hash over independently locked LRU stripes
#[derive(Debug)]
pub struct StripedLru {
    stripes: Vec<ThreadSafeLru>,
    hasher: RandomState,
}

impl StripedLru {
    /// Split `max_size` bytes evenly over `stripes` stripes
    pub fn new(max_size: usize, stripes: usize) -> Result<Self, StorageError> {
        let stripe_size = max_size.checked_div(stripes).unwrap_or(0);
        if stripe_size < MIN_STRIPE_SIZE {
            return Err(StorageError::StripeTooSmall {
                stripe_size,
                min: MIN_STRIPE_SIZE,
            });
        }

        Ok(Self {
            stripes: (0..stripes).map(|_| ThreadSafeLru::new(stripe_size)).collect(),
            hasher: RandomState::new(),
        })
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Total entries across stripes
    pub fn len(&self) -> usize {
        self.stripes.iter().map(ThreadSafeLru::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.iter().all(ThreadSafeLru::is_empty)
    }

    fn stripe(&self, key: &[u8]) -> &ThreadSafeLru {
        let idx = self.hasher.hash_one(key) as usize % self.stripes.len();
        &self.stripes[idx]
    }
}

impl Storage for StripedLru {
    fn put(&self, key: &[u8], value: &[u8]) -> bool {
        self.stripe(key).put(key, value)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> bool {
        self.stripe(key).put_if_absent(key, value)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> bool {
        self.stripe(key).set(key, value)
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.stripe(key).delete(key)
    }

    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.stripe(key).get(key)
    }

    fn update(&self, key: &[u8], f: &mut dyn FnMut(&[u8]) -> Option<Vec<u8>>) -> Option<bool> {
        self.stripe(key).update(key, f)
    }
}
