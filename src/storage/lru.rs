//! Byte-bounded LRU map
//!
//! Entries live in a slab and are chained through `prev`/`next` slot indices,
//! least recently used at `head`, most recently used at `tail`. The byte
//! budget counts `key.len() + value.len()` of every entry.

use bytes::Bytes;
use slab::Slab;
use std::collections::HashMap;

#[derive(Debug)]
struct Entry {
    key: Bytes,
    value: Bytes,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Entry {
    fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// LRU map, not thread safe
#[derive(Debug)]
pub struct SimpleLru {
    max_size: usize,
    cur_size: usize,
    entries: Slab<Entry>,
    index: HashMap<Bytes, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl SimpleLru {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            cur_size: 0,
            entries: Slab::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    /// Insert or overwrite; false when the entry can never fit
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> bool {
        if key.len() + value.len() > self.max_size {
            return false;
        }
        match self.index.get(key) {
            Some(&slot) => self.update(slot, value),
            None => self.insert(key, value),
        }
    }

    pub fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> bool {
        if key.len() + value.len() > self.max_size || self.index.contains_key(key) {
            return false;
        }
        self.insert(key, value)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> bool {
        match self.index.get(key) {
            Some(&slot) => self.update(slot, value),
            None => false,
        }
    }

    pub fn delete(&mut self, key: &[u8]) -> bool {
        match self.index.get(key) {
            Some(&slot) => {
                self.remove(slot);
                true
            }
            None => false,
        }
    }

    /// Fetch a value and mark it most recently used
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        let slot = *self.index.get(key)?;
        self.touch(slot);
        Some(self.entries[slot].value.clone())
    }

    /// Read-modify-write of an existing entry, see [`Storage::update`](super::Storage::update)
    pub fn update_with(
        &mut self,
        key: &[u8],
        f: &mut dyn FnMut(&[u8]) -> Option<Vec<u8>>,
    ) -> Option<bool> {
        let slot = *self.index.get(key)?;
        let current = self.entries[slot].value.clone();
        Some(match f(&current) {
            Some(value) => self.update(slot, &value),
            None => false,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of keys and values currently held
    pub fn size(&self) -> usize {
        self.cur_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn insert(&mut self, key: &[u8], value: &[u8]) -> bool {
        let size = key.len() + value.len();
        while self.cur_size + size > self.max_size {
            match self.head {
                Some(slot) => self.remove(slot),
                None => return false,
            }
        }

        let key = Bytes::copy_from_slice(key);
        let slot = self.entries.insert(Entry {
            key: key.clone(),
            value: Bytes::copy_from_slice(value),
            prev: None,
            next: None,
        });
        self.link_tail(slot);
        self.index.insert(key, slot);
        self.cur_size += size;
        true
    }

    fn update(&mut self, slot: usize, value: &[u8]) -> bool {
        let old_value_len = self.entries[slot].value.len();
        if self.entries[slot].key.len() + value.len() > self.max_size {
            return false;
        }

        // Moving to the tail first keeps the entry out of reach of the eviction loop
        self.touch(slot);
        while self.cur_size - old_value_len + value.len() > self.max_size {
            match self.head {
                Some(head) if head != slot => self.remove(head),
                _ => break,
            }
        }

        self.entries[slot].value = Bytes::copy_from_slice(value);
        self.cur_size = self.cur_size - old_value_len + value.len();
        true
    }

    fn remove(&mut self, slot: usize) {
        self.unlink(slot);
        let entry = self.entries.remove(slot);
        self.index.remove(&entry.key);
        self.cur_size -= entry.size();
    }

    fn touch(&mut self, slot: usize) {
        if self.tail != Some(slot) {
            self.unlink(slot);
            self.link_tail(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let entry = &mut self.entries[slot];
            (entry.prev.take(), entry.next.take())
        };
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_tail(&mut self, slot: usize) {
        self.entries[slot].prev = self.tail;
        self.entries[slot].next = None;
        match self.tail {
            Some(t) => self.entries[t].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }
}
