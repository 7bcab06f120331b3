use std::ops::Bound;
use std::rc::Rc;

use anyhow::Result;
use crossbeam_skiplist::SkipMap;

use crate::alloc::ByteAllocator;
use crate::kv::KeyValue;
use crate::shared_bytes::SharedBytes;
use crate::store::DataStore;

/// Ordered in-memory backing store.
///
/// This is the reference [`DataStore`]: tests run against it and it is the
/// bottom of the layer stack when no disk-backed store is wired in. The
/// skip list mutates through `&self`, so a shared handle needs no locking.
pub struct MemoryStore {
    map: SkipMap<SharedBytes, SharedBytes>,
    allocator: Rc<ByteAllocator>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_allocator(Rc::new(ByteAllocator::new()))
    }

    pub fn with_allocator(allocator: Rc<ByteAllocator>) -> Self {
        Self {
            map: SkipMap::new(),
            allocator,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All entries in key order.
    pub fn entries(&self) -> Vec<KeyValue> {
        self.map
            .iter()
            .map(|entry| KeyValue::new(entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore for MemoryStore {
    fn allocator(&self) -> Rc<ByteAllocator> {
        self.allocator.clone()
    }

    fn read(&self, key: &SharedBytes) -> Result<KeyValue> {
        Ok(match self.map.get(key) {
            Some(entry) => KeyValue::new(entry.key().clone(), entry.value().clone()),
            None => KeyValue::invalid(),
        })
    }

    fn contains(&self, key: &SharedBytes) -> Result<bool> {
        Ok(self.map.contains_key(key))
    }

    fn write(&self, kv: KeyValue) -> Result<()> {
        if !kv.is_valid() {
            return Ok(());
        }
        let (key, value) = kv.into_parts();
        self.map.insert(key, value);
        Ok(())
    }

    fn erase(&self, key: &SharedBytes) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    fn find_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        Ok(match self.map.get(key) {
            Some(entry) => entry.key().clone(),
            None => SharedBytes::invalid(),
        })
    }

    fn first_key(&self) -> Result<SharedBytes> {
        Ok(self
            .map
            .front()
            .map(|entry| entry.key().clone())
            .unwrap_or_else(SharedBytes::invalid))
    }

    fn last_key(&self) -> Result<SharedBytes> {
        Ok(self
            .map
            .back()
            .map(|entry| entry.key().clone())
            .unwrap_or_else(SharedBytes::invalid))
    }

    fn lower_bound_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        Ok(self
            .map
            .lower_bound(Bound::Included(key))
            .map(|entry| entry.key().clone())
            .unwrap_or_else(SharedBytes::invalid))
    }

    fn upper_bound_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        Ok(self
            .map
            .lower_bound(Bound::Excluded(key))
            .map(|entry| entry.key().clone())
            .unwrap_or_else(SharedBytes::invalid))
    }

    fn next_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        self.upper_bound_key(key)
    }

    fn prev_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        Ok(self
            .map
            .upper_bound(Bound::Excluded(key))
            .map(|entry| entry.key().clone())
            .unwrap_or_else(SharedBytes::invalid))
    }
}
