//! Per-layer overlay cache.
//!
//! Every session layer owns one: an ordered key-to-value map holding the
//! layer's authored updates plus entries cached opportunistically by
//! merged reads. It presents the same [`DataStore`] surface as a backing
//! store, with interior mutability so a shared handle stays `&self`.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::rc::Rc;

use anyhow::Result;

use crate::alloc::ByteAllocator;
use crate::kv::KeyValue;
use crate::shared_bytes::SharedBytes;
use crate::store::{DataStore, KeySet};

#[derive(Debug)]
pub struct OverlayCache {
    entries: RefCell<BTreeMap<SharedBytes, SharedBytes>>,
    allocator: Rc<ByteAllocator>,
    hits: Cell<u64>,
    misses: Cell<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
}

impl OverlayCache {
    pub fn new(allocator: Rc<ByteAllocator>) -> Self {
        Self {
            entries: RefCell::new(BTreeMap::new()),
            allocator,
            hits: Cell::new(0),
            misses: Cell::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    /// All keys in order.
    pub fn keys(&self) -> Vec<SharedBytes> {
        self.entries.borrow().keys().cloned().collect()
    }

    pub fn stats(&self) -> OverlayStats {
        OverlayStats {
            hits: self.hits.get(),
            misses: self.misses.get(),
            len: self.len(),
        }
    }

    /// Drops every entry whose key is not in `keep`. Used when a layer is
    /// re-attached under a new parent and its cached reads may be stale.
    pub(crate) fn retain_keys(&self, keep: &KeySet) {
        self.entries
            .borrow_mut()
            .retain(|key, _| keep.contains(key));
    }
}

impl DataStore for OverlayCache {
    fn allocator(&self) -> Rc<ByteAllocator> {
        self.allocator.clone()
    }

    fn read(&self, key: &SharedBytes) -> Result<KeyValue> {
        match self.entries.borrow().get_key_value(key) {
            Some((key, value)) => {
                self.hits.set(self.hits.get() + 1);
                Ok(KeyValue::new(key.clone(), value.clone()))
            }
            None => {
                self.misses.set(self.misses.get() + 1);
                Ok(KeyValue::invalid())
            }
        }
    }

    fn contains(&self, key: &SharedBytes) -> Result<bool> {
        Ok(self.entries.borrow().contains_key(key))
    }

    fn write(&self, kv: KeyValue) -> Result<()> {
        if !kv.is_valid() {
            return Ok(());
        }
        let (key, value) = kv.into_parts();
        self.entries.borrow_mut().insert(key, value);
        Ok(())
    }

    fn erase(&self, key: &SharedBytes) -> Result<()> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }

    fn find_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        Ok(match self.entries.borrow().get_key_value(key) {
            Some((key, _)) => key.clone(),
            None => SharedBytes::invalid(),
        })
    }

    fn first_key(&self) -> Result<SharedBytes> {
        Ok(self
            .entries
            .borrow()
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(SharedBytes::invalid))
    }

    fn last_key(&self) -> Result<SharedBytes> {
        Ok(self
            .entries
            .borrow()
            .keys()
            .next_back()
            .cloned()
            .unwrap_or_else(SharedBytes::invalid))
    }

    fn lower_bound_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        Ok(self
            .entries
            .borrow()
            .range((Bound::Included(key), Bound::<&SharedBytes>::Unbounded))
            .next()
            .map(|(key, _)| key.clone())
            .unwrap_or_else(SharedBytes::invalid))
    }

    fn upper_bound_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        Ok(self
            .entries
            .borrow()
            .range((Bound::Excluded(key), Bound::<&SharedBytes>::Unbounded))
            .next()
            .map(|(key, _)| key.clone())
            .unwrap_or_else(SharedBytes::invalid))
    }

    fn next_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        self.upper_bound_key(key)
    }

    fn prev_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        Ok(self
            .entries
            .borrow()
            .range((Bound::<&SharedBytes>::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(key, _)| key.clone())
            .unwrap_or_else(SharedBytes::invalid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_orders_and_counts() -> Result<()> {
        let overlay = OverlayCache::new(Rc::new(ByteAllocator::new()));
        overlay.write(KeyValue::new("b", "2"))?;
        overlay.write(KeyValue::new("d", "4"))?;

        assert_eq!(overlay.first_key()?, SharedBytes::from("b"));
        assert_eq!(overlay.upper_bound_key(&SharedBytes::from("b"))?, SharedBytes::from("d"));
        assert_eq!(overlay.prev_key(&SharedBytes::from("d"))?, SharedBytes::from("b"));

        assert!(overlay.read(&SharedBytes::from("b"))?.is_valid());
        assert!(!overlay.read(&SharedBytes::from("c"))?.is_valid());
        let stats = overlay.stats();
        assert_eq!((stats.hits, stats.misses, stats.len), (1, 1, 2));
        Ok(())
    }

    #[test]
    fn retain_keeps_only_requested_keys() -> Result<()> {
        let overlay = OverlayCache::new(Rc::new(ByteAllocator::new()));
        overlay.write(KeyValue::new("a", "1"))?;
        overlay.write(KeyValue::new("b", "2"))?;

        let mut keep = KeySet::default();
        keep.insert(SharedBytes::from("b"));
        overlay.retain_keys(&keep);

        assert_eq!(overlay.keys(), vec![SharedBytes::from("b")]);
        Ok(())
    }
}
