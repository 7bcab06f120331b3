//! Store capability contract.
//!
//! Sessions are parameterized over what sits beneath them only through the
//! [`DataStore`] trait: the persistent backing store, the per-layer overlay
//! cache, and sessions themselves all present the same surface, which is
//! what lets a commit write through to a parent session and to a backing
//! store with the same code path.

mod memory;

use std::collections::HashSet;
use std::rc::Rc;

use anyhow::Result;

use crate::alloc::ByteAllocator;
use crate::kv::KeyValue;
use crate::shared_bytes::SharedBytes;

pub use memory::MemoryStore;

/// Hash set of keys, used for "missing" results and per-layer bookkeeping.
pub type KeySet = HashSet<SharedBytes, ahash::RandomState>;

/// An ordered key-value store.
///
/// Lookups express absence with the `invalid` sentinels rather than
/// errors; `Result` is reserved for collaborator failures (I/O, etc.),
/// which implementations surface unchanged. Ordered navigation is
/// key-based: each method resolves to a key in lexicographic order, or to
/// `SharedBytes::invalid` when no such key exists.
pub trait DataStore {
    /// The allocator that produces buffers compatible with this store.
    fn allocator(&self) -> Rc<ByteAllocator>;

    fn read(&self, key: &SharedBytes) -> Result<KeyValue>;
    fn contains(&self, key: &SharedBytes) -> Result<bool>;
    fn write(&self, kv: KeyValue) -> Result<()>;
    fn erase(&self, key: &SharedBytes) -> Result<()>;

    /// Reads a batch of keys, returning the entries found and the keys
    /// that were not.
    fn read_batch(&self, keys: &[SharedBytes]) -> Result<(Vec<KeyValue>, KeySet)> {
        let mut found = Vec::new();
        let mut missing = KeySet::default();
        for key in keys {
            let kv = self.read(key)?;
            if kv.is_valid() {
                found.push(kv);
            } else {
                missing.insert(key.clone());
            }
        }
        Ok((found, missing))
    }

    fn write_batch(&self, kvs: Vec<KeyValue>) -> Result<()> {
        for kv in kvs {
            self.write(kv)?;
        }
        Ok(())
    }

    fn erase_batch(&self, keys: &[SharedBytes]) -> Result<()> {
        for key in keys {
            self.erase(key)?;
        }
        Ok(())
    }

    /// Copies the values stored under `keys` into `dest`, skipping keys
    /// this store does not have.
    fn write_to(&self, dest: &dyn DataStore, keys: &[SharedBytes]) -> Result<()> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let kv = self.read(key)?;
            if kv.is_valid() {
                out.push(kv);
            }
        }
        dest.write_batch(out)
    }

    /// `key` if present, else invalid.
    fn find_key(&self, key: &SharedBytes) -> Result<SharedBytes>;
    fn first_key(&self) -> Result<SharedBytes>;
    fn last_key(&self) -> Result<SharedBytes>;
    /// Smallest key `>= key`.
    fn lower_bound_key(&self, key: &SharedBytes) -> Result<SharedBytes>;
    /// Smallest key `> key`.
    fn upper_bound_key(&self, key: &SharedBytes) -> Result<SharedBytes>;
    /// Successor of `key` (same as the upper bound).
    fn next_key(&self, key: &SharedBytes) -> Result<SharedBytes>;
    /// Predecessor of `key`: greatest key `< key`.
    fn prev_key(&self, key: &SharedBytes) -> Result<SharedBytes>;
}
