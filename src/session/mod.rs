//! Nested transactional sessions.
//!
//! A session is one layer of in-memory state stacked on a backing store.
//! Layers form a single linear chain from the root (which owns the
//! backing-store reference) to the tip (the innermost open transaction).
//! Writes and erases land only in the layer they are issued on; reads
//! merge the chain from that layer outward, with per-layer tombstones
//! masking everything beneath them. `commit` squashes a layer into its
//! parent (or the backing store at the root) and `undo` discards it.
//!
//! Ownership runs child-to-parent: a layer keeps its parent alive, while
//! the downward link is weak and only observes whichever child the caller
//! still holds. The engine is strictly single-threaded; callers serialize
//! all access to a chain and its backing store.

mod iter;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use anyhow::Result;

use crate::alloc::ByteAllocator;
use crate::kv::KeyValue;
use crate::overlay::OverlayCache;
use crate::shared_bytes::SharedBytes;
use crate::store::{DataStore, KeySet};

pub use iter::SessionIter;

/// Per-key entry in a layer's iterator-neighbor cache: whether the key's
/// merged-view neighbors are already known, and whether the key is
/// tombstoned from the iterator's point of view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct IterState {
    pub(crate) next_known: bool,
    pub(crate) prev_known: bool,
    pub(crate) deleted: bool,
}

/// Flags for a single neighbor-cache update.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IterCacheUpdate {
    /// Only ensure the key is present; skip neighbor computation.
    pub(crate) prime_only: bool,
    /// Recompute neighbors even when both are already known.
    pub(crate) recalculate: bool,
    pub(crate) mark_deleted: bool,
    /// Apply `mark_deleted`; without this the deleted flag is left alone.
    pub(crate) overwrite: bool,
}

pub(crate) const REFRESH_ON_READ: IterCacheUpdate = IterCacheUpdate {
    prime_only: false,
    recalculate: true,
    mark_deleted: false,
    overwrite: false,
};

const REFRESH_ON_WRITE: IterCacheUpdate = IterCacheUpdate {
    prime_only: false,
    recalculate: true,
    mark_deleted: false,
    overwrite: true,
};

const REFRESH_ON_ERASE: IterCacheUpdate = IterCacheUpdate {
    prime_only: false,
    recalculate: true,
    mark_deleted: true,
    overwrite: true,
};

pub(crate) struct SessionNode {
    parent: RefCell<Option<Rc<SessionNode>>>,
    child: RefCell<Weak<SessionNode>>,
    /// Present on the root; inherited by children while attached.
    backing: RefCell<Option<Rc<dyn DataStore>>>,
    overlay: OverlayCache,
    /// Keys authored in this layer. Disjoint from `deleted`.
    updated: RefCell<KeySet>,
    /// Keys tombstoned in this layer. Tombstoned keys are never in the
    /// overlay.
    deleted: RefCell<KeySet>,
    pub(crate) iter_cache: RefCell<BTreeMap<SharedBytes, IterState>>,
}

impl SessionNode {
    fn new(
        parent: Option<Rc<SessionNode>>,
        backing: Option<Rc<dyn DataStore>>,
        overlay: OverlayCache,
    ) -> Rc<Self> {
        Rc::new(Self {
            parent: RefCell::new(parent),
            child: RefCell::new(Weak::new()),
            backing: RefCell::new(backing),
            overlay,
            updated: RefCell::new(KeySet::default()),
            deleted: RefCell::new(KeySet::default()),
            iter_cache: RefCell::new(BTreeMap::new()),
        })
    }
}

/// Handle to one layer of the session stack.
///
/// Cloning a `Session` yields another handle to the same layer. The
/// `invalid` handle is a sentinel: mutators on it are no-ops and readers
/// return the invalid sentinels.
#[derive(Clone)]
pub struct Session {
    pub(crate) node: Option<Rc<SessionNode>>,
}

impl Session {
    /// New root layer over `store`.
    pub fn new(store: Rc<dyn DataStore>) -> Self {
        let overlay = OverlayCache::new(store.allocator());
        Self::with_overlay(store, overlay)
    }

    /// New root layer over `store` with a pre-populated overlay.
    pub fn with_overlay(store: Rc<dyn DataStore>, overlay: OverlayCache) -> Self {
        Self {
            node: Some(SessionNode::new(None, Some(store), overlay)),
        }
    }

    /// The sentinel handle.
    pub fn invalid() -> Self {
        Self { node: None }
    }

    pub fn is_valid(&self) -> bool {
        self.node.is_some()
    }

    /// Creates a new tip nested on top of this layer.
    ///
    /// If this layer already had a child, that child is unlinked and
    /// degraded: it loses both its parent and its backing reference.
    pub fn nest(&self) -> Session {
        let Some(node) = &self.node else {
            return Session::invalid();
        };
        let stale = node.child.borrow().upgrade();
        if let Some(stale) = stale {
            *stale.parent.borrow_mut() = None;
            *stale.backing.borrow_mut() = None;
        }
        let child = SessionNode::new(
            Some(node.clone()),
            node.backing.borrow().clone(),
            OverlayCache::new(node.overlay.allocator()),
        );
        *node.child.borrow_mut() = Rc::downgrade(&child);
        Session { node: Some(child) }
    }

    /// Grafts a detached session onto this layer and primes it, returning
    /// the previously attached child (possibly invalid).
    pub fn attach(&self, child: Session) -> Session {
        let Some(node) = &self.node else {
            return Session::invalid();
        };
        let Some(child_node) = &child.node else {
            return Session::invalid();
        };
        let previous = self.detach();
        *child_node.parent.borrow_mut() = Some(node.clone());
        *child_node.backing.borrow_mut() = node.backing.borrow().clone();
        *node.child.borrow_mut() = Rc::downgrade(child_node);
        prime_node(child_node);
        previous
    }

    /// Unlinks and returns the current child (possibly invalid). The
    /// detached child keeps its overlay and key sets but loses its parent
    /// and backing references, becoming a free-standing layer.
    pub fn detach(&self) -> Session {
        let Some(node) = &self.node else {
            return Session::invalid();
        };
        let child = node.child.borrow().upgrade();
        *node.child.borrow_mut() = Weak::new();
        if let Some(child_node) = &child {
            *child_node.parent.borrow_mut() = None;
            *child_node.backing.borrow_mut() = None;
            // The detached subtree's neighbor flags described a merged
            // view that no longer exists.
            clear_iter_caches(child_node);
        }
        Session { node: child }
    }

    /// Folds this layer's tombstones and authored updates into its parent
    /// (or the backing store at the root), then empties the layer. The
    /// layer stays in the chain; an empty layer is transparent to reads
    /// and iteration.
    ///
    /// On an undone or invalid handle this is a no-op.
    pub fn commit(&self) -> Result<()> {
        let Some(node) = &self.node else {
            return Ok(());
        };
        commit_node(node)
    }

    /// Removes this layer from the chain, discarding its writes. Parent
    /// and child (when present) are linked to each other.
    pub fn undo(&self) {
        let Some(node) = &self.node else {
            return;
        };
        let parent = node.parent.borrow_mut().take();
        let child = std::mem::replace(&mut *node.child.borrow_mut(), Weak::new());
        if let Some(parent_node) = &parent {
            *parent_node.child.borrow_mut() = child.clone();
        }
        if let Some(child_node) = child.upgrade() {
            *child_node.parent.borrow_mut() = parent;
            clear_iter_caches(&child_node);
        }
        *node.backing.borrow_mut() = None;
        clear_node(node);
    }

    /// Tip-local wipe: overlay, key sets, and neighbor cache.
    pub fn clear(&self) {
        if let Some(node) = &self.node {
            clear_node(node);
        }
    }

    /// Merged read: walk from this layer toward the root, honoring
    /// tombstones, then fall through to the backing store. A hit from an
    /// ancestor or the store is cached into this layer's overlay (without
    /// marking it authored).
    pub fn read(&self, key: &SharedBytes) -> Result<KeyValue> {
        let Some(node) = &self.node else {
            return Ok(KeyValue::invalid());
        };
        let mut layer = Some(node.clone());
        while let Some(current) = layer {
            if current.deleted.borrow().contains(key) {
                return Ok(KeyValue::invalid());
            }
            let kv = current.overlay.read(key)?;
            if kv.is_valid() {
                if !Rc::ptr_eq(&current, node) {
                    node.overlay.write(kv.clone())?;
                    update_iter_cache(node, key, REFRESH_ON_READ)?;
                }
                return Ok(kv);
            }
            layer = current.parent.borrow().clone();
        }
        let backing = node.backing.borrow().clone();
        if let Some(store) = backing {
            let kv = store.read(key)?;
            if kv.is_valid() {
                node.overlay.write(kv.clone())?;
                update_iter_cache(node, key, REFRESH_ON_READ)?;
                return Ok(kv);
            }
        }
        Ok(KeyValue::invalid())
    }

    pub fn contains(&self, key: &SharedBytes) -> Result<bool> {
        let Some(node) = &self.node else {
            return Ok(false);
        };
        let mut layer = Some(node.clone());
        while let Some(current) = layer {
            if current.deleted.borrow().contains(key) {
                return Ok(false);
            }
            if current.overlay.contains(key)? {
                update_iter_cache(node, key, REFRESH_ON_READ)?;
                return Ok(true);
            }
            layer = current.parent.borrow().clone();
        }
        match node.backing.borrow().clone() {
            Some(store) => store.contains(key),
            None => Ok(false),
        }
    }

    /// Batch read. Keys found in some layer are returned immediately; the
    /// remainder go to the backing store in one batch, and those hits are
    /// cached into this layer's overlay. Keys tombstoned in some layer are
    /// reported missing without consulting the store.
    pub fn read_batch(&self, keys: &[SharedBytes]) -> Result<(Vec<KeyValue>, KeySet)> {
        let Some(node) = &self.node else {
            return Ok((Vec::new(), KeySet::default()));
        };
        let mut found = Vec::new();
        let mut missing = KeySet::default();
        let mut fetch = Vec::new();
        for key in keys {
            let mut hit = false;
            let mut dead = false;
            let mut layer = Some(node.clone());
            while let Some(current) = layer {
                if current.deleted.borrow().contains(key) {
                    dead = true;
                    break;
                }
                let kv = current.overlay.read(key)?;
                if kv.is_valid() {
                    if !Rc::ptr_eq(&current, node) {
                        node.overlay.write(kv.clone())?;
                        update_iter_cache(node, key, REFRESH_ON_READ)?;
                    }
                    found.push(kv);
                    hit = true;
                    break;
                }
                layer = current.parent.borrow().clone();
            }
            if dead {
                missing.insert(key.clone());
            } else if !hit {
                fetch.push(key.clone());
            }
        }
        let backing = node.backing.borrow().clone();
        match backing {
            Some(store) if !fetch.is_empty() => {
                let (store_found, store_missing) = store.read_batch(&fetch)?;
                if !store_found.is_empty() {
                    node.overlay.write_batch(store_found.clone())?;
                }
                found.extend(store_found);
                missing.extend(store_missing);
            }
            _ => missing.extend(fetch),
        }
        Ok((found, missing))
    }

    /// Writes into this layer: the key becomes authored here, any local
    /// tombstone is dropped, and the neighbor cache is refreshed.
    pub fn write(&self, kv: KeyValue) -> Result<()> {
        let Some(node) = &self.node else {
            return Ok(());
        };
        if !kv.is_valid() {
            return Ok(());
        }
        let key = kv.key().clone();
        node.updated.borrow_mut().insert(key.clone());
        node.deleted.borrow_mut().remove(&key);
        node.overlay.write(kv)?;
        update_iter_cache(node, &key, REFRESH_ON_WRITE)
    }

    /// Tombstones the key in this layer, masking any ancestor value.
    pub fn erase(&self, key: &SharedBytes) -> Result<()> {
        let Some(node) = &self.node else {
            return Ok(());
        };
        if !key.is_valid() {
            return Ok(());
        }
        node.deleted.borrow_mut().insert(key.clone());
        node.updated.borrow_mut().remove(key);
        node.overlay.erase(key)?;
        update_iter_cache(node, key, REFRESH_ON_ERASE)
    }

    pub fn write_batch(&self, kvs: Vec<KeyValue>) -> Result<()> {
        for kv in kvs {
            self.write(kv)?;
        }
        Ok(())
    }

    pub fn erase_batch(&self, keys: &[SharedBytes]) -> Result<()> {
        for key in keys {
            self.erase(key)?;
        }
        Ok(())
    }

    /// Copies the merged values for `keys` into `dest`, skipping keys
    /// tombstoned at this layer or above it. No read-through caching.
    pub fn write_to(&self, dest: &dyn DataStore, keys: &[SharedBytes]) -> Result<()> {
        let Some(node) = &self.node else {
            return Ok(());
        };
        let mut out = Vec::new();
        for key in keys {
            let kv = peek_node(node, key)?;
            if kv.is_valid() {
                out.push(kv);
            }
        }
        dest.write_batch(out)
    }

    /// Pulls `keys` out of `source` into this layer.
    pub fn read_from(&self, source: &dyn DataStore, keys: &[SharedBytes]) -> Result<()> {
        source.write_to(self, keys)
    }

    pub fn begin(&self) -> Result<SessionIter> {
        self.make_iterator(SeekKind::First)
    }

    /// The end sentinel. Incrementing it rolls over to the first entry.
    pub fn end(&self) -> SessionIter {
        SessionIter::end_of(self.clone())
    }

    pub fn find(&self, key: &SharedBytes) -> Result<SessionIter> {
        self.make_iterator(SeekKind::Find(key))
    }

    pub fn lower_bound(&self, key: &SharedBytes) -> Result<SessionIter> {
        self.make_iterator(SeekKind::LowerBound(key))
    }

    pub fn upper_bound(&self, key: &SharedBytes) -> Result<SessionIter> {
        self.make_iterator(SeekKind::UpperBound(key))
    }

    /// The backing store, if this layer is attached to one.
    pub fn backing(&self) -> Option<Rc<dyn DataStore>> {
        self.node.as_ref()?.backing.borrow().clone()
    }

    /// This layer's overlay cache.
    pub fn overlay_cache(&self) -> Option<&OverlayCache> {
        self.node.as_deref().map(|node| &node.overlay)
    }

    /// The backing store's allocator, or the overlay's for a detached
    /// layer.
    pub fn memory_allocator(&self) -> Option<Rc<ByteAllocator>> {
        let node = self.node.as_ref()?;
        let backing = node.backing.borrow();
        Some(match backing.as_ref() {
            Some(store) => store.allocator(),
            None => node.overlay.allocator(),
        })
    }

    fn make_iterator(&self, kind: SeekKind<'_>) -> Result<SessionIter> {
        let Some(node) = &self.node else {
            return Ok(SessionIter::end_of(self.clone()));
        };
        let winner = merged_seek(node, kind)?;
        let mut position = SharedBytes::invalid();
        if winner.is_valid() {
            update_iter_cache(node, &winner, REFRESH_ON_READ)?;
            let masked = node
                .iter_cache
                .borrow()
                .get(&winner)
                .map_or(false, |state| state.deleted);
            if !masked {
                position = winner;
            }
        }
        Ok(SessionIter::new(self.clone(), position))
    }
}

impl DataStore for Session {
    fn allocator(&self) -> Rc<ByteAllocator> {
        self.memory_allocator()
            .unwrap_or_else(|| Rc::new(ByteAllocator::new()))
    }

    fn read(&self, key: &SharedBytes) -> Result<KeyValue> {
        Session::read(self, key)
    }

    fn contains(&self, key: &SharedBytes) -> Result<bool> {
        Session::contains(self, key)
    }

    fn write(&self, kv: KeyValue) -> Result<()> {
        Session::write(self, kv)
    }

    fn erase(&self, key: &SharedBytes) -> Result<()> {
        Session::erase(self, key)
    }

    fn read_batch(&self, keys: &[SharedBytes]) -> Result<(Vec<KeyValue>, KeySet)> {
        Session::read_batch(self, keys)
    }

    fn write_batch(&self, kvs: Vec<KeyValue>) -> Result<()> {
        Session::write_batch(self, kvs)
    }

    fn erase_batch(&self, keys: &[SharedBytes]) -> Result<()> {
        Session::erase_batch(self, keys)
    }

    fn write_to(&self, dest: &dyn DataStore, keys: &[SharedBytes]) -> Result<()> {
        Session::write_to(self, dest, keys)
    }

    fn find_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        match &self.node {
            Some(node) => merged_seek(node, SeekKind::Find(key)),
            None => Ok(SharedBytes::invalid()),
        }
    }

    fn first_key(&self) -> Result<SharedBytes> {
        match &self.node {
            Some(node) => merged_seek(node, SeekKind::First),
            None => Ok(SharedBytes::invalid()),
        }
    }

    fn last_key(&self) -> Result<SharedBytes> {
        match &self.node {
            Some(node) => merged_seek(node, SeekKind::Last),
            None => Ok(SharedBytes::invalid()),
        }
    }

    fn lower_bound_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        match &self.node {
            Some(node) => merged_seek(node, SeekKind::LowerBound(key)),
            None => Ok(SharedBytes::invalid()),
        }
    }

    fn upper_bound_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        match &self.node {
            Some(node) => merged_seek(node, SeekKind::UpperBound(key)),
            None => Ok(SharedBytes::invalid()),
        }
    }

    fn next_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        self.upper_bound_key(key)
    }

    fn prev_key(&self, key: &SharedBytes) -> Result<SharedBytes> {
        match &self.node {
            Some(node) => merged_seek(node, SeekKind::Predecessor(key)),
            None => Ok(SharedBytes::invalid()),
        }
    }
}

/// Guard that commits the wrapped session on every exit path.
///
/// Sessions do not commit on drop by themselves; wrap one in a
/// `ScopedSession` to get commit-on-exit. For recovery purposes an
/// unfinalized session is equivalent to a committed one: dropping a
/// handle is not a discard (that is `undo`), so callers must not rely on
/// a drop to suppress writes, and callers that need the commit to
/// actually run on every exit path use this guard.
pub struct ScopedSession {
    session: Session,
}

impl ScopedSession {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Commits now and reports the result. The drop-time commit that
    /// follows is a no-op on the emptied layer.
    pub fn finish(self) -> Result<()> {
        self.session.commit()
    }
}

impl Deref for ScopedSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        let _ = self.session.commit();
    }
}

#[derive(Clone, Copy)]
pub(crate) enum SeekKind<'a> {
    First,
    Last,
    Find(&'a SharedBytes),
    LowerBound(&'a SharedBytes),
    UpperBound(&'a SharedBytes),
    /// Greatest key strictly below the given one.
    Predecessor(&'a SharedBytes),
}

impl SeekKind<'_> {
    fn backwards(self) -> bool {
        matches!(self, SeekKind::Last | SeekKind::Predecessor(_))
    }
}

fn commit_node(node: &Rc<SessionNode>) -> Result<()> {
    let parent = node.parent.borrow().clone();
    let backing = node.backing.borrow().clone();
    if parent.is_none() && backing.is_none() {
        // Undone layer; nowhere to fold into.
        return Ok(());
    }

    let deleted: Vec<SharedBytes> = node.deleted.borrow().iter().cloned().collect();
    let updated: Vec<SharedBytes> = node.updated.borrow().iter().cloned().collect();
    if let Some(parent) = parent {
        let dest = Session { node: Some(parent) };
        dest.erase_batch(&deleted)?;
        node.overlay.write_to(&dest, &updated)?;
    } else if let Some(store) = backing {
        store.erase_batch(&deleted)?;
        node.overlay.write_to(store.as_ref(), &updated)?;
    }
    clear_node(node);
    Ok(())
}

fn clear_node(node: &SessionNode) {
    node.deleted.borrow_mut().clear();
    node.updated.borrow_mut().clear();
    node.overlay.clear();
    node.iter_cache.borrow_mut().clear();
}

/// Resets a freshly attached subtree: the neighbor cache goes, and so does
/// every overlay entry that was cached from the old parent's view rather
/// than authored here.
fn prime_node(node: &Rc<SessionNode>) {
    node.iter_cache.borrow_mut().clear();
    {
        let updated = node.updated.borrow();
        node.overlay.retain_keys(&updated);
    }
    if let Some(child) = node.child.borrow().upgrade() {
        prime_node(&child);
    }
}

fn clear_iter_caches(node: &Rc<SessionNode>) {
    node.iter_cache.borrow_mut().clear();
    if let Some(child) = node.child.borrow().upgrade() {
        clear_iter_caches(&child);
    }
}

/// Side-effect-free merged read (no read-through caching).
fn peek_node(node: &Rc<SessionNode>, key: &SharedBytes) -> Result<KeyValue> {
    let mut layer = Some(node.clone());
    while let Some(current) = layer {
        if current.deleted.borrow().contains(key) {
            return Ok(KeyValue::invalid());
        }
        let kv = current.overlay.read(key)?;
        if kv.is_valid() {
            return Ok(kv);
        }
        layer = current.parent.borrow().clone();
    }
    match node.backing.borrow().clone() {
        Some(store) => store.read(key),
        None => Ok(KeyValue::invalid()),
    }
}

/// The chain from the root down to `node`, inclusive.
fn chain_from_root(node: &Rc<SessionNode>) -> Vec<Rc<SessionNode>> {
    let mut layers = vec![node.clone()];
    let mut current = node.parent.borrow().clone();
    while let Some(layer) = current {
        current = layer.parent.borrow().clone();
        layers.push(layer);
    }
    layers.reverse();
    layers
}

/// Whether `key` is masked for a store whose descendant layers are
/// `layers`: the walk runs outward-in, a tombstone hides the key, a later
/// authored update reveals it again, and the last flip wins.
fn shadowed(layers: &[Rc<SessionNode>], key: &SharedBytes) -> bool {
    let mut hidden = false;
    for layer in layers {
        if layer.deleted.borrow().contains(key) {
            hidden = true;
        } else if layer.updated.borrow().contains(key) {
            hidden = false;
        }
    }
    hidden
}

fn seek_start(store: &dyn DataStore, kind: SeekKind<'_>) -> Result<SharedBytes> {
    match kind {
        SeekKind::First => store.first_key(),
        SeekKind::Last => store.last_key(),
        SeekKind::Find(key) => store.find_key(key),
        SeekKind::LowerBound(key) => store.lower_bound_key(key),
        SeekKind::UpperBound(key) => store.upper_bound_key(key),
        SeekKind::Predecessor(key) => store.prev_key(key),
    }
}

/// Per-store candidate: the first key from the starting position, stepping
/// in the seek direction, that is not shadowed by a descendant layer.
fn seek_candidate(
    store: &dyn DataStore,
    kind: SeekKind<'_>,
    descendants: &[Rc<SessionNode>],
) -> Result<SharedBytes> {
    let mut candidate = seek_start(store, kind)?;
    while candidate.is_valid() && shadowed(descendants, &candidate) {
        if matches!(kind, SeekKind::Find(_)) {
            return Ok(SharedBytes::invalid());
        }
        candidate = if kind.backwards() {
            store.prev_key(&candidate)?
        } else {
            store.next_key(&candidate)?
        };
    }
    Ok(candidate)
}

/// The merged-view key selected by `kind` across the backing store and
/// every layer from the root down to `node`. Forward seeks pick the
/// smallest candidate, backward seeks the greatest.
pub(crate) fn merged_seek(node: &Rc<SessionNode>, kind: SeekKind<'_>) -> Result<SharedBytes> {
    let layers = chain_from_root(node);
    let mut winner = SharedBytes::invalid();
    let mut consider = |candidate: SharedBytes| {
        if !candidate.is_valid() {
            return;
        }
        let better = !winner.is_valid()
            || match kind {
                SeekKind::Find(_) => false,
                _ if kind.backwards() => candidate > winner,
                _ => candidate < winner,
            };
        if better {
            winner = candidate;
        }
    };

    let backing = node.backing.borrow().clone();
    if let Some(store) = backing {
        // Every layer, root included, can shadow the backing store.
        consider(seek_candidate(store.as_ref(), kind, &layers)?);
    }
    for (depth, layer) in layers.iter().enumerate() {
        consider(seek_candidate(&layer.overlay, kind, &layers[depth + 1..])?);
    }
    Ok(winner)
}

/// Merged-view neighbors of `key`: the greatest key strictly below it and
/// the smallest key strictly above it. Pure reads; this never touches the
/// neighbor cache, so it is safe to call while a cache update is in
/// flight.
fn bounds(node: &Rc<SessionNode>, key: &SharedBytes) -> Result<(SharedBytes, SharedBytes)> {
    let lower = merged_seek(node, SeekKind::Predecessor(key))?;
    let upper = merged_seek(node, SeekKind::UpperBound(key))?;
    Ok((lower, upper))
}

/// Creates or refreshes the neighbor-cache entry for `key`, resolving its
/// merged-view neighbors and cross-linking the known-neighbor flags.
pub(crate) fn update_iter_cache(
    node: &Rc<SessionNode>,
    key: &SharedBytes,
    update: IterCacheUpdate,
) -> Result<()> {
    {
        let mut cache = node.iter_cache.borrow_mut();
        let state = cache.entry(key.clone()).or_default();
        if update.prime_only {
            return Ok(());
        }
        if update.overwrite {
            state.deleted = update.mark_deleted;
        }
        if !update.recalculate && state.next_known && state.prev_known {
            return Ok(());
        }
    }

    let (lower, upper) = bounds(node, key)?;

    let mut cache = node.iter_cache.borrow_mut();
    if lower.is_valid() {
        cache.entry(lower).or_default().next_known = true;
        if let Some(state) = cache.get_mut(key) {
            state.prev_known = true;
        }
    }
    if upper.is_valid() {
        cache.entry(upper).or_default().prev_known = true;
        if let Some(state) = cache.get_mut(key) {
            state.next_known = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn root() -> Session {
        Session::new(Rc::new(MemoryStore::new()))
    }

    fn key(s: &str) -> SharedBytes {
        SharedBytes::from(s)
    }

    #[test]
    fn updated_and_deleted_stay_disjoint() -> Result<()> {
        let session = root();
        let k = key("k");
        session.write(KeyValue::new("k", "v"))?;
        session.erase(&k)?;
        {
            let node = session.node.as_ref().expect("valid session");
            assert!(!node.updated.borrow().contains(&k));
            assert!(node.deleted.borrow().contains(&k));
            assert!(!node.overlay.contains(&k)?);
        }
        session.write(KeyValue::new("k", "v2"))?;
        {
            let node = session.node.as_ref().expect("valid session");
            assert!(node.updated.borrow().contains(&k));
            assert!(!node.deleted.borrow().contains(&k));
        }
        Ok(())
    }

    #[test]
    fn chain_stays_linear() {
        let s0 = root();
        let s1 = s0.nest();
        let s2 = s1.nest();
        let chain = chain_from_root(s2.node.as_ref().expect("valid session"));
        assert_eq!(chain.len(), 3);
        assert!(Rc::ptr_eq(&chain[0], s0.node.as_ref().unwrap()));
        assert!(Rc::ptr_eq(&chain[2], s2.node.as_ref().unwrap()));
        // Parent's downward link observes the child.
        let down = chain[0].child.borrow().upgrade().expect("child link");
        assert!(Rc::ptr_eq(&down, &chain[1]));
    }

    #[test]
    fn nest_degrades_a_stale_child() {
        let s0 = root();
        let s1 = s0.nest();
        let s2 = s0.nest();
        assert!(s1.backing().is_none());
        assert!(s1.node.as_ref().unwrap().parent.borrow().is_none());
        assert!(s2.backing().is_some());
    }

    #[test]
    fn neighbor_flags_cross_link() -> Result<()> {
        let session = root();
        session.write(KeyValue::new("a", "1"))?;
        session.write(KeyValue::new("c", "3"))?;
        session.write(KeyValue::new("b", "2"))?;
        let node = session.node.as_ref().expect("valid session");
        let cache = node.iter_cache.borrow();
        let b = cache.get(&key("b")).expect("cache entry for b");
        assert!(b.next_known && b.prev_known);
        assert!(cache.get(&key("a")).expect("cache entry for a").next_known);
        assert!(cache.get(&key("c")).expect("cache entry for c").prev_known);
        Ok(())
    }

    #[test]
    fn prime_only_updates_skip_neighbor_resolution() -> Result<()> {
        let session = root();
        session.write(KeyValue::new("a", "1"))?;
        session.write(KeyValue::new("c", "3"))?;
        let node = session.node.as_ref().expect("valid session");
        let probe = key("b");
        update_iter_cache(
            node,
            &probe,
            IterCacheUpdate {
                prime_only: true,
                recalculate: true,
                mark_deleted: false,
                overwrite: false,
            },
        )?;
        let cache = node.iter_cache.borrow();
        let state = cache.get(&probe).expect("primed entry");
        assert!(!state.next_known && !state.prev_known && !state.deleted);
        Ok(())
    }

    #[test]
    fn invalid_session_is_inert() -> Result<()> {
        let session = Session::invalid();
        session.write(KeyValue::new("k", "v"))?;
        session.erase(&key("k"))?;
        session.commit()?;
        session.undo();
        assert!(!session.read(&key("k"))?.is_valid());
        assert!(!session.contains(&key("k"))?);
        assert!(!session.attach(Session::invalid()).is_valid());
        assert!(!session.detach().is_valid());
        assert!(session.begin()?.is_end());
        Ok(())
    }
}
