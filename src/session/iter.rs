use std::fmt;
use std::ops::Bound;
use std::rc::Rc;

use anyhow::Result;

use crate::kv::KeyValue;
use crate::shared_bytes::SharedBytes;

use super::{update_iter_cache, IterState, Session, SessionNode, REFRESH_ON_READ};

/// Bidirectional, cyclical iterator over a session's merged key order.
///
/// The iterator walks the owning session's neighbor cache rather than the
/// layers themselves; when it reaches a key whose neighbor in the step
/// direction is not yet known, it resolves the neighbor across all layers
/// and the backing store, then continues in cache order. Both directions
/// pass through the end sentinel: stepping past the last key lands on the
/// sentinel and a further increment wraps to the first entry, while a
/// decrement at the merged front lands on the sentinel and a further
/// decrement wraps to the last entry.
///
/// Any write, erase, commit, or undo on the owning session may invalidate
/// an iterator obtained before the mutation; do not keep iterators across
/// such calls.
#[derive(Clone)]
pub struct SessionIter {
    session: Session,
    /// Key of the current neighbor-cache entry; invalid at the end
    /// sentinel.
    position: SharedBytes,
}

impl SessionIter {
    pub(crate) fn new(session: Session, position: SharedBytes) -> Self {
        Self { session, position }
    }

    pub(crate) fn end_of(session: Session) -> Self {
        Self::new(session, SharedBytes::invalid())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_end(&self) -> bool {
        !self.position.is_valid()
    }

    /// The key under the cursor; invalid at the end sentinel.
    pub fn key(&self) -> &SharedBytes {
        &self.position
    }

    /// Reads the entry under the cursor through the owning session;
    /// invalid at the end sentinel.
    pub fn entry(&self) -> Result<KeyValue> {
        if !self.position.is_valid() {
            return Ok(KeyValue::invalid());
        }
        self.session.read(&self.position)
    }

    /// Advances to the next non-tombstoned key in merged order. Stepping
    /// past the last key lands on the end sentinel; incrementing the
    /// sentinel wraps to the first entry.
    pub fn step_next(&mut self) -> Result<()> {
        let Some(node) = self.session.node.clone() else {
            return Ok(());
        };
        if !self.position.is_valid() {
            // Wrap: the sentinel increments to the front of the cache.
            let first = {
                let cache = node.iter_cache.borrow();
                cache
                    .iter()
                    .next()
                    .map(|(key, state)| (key.clone(), state.deleted))
            };
            match first {
                None => return Ok(()),
                Some((key, deleted)) => {
                    self.position = key;
                    if !deleted {
                        return Ok(());
                    }
                    // A tombstoned front entry: keep stepping below.
                }
            }
        }
        loop {
            if !self.flag_or_recalculate(&node, |state| state.next_known)? {
                self.position = SharedBytes::invalid();
                break;
            }
            let next = {
                let cache = node.iter_cache.borrow();
                cache
                    .range((
                        Bound::Excluded(&self.position),
                        Bound::<&SharedBytes>::Unbounded,
                    ))
                    .next()
                    .map(|(key, state)| (key.clone(), state.deleted))
            };
            match next {
                None => {
                    self.position = SharedBytes::invalid();
                    break;
                }
                Some((key, deleted)) => {
                    self.position = key;
                    if !deleted {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Steps back to the previous non-tombstoned key in merged order. The
    /// sentinel decrements to the last entry; decrementing at the merged
    /// front lands on the sentinel.
    pub fn step_prev(&mut self) -> Result<()> {
        let Some(node) = self.session.node.clone() else {
            return Ok(());
        };
        if !self.position.is_valid() {
            // Wrap: the sentinel decrements to the back of the cache.
            let last = {
                let cache = node.iter_cache.borrow();
                cache
                    .iter()
                    .next_back()
                    .map(|(key, state)| (key.clone(), state.deleted))
            };
            match last {
                None => return Ok(()),
                Some((key, deleted)) => {
                    self.position = key;
                    if !deleted {
                        return Ok(());
                    }
                    // A tombstoned back entry: keep stepping below.
                }
            }
        }
        loop {
            if !self.flag_or_recalculate(&node, |state| state.prev_known)? {
                self.position = SharedBytes::invalid();
                break;
            }
            let prev = {
                let cache = node.iter_cache.borrow();
                cache
                    .range((
                        Bound::<&SharedBytes>::Unbounded,
                        Bound::Excluded(&self.position),
                    ))
                    .next_back()
                    .map(|(key, state)| (key.clone(), state.deleted))
            };
            match prev {
                None => {
                    self.position = SharedBytes::invalid();
                    break;
                }
                Some((key, deleted)) => {
                    self.position = key;
                    if !deleted {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Reads the current flag; when unset, forces one neighbor
    /// recomputation and re-reads it. A vanished cache entry reads as
    /// unset.
    fn flag_or_recalculate<F>(&self, node: &Rc<SessionNode>, flag: F) -> Result<bool>
    where
        F: Fn(&IterState) -> bool,
    {
        let current = node
            .iter_cache
            .borrow()
            .get(&self.position)
            .map(|state| flag(state));
        match current {
            None => Ok(false),
            Some(true) => Ok(true),
            Some(false) => {
                update_iter_cache(node, &self.position, REFRESH_ON_READ)?;
                Ok(node
                    .iter_cache
                    .borrow()
                    .get(&self.position)
                    .map_or(false, |state| flag(state)))
            }
        }
    }
}

impl PartialEq for SessionIter {
    /// Two iterators are equal only on the same session: both at the end
    /// sentinel, or both on the same key.
    fn eq(&self, other: &Self) -> bool {
        let same_session = match (&self.session.node, &other.session.node) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_session && self.position == other.position
    }
}

impl Eq for SessionIter {}

impl fmt::Debug for SessionIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIter")
            .field("position", &self.position)
            .finish()
    }
}
