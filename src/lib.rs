//! `stratadb` is a layered transactional key-value session engine.
//!
//! A stack of nested in-memory write buffers (sessions) sits on top of a
//! persistent key-value store:
//! - Writes and erases land only in the session they are issued on;
//!   deletes are per-key tombstones.
//! - Reads merge the stack from that session outward to the root and then
//!   the backing store, with tombstones at any layer masking everything
//!   beneath them. Hits from ancestors are cached read-through into the
//!   reading session's overlay.
//! - `commit` squashes a session into its parent (or the backing store at
//!   the root); `undo` discards it; chains can be detached and re-grafted.
//! - Iteration walks the globally sorted key order across every layer and
//!   the backing store, driven by a per-session neighbor cache so that
//!   cross-layer bounds are not recomputed on every step.
//!
//! The engine is strictly single-threaded: callers serialize all access to
//! a chain and its backing store. Domain-level absence is expressed with
//! sentinels (`SharedBytes::invalid`, `KeyValue::invalid`,
//! `Session::invalid`), never with errors; `Result` carries collaborator
//! failures only.

pub mod alloc;
pub mod kv;
pub mod overlay;
pub mod session;
pub mod shared_bytes;
pub mod store;

pub use alloc::{AllocatorStats, ByteAllocator};
pub use kv::KeyValue;
pub use overlay::{OverlayCache, OverlayStats};
pub use session::{ScopedSession, Session, SessionIter};
pub use shared_bytes::SharedBytes;
pub use store::{DataStore, KeySet, MemoryStore};
