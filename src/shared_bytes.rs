use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;

/// Immutable, reference-counted byte sequence used for keys and values.
///
/// Cloning shares the underlying buffer. Comparison is lexicographic over
/// the raw bytes. `SharedBytes::invalid` is a sentinel meaning "no such
/// buffer": it compares unequal to every real buffer, sorts after all of
/// them, and is never stored in any container.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct SharedBytes(Option<Bytes>);

impl SharedBytes {
    /// The "no such buffer" sentinel.
    pub fn invalid() -> Self {
        Self(None)
    }

    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self(Some(Bytes::copy_from_slice(data)))
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_some()
    }

    /// Raw bytes; empty for the invalid sentinel.
    pub fn as_slice(&self) -> &[u8] {
        match &self.0 {
            Some(bytes) => bytes.as_ref(),
            None => &[],
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        self.0.as_ref()
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl Ord for SharedBytes {
    fn cmp(&self, other: &Self) -> Ordering {
        // The sentinel sorts after every valid buffer.
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl PartialOrd for SharedBytes {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for SharedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(bytes) => write!(f, "b\"{}\"", bytes.escape_ascii()),
            None => write!(f, "<invalid>"),
        }
    }
}

impl From<Bytes> for SharedBytes {
    fn from(bytes: Bytes) -> Self {
        Self(Some(bytes))
    }
}

impl From<Vec<u8>> for SharedBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Some(Bytes::from(bytes)))
    }
}

impl From<&[u8]> for SharedBytes {
    fn from(bytes: &[u8]) -> Self {
        Self::copy_from_slice(bytes)
    }
}

impl From<&str> for SharedBytes {
    fn from(s: &str) -> Self {
        Self::copy_from_slice(s.as_bytes())
    }
}
