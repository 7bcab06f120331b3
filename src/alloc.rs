use std::cell::Cell;

use crate::kv::KeyValue;
use crate::shared_bytes::SharedBytes;

/// Produces the byte buffers a store hands out, and counts what it makes.
///
/// Every store exposes its allocator so callers can build keys and values
/// compatible with that store. Buffers are reference-counted, so copying
/// between stores that happen to share an allocator is free.
#[derive(Debug, Default)]
pub struct ByteAllocator {
    allocations: Cell<u64>,
    bytes_allocated: Cell<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub allocations: u64,
    pub bytes_allocated: u64,
}

impl ByteAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, data: &[u8]) -> SharedBytes {
        self.allocations.set(self.allocations.get() + 1);
        self.bytes_allocated
            .set(self.bytes_allocated.get() + data.len() as u64);
        SharedBytes::copy_from_slice(data)
    }

    pub fn allocate_kv(&self, key: &[u8], value: &[u8]) -> KeyValue {
        KeyValue::new(self.allocate(key), self.allocate(value))
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocations: self.allocations.get(),
            bytes_allocated: self.bytes_allocated.get(),
        }
    }
}
