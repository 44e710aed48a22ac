//! Append-only arena for variable-size accumulator state
//!
//! Accumulator states are fixed-size payloads living in caller-owned byte
//! buffers. Anything variable-length (collected values, strings) spills into
//! an arena owned by the caller for the lifetime of the whole query. The
//! arena never moves previously returned memory and strictly outlives every
//! state that references it.

use bumpalo::Bump;
use std::alloc::Layout;
use std::ptr::NonNull;

/// Alignment used by the raw allocation entry point, malloc-style.
const RAW_ALLOC_ALIGN: usize = 16;

/// Growable, append-only memory region.
///
/// The arena is a single-writer-at-a-time resource per aggregation context;
/// the framework imposes no locking of its own.
pub struct Arena {
    bump: Bump,
}

impl Arena {
    pub fn new() -> Self {
        Self { bump: Bump::new() }
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            bump: Bump::with_capacity(bytes),
        }
    }

    /// Raw allocation entry point. Returned memory is uninitialized,
    /// 16-byte aligned and valid until the arena is dropped.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        let layout = Layout::from_size_align(size.max(1), RAW_ALLOC_ALIGN)
            .expect("arena allocation size overflow");
        self.bump.alloc_layout(layout)
    }

    /// Copy a slice into the arena and return the stable copy.
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> &[T] {
        self.bump.alloc_slice_copy(src)
    }

    /// Copy a string into the arena and return the stable copy.
    pub fn alloc_str(&self, s: &str) -> &str {
        self.bump.alloc_str(s)
    }

    /// Total bytes reserved from the underlying allocator.
    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("allocated_bytes", &self.allocated_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_allocation_is_stable_and_aligned() {
        let arena = Arena::new();

        let first = arena.allocate(24);
        assert_eq!(first.as_ptr() as usize % RAW_ALLOC_ALIGN, 0);
        unsafe { first.as_ptr().write_bytes(0xAB, 24) };

        // Later allocations must not move earlier ones.
        for _ in 0..1000 {
            arena.allocate(64);
        }
        let bytes = unsafe { std::slice::from_raw_parts(first.as_ptr(), 24) };
        assert!(bytes.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_slice_copy() {
        let arena = Arena::with_capacity(1024);
        let copied = arena.alloc_slice_copy(&[1i64, 2, 3]);
        assert_eq!(copied, &[1, 2, 3]);
        assert_eq!(arena.alloc_str("agg"), "agg");
    }
}
