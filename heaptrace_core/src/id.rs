//! Object identifiers.
//!
//! Every object the agent attaches a full context to receives a 64-bit id.
//! Ids are handed out monotonically and never reused, even after the object
//! they named has been collected, so write-history entries stay unambiguous
//! for the whole agent lifetime.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of an object that has (or had) a full context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Get the raw id value. Always non-zero.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Monotonic allocator for [`ObjectId`]s.
///
/// A single fetch-and-add per allocation; shared freely between threads.
/// Id 0 is never issued.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Create an allocator whose first id is 1.
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    #[inline]
    pub fn allocate(&self) -> ObjectId {
        ObjectId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let alloc = IdAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert!(b.raw() > a.raw());
        assert_eq!(alloc.issued(), 2);
    }

    #[test]
    fn test_zero_is_never_issued() {
        let alloc = IdAllocator::new();
        assert_eq!(alloc.allocate().raw(), 1);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let alloc = Arc::new(IdAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| alloc.allocate().raw()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
