//! Lock-free per-slot write history.
//!
//! Each reference-typed field and each array slot the agent has seen a
//! write to owns one `WriteHistory`: an append-only singly linked list of
//! (value id, cause) pairs with the newest entry at the head.
//!
//! # Design
//!
//! Appending allocates a node, links it to the current head and installs it
//! with a compare-and-swap, retrying with the freshly observed head on
//! failure. Lookups snapshot the head and walk `prev` links; the suffix
//! behind any observed head is immutable, so readers never race with
//! writers and never block them.
//!
//! The list is never shrunk. Nodes are freed only when the owning history
//! is dropped, which happens when the owning object context is destroyed;
//! at that point the object-free serialization guarantees no reader still
//! holds a node pointer, so no hazard-pointer scheme is needed.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::{CauseRef, ObjectId};

struct WriteNode {
    prev: *mut WriteNode,
    value: ObjectId,
    cause: CauseRef,
}

/// Append-only list of (value id, cause) pairs for one field or slot.
pub struct WriteHistory {
    head: AtomicPtr<WriteNode>,
}

impl WriteHistory {
    /// Create an empty history.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Record that `value` was written to this slot under `cause`.
    ///
    /// Safe to call from any number of threads concurrently; the only
    /// synchronization is the head compare-and-swap.
    pub fn record(&self, value: ObjectId, cause: CauseRef) {
        let node = Box::into_raw(Box::new(WriteNode {
            prev: ptr::null_mut(),
            value,
            cause,
        }));

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // The node is not visible to anyone else until the CAS lands.
            unsafe { (*node).prev = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Find the cause of the most recent write of `value` to this slot.
    ///
    /// Walks from the head, so the first match is the newest one. Returns
    /// `None` if `value` was never recorded here.
    pub fn lookup(&self, value: ObjectId) -> Option<CauseRef> {
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if node.value == value {
                return Some(node.cause);
            }
            cur = node.prev;
        }
        None
    }

    /// Number of recorded writes. Linear walk; intended for tests and
    /// teardown accounting, not hot paths.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            count += 1;
            cur = unsafe { (*cur).prev };
        }
        count
    }

    /// Whether no write has been recorded.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Default for WriteHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WriteHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHistory")
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for WriteHistory {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // Reconstruct the box to free the node, then step to the next.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.prev;
        }
    }
}

// SAFETY: the head pointer is only mutated through atomic operations, node
// payloads are immutable after publication, and nodes are freed exclusively
// in Drop, which requires unique ownership of the history.
unsafe impl Send for WriteHistory {}
unsafe impl Sync for WriteHistory {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdAllocator;
    use std::sync::Arc;

    fn cause(n: u64) -> CauseRef {
        CauseRef::new(n).unwrap()
    }

    #[test]
    fn test_empty_lookup() {
        let history = WriteHistory::new();
        let ids = IdAllocator::new();
        assert_eq!(history.lookup(ids.allocate()), None);
        assert!(history.is_empty());
    }

    #[test]
    fn test_single_record() {
        let history = WriteHistory::new();
        let ids = IdAllocator::new();
        let v = ids.allocate();

        history.record(v, cause(10));
        assert_eq!(history.lookup(v), Some(cause(10)));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_newest_match_wins() {
        let history = WriteHistory::new();
        let ids = IdAllocator::new();
        let v = ids.allocate();

        history.record(v, cause(10));
        history.record(v, cause(20));
        assert_eq!(history.lookup(v), Some(cause(20)));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_distinct_values_keep_distinct_causes() {
        let history = WriteHistory::new();
        let ids = IdAllocator::new();
        let v1 = ids.allocate();
        let v2 = ids.allocate();

        history.record(v1, cause(10));
        history.record(v2, cause(20));
        assert_eq!(history.lookup(v1), Some(cause(10)));
        assert_eq!(history.lookup(v2), Some(cause(20)));
    }

    #[test]
    fn test_unrecorded_value_is_absent() {
        let history = WriteHistory::new();
        let ids = IdAllocator::new();
        let recorded = ids.allocate();
        let other = ids.allocate();

        history.record(recorded, cause(10));
        assert_eq!(history.lookup(other), None);
    }

    #[test]
    fn test_concurrent_appends_all_land() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;

        let history = Arc::new(WriteHistory::new());
        let ids = Arc::new(IdAllocator::new());

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let history = Arc::clone(&history);
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || {
                    let mut recorded = Vec::with_capacity(PER_THREAD);
                    for _ in 0..PER_THREAD {
                        let v = ids.allocate();
                        history.record(v, cause(t as u64 + 1));
                        recorded.push(v);
                    }
                    recorded
                })
            })
            .collect();

        for (t, handle) in handles.into_iter().enumerate() {
            for v in handle.join().unwrap() {
                assert_eq!(history.lookup(v), Some(cause(t as u64 + 1)));
            }
        }
        assert_eq!(history.len(), THREADS * PER_THREAD);
    }

    #[test]
    fn test_reads_race_with_writes() {
        let history = Arc::new(WriteHistory::new());
        let ids = Arc::new(IdAllocator::new());
        let probe = ids.allocate();
        history.record(probe, cause(99));

        let writer = {
            let history = Arc::clone(&history);
            let ids = Arc::clone(&ids);
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    history.record(ids.allocate(), cause(1));
                }
            })
        };

        // The probe entry is in the immutable suffix; it must stay visible
        // no matter how many appends land concurrently.
        for _ in 0..2000 {
            assert_eq!(history.lookup(probe), Some(cause(99)));
        }
        writer.join().unwrap();
    }
}
