//! Cause references.
//!
//! A cause is a global reference to the class whose initializer (or the
//! caller-supplied marker object) was executing on a thread when an
//! allocation or heap write happened. The host issues these handles; the
//! engine only stores and compares them.

use std::num::NonZeroU64;

/// A non-null global-reference handle naming a cause.
///
/// Handles are opaque: the engine never dereferences them, it only hands
/// them back to the consumer. The null handle is represented as
/// `Option::<CauseRef>::None` so a `CauseRef` itself is always meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CauseRef(NonZeroU64);

impl CauseRef {
    /// Wrap a raw handle. Returns `None` for the null handle.
    #[inline]
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Get the raw handle value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0.get()
    }
}
