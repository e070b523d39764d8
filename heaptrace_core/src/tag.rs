//! The two-mode object tag word.
//!
//! The inspector lets the agent attach one 64-bit word to every object it
//! observes. That word is the whole per-object footprint until a full
//! context becomes necessary, so it is packed:
//!
//! ```text
//! bit 0:     complex flag
//! bits 1-63: payload
//! ```
//!
//! With `complex = 0` the payload is a cause handle shifted left by one:
//! the object was allocated under that cause but has never been written
//! into. With `complex = 1` the payload is the address of a heap-allocated
//! object context with bit 0 set; context allocations are at least 2-byte
//! aligned so the low bit is free, which is asserted on encode.
//!
//! The zero word is the untagged state. Tags are only ever upgraded from
//! cause-only to complex, never downgraded.

use crate::CauseRef;

const COMPLEX_BIT: u64 = 1;

/// One machine word of per-object state.
///
/// `ObjectTag` is a plain value; reading and writing the word on an object
/// goes through the inspector, and interpretation of a complex payload is
/// the agent's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ObjectTag(u64);

impl ObjectTag {
    /// The untagged state.
    pub const UNTAGGED: Self = Self(0);

    /// Reconstruct a tag from the raw word stored on an object.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw word to store on an object.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Encode a cause-only tag.
    ///
    /// # Panics
    ///
    /// Panics if the cause handle does not fit in 63 bits.
    #[inline]
    pub fn cause_only(cause: CauseRef) -> Self {
        let raw = cause.raw();
        assert!(raw < (1 << 63), "cause handle exceeds 63 bits: {raw:#x}");
        Self(raw << 1)
    }

    /// Encode a complex tag from a context address.
    ///
    /// # Panics
    ///
    /// Panics if the address has its low bit set; contexts are boxed and
    /// thus at least 2-byte aligned, so a set low bit means the caller is
    /// installing something that is not a context pointer.
    #[inline]
    pub fn complex(context_addr: usize) -> Self {
        assert_eq!(
            context_addr & COMPLEX_BIT as usize,
            0,
            "misaligned context pointer: {context_addr:#x}"
        );
        Self(context_addr as u64 | COMPLEX_BIT)
    }

    /// Whether this is the untagged state.
    #[inline]
    pub const fn is_untagged(self) -> bool {
        self.0 == 0
    }

    /// Whether the payload is a context pointer.
    #[inline]
    pub const fn is_complex(self) -> bool {
        self.0 & COMPLEX_BIT != 0
    }

    /// The cause carried by a cause-only tag.
    ///
    /// Returns `None` for untagged and complex tags; the cause of a complex
    /// tag lives in the context's `alloc_reason` and is recovered by the
    /// agent.
    #[inline]
    pub fn cause(self) -> Option<CauseRef> {
        if self.is_complex() {
            return None;
        }
        CauseRef::new(self.0 >> 1)
    }

    /// The context address carried by a complex tag.
    #[inline]
    pub fn context_addr(self) -> Option<usize> {
        if self.is_complex() {
            Some((self.0 & !COMPLEX_BIT) as usize)
        } else {
            None
        }
    }
}

impl Default for ObjectTag {
    fn default() -> Self {
        Self::UNTAGGED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged() {
        let tag = ObjectTag::UNTAGGED;
        assert!(tag.is_untagged());
        assert!(!tag.is_complex());
        assert_eq!(tag.cause(), None);
        assert_eq!(tag.context_addr(), None);
        assert_eq!(tag.raw(), 0);
    }

    #[test]
    fn test_cause_only_round_trip() {
        let cause = CauseRef::new(0x1234).unwrap();
        let tag = ObjectTag::cause_only(cause);
        assert!(!tag.is_untagged());
        assert!(!tag.is_complex());
        assert_eq!(tag.cause(), Some(cause));
        assert_eq!(tag.context_addr(), None);
    }

    #[test]
    fn test_complex_round_trip() {
        let addr = 0xdead_b000usize;
        let tag = ObjectTag::complex(addr);
        assert!(tag.is_complex());
        assert!(!tag.is_untagged());
        assert_eq!(tag.context_addr(), Some(addr));
        assert_eq!(tag.cause(), None);
    }

    #[test]
    fn test_raw_survives_storage() {
        let cause = CauseRef::new(7).unwrap();
        let tag = ObjectTag::cause_only(cause);
        let restored = ObjectTag::from_raw(tag.raw());
        assert_eq!(restored, tag);
    }

    #[test]
    #[should_panic(expected = "misaligned context pointer")]
    fn test_misaligned_context_rejected() {
        let _ = ObjectTag::complex(0x1001);
    }

    #[test]
    #[should_panic(expected = "cause handle exceeds 63 bits")]
    fn test_oversized_cause_rejected() {
        let cause = CauseRef::new(1 << 63).unwrap();
        let _ = ObjectTag::cause_only(cause);
    }
}
