//! Per-thread cause tracking.
//!
//! Each thread carries a stack of the class initializers currently
//! executing on it, plus an optional ambient cause installed by the host
//! through `set_cause`. The stack entries are global references promoted
//! at push time; popping deliberately does not release them because write
//! histories anywhere in the heap may still quote them.

use smallvec::SmallVec;

use heaptrace_core::CauseRef;

/// Cause state owned by one thread.
///
/// Only the owning thread mutates its state; the surrounding map provides
/// the per-entry exclusivity.
#[derive(Debug, Default)]
pub struct ThreadState {
    /// Innermost active initializer last.
    initializers: SmallVec<[CauseRef; 8]>,
    ambient: Option<CauseRef>,
    ambient_applies_to_writes: bool,
    /// Whether field-write notifications are currently enabled for this
    /// thread. Bookkeeping for the watch-toggling optimization.
    watch_enabled: bool,
}

impl ThreadState {
    /// Create state with no cause.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an initializer (or custom marker) global reference.
    pub fn push(&mut self, cause: CauseRef) {
        self.initializers.push(cause);
    }

    /// Pop the innermost entry. The global reference is leaked on purpose.
    pub fn pop(&mut self) -> Option<CauseRef> {
        self.initializers.pop()
    }

    /// The innermost active initializer.
    #[inline]
    pub fn top(&self) -> Option<CauseRef> {
        self.initializers.last().copied()
    }

    /// Depth of the initializer stack.
    #[inline]
    pub fn depth(&self) -> usize {
        self.initializers.len()
    }

    /// Install or clear the ambient cause.
    ///
    /// Callers must only do this while the initializer stack is empty.
    pub fn set_ambient(&mut self, cause: Option<CauseRef>, applies_to_writes: bool) {
        debug_assert!(
            self.initializers.is_empty(),
            "ambient cause set while initializers are active"
        );
        self.ambient = cause;
        self.ambient_applies_to_writes = applies_to_writes;
    }

    /// The cause currently in effect on this thread.
    ///
    /// The initializer-stack top wins when present. Otherwise the ambient
    /// cause is surfaced, except for heap-write attribution when it was
    /// installed as allocation-only.
    pub fn reason(&self, for_heap_write: bool) -> Option<CauseRef> {
        if let Some(top) = self.top() {
            return Some(top);
        }
        match self.ambient {
            Some(cause) if !for_heap_write || self.ambient_applies_to_writes => Some(cause),
            _ => None,
        }
    }

    /// Read the watch-enablement flag.
    #[inline]
    pub fn watch_enabled(&self) -> bool {
        self.watch_enabled
    }

    /// Update the watch-enablement flag.
    #[inline]
    pub fn set_watch_enabled(&mut self, enabled: bool) {
        self.watch_enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cause(n: u64) -> CauseRef {
        CauseRef::new(n).unwrap()
    }

    #[test]
    fn test_empty_state_has_no_reason() {
        let state = ThreadState::new();
        assert_eq!(state.reason(false), None);
        assert_eq!(state.reason(true), None);
    }

    #[test]
    fn test_top_of_stack_wins() {
        let mut state = ThreadState::new();
        state.push(cause(1));
        state.push(cause(2));
        assert_eq!(state.reason(false), Some(cause(2)));
        assert_eq!(state.reason(true), Some(cause(2)));
    }

    #[test]
    fn test_push_pop_restores_previous_reason() {
        let mut state = ThreadState::new();
        state.set_ambient(Some(cause(9)), true);
        let before = state.reason(true);

        for i in 0..5 {
            state.push(cause(10 + i));
        }
        for _ in 0..5 {
            state.pop();
        }
        assert_eq!(state.reason(true), before);
        assert_eq!(state.reason(false), before);
    }

    #[test]
    fn test_ambient_applies_to_writes() {
        let mut state = ThreadState::new();
        state.set_ambient(Some(cause(5)), true);
        assert_eq!(state.reason(false), Some(cause(5)));
        assert_eq!(state.reason(true), Some(cause(5)));
    }

    #[test]
    fn test_ambient_allocation_only() {
        let mut state = ThreadState::new();
        state.set_ambient(Some(cause(5)), false);
        assert_eq!(state.reason(false), Some(cause(5)));
        assert_eq!(state.reason(true), None);
    }

    #[test]
    fn test_initializer_shadows_ambient() {
        let mut state = ThreadState::new();
        state.set_ambient(Some(cause(5)), false);
        state.push(cause(7));
        assert_eq!(state.reason(true), Some(cause(7)));
        state.pop();
        assert_eq!(state.reason(true), None);
        assert_eq!(state.reason(false), Some(cause(5)));
    }

    #[test]
    fn test_set_ambient_is_idempotent() {
        let mut state = ThreadState::new();
        state.set_ambient(Some(cause(5)), false);
        state.set_ambient(Some(cause(5)), false);
        assert_eq!(state.reason(false), Some(cause(5)));
        assert_eq!(state.reason(true), None);
    }

    #[test]
    fn test_clearing_ambient() {
        let mut state = ThreadState::new();
        state.set_ambient(Some(cause(5)), true);
        state.set_ambient(None, false);
        assert_eq!(state.reason(false), None);
    }
}
