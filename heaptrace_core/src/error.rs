//! Agent error taxonomy.
//!
//! Errors surfaced by the engine fall into a small set of categories; the
//! entry-point layer translates each into the matching raise on the host
//! side (generic error, out-of-memory, or I/O error) and never lets one
//! unwind across the host boundary.

use std::fmt;

/// An error produced while handling an event or query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The host rejected an inspection request. Treated as a programming
    /// error; `code` is the host's numeric error code and `op` names the
    /// request that failed.
    Inspector {
        /// Host-side error code.
        code: u32,
        /// The inspection operation that was rejected.
        op: &'static str,
    },
    /// Native allocation failed.
    OutOfMemory,
    /// A diagnostic write failed.
    Io(String),
    /// A static-field query named a class that has not finished
    /// initializing.
    ClassNotInitialized,
    /// An event handler panicked; the message is preserved for the host.
    HandlerPanic(String),
}

impl AgentError {
    /// Shorthand for an inspector failure.
    #[inline]
    pub fn inspector(code: u32, op: &'static str) -> Self {
        Self::Inspector { code, op }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Inspector { code, op } => {
                write!(f, "inspector error {code} during {op}")
            }
            AgentError::OutOfMemory => write!(f, "native allocation failed"),
            AgentError::Io(message) => write!(f, "diagnostic I/O failed: {message}"),
            AgentError::ClassNotInitialized => {
                write!(f, "class not initialized yet, field being asked for")
            }
            AgentError::HandlerPanic(message) => write!(f, "handler panicked: {message}"),
        }
    }
}

impl std::error::Error for AgentError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_operation() {
        let err = AgentError::inspector(21, "get_class_fields");
        let text = err.to_string();
        assert!(text.contains("21"));
        assert!(text.contains("get_class_fields"));
    }

    #[test]
    fn test_display_out_of_memory() {
        assert_eq!(AgentError::OutOfMemory.to_string(), "native allocation failed");
    }
}
