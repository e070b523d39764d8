//! Core data structures for the heaptrace attribution engine.
//!
//! This crate holds the leaf pieces that the agent builds on:
//!
//! - **Object tags** ([`ObjectTag`]): one 64-bit word per observed object,
//!   encoding either a bare allocation cause or a pointer to a full
//!   per-object context.
//! - **Write histories** ([`WriteHistory`]): lock-free append-only lists of
//!   (value id, cause) pairs, one per field or array slot.
//! - **Object ids** ([`ObjectId`], [`IdAllocator`]): monotonically assigned
//!   64-bit identifiers that survive garbage collection of the object they
//!   named.
//! - **Cause references** ([`CauseRef`]): non-null global-reference handles
//!   to the class initializer (or caller-supplied marker) held responsible
//!   for an allocation or heap write.
//!
//! Nothing in this crate talks to the host runtime; the inspector surface
//! lives in `heaptrace_inspector` and the engine itself in
//! `heaptrace_agent`.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cause;
mod error;
mod history;
mod id;
mod stats;
mod tag;

pub use cause::CauseRef;
pub use error::AgentError;
pub use history::WriteHistory;
pub use id::{IdAllocator, ObjectId};
pub use stats::AgentStats;
pub use tag::ObjectTag;
