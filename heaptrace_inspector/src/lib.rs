//! Abstract host-runtime inspection capabilities.
//!
//! The attribution engine never talks to a concrete managed runtime; it
//! talks to an [`Inspector`], a trait with one method per capability the
//! host tool interface provides: object tagging, class and field
//! reflection, frame inspection, watch installation, reference management
//! and error raising.
//!
//! Handles ([`ObjectRef`], [`ClassRef`], [`FieldRef`], [`MethodRef`],
//! [`ThreadRef`]) are opaque words issued by the host. The engine stores
//! and compares them but never interprets their bits.
//!
//! The [`mock`] module provides an in-memory runtime that implements the
//! full trait for tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod mock;

use std::fmt;

// =============================================================================
// Handles
// =============================================================================

/// Opaque handle to a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectRef(pub u64);

impl ObjectRef {
    /// Raw handle value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Reinterpret this object as a class mirror.
    ///
    /// Valid only when the host has confirmed the object is a class
    /// (by signature or by an explicit class query).
    #[inline]
    pub fn as_class(self) -> ClassRef {
        ClassRef(self.0)
    }
}

/// Opaque handle to a class. Every class handle is also a valid handle to
/// the class-mirror object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ClassRef(pub u64);

impl ClassRef {
    /// Raw handle value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// The class-mirror object for this class.
    #[inline]
    pub fn as_object(self) -> ObjectRef {
        ObjectRef(self.0)
    }
}

/// Opaque handle to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct FieldRef(pub u64);

/// Opaque handle to a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MethodRef(pub u64);

/// Opaque handle to a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ThreadRef(pub u64);

/// Opaque handle to a weak reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct WeakRef(pub u64);

// =============================================================================
// Flag Sets
// =============================================================================

bitflags::bitflags! {
    /// Progress of a class through loading and initialization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassStatus: u32 {
        /// Verified and prepared; fields exist.
        const PREPARED = 1 << 0;
        /// Static initializer has completed.
        const INITIALIZED = 1 << 1;
        /// Initialization failed.
        const ERROR = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Access modifiers of a field, in the class-file encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldModifiers: u32 {
        /// The field is static.
        const STATIC = 0x0008;
        /// The field is final.
        const FINAL = 0x0010;
        /// The field is volatile.
        const VOLATILE = 0x0040;
    }
}

bitflags::bitflags! {
    /// Capabilities the engine requests from the host at load time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        /// Attach and read one tag word per object.
        const TAG_OBJECTS = 1 << 0;
        /// Deliver object-free notifications for tagged objects.
        const OBJECT_FREE_EVENTS = 1 << 1;
        /// Deliver frame-pop notifications on request.
        const FRAME_POP_EVENTS = 1 << 2;
        /// Install per-field write watches.
        const FIELD_WATCHES = 1 << 3;
        /// Rewrite class files as they load.
        const CLASS_TRANSFORM = 1 << 4;
        /// Deliver thread start and end events.
        const THREAD_LIFECYCLE = 1 << 5;
        /// Deliver allocation notifications.
        const ALLOCATION_EVENTS = 1 << 6;
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Numeric error codes returned by the host for ill-formed requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InspectorErrorCode {
    /// The object handle is stale or invalid.
    InvalidObject = 20,
    /// The class handle is stale or invalid.
    InvalidClass = 21,
    /// The field handle does not belong to the class.
    InvalidField = 25,
    /// The thread handle is stale or invalid.
    InvalidThread = 10,
    /// The requested frame depth is past the end of the stack.
    NoMoreFrames = 31,
    /// The watch is already installed.
    Duplicate = 103,
    /// The request is not valid in the current phase.
    WrongPhase = 112,
    /// A required capability was not granted.
    MissingCapability = 99,
    /// The host ran out of memory serving the request.
    OutOfMemory = 110,
    /// Catch-all for internal host failures.
    Internal = 113,
}

/// An inspection request the host rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectorError {
    /// Why the request was rejected.
    pub code: InspectorErrorCode,
}

impl InspectorError {
    /// Build an error from a code.
    #[inline]
    pub const fn new(code: InspectorErrorCode) -> Self {
        Self { code }
    }

    /// Numeric value of the code.
    #[inline]
    pub fn code_value(self) -> u32 {
        self.code as u32
    }

    /// Whether this is the duplicate-watch indicator.
    #[inline]
    pub fn is_duplicate(self) -> bool {
        self.code == InspectorErrorCode::Duplicate
    }
}

impl fmt::Display for InspectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inspector error {:?} ({})", self.code, self.code_value())
    }
}

impl std::error::Error for InspectorError {}

/// Result alias for inspection requests.
pub type InspectorResult<T> = Result<T, InspectorError>;

// =============================================================================
// The Capability Trait
// =============================================================================

/// The host-runtime tool interface, reduced to the capabilities the
/// attribution engine consumes.
///
/// Implementations must be safe to call from any thread; event handlers
/// run on whichever thread triggered the event.
pub trait Inspector: Send + Sync {
    // -- capabilities -----------------------------------------------------

    /// Request the given capability set. All-or-nothing.
    fn add_capabilities(&self, caps: Capabilities) -> InspectorResult<()>;

    /// Release everything acquired by [`Inspector::add_capabilities`].
    fn relinquish_capabilities(&self) -> InspectorResult<()>;

    // -- object tagging ---------------------------------------------------

    /// Read the tag word attached to `obj`. Zero means untagged.
    fn get_tag(&self, obj: ObjectRef) -> InspectorResult<u64>;

    /// Attach a tag word to `obj`.
    fn set_tag(&self, obj: ObjectRef, word: u64) -> InspectorResult<()>;

    /// Visit the tag word of every live tagged object.
    fn iterate_tagged(&self, visit: &mut dyn FnMut(u64)) -> InspectorResult<()>;

    // -- references -------------------------------------------------------

    /// Promote `obj` to a global reference that outlives the current frame.
    fn new_global_ref(&self, obj: ObjectRef) -> InspectorResult<ObjectRef>;

    /// Create a weak reference that does not keep `obj` alive.
    fn new_weak_ref(&self, obj: ObjectRef) -> InspectorResult<WeakRef>;

    /// Resolve a weak reference; `None` once the target is collected.
    fn weak_ref_target(&self, weak: WeakRef) -> InspectorResult<Option<ObjectRef>>;

    /// Release a weak reference handle.
    fn delete_weak_ref(&self, weak: WeakRef) -> InspectorResult<()>;

    /// Whether two handles name the same object.
    fn is_same_object(&self, a: ObjectRef, b: ObjectRef) -> bool;

    // -- classes and fields -----------------------------------------------

    /// The class of `obj`.
    fn object_class(&self, obj: ObjectRef) -> InspectorResult<ClassRef>;

    /// The type signature of `cls`, e.g. `Ljava/util/List;` or `[I`.
    fn class_signature(&self, cls: ClassRef) -> InspectorResult<String>;

    /// The direct superclass, or `None` for the root class.
    fn superclass(&self, cls: ClassRef) -> InspectorResult<Option<ClassRef>>;

    /// Loading and initialization status of `cls`.
    fn class_status(&self, cls: ClassRef) -> InspectorResult<ClassStatus>;

    /// The fields declared directly by `cls` (no inherited fields).
    fn class_fields(&self, cls: ClassRef) -> InspectorResult<Vec<FieldRef>>;

    /// The type signature of a declared field.
    fn field_signature(&self, cls: ClassRef, field: FieldRef) -> InspectorResult<String>;

    /// The access modifiers of a declared field.
    fn field_modifiers(&self, cls: ClassRef, field: FieldRef) -> InspectorResult<FieldModifiers>;

    /// Element count of an array object.
    fn array_length(&self, obj: ObjectRef) -> InspectorResult<usize>;

    /// Every class currently loaded.
    fn loaded_classes(&self) -> InspectorResult<Vec<ClassRef>>;

    /// Whether `cls` accepts retransformation.
    fn is_modifiable_class(&self, cls: ClassRef) -> InspectorResult<bool>;

    /// Request retransformation of `cls`, replaying the class-file load
    /// hook for it.
    fn retransform_class(&self, cls: ClassRef) -> InspectorResult<()>;

    // -- threads and frames -----------------------------------------------

    /// Handle of the calling thread.
    fn current_thread(&self) -> InspectorResult<ThreadRef>;

    /// The method executing at `depth` frames below the top of `thread`'s
    /// stack (0 is the current frame).
    fn frame_location(&self, thread: ThreadRef, depth: usize) -> InspectorResult<MethodRef>;

    /// The class that declares `method`.
    fn method_declaring_class(&self, method: MethodRef) -> InspectorResult<ClassRef>;

    /// Ask for a one-shot notification when the frame at `depth` returns.
    fn notify_frame_pop(&self, thread: ThreadRef, depth: usize) -> InspectorResult<()>;

    // -- watches ----------------------------------------------------------

    /// Install a modification watch on one field. Returns the
    /// duplicate-watch code if the watch is already installed.
    fn set_field_watch(&self, cls: ClassRef, field: FieldRef) -> InspectorResult<()>;

    /// Enable or disable delivery of field-write notifications to handlers
    /// for events triggered by `thread`.
    fn set_thread_write_notifications(
        &self,
        thread: ThreadRef,
        enabled: bool,
    ) -> InspectorResult<()>;

    /// Interpose on the host's array-element-store primitive so element
    /// writes become observable.
    fn install_array_interposer(&self) -> InspectorResult<()>;

    // -- raising into the managed layer -----------------------------------

    /// Raise a generic error to the managed layer.
    fn raise_error(&self, message: &str);

    /// Raise an out-of-memory condition to the managed layer.
    fn raise_out_of_memory(&self);

    /// Raise an I/O error to the managed layer.
    fn raise_io_error(&self, message: &str);
}
