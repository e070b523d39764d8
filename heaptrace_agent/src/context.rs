//! Per-object provenance records.
//!
//! A full context is attached to an object the first time something must
//! be remembered about it beyond a bare allocation cause: a write into one
//! of its slots, or a write of the object itself somewhere. Contexts come
//! in three shapes sharing a common header:
//!
//! - **Instance**: write histories for the nonstatic reference fields of
//!   the object's class, indexed through a shared [`ClassInfo`].
//! - **Array**: write histories for each element slot, bounds fixed at
//!   creation.
//! - **Class**: the class mirror is an object too, so this composes an
//!   instance table for the mirror's own fields, and adds a lazily
//!   materialized table for the class's static fields plus the
//!   `made_reachable_by` back-pointer to the initializer that first
//!   triggered this class's initialization.
//!
//! The header carries the object's id and its allocation reason; both are
//! write-once. Contexts are reached through raw pointers stored in tag
//! words, created under the process-wide creation mutex and destroyed only
//! on object-free or teardown, which is what makes the raw sharing sound.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use heaptrace_core::{AgentError, CauseRef, ObjectId, WriteHistory};
use heaptrace_inspector::{ClassRef, FieldRef, Inspector, WeakRef};

use crate::class_info::ClassInfo;
use crate::environment::inspect;

fn history_table(len: usize) -> Box<[WriteHistory]> {
    (0..len).map(|_| WriteHistory::new()).collect()
}

// =============================================================================
// Instance Table
// =============================================================================

/// Write histories for the nonstatic fields of one object.
#[derive(Debug)]
pub struct InstanceContext {
    info: Arc<ClassInfo>,
    histories: Box<[WriteHistory]>,
}

impl InstanceContext {
    /// Create a table sized to the class's nonstatic field count.
    pub fn new(info: Arc<ClassInfo>) -> Self {
        let histories = history_table(info.nonstatic_len());
        Self { info, histories }
    }

    /// The shared field layout.
    pub fn info(&self) -> &Arc<ClassInfo> {
        &self.info
    }

    fn record(&self, field: FieldRef, value: ObjectId, cause: CauseRef) {
        match self.info.nonstatic_index(field) {
            Some(index) => self.histories[index].record(value, cause),
            // Can occur for fields of substituted classes.
            None => debug_assert!(false, "write to field absent from layout"),
        }
    }

    fn lookup(&self, field: FieldRef, value: ObjectId) -> Option<CauseRef> {
        let index = self.info.nonstatic_index(field)?;
        self.histories[index].lookup(value)
    }
}

// =============================================================================
// Array Table
// =============================================================================

/// Write histories for the element slots of one array.
#[derive(Debug)]
pub struct ArrayContext {
    histories: Box<[WriteHistory]>,
}

impl ArrayContext {
    /// Create a table with one history per element.
    pub fn new(length: usize) -> Self {
        Self {
            histories: history_table(length),
        }
    }

    /// Element count the table was sized for.
    pub fn length(&self) -> usize {
        self.histories.len()
    }

    fn record(&self, index: usize, value: ObjectId, cause: CauseRef) {
        assert!(
            index < self.histories.len(),
            "array write index {index} out of bounds (length {})",
            self.histories.len()
        );
        self.histories[index].record(value, cause);
    }

    fn lookup(&self, index: usize, value: ObjectId) -> Option<CauseRef> {
        assert!(
            index < self.histories.len(),
            "array query index {index} out of bounds (length {})",
            self.histories.len()
        );
        self.histories[index].lookup(value)
    }
}

// =============================================================================
// Class Statics Table
// =============================================================================

/// Lazily materialized static-field table of a class.
#[derive(Debug)]
struct StaticTable {
    info: Arc<ClassInfo>,
    histories: Box<[WriteHistory]>,
}

impl StaticTable {
    fn new(info: Arc<ClassInfo>) -> Self {
        let histories = history_table(info.static_len());
        Self { info, histories }
    }
}

// =============================================================================
// Class Context
// =============================================================================

/// Context of a class mirror.
#[derive(Debug)]
pub struct ClassContext {
    /// The mirror's role as a plain object with fields of its own.
    mirror: InstanceContext,
    /// Weak reference to the mirror, used to rebuild field indices after
    /// the eager layout was not requested at creation.
    class_object: WeakRef,
    /// Own static-field table; null until first static access.
    statics: AtomicPtr<StaticTable>,
    /// The initializer that first caused this class to initialize.
    /// Zero until set; written at most once.
    made_reachable_by: AtomicU64,
}

impl ClassContext {
    /// Create a class context.
    ///
    /// `declaring_info` is the layout of the mirror's own class (the
    /// class-mirror class). When `own_info` is given the static table is
    /// materialized eagerly; otherwise it waits for the first static
    /// read or write.
    pub fn new(
        inspector: &dyn Inspector,
        cls: ClassRef,
        declaring_info: Arc<ClassInfo>,
        own_info: Option<Arc<ClassInfo>>,
    ) -> Result<Self, AgentError> {
        let class_object = inspect("new_weak_ref", inspector.new_weak_ref(cls.as_object()))?;
        let statics = match own_info {
            Some(info) => AtomicPtr::new(Box::into_raw(Box::new(StaticTable::new(info)))),
            None => AtomicPtr::new(ptr::null_mut()),
        };
        Ok(Self {
            mirror: InstanceContext::new(declaring_info),
            class_object,
            statics,
            made_reachable_by: AtomicU64::new(0),
        })
    }

    /// The static table, materializing it on first use.
    ///
    /// Materialization is a double-check-then-CAS: the loser of a race
    /// drops its freshly built draft and adopts the winner's table.
    fn statics(&self, inspector: &dyn Inspector) -> Result<&StaticTable, AgentError> {
        let existing = self.statics.load(Ordering::Acquire);
        if !existing.is_null() {
            // SAFETY: a published table is never freed before the context.
            return Ok(unsafe { &*existing });
        }

        let target = inspect(
            "weak_ref_target",
            inspector.weak_ref_target(self.class_object),
        )?;
        let cls = target
            .ok_or_else(|| AgentError::inspector(
                heaptrace_inspector::InspectorErrorCode::InvalidClass as u32,
                "weak_ref_target",
            ))?
            .as_class();

        let info = ClassInfo::build(inspector, cls)?;
        let draft = Box::into_raw(Box::new(StaticTable::new(info)));
        match self.statics.compare_exchange(
            ptr::null_mut(),
            draft,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // SAFETY: just published, never freed before the context.
            Ok(_) => Ok(unsafe { &*draft }),
            Err(winner) => {
                // SAFETY: the draft was never published; we still own it.
                drop(unsafe { Box::from_raw(draft) });
                // SAFETY: as above for published tables.
                Ok(unsafe { &*winner })
            }
        }
    }

    /// The class's full field layout, materializing it if needed.
    pub fn class_info(&self, inspector: &dyn Inspector) -> Result<Arc<ClassInfo>, AgentError> {
        Ok(Arc::clone(&self.statics(inspector)?.info))
    }

    /// Record a static-field write.
    pub fn register_static_write(
        &self,
        inspector: &dyn Inspector,
        field: FieldRef,
        value: ObjectId,
        cause: CauseRef,
    ) -> Result<(), AgentError> {
        let table = self.statics(inspector)?;
        match table.info.static_index(field) {
            Some(index) => table.histories[index].record(value, cause),
            None => debug_assert!(false, "static write to field absent from layout"),
        }
        Ok(())
    }

    /// Cause of the most recent static write of `value` to `field`.
    pub fn static_write_reason(
        &self,
        inspector: &dyn Inspector,
        field: FieldRef,
        value: ObjectId,
    ) -> Result<Option<CauseRef>, AgentError> {
        let table = self.statics(inspector)?;
        Ok(table
            .info
            .static_index(field)
            .and_then(|index| table.histories[index].lookup(value)))
    }

    /// The initializer recorded as having triggered this class.
    #[inline]
    pub fn made_reachable_by(&self) -> Option<CauseRef> {
        CauseRef::new(self.made_reachable_by.load(Ordering::Acquire))
    }

    /// Record the triggering initializer if none is recorded yet. A class
    /// whose initializer runs again keeps its original attribution.
    pub fn set_made_reachable_by(&self, cause: CauseRef) {
        let _ = self.made_reachable_by.compare_exchange(
            0,
            cause.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn release_host_refs(&self, inspector: &dyn Inspector) {
        // Best effort: the weak handle may already be stale at teardown.
        let _ = inspector.delete_weak_ref(self.class_object);
    }
}

impl Drop for ClassContext {
    fn drop(&mut self) {
        let table = *self.statics.get_mut();
        if !table.is_null() {
            // SAFETY: dropping the context is the single owner's last use.
            drop(unsafe { Box::from_raw(table) });
        }
    }
}

// =============================================================================
// The Polymorphic Context
// =============================================================================

/// The shape-specific part of a context.
#[derive(Debug)]
pub enum ContextKind {
    /// A plain object.
    Instance(InstanceContext),
    /// An array.
    Array(ArrayContext),
    /// A class mirror.
    Class(ClassContext),
}

/// Per-object provenance record.
#[derive(Debug)]
pub struct ObjectContext {
    id: ObjectId,
    /// Raw cause handle; zero until the first allocation reason lands.
    alloc_reason: AtomicU64,
    kind: ContextKind,
}

impl ObjectContext {
    /// Assemble a context from its parts.
    pub fn new(id: ObjectId, kind: ContextKind) -> Self {
        Self {
            id,
            alloc_reason: AtomicU64::new(0),
            kind,
        }
    }

    /// The object's id.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The allocation reason, if one was ever established.
    #[inline]
    pub fn alloc_reason(&self) -> Option<CauseRef> {
        CauseRef::new(self.alloc_reason.load(Ordering::Acquire))
    }

    /// Establish the allocation reason if none is set. The first reason
    /// wins; later calls change nothing.
    pub fn set_alloc_reason_if_unset(&self, cause: CauseRef) {
        let _ = self.alloc_reason.compare_exchange(
            0,
            cause.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Seed the allocation reason from a pre-existing cause-only tag.
    /// Only valid before the context is published.
    pub fn seed_alloc_reason(&mut self, cause: CauseRef) {
        *self.alloc_reason.get_mut() = cause.raw();
    }

    /// The shape-specific part.
    #[inline]
    pub fn kind(&self) -> &ContextKind {
        &self.kind
    }

    /// This context as a class context, when it is one.
    #[inline]
    pub fn as_class(&self) -> Option<&ClassContext> {
        match &self.kind {
            ContextKind::Class(class) => Some(class),
            _ => None,
        }
    }

    /// Record a nonstatic field write on this object.
    ///
    /// Class mirrors take these too; their own fields are ordinary
    /// nonstatic fields. Writes against an array context are a caller bug
    /// and are dropped.
    pub fn register_field_write(&self, field: FieldRef, value: ObjectId, cause: CauseRef) {
        match &self.kind {
            ContextKind::Instance(instance) => instance.record(field, value, cause),
            ContextKind::Class(class) => class.mirror.record(field, value, cause),
            ContextKind::Array(_) => debug_assert!(false, "field write on array context"),
        }
    }

    /// Cause of the most recent write of `value` into `field`.
    pub fn field_write_reason(&self, field: FieldRef, value: ObjectId) -> Option<CauseRef> {
        match &self.kind {
            ContextKind::Instance(instance) => instance.lookup(field, value),
            ContextKind::Class(class) => class.mirror.lookup(field, value),
            ContextKind::Array(_) => None,
        }
    }

    /// Record an array element write on this object.
    pub fn register_array_write(&self, index: usize, value: ObjectId, cause: CauseRef) {
        match &self.kind {
            ContextKind::Array(array) => array.record(index, value, cause),
            _ => debug_assert!(false, "array write on non-array context"),
        }
    }

    /// Cause of the most recent write of `value` into element `index`.
    pub fn array_write_reason(&self, index: usize, value: ObjectId) -> Option<CauseRef> {
        match &self.kind {
            ContextKind::Array(array) => array.lookup(index, value),
            _ => None,
        }
    }

    /// Release inspector-held references before destruction.
    pub fn release_host_refs(&self, inspector: &dyn Inspector) {
        if let ContextKind::Class(class) = &self.kind {
            class.release_host_refs(inspector);
        }
    }
}
