//! Agent lifecycle and event dispatch.
//!
//! One [`Environment`] exists per agent load. It owns the inspector
//! handle, the per-thread cause states, the context-creation mutex and the
//! id allocator, and it is the receiver for every host event: allocations,
//! field and array writes, initializer entry hooks, frame pops, object
//! frees, thread lifecycle and class lifecycle.
//!
//! # Context ownership
//!
//! Full contexts live behind raw pointers packed into tag words. They are
//! created here under a process-wide mutex that collapses racing
//! creations, and they are freed in exactly two places: the object-free
//! handler and teardown. The host serializes object death against handler
//! execution, which is what makes handing out `&ObjectContext` borrows
//! from the tag word sound.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use heaptrace_core::{AgentError, AgentStats, CauseRef, IdAllocator, ObjectTag};
use heaptrace_inspector::{
    Capabilities, ClassRef, ClassStatus, FieldRef, Inspector, InspectorErrorCode, InspectorResult,
    MethodRef, ObjectRef, ThreadRef,
};

use crate::class_info::{is_reference_signature, ClassInfo};
use crate::config::AgentConfig;
use crate::context::{ArrayContext, ClassContext, ContextKind, InstanceContext, ObjectContext};
use crate::diagnostics;
use crate::thread_state::ThreadState;

/// Internal name of the class whose methods the rewriter injects calls to.
pub const HOOK_CLASS_NAME: &str = "HeapAssignmentTracingHooks";

/// Classes that must never be rewritten: the hook class itself, and one
/// host-internal class that crashes the host's late compile phase when
/// touched.
const REWRITE_EXCLUDED: [&str; 2] = [
    HOOK_CLASS_NAME,
    "com/oracle/svm/core/jni/functions/JNIFunctionTables",
];

/// Signature of the class-mirror class.
const CLASS_MIRROR_SIGNATURE: &str = "Ljava/lang/Class;";

/// Convert an inspector failure into an [`AgentError`] naming the request.
pub(crate) fn inspect<T>(op: &'static str, result: InspectorResult<T>) -> Result<T, AgentError> {
    result.map_err(|err| AgentError::inspector(err.code_value(), op))
}

/// Rewrites class files as they load. The transformation itself (inserting
/// the initializer entry hooks) is supplied by the embedder; the agent
/// only enforces the exclusion list.
pub trait ClassTransformer: Send + Sync {
    /// Return the rewritten class file, or `None` to keep it unchanged.
    fn transform(&self, class_name: &str, class_data: &[u8]) -> Option<Vec<u8>>;
}

/// The loaded agent.
pub struct Environment {
    inspector: Arc<dyn Inspector>,
    config: AgentConfig,
    transformer: Option<Box<dyn ClassTransformer>>,
    threads: DashMap<ThreadRef, ThreadState>,
    /// Serializes tag upgrades so at most one context is created per
    /// object.
    creation_mutex: Mutex<()>,
    ids: IdAllocator,
    stats: AgentStats,
    disposed: AtomicBool,
}

impl Environment {
    /// Acquire capabilities and set up a fresh environment.
    pub fn new(
        inspector: Arc<dyn Inspector>,
        config: AgentConfig,
        transformer: Option<Box<dyn ClassTransformer>>,
    ) -> Result<Arc<Self>, AgentError> {
        let mut caps = Capabilities::TAG_OBJECTS
            | Capabilities::OBJECT_FREE_EVENTS
            | Capabilities::FRAME_POP_EVENTS
            | Capabilities::THREAD_LIFECYCLE
            | Capabilities::ALLOCATION_EVENTS;
        if config.watchpoints_enabled {
            caps |= Capabilities::FIELD_WATCHES;
        }
        if config.rewrite_enabled {
            caps |= Capabilities::CLASS_TRANSFORM;
        }
        inspect("add_capabilities", inspector.add_capabilities(caps))?;

        Ok(Arc::new(Self {
            inspector,
            config,
            transformer,
            threads: DashMap::default(),
            creation_mutex: Mutex::new(()),
            ids: IdAllocator::new(),
            stats: AgentStats::new(),
            disposed: AtomicBool::new(false),
        }))
    }

    /// The active configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Engine activity counters.
    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    pub(crate) fn inspector(&self) -> &dyn Inspector {
        self.inspector.as_ref()
    }

    // =========================================================================
    // Context Access
    // =========================================================================

    /// The context already attached to `obj`, if any.
    pub(crate) fn context_of(&self, obj: ObjectRef) -> Result<Option<&ObjectContext>, AgentError> {
        let tag = ObjectTag::from_raw(inspect("get_tag", self.inspector.get_tag(obj))?);
        // SAFETY: a complex tag points to a live context until the host
        // reports the object freed, which cannot interleave with this
        // handler (see module docs).
        Ok(tag
            .context_addr()
            .map(|addr| unsafe { &*(addr as *const ObjectContext) }))
    }

    /// The context attached to `obj`, creating and installing one first
    /// when necessary.
    pub(crate) fn get_or_create_context(
        &self,
        obj: ObjectRef,
    ) -> Result<&ObjectContext, AgentError> {
        if let Some(ctx) = self.context_of(obj)? {
            return Ok(ctx);
        }
        self.create_context(obj)
    }

    /// Decide the context shape for `obj` per its class.
    fn build_kind(&self, obj: ObjectRef) -> Result<ContextKind, AgentError> {
        let inspector = self.inspector.as_ref();
        let cls = inspect("object_class", inspector.object_class(obj))?;
        let signature = inspect("class_signature", inspector.class_signature(cls))?;

        if inspector.is_same_object(cls.as_object(), obj) {
            // The mirror of the class-mirror class is an instance of
            // itself; its layout serves both roles.
            let info = ClassInfo::build(inspector, cls)?;
            let class_ctx =
                ClassContext::new(inspector, obj.as_class(), Arc::clone(&info), Some(info))?;
            return Ok(ContextKind::Class(class_ctx));
        }

        if signature.starts_with('L') {
            let class_ctx = self.get_or_create_context(cls.as_object())?;
            let info = match class_ctx.as_class() {
                Some(class_ctx) => class_ctx.class_info(inspector)?,
                None => {
                    debug_assert!(false, "class mirror carries a non-class context");
                    ClassInfo::build(inspector, cls)?
                }
            };

            if signature == CLASS_MIRROR_SIGNATURE {
                // A class mirror: instance layout from the mirror class,
                // own static layout materialized on first static access.
                let class_ctx = ClassContext::new(inspector, obj.as_class(), info, None)?;
                return Ok(ContextKind::Class(class_ctx));
            }
            return Ok(ContextKind::Instance(InstanceContext::new(info)));
        }

        if signature.starts_with('[') {
            let length = inspect("array_length", inspector.array_length(obj))?;
            return Ok(ContextKind::Array(ArrayContext::new(length)));
        }

        unreachable!("object of primitive class {signature}")
    }

    /// Build a context for `obj` and install it, collapsing races.
    fn create_context(&self, obj: ObjectRef) -> Result<&ObjectContext, AgentError> {
        // Built outside the creation mutex: shape decisions may recurse
        // into get-or-create for the object's class mirror.
        let kind = self.build_kind(obj)?;
        let mut ctx = Box::new(ObjectContext::new(self.ids.allocate(), kind));

        let guard = self.creation_mutex.lock();
        let old = ObjectTag::from_raw(inspect("get_tag", self.inspector.get_tag(obj))?);

        if let Some(addr) = old.context_addr() {
            drop(guard);
            // Another thread won; discard the draft.
            self.stats.record_creation_race();
            ctx.release_host_refs(self.inspector.as_ref());
            // SAFETY: as in `context_of`.
            return Ok(unsafe { &*(addr as *const ObjectContext) });
        }

        if let Some(cause) = old.cause() {
            ctx.seed_alloc_reason(cause);
        }

        let ptr = Box::into_raw(ctx);
        let install = self
            .inspector
            .set_tag(obj, ObjectTag::complex(ptr as usize).raw());
        if let Err(err) = install {
            drop(guard);
            // SAFETY: never published; we still own the allocation.
            let ctx = unsafe { Box::from_raw(ptr) };
            ctx.release_host_refs(self.inspector.as_ref());
            return Err(AgentError::inspector(err.code_value(), "set_tag"));
        }
        drop(guard);

        self.stats.record_context();
        // SAFETY: just published; lives until object-free or teardown.
        Ok(unsafe { &*ptr })
    }

    // =========================================================================
    // Cause Stack Maintenance
    // =========================================================================

    /// The cause in effect on `thread`, if any.
    fn thread_reason(&self, thread: ThreadRef, for_heap_write: bool) -> Option<CauseRef> {
        self.threads
            .get(&thread)
            .and_then(|state| state.reason(for_heap_write))
    }

    /// Re-derive whether `thread` should receive field-write notifications
    /// and tell the host when that changed. Purely an optimization; the
    /// write handlers re-check the cause themselves.
    fn refresh_write_notifications(&self, thread: ThreadRef) -> Result<(), AgentError> {
        if !self.config.watchpoints_enabled {
            return Ok(());
        }
        let mut state = self.threads.entry(thread).or_default();
        let active = state.reason(true).is_some();
        if active != state.watch_enabled() {
            inspect(
                "set_thread_write_notifications",
                self.inspector.set_thread_write_notifications(thread, active),
            )?;
            state.set_watch_enabled(active);
        }
        Ok(())
    }

    /// Promote `reason` to a global reference and push it on `thread`'s
    /// initializer stack. Also records the outer initializer as the
    /// trigger of `reason` when it names a class not yet attributed.
    fn push_cause(&self, thread: ThreadRef, reason: ObjectRef) -> Result<(), AgentError> {
        let global = inspect("new_global_ref", self.inspector.new_global_ref(reason))?;
        let cause = CauseRef::new(global.raw()).ok_or_else(|| {
            AgentError::inspector(InspectorErrorCode::Internal as u32, "new_global_ref")
        })?;

        let carrier = {
            let mut state = self.threads.entry(thread).or_default();
            let carrier = state.reason(false);
            state.push(cause);
            carrier
        };
        self.stats.record_push();
        self.refresh_write_notifications(thread)?;

        if self.config.traces_writes() {
            let outer = diagnostics::class_name(
                self.inspector.as_ref(),
                carrier.map(|c| ObjectRef(c.raw()).as_class()),
            );
            let inner = diagnostics::class_name(
                self.inspector.as_ref(),
                Some(ObjectRef(cause.raw()).as_class()),
            );
            diagnostics::log_initializer_entry(&outer, &inner);
        }

        if let Some(carrier) = carrier {
            let same = self
                .inspector
                .is_same_object(ObjectRef(carrier.raw()), ObjectRef(cause.raw()));
            if !same {
                let ctx = self.get_or_create_context(ObjectRef(cause.raw()))?;
                if let Some(class_ctx) = ctx.as_class() {
                    class_ctx.set_made_reachable_by(carrier);
                }
            }
        }
        Ok(())
    }

    /// Pop `thread`'s innermost cause, which must match `expected`.
    fn pop_cause(&self, thread: ThreadRef, expected: ObjectRef) -> Result<(), AgentError> {
        let popped = {
            let mut state = self.threads.entry(thread).or_default();
            // The popped global reference is leaked on purpose; write
            // histories anywhere may still quote it.
            state.pop()
        };
        debug_assert!(
            matches!(popped, Some(top)
                if self.inspector.is_same_object(ObjectRef(top.raw()), expected)),
            "initializer exit does not match the stack top"
        );
        let _ = popped;

        self.refresh_write_notifications(thread)?;

        if self.config.traces_writes() {
            let inner =
                diagnostics::class_name(self.inspector.as_ref(), Some(expected.as_class()));
            diagnostics::log_initializer_exit(&inner);
        }
        Ok(())
    }

    /// Establish `cause` as the allocation reason of `obj`: a cause-only
    /// tag for untagged objects, a back-filled `alloc_reason` for objects
    /// that already carry a context. An already established reason is
    /// never changed.
    fn attribute_allocation(&self, obj: ObjectRef, cause: CauseRef) -> Result<(), AgentError> {
        // The mutex serializes this against a concurrent tag upgrade, so
        // a cause-only install can never clobber a freshly published
        // context pointer.
        let _guard = self.creation_mutex.lock();
        let tag = ObjectTag::from_raw(inspect("get_tag", self.inspector.get_tag(obj))?);
        if tag.is_untagged() {
            inspect(
                "set_tag",
                self.inspector.set_tag(obj, ObjectTag::cause_only(cause).raw()),
            )?;
        } else if let Some(addr) = tag.context_addr() {
            // SAFETY: as in `context_of`.
            let ctx = unsafe { &*(addr as *const ObjectContext) };
            ctx.set_alloc_reason_if_unset(cause);
        }
        Ok(())
    }

    // =========================================================================
    // Event Handlers
    // =========================================================================

    /// Catch-up work once the host is fully up: replay the class-file
    /// hook for classes that loaded before the agent, install watches for
    /// classes that prepared before the agent, and interpose on the
    /// array-element-store primitive.
    pub fn on_vm_init(&self) -> Result<(), AgentError> {
        if self.config.rewrite_enabled || self.config.watchpoints_enabled {
            for cls in inspect("loaded_classes", self.inspector.loaded_classes())? {
                if self.config.rewrite_enabled
                    && inspect(
                        "is_modifiable_class",
                        self.inspector.is_modifiable_class(cls),
                    )?
                {
                    inspect("retransform_class", self.inspector.retransform_class(cls))?;
                }
                if self.config.watchpoints_enabled {
                    let status = inspect("class_status", self.inspector.class_status(cls))?;
                    if status.contains(ClassStatus::PREPARED) {
                        self.install_field_watches(cls)?;
                    }
                }
            }
        }
        inspect(
            "install_array_interposer",
            self.inspector.install_array_interposer(),
        )
    }

    /// An object was allocated on `thread`.
    pub fn on_allocation(&self, obj: ObjectRef, thread: ThreadRef) -> Result<(), AgentError> {
        let Some(cause) = self.thread_reason(thread, false) else {
            return Ok(());
        };
        self.attribute_allocation(obj, cause)
    }

    /// A reference-typed field was written on `thread`.
    ///
    /// `receiver` is `None` for static writes, which land on the class
    /// context of `declaring`. Null values are never recorded.
    pub fn on_field_write(
        &self,
        thread: ThreadRef,
        declaring: ClassRef,
        receiver: Option<ObjectRef>,
        field: FieldRef,
        new_value: Option<ObjectRef>,
    ) -> Result<(), AgentError> {
        let Some(value) = new_value else {
            return Ok(());
        };
        let Some(cause) = self.thread_reason(thread, true) else {
            return Ok(());
        };

        let value_ctx = self.get_or_create_context(value)?;
        value_ctx.set_alloc_reason_if_unset(cause);
        let value_id = value_ctx.id();

        match receiver {
            Some(receiver) => {
                let ctx = self.get_or_create_context(receiver)?;
                ctx.set_alloc_reason_if_unset(cause);
                ctx.register_field_write(field, value_id, cause);
            }
            None => {
                let ctx = self.get_or_create_context(declaring.as_object())?;
                match ctx.as_class() {
                    Some(class_ctx) => class_ctx.register_static_write(
                        self.inspector.as_ref(),
                        field,
                        value_id,
                        cause,
                    )?,
                    None => debug_assert!(false, "static write against a non-class context"),
                }
            }
        }
        self.stats.record_write();

        if self.config.traces_writes() {
            self.log_field_write(cause, declaring, receiver, value);
        }
        Ok(())
    }

    /// An array element was written on `thread`. Null values are never
    /// recorded.
    pub fn on_array_write(
        &self,
        thread: ThreadRef,
        array: ObjectRef,
        index: usize,
        value: Option<ObjectRef>,
    ) -> Result<(), AgentError> {
        let Some(value) = value else {
            return Ok(());
        };
        let Some(cause) = self.thread_reason(thread, true) else {
            return Ok(());
        };

        let value_ctx = self.get_or_create_context(value)?;
        value_ctx.set_alloc_reason_if_unset(cause);
        let array_ctx = self.get_or_create_context(array)?;
        array_ctx.set_alloc_reason_if_unset(cause);
        array_ctx.register_array_write(index, value_ctx.id(), cause);
        self.stats.record_write();

        if self.config.traces_writes() {
            self.log_array_write(cause, array, index, value);
        }
        Ok(())
    }

    /// Hook call: a rewritten instance initializer reported its receiver.
    ///
    /// The first invocation after load passes no instance; it only exists
    /// to force linkage of the hook and is ignored.
    pub fn report_instance(&self, instance: Option<ObjectRef>) -> Result<(), AgentError> {
        let Some(instance) = instance else {
            return Ok(());
        };
        let thread = inspect("current_thread", self.inspector.current_thread())?;
        let Some(cause) = self.thread_reason(thread, false) else {
            return Ok(());
        };
        self.attribute_allocation(instance, cause)
    }

    /// Hook call: a rewritten class initializer is starting in the frame
    /// directly below. Pushes the class and arranges the automatic pop.
    pub fn report_initializer_starting(&self) -> Result<(), AgentError> {
        let thread = inspect("current_thread", self.inspector.current_thread())?;
        let method = inspect("frame_location", self.inspector.frame_location(thread, 1))?;
        let cls = inspect(
            "method_declaring_class",
            self.inspector.method_declaring_class(method),
        )?;
        self.push_cause(thread, cls.as_object())?;
        inspect("notify_frame_pop", self.inspector.notify_frame_pop(thread, 1))
    }

    /// The frame registered by [`Self::report_initializer_starting`]
    /// returned.
    pub fn on_frame_pop(&self, thread: ThreadRef, method: MethodRef) -> Result<(), AgentError> {
        let cls = inspect(
            "method_declaring_class",
            self.inspector.method_declaring_class(method),
        )?;
        self.pop_cause(thread, cls.as_object())
    }

    /// A tagged object was collected. Frees the context of a complex tag;
    /// cause-only tags need no cleanup.
    pub fn on_object_free(&self, tag_word: u64) {
        let tag = ObjectTag::from_raw(tag_word);
        if let Some(addr) = tag.context_addr() {
            // SAFETY: the object is gone, so nothing can reach this
            // context through its tag anymore; the host delivers exactly
            // one free notification per tagged object.
            let ctx = unsafe { Box::from_raw(addr as *mut ObjectContext) };
            ctx.release_host_refs(self.inspector.as_ref());
        }
    }

    /// A thread started; give it fresh cause state.
    pub fn on_thread_start(&self, thread: ThreadRef) {
        self.threads.insert(thread, ThreadState::new());
    }

    /// A thread ended; drop its cause state.
    pub fn on_thread_end(&self, thread: ThreadRef) {
        self.threads.remove(&thread);
    }

    /// A class reached the prepared state; watch its reference fields.
    pub fn on_class_prepare(&self, cls: ClassRef) -> Result<(), AgentError> {
        if !self.config.watchpoints_enabled {
            return Ok(());
        }
        self.install_field_watches(cls)
    }

    /// A class file is about to be defined. Returns the rewritten bytes,
    /// or `None` to keep the class unchanged.
    pub fn on_class_file_load(&self, name: &str, class_data: &[u8]) -> Option<Vec<u8>> {
        if !self.config.rewrite_enabled {
            return None;
        }
        if REWRITE_EXCLUDED.contains(&name) {
            return None;
        }
        self.transformer
            .as_ref()
            .and_then(|t| t.transform(name, class_data))
    }

    /// Install modification watches on every reference field of `cls`.
    fn install_field_watches(&self, cls: ClassRef) -> Result<(), AgentError> {
        for field in inspect("class_fields", self.inspector.class_fields(cls))? {
            let signature = inspect(
                "field_signature",
                self.inspector.field_signature(cls, field),
            )?;
            if !is_reference_signature(&signature) {
                continue;
            }
            match self.inspector.set_field_watch(cls, field) {
                Ok(()) => {}
                // The class was already processed.
                Err(err) if err.is_duplicate() => return Ok(()),
                Err(err) => {
                    return Err(AgentError::inspector(err.code_value(), "set_field_watch"))
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Caller-Supplied Causes
    // =========================================================================

    /// Install or clear the calling thread's ambient cause.
    pub fn set_cause(
        &self,
        cause: Option<ObjectRef>,
        applies_to_heap_writes: bool,
    ) -> Result<(), AgentError> {
        let thread = inspect("current_thread", self.inspector.current_thread())?;
        let cause = match cause {
            Some(obj) => {
                let global = inspect("new_global_ref", self.inspector.new_global_ref(obj))?;
                CauseRef::new(global.raw())
            }
            None => None,
        };
        {
            let mut state = self.threads.entry(thread).or_default();
            state.set_ambient(cause, applies_to_heap_writes);
        }
        self.refresh_write_notifications(thread)
    }

    /// Push a caller-supplied marker on the calling thread's stack.
    pub fn begin_tracing(&self, cause: ObjectRef) -> Result<(), AgentError> {
        let thread = inspect("current_thread", self.inspector.current_thread())?;
        self.push_cause(thread, cause)
    }

    /// Pop a caller-supplied marker from the calling thread's stack.
    pub fn end_tracing(&self, cause: ObjectRef) -> Result<(), AgentError> {
        let thread = inspect("current_thread", self.inspector.current_thread())?;
        self.pop_cause(thread, cause)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Free every live context and release capabilities.
    ///
    /// A failed heap walk (possible during abnormal process exit) is
    /// tolerated silently; the contexts leak but the process is going
    /// away. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let inspector = self.inspector.as_ref();
        let walk = inspector.iterate_tagged(&mut |word| {
            let tag = ObjectTag::from_raw(word);
            if let Some(addr) = tag.context_addr() {
                // SAFETY: teardown is the last consumer of every tag; the
                // walk visits each tagged object once.
                let ctx = unsafe { Box::from_raw(addr as *mut ObjectContext) };
                ctx.release_host_refs(inspector);
            }
        });
        if walk.is_err() {
            return;
        }

        if self.config.log {
            let stats = &self.stats;
            eprintln!(
                "heaptrace: {} contexts, {} writes, {} lookups, {} pushes, {} races",
                stats.contexts_created.load(Ordering::Relaxed),
                stats.writes_recorded.load(Ordering::Relaxed),
                stats.lookups.load(Ordering::Relaxed),
                stats.initializer_pushes.load(Ordering::Relaxed),
                stats.creation_races_lost.load(Ordering::Relaxed),
            );
        }

        let _ = inspector.relinquish_capabilities();
    }

    // =========================================================================
    // Write Logging
    // =========================================================================

    fn log_field_write(
        &self,
        cause: CauseRef,
        declaring: ClassRef,
        receiver: Option<ObjectRef>,
        value: ObjectRef,
    ) {
        let inspector = self.inspector.as_ref();
        let cause_name =
            diagnostics::class_name(inspector, Some(ObjectRef(cause.raw()).as_class()));
        let receiver_cls = match receiver {
            Some(receiver) => inspector.object_class(receiver).ok(),
            None => Some(declaring),
        };
        let receiver_name = diagnostics::class_name(inspector, receiver_cls);
        let value_name =
            diagnostics::class_name(inspector, inspector.object_class(value).ok());
        diagnostics::log_field_write(&cause_name, &receiver_name, &value_name);
    }

    fn log_array_write(&self, cause: CauseRef, array: ObjectRef, index: usize, value: ObjectRef) {
        let inspector = self.inspector.as_ref();
        let cause_name =
            diagnostics::class_name(inspector, Some(ObjectRef(cause.raw()).as_class()));
        let array_name = diagnostics::class_name(inspector, inspector.object_class(array).ok());
        let value_name =
            diagnostics::class_name(inspector, inspector.object_class(value).ok());
        diagnostics::log_array_write(&cause_name, &array_name, index, &value_name);
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.dispose();
    }
}
