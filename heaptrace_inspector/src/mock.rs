//! In-memory host runtime for tests.
//!
//! [`MockRuntime`] implements the full [`Inspector`] trait against plain
//! tables: classes with declared fields, objects with tag words, synthetic
//! frame stacks and watch bookkeeping. Tests build a small class hierarchy,
//! allocate objects and drive the engine's event handlers by hand.
//!
//! The mock is deliberately strict: stale handles return the same error
//! codes a real host would, duplicate watch installs return the duplicate
//! indicator, and raised errors are captured for assertions instead of
//! aborting the test.

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{
    Capabilities, ClassRef, ClassStatus, FieldModifiers, FieldRef, Inspector, InspectorError,
    InspectorErrorCode, InspectorResult, MethodRef, ObjectRef, ThreadRef, WeakRef,
};

/// Signature of the root class.
pub const ROOT_CLASS_SIGNATURE: &str = "Ljava/lang/Object;";
/// Signature of the class-mirror class.
pub const CLASS_CLASS_SIGNATURE: &str = "Ljava/lang/Class;";

// Thread handles are per OS thread, assigned on first use, shared by every
// runtime instance in the process.
static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// An error or signal the engine raised into the managed layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Raise {
    /// Generic error with a message.
    Error(String),
    /// Out-of-memory signal.
    OutOfMemory,
    /// I/O error with a message.
    Io(String),
}

struct ObjectData {
    class: u64,
    tag: u64,
    array_length: Option<usize>,
    global_refs: u32,
}

struct ClassData {
    signature: String,
    superclass: Option<u64>,
    fields: Vec<u64>,
    status: ClassStatus,
    modifiable: bool,
}

struct FieldData {
    owner: u64,
    signature: String,
    modifiers: FieldModifiers,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    objects: FxHashMap<u64, ObjectData>,
    classes: FxHashMap<u64, ClassData>,
    fields: FxHashMap<u64, FieldData>,
    methods: FxHashMap<u64, u64>,
    weaks: FxHashMap<u64, u64>,
    frames: FxHashMap<u64, Vec<u64>>,
    pending_pops: FxHashSet<(u64, usize)>,
    watches: FxHashSet<(u64, u64)>,
    thread_notifications: FxHashMap<u64, bool>,
    retransformed: Vec<u64>,
    granted: Capabilities,
    relinquished: bool,
    array_interposer: bool,
}

/// In-memory implementation of the host tool interface.
pub struct MockRuntime {
    state: RwLock<MockState>,
    raises: Mutex<Vec<Raise>>,
    fail_capabilities: AtomicBool,
    fail_heap_walk: AtomicBool,
    root_class: ClassRef,
    class_class: ClassRef,
}

impl MockRuntime {
    /// Create a runtime pre-seeded with the root class and the
    /// class-mirror class.
    pub fn new() -> Self {
        let mut state = MockState {
            next_handle: 1,
            ..Default::default()
        };

        let root = state.next_handle;
        state.next_handle += 1;
        let class_class = state.next_handle;
        state.next_handle += 1;

        state.classes.insert(
            root,
            ClassData {
                signature: ROOT_CLASS_SIGNATURE.to_string(),
                superclass: None,
                fields: Vec::new(),
                status: ClassStatus::PREPARED | ClassStatus::INITIALIZED,
                modifiable: true,
            },
        );
        state.classes.insert(
            class_class,
            ClassData {
                signature: CLASS_CLASS_SIGNATURE.to_string(),
                superclass: Some(root),
                fields: Vec::new(),
                status: ClassStatus::PREPARED | ClassStatus::INITIALIZED,
                modifiable: false,
            },
        );

        // Class mirrors are themselves objects. The mirror of the
        // class-mirror class is an instance of itself, as on a real host.
        state.objects.insert(
            root,
            ObjectData {
                class: class_class,
                tag: 0,
                array_length: None,
                global_refs: 0,
            },
        );
        state.objects.insert(
            class_class,
            ObjectData {
                class: class_class,
                tag: 0,
                array_length: None,
                global_refs: 0,
            },
        );

        Self {
            state: RwLock::new(state),
            raises: Mutex::new(Vec::new()),
            fail_capabilities: AtomicBool::new(false),
            fail_heap_walk: AtomicBool::new(false),
            root_class: ClassRef(root),
            class_class: ClassRef(class_class),
        }
    }

    /// The pre-seeded root class.
    pub fn root_class(&self) -> ClassRef {
        self.root_class
    }

    /// The pre-seeded class-mirror class.
    pub fn class_class(&self) -> ClassRef {
        self.class_class
    }

    // -- world building ---------------------------------------------------

    /// Define a class. The superclass defaults to the root class.
    pub fn define_class(&self, signature: &str, superclass: Option<ClassRef>) -> ClassRef {
        let mut state = self.state.write();
        let handle = state.next_handle;
        state.next_handle += 1;
        let class_class = self.class_class.raw();
        state.classes.insert(
            handle,
            ClassData {
                signature: signature.to_string(),
                superclass: Some(superclass.unwrap_or(self.root_class).raw()),
                fields: Vec::new(),
                status: ClassStatus::PREPARED,
                modifiable: true,
            },
        );
        state.objects.insert(
            handle,
            ObjectData {
                class: class_class,
                tag: 0,
                array_length: None,
                global_refs: 0,
            },
        );
        ClassRef(handle)
    }

    /// Declare a field on a class.
    pub fn add_field(
        &self,
        cls: ClassRef,
        signature: &str,
        modifiers: FieldModifiers,
    ) -> FieldRef {
        let mut state = self.state.write();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.fields.insert(
            handle,
            FieldData {
                owner: cls.raw(),
                signature: signature.to_string(),
                modifiers,
            },
        );
        state
            .classes
            .get_mut(&cls.raw())
            .expect("unknown class")
            .fields
            .push(handle);
        FieldRef(handle)
    }

    /// Declare a method on a class.
    pub fn define_method(&self, cls: ClassRef) -> MethodRef {
        let mut state = self.state.write();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.methods.insert(handle, cls.raw());
        MethodRef(handle)
    }

    /// Allocate an instance of `cls`.
    pub fn new_object(&self, cls: ClassRef) -> ObjectRef {
        let mut state = self.state.write();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.objects.insert(
            handle,
            ObjectData {
                class: cls.raw(),
                tag: 0,
                array_length: None,
                global_refs: 0,
            },
        );
        ObjectRef(handle)
    }

    /// Allocate an array of `length` elements whose class is `cls`
    /// (an array class, signature starting with `[`).
    pub fn new_array(&self, cls: ClassRef, length: usize) -> ObjectRef {
        let mut state = self.state.write();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.objects.insert(
            handle,
            ObjectData {
                class: cls.raw(),
                tag: 0,
                array_length: Some(length),
                global_refs: 0,
            },
        );
        ObjectRef(handle)
    }

    /// Set a class's status bits.
    pub fn set_class_status(&self, cls: ClassRef, status: ClassStatus) {
        self.state
            .write()
            .classes
            .get_mut(&cls.raw())
            .expect("unknown class")
            .status = status;
    }

    /// Collect an object: it disappears from the heap, weak references to
    /// it go dead, and its tag word is returned so the caller can deliver
    /// the object-free event.
    pub fn free_object(&self, obj: ObjectRef) -> u64 {
        let mut state = self.state.write();
        let data = state
            .objects
            .remove(&obj.raw())
            .expect("freeing unknown object");
        assert_eq!(data.global_refs, 0, "freeing an object with global refs");
        state.weaks.retain(|_, target| *target != obj.raw());
        data.tag
    }

    // -- frame simulation -------------------------------------------------

    /// Push a frame for `method` onto `thread`'s synthetic stack.
    pub fn push_frame(&self, thread: ThreadRef, method: MethodRef) {
        self.state
            .write()
            .frames
            .entry(thread.0)
            .or_default()
            .push(method.0);
    }

    /// Pop the top frame. Returns the popped method and whether a
    /// frame-pop notification had been requested for it.
    pub fn pop_frame(&self, thread: ThreadRef) -> (MethodRef, bool) {
        let mut state = self.state.write();
        let stack = state.frames.get_mut(&thread.0).expect("no frames");
        let method = stack.pop().expect("pop on empty stack");
        let index = stack.len();
        let notified = state.pending_pops.remove(&(thread.0, index));
        (MethodRef(method), notified)
    }

    // -- test introspection -----------------------------------------------

    /// Drain everything raised into the managed layer so far.
    pub fn take_raises(&self) -> Vec<Raise> {
        std::mem::take(&mut *self.raises.lock())
    }

    /// Whether a watch is installed on (class, field).
    pub fn is_watched(&self, cls: ClassRef, field: FieldRef) -> bool {
        self.state.read().watches.contains(&(cls.raw(), field.0))
    }

    /// Number of installed field watches.
    pub fn watch_count(&self) -> usize {
        self.state.read().watches.len()
    }

    /// Whether field-write notifications are enabled for `thread`.
    pub fn write_notifications_enabled(&self, thread: ThreadRef) -> bool {
        self.state
            .read()
            .thread_notifications
            .get(&thread.0)
            .copied()
            .unwrap_or(false)
    }

    /// Classes whose retransformation has been requested, in order.
    pub fn retransform_requests(&self) -> Vec<ClassRef> {
        self.state
            .read()
            .retransformed
            .iter()
            .map(|&h| ClassRef(h))
            .collect()
    }

    /// Whether the array-store interposer is installed.
    pub fn array_interposer_installed(&self) -> bool {
        self.state.read().array_interposer
    }

    /// Whether capabilities have been relinquished.
    pub fn relinquished(&self) -> bool {
        self.state.read().relinquished
    }

    /// Capabilities granted so far.
    pub fn granted_capabilities(&self) -> Capabilities {
        self.state.read().granted
    }

    /// Number of live weak reference handles.
    pub fn live_weak_refs(&self) -> usize {
        self.state.read().weaks.len()
    }

    /// Make the next capability request fail, for load-failure tests.
    pub fn fail_next_capability_request(&self) {
        self.fail_capabilities.store(true, Ordering::SeqCst);
    }

    /// Make heap walks fail, for abnormal-teardown tests.
    pub fn fail_heap_walks(&self) {
        self.fail_heap_walk.store(true, Ordering::SeqCst);
    }

    fn err(code: InspectorErrorCode) -> InspectorError {
        InspectorError::new(code)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Inspector for MockRuntime {
    fn add_capabilities(&self, caps: Capabilities) -> InspectorResult<()> {
        if self.fail_capabilities.swap(false, Ordering::SeqCst) {
            return Err(Self::err(InspectorErrorCode::MissingCapability));
        }
        self.state.write().granted |= caps;
        Ok(())
    }

    fn relinquish_capabilities(&self) -> InspectorResult<()> {
        let mut state = self.state.write();
        state.relinquished = true;
        state.granted = Capabilities::empty();
        Ok(())
    }

    fn get_tag(&self, obj: ObjectRef) -> InspectorResult<u64> {
        self.state
            .read()
            .objects
            .get(&obj.raw())
            .map(|o| o.tag)
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidObject))
    }

    fn set_tag(&self, obj: ObjectRef, word: u64) -> InspectorResult<()> {
        self.state
            .write()
            .objects
            .get_mut(&obj.raw())
            .map(|o| o.tag = word)
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidObject))
    }

    fn iterate_tagged(&self, visit: &mut dyn FnMut(u64)) -> InspectorResult<()> {
        if self.fail_heap_walk.load(Ordering::SeqCst) {
            return Err(Self::err(InspectorErrorCode::Internal));
        }
        let state = self.state.read();
        for data in state.objects.values() {
            if data.tag != 0 {
                visit(data.tag);
            }
        }
        Ok(())
    }

    fn new_global_ref(&self, obj: ObjectRef) -> InspectorResult<ObjectRef> {
        self.state
            .write()
            .objects
            .get_mut(&obj.raw())
            .map(|o| {
                o.global_refs += 1;
                obj
            })
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidObject))
    }

    fn new_weak_ref(&self, obj: ObjectRef) -> InspectorResult<WeakRef> {
        let mut state = self.state.write();
        if !state.objects.contains_key(&obj.raw()) {
            return Err(Self::err(InspectorErrorCode::InvalidObject));
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.weaks.insert(handle, obj.raw());
        Ok(WeakRef(handle))
    }

    fn weak_ref_target(&self, weak: WeakRef) -> InspectorResult<Option<ObjectRef>> {
        let state = self.state.read();
        match state.weaks.get(&weak.0) {
            Some(&target) => Ok(state.objects.contains_key(&target).then_some(ObjectRef(target))),
            None => Err(Self::err(InspectorErrorCode::InvalidObject)),
        }
    }

    fn delete_weak_ref(&self, weak: WeakRef) -> InspectorResult<()> {
        self.state
            .write()
            .weaks
            .remove(&weak.0)
            .map(|_| ())
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidObject))
    }

    fn is_same_object(&self, a: ObjectRef, b: ObjectRef) -> bool {
        a.raw() == b.raw()
    }

    fn object_class(&self, obj: ObjectRef) -> InspectorResult<ClassRef> {
        self.state
            .read()
            .objects
            .get(&obj.raw())
            .map(|o| ClassRef(o.class))
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidObject))
    }

    fn class_signature(&self, cls: ClassRef) -> InspectorResult<String> {
        self.state
            .read()
            .classes
            .get(&cls.raw())
            .map(|c| c.signature.clone())
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidClass))
    }

    fn superclass(&self, cls: ClassRef) -> InspectorResult<Option<ClassRef>> {
        self.state
            .read()
            .classes
            .get(&cls.raw())
            .map(|c| c.superclass.map(ClassRef))
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidClass))
    }

    fn class_status(&self, cls: ClassRef) -> InspectorResult<ClassStatus> {
        self.state
            .read()
            .classes
            .get(&cls.raw())
            .map(|c| c.status)
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidClass))
    }

    fn class_fields(&self, cls: ClassRef) -> InspectorResult<Vec<FieldRef>> {
        self.state
            .read()
            .classes
            .get(&cls.raw())
            .map(|c| c.fields.iter().map(|&f| FieldRef(f)).collect())
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidClass))
    }

    fn field_signature(&self, cls: ClassRef, field: FieldRef) -> InspectorResult<String> {
        let state = self.state.read();
        match state.fields.get(&field.0) {
            Some(data) if data.owner == cls.raw() => Ok(data.signature.clone()),
            _ => Err(Self::err(InspectorErrorCode::InvalidField)),
        }
    }

    fn field_modifiers(&self, cls: ClassRef, field: FieldRef) -> InspectorResult<FieldModifiers> {
        let state = self.state.read();
        match state.fields.get(&field.0) {
            Some(data) if data.owner == cls.raw() => Ok(data.modifiers),
            _ => Err(Self::err(InspectorErrorCode::InvalidField)),
        }
    }

    fn array_length(&self, obj: ObjectRef) -> InspectorResult<usize> {
        self.state
            .read()
            .objects
            .get(&obj.raw())
            .and_then(|o| o.array_length)
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidObject))
    }

    fn loaded_classes(&self) -> InspectorResult<Vec<ClassRef>> {
        let state = self.state.read();
        let mut classes: Vec<_> = state.classes.keys().map(|&h| ClassRef(h)).collect();
        classes.sort_by_key(|c| c.raw());
        Ok(classes)
    }

    fn is_modifiable_class(&self, cls: ClassRef) -> InspectorResult<bool> {
        self.state
            .read()
            .classes
            .get(&cls.raw())
            .map(|c| c.modifiable)
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidClass))
    }

    fn retransform_class(&self, cls: ClassRef) -> InspectorResult<()> {
        let mut state = self.state.write();
        if !state.classes.contains_key(&cls.raw()) {
            return Err(Self::err(InspectorErrorCode::InvalidClass));
        }
        state.retransformed.push(cls.raw());
        Ok(())
    }

    fn current_thread(&self) -> InspectorResult<ThreadRef> {
        Ok(ThreadRef(THREAD_TOKEN.with(|t| *t)))
    }

    fn frame_location(&self, thread: ThreadRef, depth: usize) -> InspectorResult<MethodRef> {
        let state = self.state.read();
        let stack = state
            .frames
            .get(&thread.0)
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidThread))?;
        if depth >= stack.len() {
            return Err(Self::err(InspectorErrorCode::NoMoreFrames));
        }
        Ok(MethodRef(stack[stack.len() - 1 - depth]))
    }

    fn method_declaring_class(&self, method: MethodRef) -> InspectorResult<ClassRef> {
        self.state
            .read()
            .methods
            .get(&method.0)
            .map(|&c| ClassRef(c))
            .ok_or_else(|| Self::err(InspectorErrorCode::Internal))
    }

    fn notify_frame_pop(&self, thread: ThreadRef, depth: usize) -> InspectorResult<()> {
        let mut state = self.state.write();
        let len = state
            .frames
            .get(&thread.0)
            .ok_or_else(|| Self::err(InspectorErrorCode::InvalidThread))?
            .len();
        if depth >= len {
            return Err(Self::err(InspectorErrorCode::NoMoreFrames));
        }
        state.pending_pops.insert((thread.0, len - 1 - depth));
        Ok(())
    }

    fn set_field_watch(&self, cls: ClassRef, field: FieldRef) -> InspectorResult<()> {
        let mut state = self.state.write();
        if !state.fields.contains_key(&field.0) {
            return Err(Self::err(InspectorErrorCode::InvalidField));
        }
        if !state.watches.insert((cls.raw(), field.0)) {
            return Err(Self::err(InspectorErrorCode::Duplicate));
        }
        Ok(())
    }

    fn set_thread_write_notifications(
        &self,
        thread: ThreadRef,
        enabled: bool,
    ) -> InspectorResult<()> {
        self.state
            .write()
            .thread_notifications
            .insert(thread.0, enabled);
        Ok(())
    }

    fn install_array_interposer(&self) -> InspectorResult<()> {
        self.state.write().array_interposer = true;
        Ok(())
    }

    fn raise_error(&self, message: &str) {
        self.raises.lock().push(Raise::Error(message.to_string()));
    }

    fn raise_out_of_memory(&self) {
        self.raises.lock().push(Raise::OutOfMemory);
    }

    fn raise_io_error(&self, message: &str) {
        self.raises.lock().push(Raise::Io(message.to_string()));
    }
}
