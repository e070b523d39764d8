//! Shared test fixture: a mock host plus a loaded environment, with
//! helpers for walking a thread into and out of class initializers the
//! way the rewritten hook calls would.

#![allow(dead_code)]

use std::sync::Arc;

use heaptrace_agent::{AgentConfig, Environment};
use heaptrace_inspector::mock::MockRuntime;
use heaptrace_inspector::{ClassRef, FieldModifiers, FieldRef, Inspector, ObjectRef, ThreadRef};

pub struct Fixture {
    pub rt: Arc<MockRuntime>,
    pub env: Arc<Environment>,
}

impl Fixture {
    /// Default configuration: rewrite mode only.
    pub fn new() -> Self {
        Self::with_config(AgentConfig::default())
    }

    pub fn with_config(config: AgentConfig) -> Self {
        let rt = Arc::new(MockRuntime::new());
        let inspector: Arc<dyn Inspector> = rt.clone();
        let env = Environment::new(inspector, config, None).expect("environment");
        Self { rt, env }
    }

    pub fn thread(&self) -> ThreadRef {
        self.rt.current_thread().expect("current thread")
    }

    /// Define a class with `n` nonstatic reference fields.
    pub fn class_with_fields(&self, signature: &str, n: usize) -> (ClassRef, Vec<FieldRef>) {
        let cls = self.rt.define_class(signature, None);
        let fields = (0..n)
            .map(|_| {
                self.rt
                    .add_field(cls, "Ljava/lang/Object;", FieldModifiers::empty())
            })
            .collect();
        (cls, fields)
    }

    /// Simulate entry into `cls`'s initializer on the calling thread:
    /// the initializer frame appears, the injected hook runs on top of it
    /// and reports in, then the hook frame returns.
    pub fn enter_initializer(&self, cls: ClassRef) {
        let thread = self.thread();
        let clinit = self.rt.define_method(cls);
        let hook = self.rt.define_method(cls);
        self.rt.push_frame(thread, clinit);
        self.rt.push_frame(thread, hook);
        self.env
            .report_initializer_starting()
            .expect("initializer entry");
        let (popped, _) = self.rt.pop_frame(thread);
        assert_eq!(popped, hook, "hook frame should be on top");
    }

    /// Simulate the innermost initializer frame returning on the calling
    /// thread, which delivers the requested frame-pop notification.
    pub fn exit_initializer(&self) {
        let thread = self.thread();
        let (method, notified) = self.rt.pop_frame(thread);
        assert!(notified, "no frame-pop notification was requested");
        self.env.on_frame_pop(thread, method).expect("frame pop");
    }

    /// Raw cause handle answered by a query for comparisons against the
    /// class or marker object the cause refers to.
    pub fn raw(&self, cause: Option<heaptrace_core::CauseRef>) -> u64 {
        cause.map_or(0, |c| c.raw())
    }

    /// Shorthand: the expected cause handle for a class.
    pub fn cause_of(&self, cls: ClassRef) -> u64 {
        cls.raw()
    }

    /// Shorthand: the expected cause handle for a marker object.
    pub fn cause_of_object(&self, obj: ObjectRef) -> u64 {
        obj.raw()
    }
}
