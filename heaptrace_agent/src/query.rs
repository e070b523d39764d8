//! Cause-recovery queries.
//!
//! The consumer-facing half of the engine: five lookups that recover the
//! cause of an allocation, a field write, a static field write, an array
//! element write, or a class initialization. All of them are safe to call
//! concurrently with the event handlers.

use heaptrace_core::{AgentError, CauseRef, ObjectTag};
use heaptrace_inspector::{ClassRef, ClassStatus, FieldRef, ObjectRef};

use crate::diagnostics;
use crate::environment::{inspect, Environment};

impl Environment {
    /// The cause responsible for `obj` existing: its allocation reason,
    /// whether it lives in a cause-only tag or a full context.
    pub fn responsible_for_object(&self, obj: ObjectRef) -> Result<Option<CauseRef>, AgentError> {
        self.stats().record_lookup();
        let tag = ObjectTag::from_raw(inspect("get_tag", self.inspector().get_tag(obj))?);
        match self.context_of(obj)? {
            Some(ctx) => Ok(ctx.alloc_reason()),
            None => Ok(tag.cause()),
        }
    }

    /// The cause of the most recent write of `value` into
    /// `receiver.field`. `None` when either object lacks a context.
    pub fn responsible_for_field_write(
        &self,
        receiver: ObjectRef,
        field: FieldRef,
        value: ObjectRef,
    ) -> Result<Option<CauseRef>, AgentError> {
        self.stats().record_lookup();
        let Some(receiver_ctx) = self.context_of(receiver)? else {
            return Ok(None);
        };
        let Some(value_ctx) = self.context_of(value)? else {
            return Ok(None);
        };
        Ok(receiver_ctx.field_write_reason(field, value_ctx.id()))
    }

    /// The cause of the most recent write of `value` into the static
    /// field `declaring.field`.
    ///
    /// The declaring class must have finished initializing; otherwise the
    /// query answers `None` with a diagnostic, because the class's static
    /// state is not yet meaningful to the consumer.
    pub fn responsible_for_static_field_write(
        &self,
        declaring: ClassRef,
        field: FieldRef,
        value: ObjectRef,
    ) -> Result<Option<CauseRef>, AgentError> {
        self.stats().record_lookup();

        let status = inspect("class_status", self.inspector().class_status(declaring))?;
        if !status.contains(ClassStatus::INITIALIZED) {
            let name = diagnostics::class_name(self.inspector(), Some(declaring));
            eprintln!("Class not initialized yet field being asked for: {name}");
            return Ok(None);
        }

        let class_ctx = self.get_or_create_context(declaring.as_object())?;
        let Some(value_ctx) = self.context_of(value)? else {
            return Ok(None);
        };
        match class_ctx.as_class() {
            Some(class_ctx) => {
                class_ctx.static_write_reason(self.inspector(), field, value_ctx.id())
            }
            None => Ok(None),
        }
    }

    /// The cause of the most recent write of `value` into `array[index]`.
    pub fn responsible_for_array_write(
        &self,
        array: ObjectRef,
        index: usize,
        value: ObjectRef,
    ) -> Result<Option<CauseRef>, AgentError> {
        self.stats().record_lookup();
        let Some(array_ctx) = self.context_of(array)? else {
            return Ok(None);
        };
        let Some(value_ctx) = self.context_of(value)? else {
            return Ok(None);
        };
        Ok(array_ctx.array_write_reason(index, value_ctx.id()))
    }

    /// The initializer that first caused `cls` to initialize, if the
    /// initialization happened inside another initializer.
    pub fn initializer_responsible_for_initializer(
        &self,
        cls: ClassRef,
    ) -> Result<Option<CauseRef>, AgentError> {
        self.stats().record_lookup();
        let ctx = self.get_or_create_context(cls.as_object())?;
        Ok(ctx.as_class().and_then(|class_ctx| class_ctx.made_reachable_by()))
    }
}
