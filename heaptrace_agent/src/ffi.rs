//! C-ABI entry points.
//!
//! The host calls into the agent through these symbols. Handles cross the
//! boundary as raw 64-bit words; the null handle is 0, and queries answer
//! the raw cause handle with 0 meaning "no cause".
//!
//! Nothing here may unwind into the host. Every entry point runs its body
//! under a panic guard and translates both [`AgentError`]s and caught
//! panics into the matching raise on the host side before degrading to
//! the neutral answer.

use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use heaptrace_core::{AgentError, CauseRef};
use heaptrace_inspector::{ClassRef, FieldRef, Inspector, ObjectRef};

use crate::config::AgentConfig;
use crate::environment::{ClassTransformer, Environment};

/// Load succeeded.
pub const LOAD_SUCCESS: i32 = 0;
/// Load failed; the host should continue without the agent.
pub const LOAD_FAILURE: i32 = 1;

static ENVIRONMENT: RwLock<Option<Arc<Environment>>> = RwLock::new(None);

/// Create the global environment. Returns [`LOAD_SUCCESS`] or
/// [`LOAD_FAILURE`]; any capability-acquisition failure or invalid
/// configuration fails the load.
///
/// This is the `Agent_OnLoad` equivalent; the host binding constructs its
/// concrete [`Inspector`] and calls through here.
pub fn on_load(
    inspector: Arc<dyn Inspector>,
    config: AgentConfig,
    transformer: Option<Box<dyn ClassTransformer>>,
) -> i32 {
    if config.validate().is_err() {
        return LOAD_FAILURE;
    }
    match Environment::new(inspector, config, transformer) {
        Ok(env) => {
            *ENVIRONMENT.write() = Some(env);
            LOAD_SUCCESS
        }
        Err(_) => LOAD_FAILURE,
    }
}

/// The live environment, if the agent is loaded and not disposed.
pub fn environment() -> Option<Arc<Environment>> {
    ENVIRONMENT.read().clone()
}

/// Run an entry-point body against the global environment.
///
/// With no environment the neutral answer is returned directly; this is
/// what makes every query answer "nothing" after `dispose`.
fn with_env<R: Default>(f: impl FnOnce(&Environment) -> Result<R, AgentError>) -> R {
    let Some(env) = environment() else {
        return R::default();
    };

    match panic::catch_unwind(AssertUnwindSafe(|| f(&env))) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            raise(&env, &err);
            R::default()
        }
        Err(payload) => {
            let message = panic_message(payload);
            raise(&env, &AgentError::HandlerPanic(message));
            R::default()
        }
    }
}

fn raise(env: &Environment, err: &AgentError) {
    let inspector = env.inspector();
    match err {
        AgentError::OutOfMemory => inspector.raise_out_of_memory(),
        AgentError::Io(message) => inspector.raise_io_error(message),
        other => inspector.raise_error(&other.to_string()),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[inline]
fn raw_cause(cause: Option<CauseRef>) -> u64 {
    cause.map_or(0, CauseRef::raw)
}

#[inline]
fn nullable(handle: u64) -> Option<ObjectRef> {
    (handle != 0).then_some(ObjectRef(handle))
}

// =============================================================================
// Query Entry Points
// =============================================================================

/// Cause responsible for `obj` existing, or 0.
#[no_mangle]
pub extern "C" fn heaptrace_responsible_for_object(obj: u64) -> u64 {
    with_env(|env| {
        env.responsible_for_object(ObjectRef(obj))
            .map(raw_cause)
    })
}

/// Cause of the most recent write of `value` into `receiver.field`, or 0.
#[no_mangle]
pub extern "C" fn heaptrace_responsible_for_field_write(
    receiver: u64,
    field: u64,
    value: u64,
) -> u64 {
    with_env(|env| {
        env.responsible_for_field_write(ObjectRef(receiver), FieldRef(field), ObjectRef(value))
            .map(raw_cause)
    })
}

/// Cause of the most recent static write of `value` into
/// `declaring.field`, or 0.
#[no_mangle]
pub extern "C" fn heaptrace_responsible_for_static_field_write(
    declaring: u64,
    field: u64,
    value: u64,
) -> u64 {
    with_env(|env| {
        env.responsible_for_static_field_write(
            ClassRef(declaring),
            FieldRef(field),
            ObjectRef(value),
        )
        .map(raw_cause)
    })
}

/// Cause of the most recent write of `value` into `array[index]`, or 0.
#[no_mangle]
pub extern "C" fn heaptrace_responsible_for_array_write(
    array: u64,
    index: u64,
    value: u64,
) -> u64 {
    with_env(|env| {
        env.responsible_for_array_write(ObjectRef(array), index as usize, ObjectRef(value))
            .map(raw_cause)
    })
}

/// Initializer that first triggered `cls`'s initializer, or 0.
#[no_mangle]
pub extern "C" fn heaptrace_initializer_responsible_for_initializer(cls: u64) -> u64 {
    with_env(|env| {
        env.initializer_responsible_for_initializer(ClassRef(cls))
            .map(raw_cause)
    })
}

// =============================================================================
// Cause Control Entry Points
// =============================================================================

/// Install (non-zero `cause`) or clear (0) the calling thread's ambient
/// cause. `applies_to_heap_writes` is 0 for allocation-only attribution.
#[no_mangle]
pub extern "C" fn heaptrace_set_cause(cause: u64, applies_to_heap_writes: u8) {
    with_env(|env| env.set_cause(nullable(cause), applies_to_heap_writes != 0))
}

/// Push a caller-supplied cause on the calling thread's stack.
#[no_mangle]
pub extern "C" fn heaptrace_begin_tracing(cause: u64) {
    with_env(|env| env.begin_tracing(ObjectRef(cause)))
}

/// Pop a caller-supplied cause from the calling thread's stack.
#[no_mangle]
pub extern "C" fn heaptrace_end_tracing(cause: u64) {
    with_env(|env| env.end_tracing(ObjectRef(cause)))
}

// =============================================================================
// Rewrite Hook Entry Points
// =============================================================================

/// A rewritten instance initializer reported its receiver (0 during the
/// linkage warm-up call).
#[no_mangle]
pub extern "C" fn heaptrace_report_instance(instance: u64) {
    with_env(|env| env.report_instance(nullable(instance)))
}

/// A rewritten class initializer is starting in the caller's frame.
#[no_mangle]
pub extern "C" fn heaptrace_report_initializer_starting() {
    with_env(|env| env.report_initializer_starting())
}

// =============================================================================
// Teardown
// =============================================================================

/// Drop the global environment. Subsequent queries return 0. Inspector
/// errors during teardown are ignored unconditionally.
#[no_mangle]
pub extern "C" fn heaptrace_dispose() {
    let env = ENVIRONMENT.write().take();
    if let Some(env) = env {
        env.dispose();
    }
}
