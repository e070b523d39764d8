//! Lifecycle tests: load, watches, class catch-up, rewrite exclusions,
//! object free and teardown.

mod common;

use std::sync::Arc;

use common::Fixture;
use heaptrace_agent::{AgentConfig, ClassTransformer, Environment, HOOK_CLASS_NAME};
use heaptrace_inspector::mock::MockRuntime;
use heaptrace_inspector::{ClassStatus, FieldModifiers, Inspector};

fn watchpoint_config() -> AgentConfig {
    AgentConfig {
        watchpoints_enabled: true,
        ..Default::default()
    }
}

// =============================================================================
// Load
// =============================================================================

#[test]
fn test_capability_failure_fails_the_load() {
    let rt = Arc::new(MockRuntime::new());
    rt.fail_next_capability_request();
    let inspector: Arc<dyn Inspector> = rt.clone();
    assert!(Environment::new(inspector, AgentConfig::default(), None).is_err());
}

// =============================================================================
// Watches
// =============================================================================

#[test]
fn test_class_prepare_watches_reference_fields_only() {
    let f = Fixture::with_config(watchpoint_config());
    let cls = f.rt.define_class("Lcom/example/A;", None);
    let ref_a = f.rt.add_field(cls, "Ljava/lang/Object;", FieldModifiers::empty());
    let ref_b = f.rt.add_field(cls, "[I", FieldModifiers::empty());
    let prim = f.rt.add_field(cls, "I", FieldModifiers::empty());

    f.env.on_class_prepare(cls).unwrap();

    assert!(f.rt.is_watched(cls, ref_a));
    assert!(f.rt.is_watched(cls, ref_b));
    assert!(!f.rt.is_watched(cls, prim));
}

#[test]
fn test_duplicate_class_prepare_is_swallowed() {
    let f = Fixture::with_config(watchpoint_config());
    let cls = f.rt.define_class("Lcom/example/A;", None);
    f.rt.add_field(cls, "Ljava/lang/Object;", FieldModifiers::empty());

    f.env.on_class_prepare(cls).unwrap();
    let installed = f.rt.watch_count();
    f.env.on_class_prepare(cls).unwrap();
    assert_eq!(f.rt.watch_count(), installed);
}

#[test]
fn test_class_prepare_without_watchpoint_mode_is_inert() {
    let f = Fixture::new();
    let cls = f.rt.define_class("Lcom/example/A;", None);
    f.rt.add_field(cls, "Ljava/lang/Object;", FieldModifiers::empty());

    f.env.on_class_prepare(cls).unwrap();
    assert_eq!(f.rt.watch_count(), 0);
}

#[test]
fn test_write_notifications_follow_cause_acquisition() {
    let f = Fixture::with_config(watchpoint_config());
    let marker_cls = f.rt.define_class("Lcom/example/Marker;", None);
    let marker = f.rt.new_object(marker_cls);
    let inner = f.rt.new_object(marker_cls);
    let thread = f.thread();

    assert!(!f.rt.write_notifications_enabled(thread));

    f.env.begin_tracing(marker).unwrap();
    assert!(f.rt.write_notifications_enabled(thread));

    // Acquiring a second cause keeps notifications on.
    f.env.begin_tracing(inner).unwrap();
    f.env.end_tracing(inner).unwrap();
    assert!(f.rt.write_notifications_enabled(thread));

    f.env.end_tracing(marker).unwrap();
    assert!(!f.rt.write_notifications_enabled(thread));
}

#[test]
fn test_allocation_only_ambient_cause_keeps_notifications_off() {
    let f = Fixture::with_config(watchpoint_config());
    let marker_cls = f.rt.define_class("Lcom/example/Marker;", None);
    let marker = f.rt.new_object(marker_cls);
    let thread = f.thread();

    f.env.set_cause(Some(marker), false).unwrap();
    assert!(!f.rt.write_notifications_enabled(thread));

    f.env.set_cause(Some(marker), true).unwrap();
    assert!(f.rt.write_notifications_enabled(thread));

    f.env.set_cause(None, false).unwrap();
    assert!(!f.rt.write_notifications_enabled(thread));
}

// =============================================================================
// VM-Init Catch-Up
// =============================================================================

#[test]
fn test_vm_init_retransforms_and_watches_loaded_classes() {
    let config = AgentConfig {
        rewrite_enabled: true,
        watchpoints_enabled: true,
        ..Default::default()
    };
    let f = Fixture::with_config(config);

    let prepared = f.rt.define_class("Lcom/example/Prepared;", None);
    let field = f.rt.add_field(prepared, "Ljava/lang/Object;", FieldModifiers::empty());
    let unprepared = f.rt.define_class("Lcom/example/Loading;", None);
    f.rt.set_class_status(unprepared, ClassStatus::empty());

    f.env.on_vm_init().unwrap();

    let retransformed = f.rt.retransform_requests();
    assert!(retransformed.contains(&prepared));
    assert!(retransformed.contains(&unprepared));
    // The class-mirror class is not modifiable and must be skipped.
    assert!(!retransformed.contains(&f.rt.class_class()));

    assert!(f.rt.is_watched(prepared, field));
    assert!(f.rt.array_interposer_installed());
}

#[test]
fn test_vm_init_installs_interposer_even_without_modes_needing_classes() {
    let f = Fixture::new();
    f.env.on_vm_init().unwrap();
    assert!(f.rt.array_interposer_installed());
}

// =============================================================================
// Rewrite Exclusions
// =============================================================================

struct MarkAll;

impl ClassTransformer for MarkAll {
    fn transform(&self, _class_name: &str, class_data: &[u8]) -> Option<Vec<u8>> {
        let mut out = class_data.to_vec();
        out.push(0xca);
        Some(out)
    }
}

#[test]
fn test_class_file_load_skips_excluded_classes() {
    let rt = Arc::new(MockRuntime::new());
    let inspector: Arc<dyn Inspector> = rt.clone();
    let env = Environment::new(
        inspector,
        AgentConfig::default(),
        Some(Box::new(MarkAll)),
    )
    .unwrap();

    assert_eq!(env.on_class_file_load(HOOK_CLASS_NAME, &[1, 2]), None);
    assert_eq!(
        env.on_class_file_load("com/oracle/svm/core/jni/functions/JNIFunctionTables", &[1, 2]),
        None
    );
    assert_eq!(
        env.on_class_file_load("com/example/A", &[1, 2]),
        Some(vec![1, 2, 0xca])
    );
}

#[test]
fn test_class_file_load_is_inert_without_rewrite_mode() {
    let rt = Arc::new(MockRuntime::new());
    let inspector: Arc<dyn Inspector> = rt.clone();
    let env = Environment::new(
        inspector,
        watchpoint_config(),
        Some(Box::new(MarkAll)),
    )
    .unwrap();

    assert_eq!(env.on_class_file_load("com/example/A", &[1, 2]), None);
}

// =============================================================================
// Thread Lifecycle
// =============================================================================

#[test]
fn test_thread_end_drops_cause_state() {
    let f = Fixture::new();
    let marker_cls = f.rt.define_class("Lcom/example/Marker;", None);
    let b = f.rt.define_class("Lcom/example/B;", None);
    let marker = f.rt.new_object(marker_cls);
    let thread = f.thread();

    f.env.on_thread_start(thread);
    f.env.set_cause(Some(marker), true).unwrap();
    f.env.on_thread_end(thread);

    // The thread's ambient cause died with its state.
    let obj = f.rt.new_object(b);
    f.env.on_allocation(obj, thread).unwrap();
    assert_eq!(f.env.responsible_for_object(obj).unwrap(), None);
}

// =============================================================================
// Object Free and Teardown
// =============================================================================

#[test]
fn test_object_free_releases_the_context() {
    let f = Fixture::new();
    let a = f.rt.define_class("Lcom/example/A;", None);
    let b = f.rt.define_class("Lcom/example/B;", None);
    let (c, fields) = f.class_with_fields("Lcom/example/C;", 1);
    let obj = f.rt.new_object(c);
    let v = f.rt.new_object(b);

    f.enter_initializer(a);
    f.env
        .on_field_write(f.thread(), c, Some(obj), fields[0], Some(v))
        .unwrap();
    f.exit_initializer();

    let tag = f.rt.free_object(obj);
    f.env.on_object_free(tag);

    // The engine keeps running; remaining contexts are untouched.
    assert_eq!(f.raw(f.env.responsible_for_object(v).unwrap()), f.cause_of(a));
}

#[test]
fn test_cause_only_tags_need_no_free_handling() {
    let f = Fixture::new();
    let a = f.rt.define_class("Lcom/example/A;", None);
    let b = f.rt.define_class("Lcom/example/B;", None);

    f.enter_initializer(a);
    let obj = f.rt.new_object(b);
    f.env.on_allocation(obj, f.thread()).unwrap();
    f.exit_initializer();

    let tag = f.rt.free_object(obj);
    f.env.on_object_free(tag);
}

#[test]
fn test_dispose_frees_contexts_and_releases_capabilities() {
    let f = Fixture::new();
    let a = f.rt.define_class("Lcom/example/A;", None);
    let b = f.rt.define_class("Lcom/example/B;", None);
    let (c, fields) = f.class_with_fields("Lcom/example/C;", 1);
    let obj = f.rt.new_object(c);
    let v = f.rt.new_object(b);

    f.enter_initializer(a);
    f.env
        .on_field_write(f.thread(), c, Some(obj), fields[0], Some(v))
        .unwrap();
    f.exit_initializer();
    assert!(f.rt.live_weak_refs() > 0);

    f.env.dispose();

    assert!(f.rt.relinquished());
    // Class contexts released their weak mirror references.
    assert_eq!(f.rt.live_weak_refs(), 0);
}

#[test]
fn test_dispose_is_idempotent() {
    let f = Fixture::new();
    f.env.dispose();
    f.env.dispose();
    assert!(f.rt.relinquished());
}

#[test]
fn test_dispose_survives_a_failed_heap_walk() {
    let f = Fixture::new();
    let a = f.rt.define_class("Lcom/example/A;", None);
    let b = f.rt.define_class("Lcom/example/B;", None);
    let (c, fields) = f.class_with_fields("Lcom/example/C;", 1);
    let obj = f.rt.new_object(c);
    let v = f.rt.new_object(b);

    f.enter_initializer(a);
    f.env
        .on_field_write(f.thread(), c, Some(obj), fields[0], Some(v))
        .unwrap();
    f.exit_initializer();

    // Abnormal exit: the walk fails, contexts leak, nothing blows up.
    f.rt.fail_heap_walks();
    f.env.dispose();
    assert!(!f.rt.relinquished());
}
