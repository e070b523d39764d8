//! Per-class field layout metadata.
//!
//! A `ClassInfo` maps each reference-typed field of a class to a dense
//! index into that class's write-history tables. Nonstatic fields are
//! flattened across the whole superclass chain (excluding the root class,
//! which declares nothing the engine cares about); static fields cover the
//! queried class only. Primitive-typed fields are excluded entirely.
//!
//! Index values are assignment order during the walk. Nothing may depend
//! on a particular order, only on the mapping being stable for the
//! lifetime of the `ClassInfo`. Instances are immutable after construction
//! and shared by reference among every context of the class.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use heaptrace_core::AgentError;
use heaptrace_inspector::{ClassRef, FieldModifiers, FieldRef, Inspector};

use crate::environment::inspect;

/// Whether a field signature names a reference type (object or array).
#[inline]
pub fn is_reference_signature(signature: &str) -> bool {
    matches!(signature.as_bytes().first(), Some(b'L') | Some(b'['))
}

/// Dense field-index maps for one class.
#[derive(Debug)]
pub struct ClassInfo {
    nonstatic: FxHashMap<FieldRef, usize>,
    statics: FxHashMap<FieldRef, usize>,
}

impl ClassInfo {
    /// Build the maps for `cls` by walking it and its superclasses.
    ///
    /// Each class in the chain is visited exactly once. The walk stops
    /// before the root class; a chain consisting only of the root is
    /// walked as itself.
    pub fn build(inspector: &dyn Inspector, cls: ClassRef) -> Result<Arc<Self>, AgentError> {
        let mut nonstatic = FxHashMap::default();
        let mut statics = FxHashMap::default();

        let mut current = Some(cls);
        while let Some(klass) = current {
            let superclass = inspect("superclass", inspector.superclass(klass))?;
            if superclass.is_none() && klass != cls {
                // Reached the root via the chain; it contributes nothing.
                break;
            }

            for field in inspect("class_fields", inspector.class_fields(klass))? {
                let signature = inspect(
                    "field_signature",
                    inspector.field_signature(klass, field),
                )?;
                if !is_reference_signature(&signature) {
                    continue;
                }

                let modifiers = inspect(
                    "field_modifiers",
                    inspector.field_modifiers(klass, field),
                )?;
                if modifiers.contains(FieldModifiers::STATIC) {
                    if klass == cls {
                        let index = statics.len();
                        statics.insert(field, index);
                    }
                } else {
                    let index = nonstatic.len();
                    let previous = nonstatic.insert(field, index);
                    debug_assert!(previous.is_none(), "field visited twice");
                }
            }

            current = superclass;
        }

        Ok(Arc::new(Self { nonstatic, statics }))
    }

    /// Dense index of a nonstatic reference field, if it is known here.
    #[inline]
    pub fn nonstatic_index(&self, field: FieldRef) -> Option<usize> {
        self.nonstatic.get(&field).copied()
    }

    /// Dense index of a static reference field declared by this class.
    #[inline]
    pub fn static_index(&self, field: FieldRef) -> Option<usize> {
        self.statics.get(&field).copied()
    }

    /// Number of nonstatic reference fields (whole chain).
    #[inline]
    pub fn nonstatic_len(&self) -> usize {
        self.nonstatic.len()
    }

    /// Number of static reference fields (this class only).
    #[inline]
    pub fn static_len(&self) -> usize {
        self.statics.len()
    }
}
