//! Cyclic class-hierarchy bootstrap.
//!
//! `Class` is an instance of itself (`Class.class == Class`) and
//! `BasicObject` has no superclass; both objects must exist before either
//! can be given its real class pointer. `bootstrap_core` allocates both
//! with a transient null "uninitialized" class pointer and patches them
//! in place once both are live, per §4.2 and §9. No code outside this
//! function may observe that transient null pointer.

use crate::heap::Heap;
use crate::module::ModuleData;
use crate::object::{Object, ObjectPayload};

/// The two bootstrapped roots of the class hierarchy.
pub struct CoreClasses {
    pub basic_object: *mut Object,
    pub class: *mut Object,
}

/// Allocate `BasicObject` and `Class` with the cyclic `class` pointers
/// patched in, and GC disabled for the duration (bootstrap objects must
/// not be collected before any root registers them).
pub fn bootstrap_core(heap: &mut Heap) -> CoreClasses {
    let was_disabled = heap.gc_disabled();
    heap.set_gc_disabled(true);

    let mut basic_object_data = ModuleData::new(None);
    basic_object_data.name = Some("BasicObject".to_string());
    let basic_object = heap.allocate(
        Object::new(std::ptr::null_mut(), ObjectPayload::Module(basic_object_data)),
        &[],
    );

    let mut class_data = ModuleData::new(Some(basic_object));
    class_data.name = Some("Class".to_string());
    let class = heap.allocate(
        Object::new(std::ptr::null_mut(), ObjectPayload::Module(class_data)),
        &[],
    );

    // Patch the sentinel: both objects are Class instances, Class is its
    // own class.
    unsafe {
        (*basic_object).class = class;
        (*class).class = class;
    }

    tracing::debug!("core class hierarchy bootstrapped");
    heap.set_gc_disabled(was_disabled);
    CoreClasses { basic_object, class }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_is_its_own_class() {
        let mut heap = Heap::new();
        let roots = bootstrap_core(&mut heap);
        unsafe {
            assert_eq!((*roots.class).class, roots.class);
            assert_eq!((*roots.basic_object).class, roots.class);
        }
    }
}
