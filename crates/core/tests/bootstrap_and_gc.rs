//! End-to-end: bootstrap the cyclic class hierarchy, allocate instances
//! that reference each other, and confirm the collector reclaims an
//! unrooted cycle while the bootstrapped classes themselves — reachable
//! only because every object's `class` pointer is a GC root — survive.

use rbcore::heap::Heap;
use rbcore::object::{Object, ObjectPayload};
use rbcore::{Value, bootstrap_core, intern};

#[test]
fn bootstrapped_classes_survive_a_collection_via_an_instances_class_pointer() {
    let mut heap = Heap::new();
    let core = bootstrap_core(&mut heap);

    // One live instance of BasicObject, rooted explicitly the way a
    // real embedder would root a global. Its `class` pointer is enough
    // to keep both halves of the bootstrap cycle (BasicObject and
    // Class, which is its own class) marked transitively.
    let instance = heap.allocate(Object::new(core.basic_object, ObjectPayload::Plain), &[]);
    let instance_root = unsafe { Value::from_object_ptr(instance) };

    heap.collect(&[instance_root]);

    assert!(heap.is_heap_cell_in_use(instance));
    assert!(heap.is_heap_cell_in_use(core.basic_object));
    assert!(heap.is_heap_cell_in_use(core.class));
}

#[test]
fn instance_ivar_cycle_without_a_root_is_reclaimed() {
    let mut heap = Heap::new();
    let core = bootstrap_core(&mut heap);

    let a = heap.allocate(Object::new(core.basic_object, ObjectPayload::Plain), &[]);
    let b = heap.allocate(Object::new(core.basic_object, ObjectPayload::Plain), &[]);
    unsafe {
        (*a).ivars.insert(intern("@peer"), Value::from_object_ptr(b));
        (*b).ivars.insert(intern("@peer"), Value::from_object_ptr(a));
    }

    heap.collect(&[]);

    assert!(!heap.is_heap_cell_in_use(a));
    assert!(!heap.is_heap_cell_in_use(b));
}
