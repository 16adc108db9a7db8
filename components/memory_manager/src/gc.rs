//! Mark-and-sweep collection over both stores.
//!
//! The caller supplies the root values (VM stacks, frame `this` values,
//! program constants and globals, built-in prototypes); the heap adds its
//! own static-object pin set and every non-collectable object. Marking
//! uses an explicit worklist so property cycles terminate; the sweep frees
//! unmarked collectable slots in both stores.
//!
//! Collections only run at VM safe points, never mid-opcode.

use crate::heap::Heap;
use crate::object::ObjectKind;
use core_types::{ObjectId, Value};

/// Result of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStats {
    /// Objects freed by the sweep.
    pub objects_freed: u32,
    /// Strings freed by the sweep.
    pub strings_freed: u32,
}

impl Heap {
    /// Runs a full mark-and-sweep collection seeded with `roots`.
    pub fn collect(&mut self, roots: &[Value]) -> GcStats {
        self.strings.gc_clear();
        self.objects.gc_clear();

        let mut worklist: Vec<ObjectId> = Vec::new();

        // Non-collectable objects (prototypes, the root function) and
        // pinned statics are unconditional roots.
        let pinned: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, o)| !o.collectable())
            .map(|(id, _)| ObjectId(id))
            .collect();
        for id in pinned {
            self.mark_object(id, &mut worklist);
        }
        let statics: Vec<Value> = self.static_values().to_vec();
        for value in statics {
            self.mark_value(value, &mut worklist);
        }
        for value in roots {
            self.mark_value(*value, &mut worklist);
        }

        while let Some(id) = worklist.pop() {
            let mut referenced: Vec<Value> = Vec::new();
            if let Some(object) = self.objects.get(id.raw()) {
                referenced.extend(object.properties().iter().map(|(_, v)| *v));
                referenced.extend(object.elements().iter().copied());
                if let ObjectKind::Function(f) = object.kind() {
                    referenced.extend(f.constants.iter().copied());
                }
            }
            for value in referenced {
                self.mark_value(value, &mut worklist);
            }
        }

        let objects_freed = self.objects.sweep(|o| o.collectable());
        let strings_freed = self.strings.sweep(|_| true);
        self.reset_allocation_counter();

        GcStats { objects_freed, strings_freed }
    }

    /// Marks whatever a value references.
    pub fn mark_value(&mut self, value: Value, worklist: &mut Vec<ObjectId>) {
        match value {
            Value::Str(id) => self.strings.gc_mark(id.raw()),
            Value::Obj(id) | Value::ElemRef(id, _) => self.mark_object(id, worklist),
            _ => {}
        }
    }

    fn mark_object(&mut self, id: ObjectId, worklist: &mut Vec<ObjectId>) {
        if id.is_null() || !self.objects.is_valid(id.raw()) {
            return;
        }
        if self.objects.is_marked(id.raw()) {
            return;
        }
        self.objects.gc_mark(id.raw());
        worklist.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use core_types::Atom;

    #[test]
    fn test_unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        let live = heap.create_object(Object::mater());
        let dead = heap.create_object(Object::mater());

        let stats = heap.collect(&[Value::Obj(live)]);

        assert!(heap.is_valid_object(live));
        assert!(!heap.is_valid_object(dead));
        assert_eq!(stats.objects_freed, 1);
    }

    #[test]
    fn test_property_chain_keeps_objects_alive() {
        let mut heap = Heap::new();
        let inner = heap.create_object(Object::mater());
        let s = heap.create_string("payload");
        heap.object_mut(inner).unwrap().set_property(Atom(50), Value::Str(s));
        let outer = heap.create_object(Object::mater());
        heap.object_mut(outer).unwrap().set_property(Atom(51), Value::Obj(inner));

        heap.collect(&[Value::Obj(outer)]);

        assert!(heap.is_valid_object(inner));
        assert!(heap.is_valid_string(s));
    }

    #[test]
    fn test_cycles_terminate_and_survive() {
        let mut heap = Heap::new();
        let a = heap.create_object(Object::mater());
        let b = heap.create_object(Object::mater());
        heap.object_mut(a).unwrap().set_property(Atom(60), Value::Obj(b));
        heap.object_mut(b).unwrap().set_property(Atom(61), Value::Obj(a));

        heap.collect(&[Value::Obj(a)]);

        assert!(heap.is_valid_object(a));
        assert!(heap.is_valid_object(b));
    }

    #[test]
    fn test_static_pin_roots_object() {
        let mut heap = Heap::new();
        let pinned = heap.create_object(Object::mater());
        heap.add_static_object(pinned);

        heap.collect(&[]);
        assert!(heap.is_valid_object(pinned));

        heap.remove_static_object(pinned);
        heap.collect(&[]);
        assert!(!heap.is_valid_object(pinned));
    }

    #[test]
    fn test_non_collectable_survives_and_marks_children() {
        let mut heap = Heap::new();
        let child = heap.create_object(Object::mater());
        let mut proto = Object::mater();
        proto.set_collectable(false);
        proto.set_property(Atom(70), Value::Obj(child));
        let proto_id = heap.create_object(proto);

        heap.collect(&[]);

        assert!(heap.is_valid_object(proto_id));
        assert!(heap.is_valid_object(child));
    }

    #[test]
    fn test_element_ref_roots_target() {
        let mut heap = Heap::new();
        let target = heap.create_object(Object::array());
        heap.collect(&[Value::ElemRef(target, 0)]);
        assert!(heap.is_valid_object(target));
    }

    #[test]
    fn test_collect_resets_trigger() {
        let mut heap = Heap::new();
        heap.set_gc_threshold(1);
        let _ = heap.create_string("x");
        assert!(heap.should_collect());
        heap.collect(&[]);
        assert!(!heap.should_collect());
    }
}
