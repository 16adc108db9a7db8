//! The managed heap.
//!
//! Owns the string store and the object store, the static-object pin set,
//! and the allocation accounting that drives the collection trigger. The
//! collector itself lives in [`crate::gc`].

use crate::object::Object;
use crate::store::IdStore;
use core_types::{ObjectId, StringId, Value};

/// Default number of allocations between collections.
const DEFAULT_GC_THRESHOLD: u32 = 1024;

/// The managed heap: both handle stores plus GC bookkeeping.
#[derive(Debug)]
pub struct Heap {
    pub(crate) strings: IdStore<String>,
    pub(crate) objects: IdStore<Object>,
    statics: Vec<Value>,
    allocations_since_gc: u32,
    gc_threshold: u32,
    total_allocations: u64,
}

impl Heap {
    /// Creates a heap with sentinel entries in both stores.
    pub fn new() -> Self {
        let mut sentinel = Object::mater();
        sentinel.set_collectable(false);
        Heap {
            strings: IdStore::new(String::new()),
            objects: IdStore::new(sentinel),
            statics: Vec::new(),
            allocations_since_gc: 0,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            total_allocations: 0,
        }
    }

    /// Overrides the collection trigger threshold.
    pub fn set_gc_threshold(&mut self, threshold: u32) {
        self.gc_threshold = threshold.max(1);
    }

    // ---- strings ----

    /// Allocates a heap string.
    pub fn create_string(&mut self, s: &str) -> StringId {
        self.note_allocation();
        StringId(self.strings.add(s.to_string()))
    }

    /// String contents; invalid handles resolve to the sentinel entry.
    pub fn string(&self, id: StringId) -> &str {
        self.strings.get(id.raw()).map(String::as_str).unwrap_or("")
    }

    /// True while the handle's slot lives.
    pub fn is_valid_string(&self, id: StringId) -> bool {
        self.strings.is_valid(id.raw())
    }

    // ---- objects ----

    /// Allocates an object.
    pub fn create_object(&mut self, object: Object) -> ObjectId {
        self.note_allocation();
        ObjectId(self.objects.add(object))
    }

    /// Shared access to an object.
    pub fn object(&self, id: ObjectId) -> Option<&Object> {
        if id.is_null() {
            return None;
        }
        self.objects.get(id.raw())
    }

    /// Exclusive access to an object.
    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        if id.is_null() {
            return None;
        }
        self.objects.get_mut(id.raw())
    }

    /// True while the handle's slot lives.
    pub fn is_valid_object(&self, id: ObjectId) -> bool {
        self.objects.is_valid(id.raw())
    }

    // ---- pins ----

    /// Pins an object as a GC root for the duration of an asynchronous
    /// operation. Pins nest: each add needs a matching remove.
    pub fn add_static_object(&mut self, id: ObjectId) {
        if !id.is_null() {
            self.statics.push(Value::Obj(id));
        }
    }

    /// Removes one pin of `id`.
    pub fn remove_static_object(&mut self, id: ObjectId) {
        self.remove_static_value(Value::Obj(id));
    }

    /// Pins an arbitrary value; only its string/object payload matters.
    /// Event records pin their callable, receiver and arguments this way
    /// while they sit in the queue.
    pub fn add_static_value(&mut self, value: Value) {
        if matches!(value, Value::Str(_) | Value::Obj(_) | Value::ElemRef(..)) {
            self.statics.push(value);
        }
    }

    /// Removes one pin of `value`.
    pub fn remove_static_value(&mut self, value: Value) {
        if let Some(pos) = self.statics.iter().position(|&s| s == value) {
            self.statics.remove(pos);
        }
    }

    /// The current pin set.
    pub fn static_values(&self) -> &[Value] {
        &self.statics
    }

    // ---- accounting ----

    fn note_allocation(&mut self) {
        self.allocations_since_gc += 1;
        self.total_allocations += 1;
    }

    /// True once allocation crossed the high-water mark; the VM asks at
    /// safe points and runs [`Heap::collect`](crate::gc) when told to.
    pub fn should_collect(&self) -> bool {
        self.allocations_since_gc >= self.gc_threshold
    }

    pub(crate) fn reset_allocation_counter(&mut self) {
        self.allocations_since_gc = 0;
    }

    /// Lifetime allocation count.
    pub fn total_allocations(&self) -> u64 {
        self.total_allocations
    }

    /// Reads a value through a slot reference.
    pub fn read_slot(&self, target: ObjectId, index: u16) -> Option<Value> {
        self.object(target).and_then(|o| o.slot(index))
    }

    /// Writes a value through a slot reference.
    pub fn write_slot(&mut self, target: ObjectId, index: u16, value: Value) {
        if let Some(o) = self.object_mut(target) {
            o.set_slot(index, value);
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let mut heap = Heap::new();
        let id = heap.create_string("hello");
        assert_eq!(heap.string(id), "hello");
        assert!(heap.is_valid_string(id));
        assert_eq!(heap.string(StringId::NULL), "");
    }

    #[test]
    fn test_object_round_trip() {
        let mut heap = Heap::new();
        let id = heap.create_object(Object::array());
        assert!(heap.is_valid_object(id));
        assert!(heap.object(id).is_some());
        assert!(heap.object(ObjectId::NULL).is_none());
    }

    #[test]
    fn test_pins_nest() {
        let mut heap = Heap::new();
        let id = heap.create_object(Object::mater());
        heap.add_static_object(id);
        heap.add_static_object(id);
        heap.remove_static_object(id);
        assert_eq!(heap.static_values(), &[Value::Obj(id)]);
        heap.remove_static_object(id);
        assert!(heap.static_values().is_empty());
    }

    #[test]
    fn test_collect_trigger() {
        let mut heap = Heap::new();
        heap.set_gc_threshold(2);
        assert!(!heap.should_collect());
        let _ = heap.create_string("a");
        let _ = heap.create_string("b");
        assert!(heap.should_collect());
    }
}
