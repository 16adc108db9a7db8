//! The polymorphic object.
//!
//! Every collectable entity other than a bare string is an [`Object`]: a
//! plain property-bag (Mater object), the same in array mode with a dense
//! element vector, a compiled script [`Function`], or a native callable
//! identified by an index into the VM's native registry.
//!
//! Properties preserve insertion order. Element references index one of
//! two slot spaces: the element vector, or (with [`PROPERTY_SPACE`] set)
//! the property list by insertion index.

use bytecode_system::Function;
use core_types::{Atom, Value, PROPERTY_SPACE};
use std::rc::Rc;

/// What an object is, beyond its property map.
///
/// Compiled functions are immutable after parse and shared by reference:
/// every activation frame holds the same `Rc` the object does.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    /// A plain property/element container.
    Mater,
    /// A compiled script function (has code).
    Function(Rc<Function>),
    /// A native callable; the payload indexes the VM's native registry.
    Native(u32),
}

/// A heap object.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    kind: ObjectKind,
    properties: Vec<(Atom, Value)>,
    elements: Vec<Value>,
    array: bool,
    collectable: bool,
}

impl Object {
    /// A plain object.
    pub fn mater() -> Self {
        Object {
            kind: ObjectKind::Mater,
            properties: Vec::new(),
            elements: Vec::new(),
            array: false,
            collectable: true,
        }
    }

    /// A plain object in array mode.
    pub fn array() -> Self {
        let mut o = Object::mater();
        o.array = true;
        o
    }

    /// A script function object.
    pub fn function(f: Function) -> Self {
        let mut o = Object::mater();
        o.kind = ObjectKind::Function(Rc::new(f));
        o
    }

    /// A native callable bound to registry slot `native`.
    pub fn native(native: u32) -> Self {
        let mut o = Object::mater();
        o.kind = ObjectKind::Native(native);
        o
    }

    /// The object's kind.
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// True for script functions.
    pub fn has_code(&self) -> bool {
        matches!(self.kind, ObjectKind::Function(_))
    }

    /// The compiled function, for script functions.
    pub fn as_function(&self) -> Option<&Function> {
        match &self.kind {
            ObjectKind::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Shared handle to the compiled function, for activation frames.
    pub fn as_function_rc(&self) -> Option<Rc<Function>> {
        match &self.kind {
            ObjectKind::Function(f) => Some(Rc::clone(f)),
            _ => None,
        }
    }

    /// The native registry slot, for native callables.
    pub fn as_native(&self) -> Option<u32> {
        match self.kind {
            ObjectKind::Native(n) => Some(n),
            _ => None,
        }
    }

    /// True when this object is in array mode.
    pub fn is_array(&self) -> bool {
        self.array
    }

    /// Switches array mode on or off.
    pub fn set_array(&mut self, array: bool) {
        self.array = array;
    }

    /// Whether the sweep may free this object.
    pub fn collectable(&self) -> bool {
        self.collectable
    }

    /// Pins or unpins the object for the sweep (built-in prototypes and
    /// the root program function are pinned).
    pub fn set_collectable(&mut self, collectable: bool) {
        self.collectable = collectable;
    }

    // ---- properties ----

    /// Property value by name.
    pub fn property(&self, name: Atom) -> Option<Value> {
        self.properties.iter().find(|(a, _)| *a == name).map(|(_, v)| *v)
    }

    /// Insertion index of a property.
    pub fn property_slot(&self, name: Atom) -> Option<u16> {
        self.properties.iter().position(|(a, _)| *a == name).map(|i| i as u16)
    }

    /// Finds the property slot, adding an `Undefined` entry when missing.
    pub fn ensure_property_slot(&mut self, name: Atom) -> u16 {
        if let Some(slot) = self.property_slot(name) {
            return slot;
        }
        self.properties.push((name, Value::Undefined));
        (self.properties.len() - 1) as u16
    }

    /// Sets a property, preserving insertion order for existing names.
    pub fn set_property(&mut self, name: Atom, value: Value) {
        let slot = self.ensure_property_slot(name);
        self.properties[slot as usize].1 = value;
    }

    /// All properties in insertion order.
    pub fn properties(&self) -> &[(Atom, Value)] {
        &self.properties
    }

    // ---- elements ----

    /// Element by index.
    pub fn element(&self, index: usize) -> Option<Value> {
        self.elements.get(index).copied()
    }

    /// Sets an element, growing the vector with `Undefined` as needed.
    pub fn set_element(&mut self, index: usize, value: Value) {
        if index >= self.elements.len() {
            self.elements.resize(index + 1, Value::Undefined);
        }
        self.elements[index] = value;
    }

    /// Appends an element.
    pub fn append_element(&mut self, value: Value) {
        self.elements.push(value);
    }

    /// All elements.
    pub fn elements(&self) -> &[Value] {
        &self.elements
    }

    /// Number of elements.
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    // ---- slot references ----

    /// Reads through a slot index as carried by an element reference.
    pub fn slot(&self, index: u16) -> Option<Value> {
        if index & PROPERTY_SPACE != 0 {
            self.properties.get((index & !PROPERTY_SPACE) as usize).map(|(_, v)| *v)
        } else {
            self.element(index as usize)
        }
    }

    /// Writes through a slot index as carried by an element reference.
    pub fn set_slot(&mut self, index: u16, value: Value) {
        if index & PROPERTY_SPACE != 0 {
            let i = (index & !PROPERTY_SPACE) as usize;
            if i < self.properties.len() {
                self.properties[i].1 = value;
            }
        } else {
            self.set_element(index as usize, value);
        }
    }

    /// Approximate payload size in bytes, for the allocator accounting.
    pub fn approximate_size(&self) -> u32 {
        let base = std::mem::size_of::<Object>();
        let props = self.properties.len() * std::mem::size_of::<(Atom, Value)>();
        let elts = self.elements.len() * std::mem::size_of::<Value>();
        let code = match &self.kind {
            ObjectKind::Function(f) => {
                f.code.len()
                    + f.constants.len() * std::mem::size_of::<Value>()
                    + f.locals.len() * std::mem::size_of::<Atom>()
            }
            _ => 0,
        };
        (base + props + elts + code) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_insertion_order() {
        let mut o = Object::mater();
        o.set_property(Atom(10), Value::Integer(1));
        o.set_property(Atom(11), Value::Integer(2));
        o.set_property(Atom(10), Value::Integer(3));

        let names: Vec<u16> = o.properties().iter().map(|(a, _)| a.raw()).collect();
        assert_eq!(names, vec![10, 11]);
        assert_eq!(o.property(Atom(10)), Some(Value::Integer(3)));
    }

    #[test]
    fn test_elements_grow_with_undefined() {
        let mut o = Object::array();
        o.set_element(2, Value::Integer(9));
        assert_eq!(o.element_count(), 3);
        assert_eq!(o.element(0), Some(Value::Undefined));
        assert_eq!(o.element(2), Some(Value::Integer(9)));
        assert_eq!(o.element(3), None);
    }

    #[test]
    fn test_slot_spaces() {
        let mut o = Object::mater();
        o.set_property(Atom(5), Value::Integer(1));
        o.append_element(Value::Integer(2));

        assert_eq!(o.slot(0), Some(Value::Integer(2)));
        assert_eq!(o.slot(PROPERTY_SPACE), Some(Value::Integer(1)));

        o.set_slot(PROPERTY_SPACE, Value::Integer(7));
        assert_eq!(o.property(Atom(5)), Some(Value::Integer(7)));
    }

    #[test]
    fn test_kinds() {
        assert!(Object::function(Function::default()).has_code());
        assert!(!Object::mater().has_code());
        assert_eq!(Object::native(3).as_native(), Some(3));
        assert!(Object::array().is_array());
    }
}
