//! The program model.
//!
//! A [`Program`] is what one script load produces: a root function, the
//! global symbol table, and the pool of string literals the constants
//! refer to. Its lifetime spans the load; the garbage collector treats its
//! globals and literal pool as roots.

use core_types::{Atom, ObjectId, StringId, Value};

/// A loaded program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Handle of the root function object.
    pub main: ObjectId,
    /// Global symbol table, insertion-ordered.
    globals: Vec<(Atom, Value)>,
    /// String literals referenced by constants, in creation order.
    string_literals: Vec<StringId>,
}

impl Program {
    /// Creates an empty program around a root function handle.
    pub fn new(main: ObjectId) -> Self {
        Program { main, ..Program::default() }
    }

    /// Looks up a global by name.
    pub fn global(&self, name: Atom) -> Option<Value> {
        self.globals.iter().find(|(a, _)| *a == name).map(|(_, v)| *v)
    }

    /// Sets or defines a global.
    pub fn set_global(&mut self, name: Atom, value: Value) {
        if let Some(slot) = self.globals.iter_mut().find(|(a, _)| *a == name) {
            slot.1 = value;
        } else {
            self.globals.push((name, value));
        }
    }

    /// All globals, for GC rooting and the image writer.
    pub fn globals(&self) -> &[(Atom, Value)] {
        &self.globals
    }

    /// Records a string literal handle in the pool.
    pub fn add_string_literal(&mut self, id: StringId) {
        if !self.string_literals.contains(&id) {
            self.string_literals.push(id);
        }
    }

    /// The literal pool, for GC rooting and the image writer.
    pub fn string_literals(&self) -> &[StringId] {
        &self.string_literals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globals_set_and_get() {
        let mut p = Program::new(ObjectId(1));
        assert_eq!(p.global(Atom(40)), None);
        p.set_global(Atom(40), Value::Integer(1));
        p.set_global(Atom(41), Value::Integer(2));
        p.set_global(Atom(40), Value::Integer(3));
        assert_eq!(p.global(Atom(40)), Some(Value::Integer(3)));
        assert_eq!(p.globals().len(), 2);
    }

    #[test]
    fn test_literal_pool_dedups() {
        let mut p = Program::new(ObjectId(1));
        p.add_string_literal(StringId(7));
        p.add_string_literal(StringId(7));
        p.add_string_literal(StringId(8));
        assert_eq!(p.string_literals(), &[StringId(7), StringId(8)]);
    }
}
