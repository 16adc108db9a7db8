//! Identifier interning.
//!
//! Every identifier and built-in name is interned into a 16-bit [`Atom`].
//! Equal byte sequences always yield equal atoms, and atoms live for the
//! whole process. Well-known names occupy a reserved low range so that
//! comparisons against them are compile-time constants.

use std::collections::HashMap;
use std::fmt;

/// An interned identifier or well-known name.
///
/// Atoms are pure value types: two atoms compare equal exactly when the
/// strings they intern are byte-identical. The default atom is
/// [`Atom::EMPTY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Atom(pub u16);

impl Atom {
    /// The empty atom, interning the empty string.
    pub const EMPTY: Atom = Atom(0);

    /// Raw 16-bit id.
    pub fn raw(self) -> u16 {
        self.0
    }
}

impl From<WellKnown> for Atom {
    fn from(w: WellKnown) -> Atom {
        Atom(w as u16)
    }
}

macro_rules! well_known {
    ($($variant:ident => $name:expr,)*) => {
        /// Pre-seeded names the runtime compares against directly.
        ///
        /// These occupy atom ids `0..WellKnown::COUNT` in declaration order,
        /// so `Atom::from(WellKnown::Constructor)` is a constant.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        #[allow(missing_docs)]
        pub enum WellKnown {
            $($variant,)*
        }

        impl WellKnown {
            const NAMES: &'static [&'static str] = &[$($name,)*];

            /// Number of well-known atoms.
            pub const COUNT: u16 = Self::NAMES.len() as u16;
        }
    };
}

well_known! {
    Empty => "",
    Constructor => "constructor",
    ToString => "toString",
    Iterator => "iterator",
    Done => "done",
    Next => "next",
    Value => "value",
    Length => "length",
    LookupHostname => "lookupHostname",
    CurrentTime => "currentTime",
    Delay => "delay",
    Print => "print",
    Println => "println",
    Printf => "printf",
    ToInt => "toInt",
    ToUInt => "toUInt",
    ToFloat => "toFloat",
    Arguments => "arguments",
    Import => "import",
    ImportString => "importString",
    WaitForEvent => "waitForEvent",
    Meminfo => "meminfo",
    Array => "Array",
    Object => "Object",
    IteratorProto => "Iterator",
    Tcp => "TCP",
    Udp => "UDP",
    IpAddr => "IPAddr",
    Gpio => "GPIO",
    Base64 => "Base64",
    Json => "JSON",
    Fs => "FS",
    File => "File",
    Directory => "Directory",
    Task => "Task",
    Main => "main",
}

/// Process-wide table mapping byte sequences to [`Atom`]s and back.
///
/// Interning is idempotent; atoms are never destroyed. The table is
/// pre-seeded with the [`WellKnown`] names.
pub struct AtomTable {
    names: Vec<String>,
    lookup: HashMap<String, Atom>,
}

impl AtomTable {
    /// Creates a table pre-seeded with the well-known atoms.
    pub fn new() -> Self {
        let mut table = AtomTable {
            names: Vec::with_capacity(WellKnown::COUNT as usize),
            lookup: HashMap::new(),
        };
        for name in WellKnown::NAMES {
            table.intern(name);
        }
        table
    }

    /// Interns `name`, returning its atom. Idempotent.
    pub fn intern(&mut self, name: &str) -> Atom {
        if let Some(&atom) = self.lookup.get(name) {
            return atom;
        }
        assert!(self.names.len() < u16::MAX as usize, "atom table full");
        let atom = Atom(self.names.len() as u16);
        self.names.push(name.to_string());
        self.lookup.insert(name.to_string(), atom);
        atom
    }

    /// Reverse lookup for diagnostics and property access by name.
    ///
    /// Unknown atoms resolve to the empty string rather than failing; the
    /// handle came from this table or it is a bug upstream.
    pub fn resolve(&self, atom: Atom) -> &str {
        self.names.get(atom.0 as usize).map(String::as_str).unwrap_or("")
    }

    /// Number of interned atoms.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when no atoms are interned (never, in practice: the table is
    /// pre-seeded).
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AtomTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomTable").field("len", &self.names.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_idempotent() {
        let mut atoms = AtomTable::new();
        let a = atoms.intern("foo");
        let b = atoms.intern("foo");
        assert_eq!(a, b);
        let c = atoms.intern("bar");
        assert_ne!(a, c);
    }

    #[test]
    fn test_resolve_round_trip() {
        let mut atoms = AtomTable::new();
        let a = atoms.intern("lookupHostname");
        assert_eq!(atoms.resolve(a), "lookupHostname");
    }

    #[test]
    fn test_well_known_reserved_range() {
        let mut atoms = AtomTable::new();
        assert_eq!(atoms.intern("constructor"), WellKnown::Constructor.into());
        assert_eq!(atoms.intern("iterator"), WellKnown::Iterator.into());
        assert_eq!(atoms.intern("done"), WellKnown::Done.into());
        assert_eq!(atoms.intern("next"), WellKnown::Next.into());
        assert_eq!(atoms.intern("IPAddr"), WellKnown::IpAddr.into());
    }

    #[test]
    fn test_empty_atom() {
        let mut atoms = AtomTable::new();
        assert_eq!(atoms.intern(""), Atom::EMPTY);
        assert_eq!(atoms.resolve(Atom::EMPTY), "");
    }

    #[test]
    fn test_user_atoms_start_after_well_known() {
        let mut atoms = AtomTable::new();
        let user = atoms.intern("someUserName");
        assert!(user.raw() >= WellKnown::COUNT);
    }
}
