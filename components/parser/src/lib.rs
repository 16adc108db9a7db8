//! MicaScript parser.
//!
//! A byte [`Scanner`] feeds a single-pass recursive-descent grammar that
//! emits bytecode for each nested function as it parses. There is no AST:
//! the emitter writes into the function under construction, using deferred
//! code regions where emission order differs from parse order (`switch`
//! case bodies, `for` iteration expressions).
//!
//! # Example
//!
//! ```
//! use core_types::AtomTable;
//! use memory_manager::Heap;
//!
//! let mut heap = Heap::new();
//! let mut atoms = AtomTable::new();
//! let program = parser::parse_program("var a = 1 + 2;", &mut heap, &mut atoms).unwrap();
//! assert!(heap.object(program.main).unwrap().has_code());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod emitter;
mod grammar;
mod scanner;

pub use emitter::{Emitter, Label};
pub use grammar::{parse_program, ParseError};
pub use scanner::{Scanner, Token};
