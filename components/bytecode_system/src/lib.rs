//! Bytecode system for the MicaScript runtime.
//!
//! This crate defines the compact byte-encoded instruction set, the
//! immutable compiled [`Function`], and the [`Program`] that binds a root
//! function to its globals and string-literal pool.
//!
//! # Example
//!
//! ```
//! use bytecode_system::{Function, Op};
//! use core_types::{Atom, Value};
//!
//! let mut f = Function::new(Atom::EMPTY);
//! let k = f.add_constant(Value::Integer(42));
//! f.emit_op(Op::PushK);
//! f.emit_u8(k as u8);
//! f.emit_op(Op::Ret);
//! f.emit_u8(1);
//! assert_eq!(f.code.len(), 4);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod disasm;
pub mod function;
pub mod opcode;
pub mod program;

pub use disasm::disassemble;
pub use function::Function;
pub use opcode::Op;
pub use program::Program;
