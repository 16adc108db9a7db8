//! Core MicaScript value types and error handling.
//!
//! This crate provides the foundational types shared by every stage of the
//! runtime pipeline: interned atoms, the tagged value scalar, stable store
//! handles, the error taxonomy, and the monotonic timebase.
//!
//! # Overview
//!
//! - [`Atom`] / [`AtomTable`] - interned identifiers and well-known names
//! - [`Value`] - tagged representation of script values
//! - [`StringId`] / [`ObjectId`] - stable handles into the managed stores
//! - [`Error`] / [`CallReturn`] - error taxonomy and non-normal call returns
//! - [`Time`] / [`Duration`] - monotonic timebase for the scheduler
//!
//! # Examples
//!
//! ```
//! use core_types::{AtomTable, Value};
//!
//! let mut atoms = AtomTable::new();
//! let name = atoms.intern("counter");
//! assert_eq!(atoms.intern("counter"), name);
//!
//! let v = Value::Integer(42);
//! assert_eq!(v.type_name(), "integer");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod atom;
mod error;
mod time;
mod value;

pub use atom::{Atom, AtomTable, WellKnown};
pub use error::{CallResult, CallReturn, Error};
pub use time::{Duration, Time};
pub use value::{ObjectId, StringId, Value, PROPERTY_SPACE};
