//! Managed heap for the MicaScript runtime.
//!
//! Two index-addressed stores — one for strings, one for objects — hand
//! out stable 32-bit handles. A mark-and-sweep collector walks both stores
//! from a caller-supplied root set plus the pinned static objects; swept
//! slots return to a free pool and their handles become invalid.
//!
//! The persisted bytecode image reader/writer also lives here, since an
//! image is essentially a serialized slice of the object store.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod gc;
pub mod heap;
pub mod image;
pub mod meminfo;
pub mod object;
pub mod store;

pub use heap::Heap;
pub use image::{read_image, write_image, ImageError};
pub use meminfo::{AllocationCategory, MemoryInfo};
pub use object::{Object, ObjectKind};
pub use store::IdStore;
