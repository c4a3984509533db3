//! A schema-less, self-describing binary format for heterogeneous values
//! (ints, floats, bools, strings, blobs, vectors, and string-keyed maps),
//! readable from a byte slice with no parsing pass.
//!
//! Every value is written once, back to front: children land in the buffer
//! before the parent that references them, so a parent can always compute a
//! backward byte offset to something already on disk. A finished document
//! ends with a two-byte trailer (the root's packed type, then the root's
//! own byte width) that lets [`get_root`] start from the far end of the
//! slice and walk forward from there.
//!
//! Build a document with [`Builder`], then read it back with [`get_root`]
//! (fast, deferring validation to whichever accessor first touches bad
//! data) or [`get_root_checked`] (validates every reachable offset up
//! front, for untrusted input where a hard failure beats a quiet null).

pub use bitwidth::BitWidth;
pub use builder::{Builder, BuilderFlags};
pub use flexbuffers_error::{flex_bail, flex_err, FlexError, FlexResult};
pub use reader::{get_root, get_root_checked, Map, Reference, Vector};
pub use types::FlexBufferType;

mod bitwidth;
mod builder;
mod buffer;
mod pool;
mod reader;
mod types;
mod value;
