//! Error types shared by the `flexbuffers` builder and reader.
//!
//! Mirrors the error-handling shape used across the `vortex-*` crate family:
//! a small `thiserror` enum plus `flex_err!`/`flex_bail!` macros for
//! constructing and early-returning errors at the call site.
//!
//! Not every failure mode in the format is represented here. Per the
//! format's own design, a type mismatch on a reader accessor is not an
//! error (it yields a null/absent `Reference`), and a duplicate key
//! detected while sorting a map is not an error either (it latches a flag
//! the caller can inspect after `finish`). Both are recoverable parts of
//! the data model, not failures of the library. What *is* a `FlexError` is
//! a malformed or adversarial buffer on the read path, or capacity
//! exhaustion on the write path. Programming errors -- misusing the
//! builder's stack discipline -- are asserts, not `FlexError`s: they are
//! bugs in the caller, not runtime conditions to recover from.

/// Errors produced while reading or growing a flexbuffer document.
#[derive(Debug, thiserror::Error)]
pub enum FlexError {
    /// The buffer is too short to contain a valid trailer (spec: at least 3 bytes).
    #[error("buffer too small: {0}")]
    BufferTooSmall(String),

    /// A packed type byte's 6-bit tag does not name a known `FlexBufferType`.
    #[error("unknown flexbuffer type tag: {0}")]
    UnknownType(String),

    /// A computed back-offset or length would read outside the buffer.
    #[error("offset out of range: {0}")]
    OffsetOutOfRange(String),

    /// Buffer growth reached the documented ceiling (see `MAX_BUFFER_SIZE`).
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),
}

pub type FlexResult<T> = Result<T, FlexError>;

/// Construct a [`FlexError`] variant from a format string, vortex-style.
///
/// ```ignore
/// return Err(flex_err!(OffsetOutOfRange: "offset {} exceeds buffer len {}", off, len));
/// ```
#[macro_export]
macro_rules! flex_err {
    ($kind:ident : $($arg:tt)*) => {
        $crate::FlexError::$kind(format!($($arg)*))
    };
}

/// Construct and early-return a [`FlexError`], vortex-style.
#[macro_export]
macro_rules! flex_bail {
    ($kind:ident : $($arg:tt)*) => {
        return Err($crate::flex_err!($kind : $($arg)*))
    };
}
