//! Content-addressed interning for keys and strings (spec §4.6 "Sharing").
//!
//! The builder wants to ask "have I already written these exact bytes?"
//! without keeping every written string around in memory. A `Pool` answers
//! that by hashing the candidate bytes and keeping, per hash bucket, the
//! buffer offsets (`sloc`s) of everything written with that hash so far.
//! Because two different byte strings can collide on their hash, a lookup
//! still needs the caller to confirm a byte-for-byte match against the
//! bytes actually sitting in the buffer at each candidate `sloc` -- that
//! confirmation is supplied by the caller's `eq` closure rather than done
//! here, since only the caller (the builder) knows how to re-derive the
//! stored bytes for a `sloc` of a given kind (NUL-terminated key vs.
//! length-prefixed string).

use std::collections::HashMap;

/// FNV-1a, the same non-cryptographic hash used for dictionary-style
/// content interning throughout the columnar-format ecosystem this builder
/// is modeled on.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut h = OFFSET_BASIS;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(PRIME);
    }
    h
}

/// A hash-bucketed set of previously-written buffer offsets, scoped to one
/// interning domain (the builder keeps one `Pool` for keys and a separate
/// one for strings, per spec §4.6).
#[derive(Default)]
pub struct Pool {
    buckets: HashMap<u64, Vec<usize>>,
}

impl Pool {
    pub fn new() -> Self {
        Self { buckets: HashMap::new() }
    }

    /// Find a previously-interned `sloc` whose content `eq` confirms matches.
    /// Returns the first match among same-hash candidates.
    pub fn find(&self, hash: u64, mut eq: impl FnMut(usize) -> bool) -> Option<usize> {
        self.buckets.get(&hash)?.iter().copied().find(|&sloc| eq(sloc))
    }

    pub fn insert(&mut self, hash: u64, sloc: usize) {
        self.buckets.entry(hash).or_default().push(sloc);
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}
