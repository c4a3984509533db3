//! The growable, contiguous byte store the builder writes into (spec §2.2).
//!
//! Unlike the original source, where this is an external collaborator the
//! builder merely borrows, here the store is owned directly by
//! [`crate::Builder`] -- the out-of-scope note in spec §1 describes the
//! *contract*, not a requirement that it live in a separate type.

use flexbuffers_error::{flex_bail, flex_err, FlexResult};

use crate::bitwidth::padding;

/// Growth ceiling referenced in spec §9 ("Growth ceiling"): offsets beyond
/// 2^31 behave unpredictably on 32-bit platforms, so buffers are capped well
/// short of that.
pub const MAX_BUFFER_SIZE: usize = 2 * 1024 * 1024 * 1024;

const DEFAULT_CAPACITY: usize = 64;

/// A growable byte buffer, doubling capacity on demand (spec §5 "Resource
/// policy"), zero-initialized so alignment padding never leaks uninitialized
/// bytes into the document.
pub struct ByteBuffer {
    data: Vec<u8>,
    len: usize,
}

impl ByteBuffer {
    pub fn with_capacity(initial_size: usize) -> Self {
        let cap = initial_size.max(DEFAULT_CAPACITY).next_power_of_two();
        Self { data: vec![0u8; cap], len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ensure at least `n` more bytes can be written without reallocating,
    /// growing by repeated doubling (spec §5).
    pub fn ensure_space(&mut self, n: usize) -> FlexResult<()> {
        let needed = self
            .len
            .checked_add(n)
            .ok_or_else(|| flex_err!(CapacityExhausted: "requested size overflowed usize"))?;
        if needed <= self.data.len() {
            return Ok(());
        }
        if needed > MAX_BUFFER_SIZE {
            flex_bail!(CapacityExhausted: "flexbuffer would grow to {needed} bytes, exceeding the {MAX_BUFFER_SIZE}-byte ceiling");
        }
        let mut new_cap = self.data.len().max(1);
        while new_cap < needed {
            new_cap = new_cap
                .checked_mul(2)
                .ok_or_else(|| flex_err!(CapacityExhausted: "buffer capacity overflowed usize while growing"))?;
        }
        let new_cap = new_cap.min(MAX_BUFFER_SIZE.next_power_of_two());
        let mut grown = vec![0u8; new_cap];
        grown[..self.len].copy_from_slice(&self.data[..self.len]);
        log::trace!("grew flexbuffer byte buffer from {} to {new_cap} bytes", self.data.len());
        self.data = grown;
        Ok(())
    }

    /// Advance past zero-fill padding so the next write lands on `alignment`.
    pub fn align(&mut self, alignment: usize) -> FlexResult<usize> {
        let pad = padding(self.len, alignment);
        if pad > 0 {
            self.ensure_space(pad)?;
            self.len += pad;
        }
        Ok(pad)
    }

    pub fn push_byte(&mut self, byte: u8) -> FlexResult<()> {
        self.ensure_space(1)?;
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> FlexResult<()> {
        self.ensure_space(bytes.len())?;
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Write the low `width` bytes of `v`'s little-endian representation.
    /// Callers guarantee via bit-width election that `v` fits in `width`.
    pub fn write_uint(&mut self, v: u64, width: usize) -> FlexResult<()> {
        debug_assert!(matches!(width, 1 | 2 | 4 | 8), "width must be 1, 2, 4, or 8, got {width}");
        self.write_bytes(&v.to_le_bytes()[..width])
    }

    /// Two's-complement truncation of `v` to `width` bytes preserves the
    /// value whenever `v` fits, which bit-width election guarantees.
    pub fn write_int(&mut self, v: i64, width: usize) -> FlexResult<()> {
        self.write_uint(v as u64, width)
    }

    pub fn write_float(&mut self, v: f64, width: usize) -> FlexResult<()> {
        match width {
            4 => {
                #[allow(clippy::cast_possible_truncation)]
                let bits = (v as f32).to_bits();
                self.write_bytes(&bits.to_le_bytes())
            }
            8 => self.write_bytes(&v.to_bits().to_le_bytes()),
            _ => unreachable!("float width must be 4 or 8, got {width}"),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Rewind to empty while keeping the allocation (spec §5 `reset`).
    pub fn reset(&mut self) {
        self.len = 0;
        debug_assert!(self.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_doubles_and_preserves_contents() {
        let mut buf = ByteBuffer::with_capacity(1);
        for i in 0..200u8 {
            buf.push_byte(i).unwrap();
        }
        assert_eq!(buf.len(), 200);
        assert_eq!(buf.as_slice()[0], 0);
        assert_eq!(buf.as_slice()[199], 199);
    }

    #[test]
    fn align_pads_with_zeros() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.push_byte(1).unwrap();
        let pad = buf.align(4).unwrap();
        assert_eq!(pad, 3);
        assert_eq!(buf.as_slice(), &[1, 0, 0, 0]);
    }

    #[test]
    fn reset_keeps_capacity_but_clears_len() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.write_bytes(&[1, 2, 3, 4, 5]).unwrap();
        buf.reset();
        assert_eq!(buf.len(), 0);
        assert!(buf.as_slice().is_empty());
    }
}
