//! Read-only, non-owning views over a finished flexbuffer document.
//!
//! Every type here borrows the document's byte slice and computes offsets
//! backward from wherever it currently sits -- there is no parsing pass and
//! no heap allocation. Every dereference is bounds-checked; on adversarial
//! or truncated input, accessors return a null/empty/zero sentinel rather
//! than panicking or reading out of bounds. [`get_root`] itself can still
//! fail outright, since it cannot even produce a sentinel `Reference`
//! without first trusting the trailer bytes.

use flexbuffers_error::{flex_err, FlexResult};

use crate::types::{fixed_vector_len, is_typed_vector_type, typed_vector_element_type, unpack_packed_type, FlexBufferType};

fn try_read_uint_le(buffer: &[u8], offset: usize, width: usize) -> Option<u64> {
    let end = offset.checked_add(width)?;
    if end > buffer.len() {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes[..width].copy_from_slice(&buffer[offset..end]);
    Some(u64::from_le_bytes(bytes))
}

fn read_float_le(buffer: &[u8], offset: usize, width: usize) -> Option<f64> {
    match width {
        #[allow(clippy::cast_possible_truncation)]
        4 => try_read_uint_le(buffer, offset, 4).map(|u| f64::from(f32::from_bits(u as u32))),
        8 => try_read_uint_le(buffer, offset, 8).map(f64::from_bits),
        _ => None,
    }
}

fn sign_extend(u: u64, width: usize) -> i64 {
    match width {
        1 => i64::from(u as u8 as i8),
        2 => i64::from(u as u16 as i16),
        4 => i64::from(u as u32 as i32),
        _ => u as i64,
    }
}

/// NUL-terminated byte scan, bounded by the buffer. Used for keys (which
/// carry no length prefix at all) and for strings (which always carry a
/// trailing NUL regardless of their length prefix's own width, making a
/// scan simpler and more robust than re-deriving that width).
fn cstr_at(buffer: &[u8], offset: usize) -> &[u8] {
    if offset > buffer.len() {
        return &[];
    }
    let end = buffer[offset..].iter().position(|&b| b == 0).map_or(buffer.len(), |p| offset + p);
    &buffer[offset..end]
}

/// Parse the two trailer bytes and produce a `Reference` to the root value
/// (spec §4.8). Performs no validation beyond the trailer itself -- a
/// corrupt offset deeper in the tree surfaces as a null sentinel from the
/// accessor that hits it, not as an error here. Use [`get_root_checked`]
/// when the buffer is untrusted and a hard failure is preferable to a
/// silently-absent value.
pub fn get_root(buffer: &[u8]) -> FlexResult<Reference<'_>> {
    if buffer.len() < 3 {
        return Err(flex_err!(BufferTooSmall: "buffer has {} bytes, need at least 3", buffer.len()));
    }
    let end = buffer.len();
    let root_byte_width = buffer[end - 1] as usize;
    if !matches!(root_byte_width, 1 | 2 | 4 | 8) {
        return Err(flex_err!(BufferTooSmall: "trailing root byte width {root_byte_width} is not 1, 2, 4, or 8"));
    }
    let packed = buffer[end - 2];
    let (child_width, tag) = unpack_packed_type(packed);
    let ty = FlexBufferType::from_tag(tag).ok_or_else(|| flex_err!(UnknownType: "root packed type tag {tag} is not a known flexbuffer type"))?;
    let root_offset = (end - 2)
        .checked_sub(root_byte_width)
        .ok_or_else(|| flex_err!(BufferTooSmall: "root byte width {root_byte_width} exceeds the {} bytes before the trailer", end - 2))?;
    Ok(Reference { buffer, offset: root_offset, parent_width: root_byte_width, byte_width: child_width.byte_width(), ty })
}

/// Like [`get_root`], but eagerly walks every reachable offset (vectors,
/// maps, indirect scalars, strings/blobs/keys) and validates it against the
/// buffer bounds before returning, instead of deferring each check to
/// first access.
pub fn get_root_checked(buffer: &[u8]) -> FlexResult<Reference<'_>> {
    let root = get_root(buffer)?;
    validate(&root, buffer.len())?;
    Ok(root)
}

fn validate(reference: &Reference, len: usize) -> FlexResult<()> {
    match reference.ty {
        FlexBufferType::Null | FlexBufferType::Int | FlexBufferType::UInt | FlexBufferType::Float | FlexBufferType::Bool => Ok(()),
        FlexBufferType::String | FlexBufferType::Key => {
            let sloc = reference
                .indirect()
                .ok_or_else(|| flex_err!(OffsetOutOfRange: "back-offset at {} exits the buffer", reference.offset))?;
            if sloc > len {
                return Err(flex_err!(OffsetOutOfRange: "referent at {sloc} exceeds buffer length {len}"));
            }
            Ok(())
        }
        FlexBufferType::Blob => {
            let sloc = reference
                .indirect()
                .ok_or_else(|| flex_err!(OffsetOutOfRange: "back-offset at {} exits the buffer", reference.offset))?;
            let len_pos = sloc
                .checked_sub(reference.byte_width)
                .ok_or_else(|| flex_err!(OffsetOutOfRange: "blob length prefix before {sloc} underflows the buffer"))?;
            let blob_len = try_read_uint_le(reference.buffer, len_pos, reference.byte_width)
                .ok_or_else(|| flex_err!(OffsetOutOfRange: "blob length prefix at {len_pos} exits the buffer"))? as usize;
            let end = sloc
                .checked_add(blob_len)
                .ok_or_else(|| flex_err!(OffsetOutOfRange: "blob at {sloc} with length {blob_len} overflows"))?;
            if end > len {
                return Err(flex_err!(OffsetOutOfRange: "blob at {sloc} with length {blob_len} exceeds buffer length {len}"));
            }
            Ok(())
        }
        FlexBufferType::IndirectInt | FlexBufferType::IndirectUInt | FlexBufferType::IndirectFloat => {
            let target = reference
                .indirect()
                .ok_or_else(|| flex_err!(OffsetOutOfRange: "indirect back-offset at {} exits the buffer", reference.offset))?;
            if target + reference.byte_width > len {
                return Err(flex_err!(OffsetOutOfRange: "indirect value at {target} exceeds buffer length {len}"));
            }
            Ok(())
        }
        FlexBufferType::Map => {
            let map_view = reference.as_map().ok_or_else(|| flex_err!(OffsetOutOfRange: "map offset at {} is invalid", reference.offset))?;
            for idx in 0..map_view.len() {
                validate(&map_view.keys.index(idx), len)?;
                validate(&map_view.values.index(idx), len)?;
            }
            Ok(())
        }
        ty if ty == FlexBufferType::Vector || is_typed_vector_type(ty) => {
            let vector_view =
                reference.as_vector().ok_or_else(|| flex_err!(OffsetOutOfRange: "vector offset at {} is invalid", reference.offset))?;
            for idx in 0..vector_view.len() {
                validate(&vector_view.index(idx), len)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// A typed, non-owning pointer into a flexbuffer document: a byte offset
/// plus enough metadata (the slot's own width, and -- for containers --
/// the width of whatever it points at) to interpret the bytes there.
#[derive(Clone, Copy, Debug)]
pub struct Reference<'a> {
    buffer: &'a [u8],
    offset: usize,
    parent_width: usize,
    byte_width: usize,
    ty: FlexBufferType,
}

impl<'a> Reference<'a> {
    pub fn null() -> Reference<'static> {
        Reference { buffer: &[], offset: 0, parent_width: 1, byte_width: 1, ty: FlexBufferType::Null }
    }

    pub fn flex_type(&self) -> FlexBufferType {
        self.ty
    }

    pub fn is_null(&self) -> bool {
        self.ty == FlexBufferType::Null
    }

    fn indirect(&self) -> Option<usize> {
        let u = try_read_uint_le(self.buffer, self.offset, self.parent_width)?;
        self.offset.checked_sub(u as usize)
    }

    pub fn as_i64(&self) -> i64 {
        match self.ty {
            FlexBufferType::Int => try_read_uint_le(self.buffer, self.offset, self.parent_width).map(|u| sign_extend(u, self.parent_width)).unwrap_or(0),
            FlexBufferType::UInt | FlexBufferType::Bool => {
                try_read_uint_le(self.buffer, self.offset, self.parent_width).map_or(0, |u| u as i64)
            }
            FlexBufferType::IndirectInt => self
                .indirect()
                .and_then(|t| try_read_uint_le(self.buffer, t, self.byte_width))
                .map(|u| sign_extend(u, self.byte_width))
                .unwrap_or(0),
            FlexBufferType::IndirectUInt => self
                .indirect()
                .and_then(|t| try_read_uint_le(self.buffer, t, self.byte_width))
                .map_or(0, |u| u as i64),
            _ => 0,
        }
    }

    pub fn as_u64(&self) -> u64 {
        match self.ty {
            FlexBufferType::UInt | FlexBufferType::Bool => try_read_uint_le(self.buffer, self.offset, self.parent_width).unwrap_or(0),
            FlexBufferType::Int => {
                try_read_uint_le(self.buffer, self.offset, self.parent_width).map_or(0, |u| sign_extend(u, self.parent_width) as u64)
            }
            FlexBufferType::IndirectUInt => self.indirect().and_then(|t| try_read_uint_le(self.buffer, t, self.byte_width)).unwrap_or(0),
            FlexBufferType::IndirectInt => self
                .indirect()
                .and_then(|t| try_read_uint_le(self.buffer, t, self.byte_width))
                .map_or(0, |u| sign_extend(u, self.byte_width) as u64),
            _ => 0,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self.ty {
            FlexBufferType::Float => read_float_le(self.buffer, self.offset, self.parent_width).unwrap_or(0.0),
            FlexBufferType::Int => self.as_i64() as f64,
            FlexBufferType::UInt => self.as_u64() as f64,
            FlexBufferType::IndirectFloat => self.indirect().and_then(|t| read_float_le(self.buffer, t, self.byte_width)).unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self.ty {
            FlexBufferType::Bool => try_read_uint_le(self.buffer, self.offset, self.parent_width).is_some_and(|u| u != 0),
            FlexBufferType::Int => self.as_i64() != 0,
            FlexBufferType::UInt => self.as_u64() != 0,
            _ => false,
        }
    }

    /// Empty string on type mismatch or a corrupt offset, never a panic.
    pub fn as_str(&self) -> &'a str {
        if self.ty != FlexBufferType::String {
            return "";
        }
        let Some(sloc) = self.indirect() else { return "" };
        std::str::from_utf8(cstr_at(self.buffer, sloc)).unwrap_or("")
    }

    /// Valid for both `key` and `string` references (both are
    /// NUL-terminated); empty otherwise.
    pub fn c_str(&self) -> &'a str {
        if !matches!(self.ty, FlexBufferType::Key | FlexBufferType::String) {
            return "";
        }
        let Some(sloc) = self.indirect() else { return "" };
        std::str::from_utf8(cstr_at(self.buffer, sloc)).unwrap_or("")
    }

    fn key_bytes(&self) -> &'a [u8] {
        if self.ty != FlexBufferType::Key {
            return &[];
        }
        match self.indirect() {
            Some(sloc) => cstr_at(self.buffer, sloc),
            None => &[],
        }
    }

    /// Empty on type mismatch or a corrupt length/offset.
    pub fn as_blob(&self) -> &'a [u8] {
        if self.ty != FlexBufferType::Blob {
            return &[];
        }
        let Some(sloc) = self.indirect() else { return &[] };
        let Some(len_pos) = sloc.checked_sub(self.byte_width) else { return &[] };
        let Some(len) = try_read_uint_le(self.buffer, len_pos, self.byte_width) else { return &[] };
        let len = len as usize;
        let Some(end) = sloc.checked_add(len) else { return &[] };
        if end > self.buffer.len() {
            return &[];
        }
        &self.buffer[sloc..end]
    }

    pub fn as_vector(&self) -> Option<Vector<'a>> {
        if self.ty == FlexBufferType::Vector {
            let vloc = self.indirect()?;
            let count = try_read_uint_le(self.buffer, vloc.checked_sub(self.byte_width)?, self.byte_width)? as usize;
            return Some(Vector { buffer: self.buffer, vloc, count, byte_width: self.byte_width, kind: VectorKind::Untyped });
        }
        if is_typed_vector_type(self.ty) {
            let vloc = self.indirect()?;
            let elem_ty = typed_vector_element_type(self.ty)?;
            let count = match fixed_vector_len(self.ty) {
                Some(n) => n,
                None => try_read_uint_le(self.buffer, vloc.checked_sub(self.byte_width)?, self.byte_width)? as usize,
            };
            return Some(Vector { buffer: self.buffer, vloc, count, byte_width: self.byte_width, kind: VectorKind::Typed(elem_ty) });
        }
        None
    }

    pub fn as_map(&self) -> Option<Map<'a>> {
        if self.ty != FlexBufferType::Map {
            return None;
        }
        let payload_end = self.indirect()?;
        let bw = self.byte_width;
        let count = try_read_uint_le(self.buffer, payload_end.checked_sub(bw)?, bw)? as usize;
        let keys_header = payload_end.checked_sub(bw * 3)?;
        let keys_back_offset = try_read_uint_le(self.buffer, keys_header, bw)? as usize;
        let keys_elem_bw = try_read_uint_le(self.buffer, keys_header + bw, bw)? as usize;
        let keys_vloc = keys_header.checked_sub(keys_back_offset)?;
        let keys = Vector { buffer: self.buffer, vloc: keys_vloc, count, byte_width: keys_elem_bw, kind: VectorKind::Typed(FlexBufferType::Key) };
        let values = Vector { buffer: self.buffer, vloc: payload_end, count, byte_width: bw, kind: VectorKind::Untyped };
        Some(Map { keys, values })
    }
}

#[derive(Clone, Copy, Debug)]
enum VectorKind {
    Untyped,
    Typed(FlexBufferType),
}

/// A counted, indexable view over a vector's elements.
#[derive(Clone, Copy, Debug)]
pub struct Vector<'a> {
    buffer: &'a [u8],
    vloc: usize,
    count: usize,
    byte_width: usize,
    kind: VectorKind,
}

impl<'a> Vector<'a> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// A null `Reference` for an out-of-range index, never a panic.
    pub fn index(&self, i: usize) -> Reference<'a> {
        if i >= self.count {
            return Reference::null();
        }
        match self.kind {
            VectorKind::Untyped => {
                let slot = self.vloc + i * self.byte_width;
                let type_byte_pos = self.vloc + self.count * self.byte_width + i;
                let Some(&packed) = self.buffer.get(type_byte_pos) else { return Reference::null() };
                let (child_width, tag) = unpack_packed_type(packed);
                let Some(ty) = FlexBufferType::from_tag(tag) else { return Reference::null() };
                Reference { buffer: self.buffer, offset: slot, parent_width: self.byte_width, byte_width: child_width.byte_width(), ty }
            }
            VectorKind::Typed(FlexBufferType::Bool) => {
                let slot = self.vloc + i;
                if self.buffer.get(slot).is_none() {
                    return Reference::null();
                }
                Reference { buffer: self.buffer, offset: slot, parent_width: 1, byte_width: 1, ty: FlexBufferType::Bool }
            }
            VectorKind::Typed(elem_ty) => {
                let slot = self.vloc + i * self.byte_width;
                Reference { buffer: self.buffer, offset: slot, parent_width: self.byte_width, byte_width: self.byte_width, ty: elem_ty }
            }
        }
    }
}

/// A string-keyed map: a parallel pair of typed `key` and untyped value
/// vectors of the same length, with keys kept in sorted order by the
/// builder so lookups can binary search.
#[derive(Clone, Copy, Debug)]
pub struct Map<'a> {
    keys: Vector<'a>,
    values: Vector<'a>,
}

impl<'a> Map<'a> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index(&self, i: usize) -> Reference<'a> {
        self.values.index(i)
    }

    pub fn key_at(&self, i: usize) -> &'a [u8] {
        self.keys.index(i).key_bytes()
    }

    /// Binary search on key bytes (the builder sorts them at `end_map`).
    pub fn get(&self, key: &str) -> Option<Reference<'a>> {
        let target = key.as_bytes();
        let mut lo = 0usize;
        let mut hi = self.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key_at(mid).cmp(target) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(self.index(mid)),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::{Builder, BuilderFlags};

    use super::*;

    #[test]
    fn single_string_round_trips() {
        let mut b = Builder::new(64);
        b.add_string("Hello").unwrap();
        b.finish().unwrap();
        let root = get_root(b.bytes()).unwrap();
        assert_eq!(root.flex_type(), FlexBufferType::String);
        assert_eq!(root.as_str(), "Hello");
    }

    #[test]
    fn typed_int_vector_round_trips() {
        let mut b = Builder::new(64);
        b.create_typed_vector_i32(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 20]).unwrap();
        b.finish().unwrap();
        let root = get_root(b.bytes()).unwrap();
        let v = root.as_vector().unwrap();
        assert_eq!(v.len(), 10);
        assert_eq!(v.index(0).as_i64(), 1);
        assert_eq!(v.index(9).as_i64(), 20);
        assert!(v.index(10).is_null());
    }

    #[test]
    fn typed_bool_vector_round_trips() {
        let mut b = Builder::new(64);
        b.create_typed_vector_bool(&[true, false, true, false]).unwrap();
        b.finish().unwrap();
        let root = get_root(b.bytes()).unwrap();
        let v = root.as_vector().unwrap();
        assert_eq!(v.len(), 4);
        assert!(v.index(0).as_bool());
        assert!(!v.index(1).as_bool());
    }

    #[test]
    fn map_sorts_keys_and_supports_lookup() {
        let mut b = Builder::new(64);
        let start = b.start_map();
        b.add_bool_with_key(false, "bool2").unwrap();
        b.add_bool_with_key(true, "bool1").unwrap();
        b.end_map(start).unwrap();
        b.finish().unwrap();

        let root = get_root(b.bytes()).unwrap();
        assert_eq!(root.flex_type(), FlexBufferType::Map);
        let m = root.as_map().unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.key_at(0), b"bool1");
        assert_eq!(m.key_at(1), b"bool2");
        assert!(m.get("bool1").unwrap().as_bool());
        assert!(!m.get("bool2").unwrap().as_bool());
        assert!(m.get("missing").is_none());
    }

    #[test]
    fn shared_keys_and_strings_round_trip_without_duplicate_flag() {
        let mut b = Builder::new_with_flags(64, BuilderFlags::SHARE_ALL);
        let start = b.start_map();
        b.add_string_with_key("welcome", "welcome").unwrap();
        b.add_string_with_key("welcome", "welcome").unwrap();
        b.end_map(start).unwrap();
        b.finish().unwrap();
        // Same key, same (shared) value both times -- no real conflict.
        assert!(!b.has_duplicate_keys());

        let root = get_root_checked(b.bytes()).unwrap();
        let m = root.as_map().unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.index(0).as_str(), "welcome");
    }

    #[test]
    fn indirect_scalars_round_trip() {
        let mut b = Builder::new(64);
        let start = b.start_vector();
        b.add_indirect_int(-12345).unwrap();
        b.add_indirect_uint(98765).unwrap();
        b.add_indirect_double(1.5).unwrap();
        b.end_vector(start, false, false).unwrap();
        b.finish().unwrap();

        let root = get_root(b.bytes()).unwrap();
        let v = root.as_vector().unwrap();
        assert_eq!(v.index(0).flex_type(), FlexBufferType::IndirectInt);
        assert_eq!(v.index(0).as_i64(), -12345);
        assert_eq!(v.index(1).flex_type(), FlexBufferType::IndirectUInt);
        assert_eq!(v.index(1).as_u64(), 98765);
        assert_eq!(v.index(2).flex_type(), FlexBufferType::IndirectFloat);
        assert!((v.index(2).as_f64() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn nested_vector_of_strings_round_trips() {
        let mut b = Builder::new(64);
        let outer = b.start_vector();
        b.add_int(1).unwrap();
        let inner = b.start_vector();
        b.add_string("a").unwrap();
        b.add_string("bb").unwrap();
        b.end_vector(inner, true, false).unwrap();
        b.add_int(3).unwrap();
        b.end_vector(outer, false, false).unwrap();
        b.finish().unwrap();

        let root = get_root(b.bytes()).unwrap();
        let outer_v = root.as_vector().unwrap();
        assert_eq!(outer_v.len(), 3);
        assert_eq!(outer_v.index(0).as_i64(), 1);
        let inner_v = outer_v.index(1).as_vector().unwrap();
        assert_eq!(inner_v.len(), 2);
        assert_eq!(inner_v.index(0).as_str(), "a");
        assert_eq!(inner_v.index(1).as_str(), "bb");
        assert_eq!(outer_v.index(2).as_i64(), 3);
    }

    #[test]
    fn get_root_rejects_too_short_buffer() {
        assert!(get_root(&[1, 2]).is_err());
    }

    #[test]
    fn get_root_rejects_bad_root_byte_width() {
        assert!(get_root(&[0, 0, 3]).is_err());
    }

    #[test]
    fn type_mismatch_returns_sentinel_not_panic() {
        let mut b = Builder::new(64);
        b.add_string("not a number").unwrap();
        b.finish().unwrap();
        let root = get_root(b.bytes()).unwrap();
        assert_eq!(root.as_i64(), 0);
        assert!(!root.as_bool());
        assert!(root.as_vector().is_none());
    }
}
