//! The stateful writer that assembles a flexbuffer document one value at a
//! time, then emits it as a single contiguous, immutable byte slice.
//!
//! Children are always written before their parents: every `add_*` call
//! either appends concrete bytes immediately (scalars, strings, blobs, keys)
//! or defers to a framing pair (`start_vector`/`end_vector`,
//! `start_map`/`end_map`) that first lets its children push their own
//! entries, then collapses the covered range into a single offset-bearing
//! [`Value`] once every child's width is known.

use flexbuffers_error::FlexResult;

use crate::bitwidth::{width_i, width_u, BitWidth};
use crate::buffer::ByteBuffer;
use crate::pool::{hash_bytes, Pool};
use crate::types::{is_typed_vector_element_type, packed_type, to_typed_vector, FlexBufferType};
use crate::value::{Payload, Value};

/// Sharing configuration, ordered so that `>=` comparisons carry meaning
/// (the builder compares against these thresholds rather than testing
/// individual bits): `share_strings` alone (2) sits *below* the
/// `share_keys_and_strings` threshold (3) needed to actually enable string
/// sharing, which is how the format's own flag values are laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuilderFlags(u8);

impl BuilderFlags {
    pub const NONE: Self = Self(0);
    pub const SHARE_KEYS: Self = Self(1);
    pub const SHARE_STRINGS: Self = Self(2);
    pub const SHARE_KEYS_AND_STRINGS: Self = Self(3);
    pub const SHARE_KEY_VECTORS: Self = Self(4);
    pub const SHARE_ALL: Self = Self(7);

    fn share_keys(self) -> bool {
        self.0 >= Self::SHARE_KEYS.0
    }

    fn share_strings(self) -> bool {
        self.0 >= Self::SHARE_KEYS_AND_STRINGS.0
    }
}

impl Default for BuilderFlags {
    fn default() -> Self {
        Self::NONE
    }
}

impl std::ops::BitOr for BuilderFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

fn key_bytes_at(buffer: &ByteBuffer, sloc: usize) -> &[u8] {
    let data = buffer.as_slice();
    let end = data[sloc..].iter().position(|&b| b == 0).map_or(data.len(), |p| sloc + p);
    &data[sloc..end]
}

fn string_bytes_at(buffer: &ByteBuffer, sloc: usize, len: usize) -> &[u8] {
    &buffer.as_slice()[sloc..sloc + len]
}

/// A stateful flexbuffer writer. Construct with [`Builder::new`], push
/// values with the `add_*`/`start_*`/`end_*` family, then call
/// [`Builder::finish`] and read the result back with [`Builder::bytes`].
pub struct Builder {
    buffer: ByteBuffer,
    stack: Vec<Value>,
    key_pool: Pool,
    string_pool: Pool,
    flags: BuilderFlags,
    min_bit_width: BitWidth,
    finished: bool,
    has_duplicate_keys: bool,
}

impl Builder {
    pub fn new(initial_size: usize) -> Self {
        Self::new_with_flags(initial_size, BuilderFlags::NONE)
    }

    pub fn new_with_flags(initial_size: usize, flags: BuilderFlags) -> Self {
        Self {
            buffer: ByteBuffer::with_capacity(initial_size),
            stack: Vec::new(),
            key_pool: Pool::new(),
            string_pool: Pool::new(),
            flags,
            min_bit_width: BitWidth::W8,
            finished: false,
            has_duplicate_keys: false,
        }
    }

    /// Raise the floor every subsequent width election respects. Mostly
    /// useful for producing buffers with a predictable minimum slot size.
    pub fn set_min_bit_width(&mut self, min_bit_width: BitWidth) {
        self.min_bit_width = min_bit_width;
    }

    pub fn has_duplicate_keys(&self) -> bool {
        self.has_duplicate_keys
    }

    // ---- scalar adds ----------------------------------------------------

    pub fn add_null(&mut self) -> FlexResult<()> {
        self.stack.push(Value::inline(Payload::UInt(0), FlexBufferType::Null, BitWidth::W8));
        Ok(())
    }

    pub fn add_bool(&mut self, v: bool) -> FlexResult<()> {
        self.stack.push(Value::inline(Payload::UInt(u64::from(v)), FlexBufferType::Bool, BitWidth::W8));
        Ok(())
    }

    pub fn add_int(&mut self, v: i64) -> FlexResult<()> {
        self.stack.push(Value::inline(Payload::Int(v), FlexBufferType::Int, width_i(v)));
        Ok(())
    }

    pub fn add_uint(&mut self, v: u64) -> FlexResult<()> {
        self.stack.push(Value::inline(Payload::UInt(v), FlexBufferType::UInt, width_u(v)));
        Ok(())
    }

    /// `v` is stored at `w32`: a 32-bit float input carries no precision a
    /// wider slot would preserve.
    pub fn add_float(&mut self, v: f32) -> FlexResult<()> {
        self.stack.push(Value::inline(Payload::Double(f64::from(v)), FlexBufferType::Float, BitWidth::W32));
        Ok(())
    }

    /// Stored at `w32` when `v` round-trips losslessly through `f32`,
    /// otherwise `w64` (spec's "implementations MAY always pick source
    /// precision" -- this picks the narrower of the two when it is safe to).
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_double(&mut self, v: f64) -> FlexResult<()> {
        let bw = if f64::from(v as f32) == v { BitWidth::W32 } else { BitWidth::W64 };
        self.stack.push(Value::inline(Payload::Double(v), FlexBufferType::Float, bw));
        Ok(())
    }

    pub fn add_key(&mut self, key: &str) -> FlexResult<()> {
        let bytes = key.as_bytes();
        let hash = hash_bytes(bytes);
        let share = self.flags.share_keys();
        if share {
            let buffer = &self.buffer;
            if let Some(sloc) = self.key_pool.find(hash, |sloc| key_bytes_at(buffer, sloc) == bytes) {
                log::trace!("reused pooled key at offset {sloc}");
                self.stack.push(Value::offset(sloc, FlexBufferType::Key, BitWidth::W8));
                return Ok(());
            }
        }
        self.buffer.ensure_space(bytes.len() + 1)?;
        let sloc = self.buffer.len();
        self.buffer.write_bytes(bytes)?;
        self.buffer.push_byte(0)?;
        if share {
            self.key_pool.insert(hash, sloc);
        }
        self.stack.push(Value::offset(sloc, FlexBufferType::Key, BitWidth::W8));
        Ok(())
    }

    pub fn add_string(&mut self, s: &str) -> FlexResult<()> {
        let bytes = s.as_bytes();
        let hash = hash_bytes(bytes);
        let share = self.flags.share_strings();
        if share {
            let buffer = &self.buffer;
            if let Some(sloc) = self.string_pool.find(hash, |sloc| string_bytes_at(buffer, sloc, bytes.len()) == bytes) {
                log::trace!("reused pooled string at offset {sloc}");
                self.stack.push(Value::offset(sloc, FlexBufferType::String, width_u(bytes.len() as u64)));
                return Ok(());
            }
        }
        let (sloc, bw) = self.write_length_prefixed(bytes, 1)?;
        if share {
            self.string_pool.insert(hash, sloc);
        }
        self.stack.push(Value::offset(sloc, FlexBufferType::String, bw));
        Ok(())
    }

    pub fn add_blob(&mut self, bytes: &[u8]) -> FlexResult<()> {
        let (sloc, bw) = self.write_length_prefixed(bytes, 0)?;
        self.stack.push(Value::offset(sloc, FlexBufferType::Blob, bw));
        Ok(())
    }

    fn write_length_prefixed(&mut self, bytes: &[u8], trailing: usize) -> FlexResult<(usize, BitWidth)> {
        let len = bytes.len() as u64;
        let bw = width_u(len);
        self.buffer.ensure_space(8 + bytes.len() + trailing)?;
        self.buffer.align(bw.byte_width())?;
        self.buffer.write_uint(len, bw.byte_width())?;
        let sloc = self.buffer.len();
        self.buffer.write_bytes(bytes)?;
        for _ in 0..trailing {
            self.buffer.push_byte(0)?;
        }
        Ok((sloc, bw))
    }

    // ---- indirect scalars -------------------------------------------------
    //
    // An indirect scalar writes its value out as its own standalone
    // referent (like a string or blob would) instead of inline in the
    // parent slot, then pushes an offset-bearing `Value` pointing at it.
    // This buys nothing for a single value, but lets a *vector of offsets*
    // reference the same scalar from multiple places without repeating the
    // bytes -- the same sharing the key/string pools give named fields, for
    // unnamed numeric payloads. Not named as a distinct op in the builder
    // API list, but the type tag is part of the data model and the reader
    // already decodes it, so the builder needs a way to produce one.

    pub fn add_indirect_int(&mut self, v: i64) -> FlexResult<()> {
        let bw = width_i(v);
        self.buffer.align(bw.byte_width())?;
        let sloc = self.buffer.len();
        self.buffer.write_int(v, bw.byte_width())?;
        self.stack.push(Value::offset(sloc, FlexBufferType::IndirectInt, bw));
        Ok(())
    }

    pub fn add_indirect_uint(&mut self, v: u64) -> FlexResult<()> {
        let bw = width_u(v);
        self.buffer.align(bw.byte_width())?;
        let sloc = self.buffer.len();
        self.buffer.write_uint(v, bw.byte_width())?;
        self.stack.push(Value::offset(sloc, FlexBufferType::IndirectUInt, bw));
        Ok(())
    }

    /// Stored at `w32` when `v` round-trips losslessly through `f32`, like
    /// [`Builder::add_double`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_indirect_double(&mut self, v: f64) -> FlexResult<()> {
        let bw = if f64::from(v as f32) == v { BitWidth::W32 } else { BitWidth::W64 };
        self.buffer.align(bw.byte_width())?;
        let sloc = self.buffer.len();
        self.buffer.write_float(v, bw.byte_width())?;
        self.stack.push(Value::offset(sloc, FlexBufferType::IndirectFloat, bw));
        Ok(())
    }

    pub fn add_indirect_int_with_key(&mut self, v: i64, key: &str) -> FlexResult<()> {
        self.add_key(key)?;
        self.add_indirect_int(v)
    }

    pub fn add_indirect_uint_with_key(&mut self, v: u64, key: &str) -> FlexResult<()> {
        self.add_key(key)?;
        self.add_indirect_uint(v)
    }

    pub fn add_indirect_double_with_key(&mut self, v: f64, key: &str) -> FlexResult<()> {
        self.add_key(key)?;
        self.add_indirect_double(v)
    }

    // ---- key-prefixed convenience wrappers -------------------------------

    pub fn add_null_with_key(&mut self, key: &str) -> FlexResult<()> {
        self.add_key(key)?;
        self.add_null()
    }

    pub fn add_bool_with_key(&mut self, v: bool, key: &str) -> FlexResult<()> {
        self.add_key(key)?;
        self.add_bool(v)
    }

    pub fn add_int_with_key(&mut self, v: i64, key: &str) -> FlexResult<()> {
        self.add_key(key)?;
        self.add_int(v)
    }

    pub fn add_uint_with_key(&mut self, v: u64, key: &str) -> FlexResult<()> {
        self.add_key(key)?;
        self.add_uint(v)
    }

    pub fn add_float_with_key(&mut self, v: f32, key: &str) -> FlexResult<()> {
        self.add_key(key)?;
        self.add_float(v)
    }

    pub fn add_double_with_key(&mut self, v: f64, key: &str) -> FlexResult<()> {
        self.add_key(key)?;
        self.add_double(v)
    }

    pub fn add_string_with_key(&mut self, v: &str, key: &str) -> FlexResult<()> {
        self.add_key(key)?;
        self.add_string(v)
    }

    pub fn add_blob_with_key(&mut self, v: &[u8], key: &str) -> FlexResult<()> {
        self.add_key(key)?;
        self.add_blob(v)
    }

    // ---- vectors ----------------------------------------------------------

    pub fn start_vector(&mut self) -> usize {
        self.stack.len()
    }

    pub fn start_vector_with_key(&mut self, key: &str) -> FlexResult<usize> {
        self.add_key(key)?;
        Ok(self.start_vector())
    }

    /// Collapse everything pushed since `start` into a single vector value.
    ///
    /// # Panics
    /// Panics if `fixed` is set without `typed` (fixed-length vectors are
    /// always typed), or if `typed` is set and the staged elements do not
    /// all share one type.
    pub fn end_vector(&mut self, start: usize, typed: bool, fixed: bool) -> FlexResult<usize> {
        assert!(!fixed || typed, "a fixed-length vector must also be typed");
        assert!(start <= self.stack.len(), "end_vector start marker {start} is past the stack top {}", self.stack.len());
        let indices: Vec<usize> = (start..self.stack.len()).collect();
        let value = self.write_vector_body(&indices, typed, fixed, 1)?;
        let sloc = value.sloc();
        self.stack.truncate(start);
        self.stack.push(value);
        Ok(sloc)
    }

    /// Elects a common byte width, writes the (optional) length prefix,
    /// every element at that width, and -- for untyped vectors -- one
    /// packed-type byte per element. Shared by `end_vector` and the map
    /// key-vector emission in `end_map` (which passes a step-2 index set).
    fn write_vector_body(&mut self, indices: &[usize], typed: bool, fixed: bool, prefix_elems: usize) -> FlexResult<Value> {
        let count = indices.len();
        let elem_ty = if typed {
            let ty = self.stack[indices[0]].ty;
            for &idx in indices {
                assert!(self.stack[idx].ty == ty, "typed vector element has type {:?}, expected {ty:?}", self.stack[idx].ty);
            }
            assert!(
                is_typed_vector_element_type(ty) || ty == FlexBufferType::Bool,
                "{ty:?} cannot appear in a typed vector"
            );
            ty
        } else {
            FlexBufferType::Null
        };

        let mut bw = self.min_bit_width.max(width_u(count as u64));
        for (i, &idx) in indices.iter().enumerate() {
            bw = bw.max(self.stack[idx].element_width(self.buffer.len(), i + prefix_elems));
        }

        self.buffer.align(bw.byte_width())?;
        let bwv = bw.byte_width();
        let type_bytes = if typed { 0 } else { count };
        self.buffer.ensure_space(bwv + bwv * count + type_bytes)?;

        if !fixed {
            self.buffer.write_uint(count as u64, bwv)?;
        }
        let vloc = self.buffer.len();
        for &idx in indices {
            self.write_value_at(self.stack[idx], bwv)?;
        }
        if !typed {
            for &idx in indices {
                let sw = self.stack[idx].stored_width();
                self.buffer.push_byte(packed_type(sw, self.stack[idx].ty))?;
            }
        }

        let result_ty = if typed { to_typed_vector(elem_ty, if fixed { count } else { 0 }) } else { FlexBufferType::Vector };
        Ok(Value::offset(vloc, result_ty, bw))
    }

    fn write_value_at(&mut self, value: Value, byte_width: usize) -> FlexResult<()> {
        match value.ty {
            FlexBufferType::Null => self.buffer.write_uint(0, byte_width),
            FlexBufferType::Int => self.buffer.write_int(value.payload.i(), byte_width),
            FlexBufferType::UInt | FlexBufferType::Bool => self.buffer.write_uint(value.payload.u(), byte_width),
            FlexBufferType::Float => self.buffer.write_float(value.payload.f(), byte_width),
            _ => {
                let offset = (self.buffer.len() - value.sloc()) as u64;
                debug_assert!(
                    byte_width == 8 || offset < (1u64 << (8 * byte_width)),
                    "back-offset {offset} does not fit in {byte_width} bytes"
                );
                self.buffer.write_uint(offset, byte_width)
            }
        }
    }

    // ---- typed-vector fast path (spec's `create_typed_vector`) ------------
    //
    // Unlike `add_int`/`add_uint`, which narrow an inline scalar's own slot
    // to the smallest width its value needs, a typed vector built from an
    // already-typed contiguous array (spec §6 "elect width from the array
    // length and element size") never narrows *below* the source element's
    // natural width -- the caller already committed to `i32`, say, by
    // choosing that array type, and every element shares one slot width.
    // `bw` is therefore the max of the count's width and the element type's
    // own byte width, not a per-value re-election.

    fn write_typed_vector_header(&mut self, count: usize, elem_byte_width: usize) -> FlexResult<(usize, BitWidth)> {
        let bw = self.min_bit_width.max(width_u(count as u64)).max(BitWidth::from_byte_width(elem_byte_width));
        self.buffer.align(bw.byte_width())?;
        let bwv = bw.byte_width();
        self.buffer.ensure_space(bwv + bwv * count)?;
        self.buffer.write_uint(count as u64, bwv)?;
        Ok((bwv, bw))
    }

    pub fn create_typed_vector_i8(&mut self, values: &[i8]) -> FlexResult<()> {
        let (bwv, bw) = self.write_typed_vector_header(values.len(), 1)?;
        let vloc = self.buffer.len();
        for &v in values {
            self.buffer.write_int(i64::from(v), bwv)?;
        }
        self.stack.push(Value::offset(vloc, to_typed_vector(FlexBufferType::Int, 0), bw));
        Ok(())
    }

    pub fn create_typed_vector_i16(&mut self, values: &[i16]) -> FlexResult<()> {
        let (bwv, bw) = self.write_typed_vector_header(values.len(), 2)?;
        let vloc = self.buffer.len();
        for &v in values {
            self.buffer.write_int(i64::from(v), bwv)?;
        }
        self.stack.push(Value::offset(vloc, to_typed_vector(FlexBufferType::Int, 0), bw));
        Ok(())
    }

    pub fn create_typed_vector_i32(&mut self, values: &[i32]) -> FlexResult<()> {
        let (bwv, bw) = self.write_typed_vector_header(values.len(), 4)?;
        let vloc = self.buffer.len();
        for &v in values {
            self.buffer.write_int(i64::from(v), bwv)?;
        }
        self.stack.push(Value::offset(vloc, to_typed_vector(FlexBufferType::Int, 0), bw));
        Ok(())
    }

    pub fn create_typed_vector_i64(&mut self, values: &[i64]) -> FlexResult<()> {
        let (bwv, bw) = self.write_typed_vector_header(values.len(), 8)?;
        let vloc = self.buffer.len();
        for &v in values {
            self.buffer.write_int(v, bwv)?;
        }
        self.stack.push(Value::offset(vloc, to_typed_vector(FlexBufferType::Int, 0), bw));
        Ok(())
    }

    pub fn create_typed_vector_u8(&mut self, values: &[u8]) -> FlexResult<()> {
        let (bwv, bw) = self.write_typed_vector_header(values.len(), 1)?;
        let vloc = self.buffer.len();
        for &v in values {
            self.buffer.write_uint(u64::from(v), bwv)?;
        }
        self.stack.push(Value::offset(vloc, to_typed_vector(FlexBufferType::UInt, 0), bw));
        Ok(())
    }

    pub fn create_typed_vector_u16(&mut self, values: &[u16]) -> FlexResult<()> {
        let (bwv, bw) = self.write_typed_vector_header(values.len(), 2)?;
        let vloc = self.buffer.len();
        for &v in values {
            self.buffer.write_uint(u64::from(v), bwv)?;
        }
        self.stack.push(Value::offset(vloc, to_typed_vector(FlexBufferType::UInt, 0), bw));
        Ok(())
    }

    pub fn create_typed_vector_u32(&mut self, values: &[u32]) -> FlexResult<()> {
        let (bwv, bw) = self.write_typed_vector_header(values.len(), 4)?;
        let vloc = self.buffer.len();
        for &v in values {
            self.buffer.write_uint(u64::from(v), bwv)?;
        }
        self.stack.push(Value::offset(vloc, to_typed_vector(FlexBufferType::UInt, 0), bw));
        Ok(())
    }

    pub fn create_typed_vector_u64(&mut self, values: &[u64]) -> FlexResult<()> {
        let (bwv, bw) = self.write_typed_vector_header(values.len(), 8)?;
        let vloc = self.buffer.len();
        for &v in values {
            self.buffer.write_uint(v, bwv)?;
        }
        self.stack.push(Value::offset(vloc, to_typed_vector(FlexBufferType::UInt, 0), bw));
        Ok(())
    }

    pub fn create_typed_vector_f32(&mut self, values: &[f32]) -> FlexResult<()> {
        let (bwv, bw) = self.write_typed_vector_header(values.len(), 4)?;
        let vloc = self.buffer.len();
        for &v in values {
            self.buffer.write_float(f64::from(v), bwv)?;
        }
        self.stack.push(Value::offset(vloc, to_typed_vector(FlexBufferType::Float, 0), bw));
        Ok(())
    }

    pub fn create_typed_vector_f64(&mut self, values: &[f64]) -> FlexResult<()> {
        let (bwv, bw) = self.write_typed_vector_header(values.len(), 8)?;
        let vloc = self.buffer.len();
        for &v in values {
            self.buffer.write_float(v, bwv)?;
        }
        self.stack.push(Value::offset(vloc, to_typed_vector(FlexBufferType::Float, 0), bw));
        Ok(())
    }

    /// `VectorBool` elements are always written as single raw bytes; only
    /// the length prefix uses the elected width (mirrors how `Blob` stores
    /// its payload at a fixed byte-per-element regardless of frame width).
    pub fn create_typed_vector_bool(&mut self, values: &[bool]) -> FlexResult<()> {
        let count = values.len();
        let bw = self.min_bit_width.max(width_u(count as u64));
        self.buffer.align(bw.byte_width())?;
        let bwv = bw.byte_width();
        self.buffer.ensure_space(bwv + count)?;
        self.buffer.write_uint(count as u64, bwv)?;
        let vloc = self.buffer.len();
        for &v in values {
            self.buffer.push_byte(u8::from(v))?;
        }
        self.stack.push(Value::offset(vloc, FlexBufferType::VectorBool, bw));
        Ok(())
    }

    // ---- maps ---------------------------------------------------------

    pub fn start_map(&mut self) -> usize {
        self.stack.len()
    }

    pub fn start_map_with_key(&mut self, key: &str) -> FlexResult<usize> {
        self.add_key(key)?;
        Ok(self.start_map())
    }

    /// Sort the `(key, value)` pairs staged since `start` by key bytes,
    /// latch [`Builder::has_duplicate_keys`] if any two compare equal and
    /// their values differ, then
    /// emit the typed keys vector followed by the map's value vector.
    ///
    /// # Panics
    /// Panics if an odd number of entries was staged, or if an even-indexed
    /// entry (counting from `start`) is not `key`-typed.
    pub fn end_map(&mut self, start: usize) -> FlexResult<usize> {
        assert!(start <= self.stack.len(), "end_map start marker {start} is past the stack top {}", self.stack.len());
        let total = self.stack.len() - start;
        assert!(total % 2 == 0, "map must have an even number of staged key/value entries, got {total}");
        let n = total / 2;
        for i in 0..n {
            assert!(
                self.stack[start + i * 2].ty == FlexBufferType::Key,
                "map entry {i} is not a key (found {:?})",
                self.stack[start + i * 2].ty
            );
        }

        let mut order: Vec<usize> = (0..n).collect();
        let buffer = &self.buffer;
        let stack = &self.stack;
        order.sort_by(|&a, &b| {
            let ka = key_bytes_at(buffer, stack[start + a * 2].sloc());
            let kb = key_bytes_at(buffer, stack[start + b * 2].sloc());
            ka.cmp(kb)
        });
        for w in order.windows(2) {
            let ka = key_bytes_at(buffer, stack[start + w[0] * 2].sloc());
            let kb = key_bytes_at(buffer, stack[start + w[1] * 2].sloc());
            if ka == kb {
                let va = &stack[start + w[0] * 2 + 1];
                let vb = &stack[start + w[1] * 2 + 1];
                if !va.is_equal_value(vb) {
                    self.has_duplicate_keys = true;
                    log::debug!("duplicate map key with differing values detected: {:?}", String::from_utf8_lossy(ka));
                }
            }
        }

        let key_indices: Vec<usize> = order.iter().map(|&i| start + i * 2).collect();
        let value_indices: Vec<usize> = order.iter().map(|&i| start + i * 2 + 1).collect();

        let keys_value = self.write_vector_body(&key_indices, true, false, 1)?;
        let map_value = self.write_map_value_vector(&value_indices, keys_value)?;

        let sloc = map_value.sloc();
        self.stack.truncate(start);
        self.stack.push(map_value);
        Ok(sloc)
    }

    /// The map's value vector carries a 3-word prefix the plain vector path
    /// does not: `(keys_offset, keys_element_byte_width, count)`, all three
    /// written at the vector's own elected width (spec §4.5 step 4).
    fn write_map_value_vector(&mut self, indices: &[usize], keys_value: Value) -> FlexResult<Value> {
        let count = indices.len();
        let keys_ref = Value::offset(keys_value.sloc(), FlexBufferType::Vector, keys_value.bit_width);

        let mut bw = self.min_bit_width.max(width_u(count as u64));
        bw = bw.max(keys_ref.element_width(self.buffer.len(), 0));
        for (i, &idx) in indices.iter().enumerate() {
            bw = bw.max(self.stack[idx].element_width(self.buffer.len(), i + 3));
        }

        self.buffer.align(bw.byte_width())?;
        let bwv = bw.byte_width();
        self.buffer.ensure_space(3 * bwv + bwv * count + count)?;

        let header_slot = self.buffer.len();
        let keys_offset = (header_slot - keys_value.sloc()) as u64;
        self.buffer.write_uint(keys_offset, bwv)?;
        self.buffer.write_uint(keys_value.bit_width.byte_width() as u64, bwv)?;
        self.buffer.write_uint(count as u64, bwv)?;

        let vloc = self.buffer.len();
        for &idx in indices {
            self.write_value_at(self.stack[idx], bwv)?;
        }
        for &idx in indices {
            let sw = self.stack[idx].stored_width();
            self.buffer.push_byte(packed_type(sw, self.stack[idx].ty))?;
        }

        Ok(Value::offset(vloc, FlexBufferType::Map, bw))
    }

    // ---- finishing ------------------------------------------------------

    /// Emit the root exactly as if it were the sole element of an enclosing
    /// vector, then append the two trailer bytes.
    ///
    /// Per §4.8, the trailer's last byte (`bw`) is the *parent* width: the
    /// width of the slot the root's own back-offset (for offset-bearing
    /// roots) is stored at, right before the trailer. The packed type byte
    /// before it carries the root's own *child* width (`root.bit_width`) --
    /// for an inline scalar the two coincide, since an inline value's
    /// `element_width` is just its own `bit_width`, but for an
    /// offset-bearing root (a vector, map, or nested container) they can
    /// differ, and `get_root` relies on the packed byte to recover the
    /// child width it needs to dereference the root correctly.
    ///
    /// # Panics
    /// Panics if `finish` was already called (call [`Builder::reset`]
    /// first), or if the construction stack does not hold exactly one
    /// balanced value (unmatched `start_vector`/`start_map`).
    pub fn finish(&mut self) -> FlexResult<()> {
        assert!(!self.finished, "finish called on an already-finished builder; call reset() first");
        assert_eq!(self.stack.len(), 1, "finish requires exactly one staged value, found {} (unbalanced start_vector/start_map?)", self.stack.len());
        let root = self.stack[0];
        let bw = root.element_width(self.buffer.len(), 0);
        self.buffer.align(bw.byte_width())?;
        self.write_value_at(root, bw.byte_width())?;
        self.buffer.push_byte(packed_type(root.bit_width, root.ty))?;
        self.buffer.push_byte(bw.byte_width() as u8)?;
        self.finished = true;
        Ok(())
    }

    /// # Panics
    /// Panics if called before [`Builder::finish`].
    pub fn bytes(&self) -> &[u8] {
        assert!(self.finished, "bytes() called before finish()");
        self.buffer.as_slice()
    }

    /// Rewind to empty. Flags survive; pools, stack, and the duplicate-key
    /// latch are cleared; the underlying allocation is kept.
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.stack.clear();
        self.key_pool.clear();
        self.string_pool.clear();
        self.finished = false;
        self.has_duplicate_keys = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::unpack_packed_type;

    #[test]
    fn single_string_matches_reference_byte_layout() {
        let mut b = Builder::new(64);
        b.add_string("Hello").unwrap();
        b.finish().unwrap();
        assert_eq!(b.bytes(), &[5, b'H', b'e', b'l', b'l', b'o', 0, 6, 0x14, 1]);
    }

    #[test]
    fn typed_bool_vector_has_vector_bool_tag_and_w8_width() {
        let mut b = Builder::new(64);
        b.create_typed_vector_bool(&[true, false, true, false]).unwrap();
        b.finish().unwrap();
        let bytes = b.bytes();
        assert_eq!(*bytes.last().unwrap(), 1);
        let (bw, tag) = unpack_packed_type(bytes[bytes.len() - 2]);
        assert_eq!(bw, BitWidth::W8);
        assert_eq!(FlexBufferType::from_tag(tag), Some(FlexBufferType::VectorBool));
    }

    #[test]
    fn map_with_distinct_keys_has_no_duplicate_flag() {
        let mut b = Builder::new(64);
        let start = b.start_map();
        b.add_bool_with_key(false, "bool2").unwrap();
        b.add_bool_with_key(true, "bool1").unwrap();
        b.end_map(start).unwrap();
        b.finish().unwrap();
        assert!(!b.has_duplicate_keys());
    }

    #[test]
    fn repeated_key_with_identical_shared_value_reuses_storage_without_flagging() {
        let mut b = Builder::new_with_flags(64, BuilderFlags::SHARE_ALL);
        let start = b.start_map();
        b.add_string_with_key("welcome", "welcome").unwrap();
        b.end_map(start).unwrap();
        b.finish().unwrap();
        let one_entry_len = b.bytes().len();

        b.reset();
        let start = b.start_map();
        b.add_string_with_key("welcome", "welcome").unwrap();
        b.add_string_with_key("welcome", "welcome").unwrap();
        b.add_string_with_key("welcome", "welcome").unwrap();
        b.end_map(start).unwrap();
        b.finish().unwrap();
        // Same key, same value every time: not a conflict, so the flag stays
        // clear even though the key repeats three times.
        assert!(!b.has_duplicate_keys());
        // Three shared (key, value) pairs cost only one real emission plus
        // small back-offset slots per repeat, not three full emissions.
        assert!(b.bytes().len() < one_entry_len * 3);
    }

    #[test]
    fn repeated_key_with_differing_values_sets_duplicate_flag() {
        let mut b = Builder::new_with_flags(64, BuilderFlags::SHARE_ALL);
        let start = b.start_map();
        b.add_int_with_key(1, "k").unwrap();
        b.add_int_with_key(2, "k").unwrap();
        b.end_map(start).unwrap();
        b.finish().unwrap();
        assert!(b.has_duplicate_keys());
    }

    #[test]
    fn reset_clears_pools_so_keys_are_rewritten() {
        let mut b = Builder::new_with_flags(64, BuilderFlags::SHARE_ALL);
        b.add_key("k").unwrap();
        b.reset();
        assert!(b.key_pool.find(hash_bytes(b"k"), |_| true).is_none());
    }

    #[test]
    #[should_panic(expected = "exactly one staged value")]
    fn finish_with_unbalanced_stack_panics() {
        let mut b = Builder::new(64);
        b.add_int(1).unwrap();
        b.add_int(2).unwrap();
        b.finish().unwrap();
    }

    #[test]
    #[should_panic(expected = "fixed-length vector must also be typed")]
    fn fixed_without_typed_panics() {
        let mut b = Builder::new(64);
        let start = b.start_vector();
        b.add_int(1).unwrap();
        b.end_vector(start, false, true).unwrap();
    }

    #[test]
    #[should_panic(expected = "cannot appear in a typed vector")]
    fn typed_vector_of_non_scalar_type_panics() {
        let mut b = Builder::new(64);
        let start = b.start_vector();
        let inner = b.start_vector();
        b.end_vector(inner, false, false).unwrap();
        b.end_vector(start, true, false).unwrap();
    }

    #[test]
    fn nested_vector_round_trips_through_stack() {
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
        assert!(!b.bytes().is_empty());
    }
}
