//! The FlexBuffer type tag (spec §3) and the packed type byte that fuses a
//! tag with a [`BitWidth`].

use crate::bitwidth::BitWidth;

/// The 6-bit type tag stored in every packed type byte.
///
/// Tag values follow the reference FlexBuffers implementation: `Bool`'s
/// typed-vector counterpart (`VectorBool`) is deliberately non-contiguous
/// with the rest of the typed-vector range, which is why
/// [`is_typed_vector_type`] below needs an explicit extra case rather than a
/// single range check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FlexBufferType {
    Null = 0,
    Int = 1,
    UInt = 2,
    Float = 3,
    Key = 4,
    String = 5,
    IndirectInt = 6,
    IndirectUInt = 7,
    IndirectFloat = 8,
    Map = 9,
    Vector = 10,
    VectorInt = 11,
    VectorUInt = 12,
    VectorFloat = 13,
    VectorKey = 14,
    VectorStringDeprecated = 15,
    VectorInt2 = 16,
    VectorUInt2 = 17,
    VectorFloat2 = 18,
    VectorInt3 = 19,
    VectorUInt3 = 20,
    VectorFloat3 = 21,
    VectorInt4 = 22,
    VectorUInt4 = 23,
    VectorFloat4 = 24,
    Blob = 25,
    Bool = 26,
    VectorBool = 36,
}

impl FlexBufferType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Decode a 6-bit tag read off the wire. Returns `None` for an unknown
    /// tag (spec §7 `unknown_type`); callers surface that as a reader error
    /// rather than panicking, since the tag comes from untrusted input.
    pub fn from_tag(tag: u8) -> Option<Self> {
        use FlexBufferType::*;
        Some(match tag {
            0 => Null,
            1 => Int,
            2 => UInt,
            3 => Float,
            4 => Key,
            5 => String,
            6 => IndirectInt,
            7 => IndirectUInt,
            8 => IndirectFloat,
            9 => Map,
            10 => Vector,
            11 => VectorInt,
            12 => VectorUInt,
            13 => VectorFloat,
            14 => VectorKey,
            15 => VectorStringDeprecated,
            16 => VectorInt2,
            17 => VectorUInt2,
            18 => VectorFloat2,
            19 => VectorInt3,
            20 => VectorUInt3,
            21 => VectorFloat3,
            22 => VectorInt4,
            23 => VectorUInt4,
            24 => VectorFloat4,
            25 => Blob,
            26 => Bool,
            36 => VectorBool,
            _ => return None,
        })
    }

    /// Inline scalars store their value directly in the slot; everything
    /// else stores a back-offset to the referent (spec §3 Value payload).
    pub fn is_inline(self) -> bool {
        matches!(
            self,
            FlexBufferType::Null | FlexBufferType::Int | FlexBufferType::UInt | FlexBufferType::Float | FlexBufferType::Bool
        )
    }
}

/// Element types a *generic* typed vector may hold (spec §4.4 step 4).
///
/// `Bool` is handled by the separate, non-contiguous `VectorBool` tag (see
/// [`to_typed_vector`]), so it is intentionally excluded here.
pub fn is_typed_vector_element_type(ty: FlexBufferType) -> bool {
    matches!(
        ty,
        FlexBufferType::Int | FlexBufferType::UInt | FlexBufferType::Float | FlexBufferType::Key | FlexBufferType::String
    )
}

/// Whether `ty` is any flavor of typed vector (variable-length or fixed),
/// per spec §3: "falls within the contiguous typed-vector range", plus the
/// `VectorBool` special case the reference format carves out.
pub fn is_typed_vector_type(ty: FlexBufferType) -> bool {
    let tag = ty.tag();
    (FlexBufferType::VectorInt.tag()..=FlexBufferType::VectorFloat4.tag()).contains(&tag)
        || ty == FlexBufferType::VectorBool
}

/// The fixed element count implied by a fixed-length typed vector's tag, or
/// `None` for a variable-length (length-prefixed) typed vector.
pub fn fixed_vector_len(ty: FlexBufferType) -> Option<usize> {
    use FlexBufferType::*;
    match ty {
        VectorInt2 | VectorUInt2 | VectorFloat2 => Some(2),
        VectorInt3 | VectorUInt3 | VectorFloat3 => Some(3),
        VectorInt4 | VectorUInt4 | VectorFloat4 => Some(4),
        _ => None,
    }
}

/// The scalar element type a typed vector's tag was built from.
pub fn typed_vector_element_type(ty: FlexBufferType) -> Option<FlexBufferType> {
    use FlexBufferType::*;
    Some(match ty {
        VectorBool => Bool,
        VectorInt | VectorInt2 | VectorInt3 | VectorInt4 => Int,
        VectorUInt | VectorUInt2 | VectorUInt3 | VectorUInt4 => UInt,
        VectorFloat | VectorFloat2 | VectorFloat3 | VectorFloat4 => Float,
        VectorKey => Key,
        VectorStringDeprecated => String,
        _ => return None,
    })
}

/// Map a scalar element type (and, for fixed vectors, a length of 2/3/4) to
/// its typed-vector tag (spec §4.4 step 9 / §9 "fixed-length typed vectors").
///
/// # Panics
/// Panics if `elem_type` is not a valid typed-vector element type, or if
/// `fixed_len` is not one of 0 (variable-length), 2, 3, or 4.
pub fn to_typed_vector(elem_type: FlexBufferType, fixed_len: usize) -> FlexBufferType {
    if elem_type == FlexBufferType::Bool {
        assert_eq!(fixed_len, 0, "fixed-length bool vectors are not part of the format");
        return FlexBufferType::VectorBool;
    }
    assert!(
        is_typed_vector_element_type(elem_type),
        "{elem_type:?} is not a valid typed-vector element type"
    );
    let base = match fixed_len {
        0 => FlexBufferType::VectorInt,
        2 => FlexBufferType::VectorInt2,
        3 => FlexBufferType::VectorInt3,
        4 => FlexBufferType::VectorInt4,
        _ => unreachable!("fixed_len must be 0, 2, 3, or 4, got {fixed_len}"),
    };
    let delta = elem_type.tag() - FlexBufferType::Int.tag();
    FlexBufferType::from_tag(base.tag() + delta).unwrap_or_else(|| unreachable!("computed tag is always a valid VectorX tag"))
}

/// Fuse a [`BitWidth`] and a [`FlexBufferType`] into the single packed type
/// byte every slot carries (spec §3 glossary "Packed type").
pub fn packed_type(width: BitWidth, ty: FlexBufferType) -> u8 {
    (ty.tag() << 2) | width.code()
}

/// Split a packed type byte back into its width and tag. The tag is not
/// validated here -- callers that read untrusted bytes should follow up
/// with [`FlexBufferType::from_tag`] on the returned raw tag.
pub fn unpack_packed_type(byte: u8) -> (BitWidth, u8) {
    (BitWidth::from_code(byte & 0x3), byte >> 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_type_round_trips() {
        for ty in [FlexBufferType::String, FlexBufferType::VectorBool, FlexBufferType::Map] {
            for bw in [BitWidth::W8, BitWidth::W16, BitWidth::W32, BitWidth::W64] {
                let packed = packed_type(bw, ty);
                let (got_bw, got_tag) = unpack_packed_type(packed);
                assert_eq!(got_bw, bw);
                assert_eq!(FlexBufferType::from_tag(got_tag), Some(ty));
            }
        }
    }

    #[test]
    fn unknown_tag_is_none() {
        assert_eq!(FlexBufferType::from_tag(63), None);
        assert_eq!(FlexBufferType::from_tag(27), None);
    }

    #[test]
    fn vector_bool_is_typed_but_not_contiguous_with_int_range() {
        assert!(is_typed_vector_type(FlexBufferType::VectorBool));
        assert!(!(11..=24).contains(&FlexBufferType::VectorBool.tag()));
    }

    #[test]
    fn to_typed_vector_round_trips_element_type() {
        for elem in [FlexBufferType::Int, FlexBufferType::UInt, FlexBufferType::Float, FlexBufferType::Key, FlexBufferType::String]
        {
            let v = to_typed_vector(elem, 0);
            assert_eq!(typed_vector_element_type(v), Some(elem));
            assert_eq!(fixed_vector_len(v), None);
            for len in [2usize, 3, 4] {
                let fixed = to_typed_vector(elem, len);
                assert_eq!(typed_vector_element_type(fixed), Some(elem));
                assert_eq!(fixed_vector_len(fixed), Some(len));
            }
        }
        assert_eq!(to_typed_vector(FlexBufferType::Bool, 0), FlexBufferType::VectorBool);
    }
}
