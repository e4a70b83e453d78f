//! The compiled instruction encoding shared between `compiler` and `interp`.
//!
//! Mirrors the opcode-byte layout: a type-code nibble plus a flags
//! nibble in the first byte, an optional extension byte when `FLAG_WIDE` is
//! set, and trailing 7-bit-per-byte packed varints.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

/// Low nibble of the first opcode byte. Stable integer constants: the
/// numeric values are part of the `CompiledBlock` binary contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeCode {
    ResetCounter = 0,
    Align = 1,
    Skip = 2,
    Bit = 3,
    Bool = 4,
    Byte = 5,
    UByte = 6,
    Short = 7,
    UShort = 8,
    Int = 9,
    Long = 10,
    Var = 11,
    StructStart = 12,
    StructEnd = 13,
    CustomType = 14,
    // 15 is reserved.
}

bitflags! {
    /// High bits of the first opcode byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpcodeFlags: u8 {
        const NAMED         = 0b0001_0000;
        const ARRAY         = 0b0010_0000;
        const LITTLE_ENDIAN = 0b0100_0000;
        const WIDE          = 0b1000_0000;
    }
}

bitflags! {
    /// The extension byte, present only when `OpcodeFlags::WIDE` is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtFlags: u8 {
        const EXTRA_AS_EXPRESSION       = 0b0000_0001;
        const EXPRESSION_OR_WHOLESTREAM = 0b0000_0010;
    }
}

/// Flags accepted by `Parser::prepare`/`parse`.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParseFlags: u32 {
        const SKIP_REMAINING_FIELDS_IF_EOF = 0b0000_0001;
    }
}

const TYPE_CODE_MASK: u8 = 0b0000_1111;

#[must_use]
pub fn opcode_byte(type_code: TypeCode, flags: OpcodeFlags) -> u8 {
    (type_code as u8 & TYPE_CODE_MASK) | flags.bits()
}

/// Decodes one opcode byte, or `None` if its low nibble is the reserved
/// type code 15. The compiler never emits that nibble, but bytecode handed
/// to the interpreter/emitter isn't otherwise checked for provenance, so
/// this stays fallible rather than trusting the caller.
#[must_use]
pub fn decode_opcode_byte(byte: u8) -> Option<(TypeCode, OpcodeFlags)> {
    let type_code = TypeCode::try_from_primitive(byte & TYPE_CODE_MASK).ok()?;
    let flags = OpcodeFlags::from_bits_truncate(byte);
    Some((type_code, flags))
}

/// Appends `value` to `out` as a 7-bit-per-byte varint with a continuation
/// bit in the high bit of every byte but the last.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Reads a varint written by `write_varint`, advancing `pos` past it.
pub fn read_varint(code: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *code.get(*pos)?;
        *pos += 1;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
    Some(value)
}

/// Parameters captured for a user-defined (`<custom-ident>`) field type at
/// compile time; interpreted only by the caller-supplied
/// `CustomFieldTypeProcessor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomTypeDescriptor {
    pub type_name: String,
}

/// The immutable product of the compiler: bytecode plus the side tables the
/// interpreter indexes positionally while walking it. Shared (by reference)
/// across any number of concurrent parses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledBlock {
    pub code: Vec<u8>,
    pub named_fields: Vec<crate::field::NamedFieldInfo>,
    pub size_evaluators: Vec<crate::eval::CompiledExpr>,
    pub custom_type_descriptors: Vec<CustomTypeDescriptor>,
    pub has_var_fields: bool,
    pub has_evaluated_arrays: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_byte_roundtrips_type_and_flags() {
        let byte = opcode_byte(TypeCode::Int, OpcodeFlags::NAMED | OpcodeFlags::ARRAY);
        let (tc, flags) = decode_opcode_byte(byte).unwrap();
        assert_eq!(TypeCode::Int, tc);
        assert_eq!(OpcodeFlags::NAMED | OpcodeFlags::ARRAY, flags);
    }

    #[test]
    fn decode_opcode_byte_rejects_the_reserved_type_code() {
        assert_eq!(None, decode_opcode_byte(0x0f));
    }

    #[test]
    fn varint_roundtrips_values() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(Some(value), read_varint(&buf, &mut pos));
            assert_eq!(buf.len(), pos);
        }
    }
}
