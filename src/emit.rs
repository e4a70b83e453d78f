//! Symmetric emitter: walks a [`CompiledBlock`] in lockstep with a
//! previously-parsed [`Struct`] field tree, writing the exact byte sequence
//! the tree was parsed from (the round-trip property).
//!
//! Mirrors `interp`'s instruction decode precisely -- same opcode/flags/ext
//! handling, same struct re-entry bookkeeping -- but pulls values from the
//! already-built field tree instead of reading them from a stream. There is
//! no expression evaluator dependency here: an array's length is read
//! straight off the `Field` that holds it, since the tree already carries
//! the true count: only `pc` needs to walk the same path `interp` took.

use std::{error, fmt};

use crate::bits::{BitOrder, BitWriter, ByteOrder};
use crate::field::{Atom, Field, NamedFieldInfo, Struct};
use crate::opcode::{
    decode_opcode_byte, read_varint, CompiledBlock, ExtFlags, OpcodeFlags, TypeCode,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    MissingVarWriter,
    MissingCustomWriter,
    /// The field tree's shape disagrees with the compiled block it is
    /// being re-emitted against (e.g. an array-flagged instruction paired
    /// with a scalar `Field`, or a struct array whose declared literal
    /// count doesn't match the tree).
    FieldShapeMismatch,
    /// The low nibble of an opcode byte was the reserved type code 15.
    UnexpectedOpcode(u8),
    MalformedBytecode,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingVarWriter => {
                f.write_str("script declares a `var` field but no VarFieldWriter was supplied")
            }
            Self::MissingCustomWriter => f.write_str(
                "script declares a custom-type field but no CustomFieldTypeWriter was supplied",
            ),
            Self::FieldShapeMismatch => {
                f.write_str("field tree does not match the compiled script's shape")
            }
            Self::UnexpectedOpcode(byte) => write!(f, "unexpected opcode byte {byte:#04x}"),
            Self::MalformedBytecode => f.write_str("compiled block is not well-formed"),
        }
    }
}

impl error::Error for Error {}

/// Delegates emission of a `var` field to caller code; the mirror image of
/// `interp::VarFieldProcessor`.
pub trait VarFieldWriter {
    fn write_var(
        &mut self,
        writer: &mut BitWriter,
        field: &Field,
        name: &str,
        extra: i64,
        little_endian: bool,
    ) -> Result<(), Error>;
}

/// Delegates emission of a user-declared custom field type; the mirror
/// image of `interp::CustomFieldTypeProcessor`.
pub trait CustomFieldTypeWriter {
    fn write_custom(
        &mut self,
        writer: &mut BitWriter,
        field: &Field,
        name: &str,
        extra: i64,
        little_endian: bool,
    ) -> Result<(), Error>;
}

enum ArrayShape {
    None,
    Sized(usize),
}

struct Emitter<'a> {
    block: &'a CompiledBlock,
    writer: BitWriter,
    var_writer: Option<&'a mut dyn VarFieldWriter>,
    custom_writer: Option<&'a mut dyn CustomFieldTypeWriter>,
}

/// Re-emits the exact byte sequence `root` was parsed from, replaying it
/// against the same `block` that produced it.
pub fn emit(
    block: &CompiledBlock,
    root: &Struct,
    bit_order: BitOrder,
    var_writer: Option<&mut dyn VarFieldWriter>,
    custom_writer: Option<&mut dyn CustomFieldTypeWriter>,
) -> Result<Vec<u8>, Error> {
    let mut emitter = Emitter {
        block,
        writer: BitWriter::new(bit_order),
        var_writer,
        custom_writer,
    };
    let mut pc = 0usize;
    let mut fields = root.fields.iter();
    emitter.run_fields(&mut pc, None, &mut fields)?;
    Ok(emitter.writer.finish())
}

type FieldIter<'t> = std::slice::Iter<'t, (NamedFieldInfo, Field)>;

impl<'a> Emitter<'a> {
    fn run_fields(
        &mut self,
        pc: &mut usize,
        struct_end: Option<()>,
        fields: &mut FieldIter<'_>,
    ) -> Result<(), Error> {
        loop {
            match struct_end {
                None if *pc >= self.block.code.len() => return Ok(()),
                None => {}
                Some(()) => {
                    if *pc >= self.block.code.len() {
                        return Err(Error::MalformedBytecode);
                    }
                }
            }

            let byte = self.block.code[*pc];
            *pc += 1;
            let (type_code, opflags) = decode_opcode_byte(byte).ok_or(Error::UnexpectedOpcode(byte))?;

            if type_code == TypeCode::StructEnd {
                match struct_end {
                    Some(()) => {
                        read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
                        return Ok(());
                    }
                    None => return Err(Error::MalformedBytecode),
                }
            }

            if let TypeCode::ResetCounter | TypeCode::Align | TypeCode::Skip = type_code {
                let extra = read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
                match type_code {
                    TypeCode::ResetCounter => self.writer.reset_counter(),
                    TypeCode::Align => self.writer.align(extra as u32),
                    TypeCode::Skip => self.writer.skip(extra as i64),
                    _ => unreachable!(),
                }
                continue;
            }

            let (info, field) = fields.next().ok_or(Error::FieldShapeMismatch)?;
            self.run_instruction(pc, type_code, opflags, info, field)?;
        }
    }

    fn run_instruction(
        &mut self,
        pc: &mut usize,
        type_code: TypeCode,
        opflags: OpcodeFlags,
        info: &NamedFieldInfo,
        field: &Field,
    ) -> Result<(), Error> {
        let ext = if opflags.contains(OpcodeFlags::WIDE) {
            let b = *self.block.code.get(*pc).ok_or(Error::MalformedBytecode)?;
            *pc += 1;
            ExtFlags::from_bits_truncate(b)
        } else {
            ExtFlags::empty()
        };

        let shape = if opflags.contains(OpcodeFlags::ARRAY)
            && !ext.contains(ExtFlags::EXPRESSION_OR_WHOLESTREAM)
        {
            let literal = read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
            let len = field.array_len().ok_or(Error::FieldShapeMismatch)?;
            if literal as usize != len {
                return Err(Error::FieldShapeMismatch);
            }
            ArrayShape::Sized(len)
        } else if opflags.contains(OpcodeFlags::ARRAY) || ext.contains(ExtFlags::EXPRESSION_OR_WHOLESTREAM) {
            ArrayShape::Sized(field.array_len().ok_or(Error::FieldShapeMismatch)?)
        } else {
            ArrayShape::None
        };

        let extra = if crate::compiler::has_extra_literal(type_code) {
            read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)? as i64
        } else {
            0
        };

        let byte_order = if opflags.contains(OpcodeFlags::LITTLE_ENDIAN) {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        };
        let little_endian = byte_order == ByteOrder::LittleEndian;

        if type_code == TypeCode::StructStart {
            return self.run_struct(pc, shape, field);
        }

        self.run_atomic(pc, type_code, shape, extra, byte_order, little_endian, &info.local_name, field)
    }

    fn run_struct(&mut self, pc: &mut usize, shape: ArrayShape, field: &Field) -> Result<(), Error> {
        match (shape, field) {
            (ArrayShape::None, Field::Struct(s)) => {
                let mut it = s.fields.iter();
                self.run_fields(pc, Some(()), &mut it)
            }
            (ArrayShape::Sized(n), Field::ArrayStruct(elems)) => {
                if n != elems.len() {
                    return Err(Error::FieldShapeMismatch);
                }
                let body_start = *pc;
                if elems.is_empty() {
                    // Mirrors interp's skip mode: the body still owns opcode
                    // bytes that pc must walk past, even though it never
                    // produced (and here never re-emits) a single element.
                    return self.skip_struct_body(pc);
                }
                for element in elems {
                    *pc = body_start;
                    let mut it = element.fields.iter();
                    self.run_fields(pc, Some(()), &mut it)?;
                }
                Ok(())
            }
            _ => Err(Error::FieldShapeMismatch),
        }
    }

    /// Advances `pc` past one structure body without writing anything.
    /// Used when a counted struct array re-emits zero elements.
    fn skip_struct_body(&mut self, pc: &mut usize) -> Result<(), Error> {
        loop {
            let byte = *self.block.code.get(*pc).ok_or(Error::MalformedBytecode)?;
            *pc += 1;
            let (type_code, opflags) = decode_opcode_byte(byte).ok_or(Error::UnexpectedOpcode(byte))?;

            if type_code == TypeCode::StructEnd {
                read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
                return Ok(());
            }

            let ext = if opflags.contains(OpcodeFlags::WIDE) {
                let b = *self.block.code.get(*pc).ok_or(Error::MalformedBytecode)?;
                *pc += 1;
                ExtFlags::from_bits_truncate(b)
            } else {
                ExtFlags::empty()
            };

            if let TypeCode::ResetCounter | TypeCode::Align | TypeCode::Skip = type_code {
                read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
                continue;
            }

            if opflags.contains(OpcodeFlags::ARRAY) && !ext.contains(ExtFlags::EXPRESSION_OR_WHOLESTREAM) {
                read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
            }

            if crate::compiler::has_extra_literal(type_code) {
                read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
            }

            if type_code == TypeCode::StructStart {
                self.skip_struct_body(pc)?;
            } else if type_code == TypeCode::CustomType {
                read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_atomic(
        &mut self,
        pc: &mut usize,
        type_code: TypeCode,
        shape: ArrayShape,
        extra: i64,
        byte_order: ByteOrder,
        little_endian: bool,
        name: &str,
        field: &Field,
    ) -> Result<(), Error> {
        match shape {
            ArrayShape::None => self.write_scalar(pc, type_code, extra, byte_order, little_endian, name, field),
            ArrayShape::Sized(count) => {
                self.write_array(pc, type_code, count, extra, byte_order, little_endian, name, field)
            }
        }
    }

    fn write_scalar(
        &mut self,
        pc: &mut usize,
        type_code: TypeCode,
        extra: i64,
        byte_order: ByteOrder,
        little_endian: bool,
        name: &str,
        field: &Field,
    ) -> Result<(), Error> {
        let Field::Atom(atom) = field else {
            return Err(Error::FieldShapeMismatch);
        };
        match (type_code, atom) {
            (TypeCode::Bit, Atom::Bit { width, value }) => {
                self.writer.write_bit_field(*value, *width).map_err(|_| Error::FieldShapeMismatch)
            }
            (TypeCode::Bool, Atom::Bool(b)) => {
                self.writer.write_boolean(*b);
                Ok(())
            }
            (TypeCode::Byte, Atom::Byte(v)) => {
                self.writer.write_byte(*v);
                Ok(())
            }
            (TypeCode::UByte, Atom::UByte(v)) => {
                self.writer.write_ubyte(*v);
                Ok(())
            }
            (TypeCode::Short, Atom::Short(v)) => {
                self.writer.write_short(*v, byte_order);
                Ok(())
            }
            (TypeCode::UShort, Atom::UShort(v)) => {
                self.writer.write_ushort(*v, byte_order);
                Ok(())
            }
            (TypeCode::Int, Atom::Int(v)) => {
                self.writer.write_int(*v, byte_order);
                Ok(())
            }
            (TypeCode::Long, Atom::Long(v)) => {
                self.writer.write_long(*v, byte_order);
                Ok(())
            }
            (TypeCode::Var, Atom::Var(inner)) => {
                let writer = self.var_writer.as_deref_mut().ok_or(Error::MissingVarWriter)?;
                writer.write_var(&mut self.writer, inner, name, extra, little_endian)
            }
            (TypeCode::CustomType, Atom::Custom(inner)) => {
                let _descriptor_idx =
                    read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
                let writer = self.custom_writer.as_deref_mut().ok_or(Error::MissingCustomWriter)?;
                writer.write_custom(&mut self.writer, inner, name, extra, little_endian)
            }
            _ => Err(Error::FieldShapeMismatch),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_array(
        &mut self,
        pc: &mut usize,
        type_code: TypeCode,
        count: usize,
        extra: i64,
        byte_order: ByteOrder,
        little_endian: bool,
        name: &str,
        field: &Field,
    ) -> Result<(), Error> {
        match (type_code, field) {
            (TypeCode::Bit, Field::BitArray { width, values }) => {
                if values.len() != count {
                    return Err(Error::FieldShapeMismatch);
                }
                for &v in values {
                    self.writer.write_bit_field(v, *width).map_err(|_| Error::FieldShapeMismatch)?;
                }
                Ok(())
            }
            (TypeCode::Bool, Field::BoolArray(values)) => {
                check_len(values.len(), count)?;
                values.iter().for_each(|&b| self.writer.write_boolean(b));
                Ok(())
            }
            (TypeCode::Byte, Field::ByteArray(values)) => {
                check_len(values.len(), count)?;
                values.iter().for_each(|&v| self.writer.write_byte(v));
                Ok(())
            }
            (TypeCode::UByte, Field::UByteArray(values)) => {
                check_len(values.len(), count)?;
                values.iter().for_each(|&v| self.writer.write_ubyte(v));
                Ok(())
            }
            (TypeCode::Short, Field::ShortArray(values)) => {
                check_len(values.len(), count)?;
                values.iter().for_each(|&v| self.writer.write_short(v, byte_order));
                Ok(())
            }
            (TypeCode::UShort, Field::UShortArray(values)) => {
                check_len(values.len(), count)?;
                values.iter().for_each(|&v| self.writer.write_ushort(v, byte_order));
                Ok(())
            }
            (TypeCode::Int, Field::IntArray(values)) => {
                check_len(values.len(), count)?;
                values.iter().for_each(|&v| self.writer.write_int(v, byte_order));
                Ok(())
            }
            (TypeCode::Long, Field::LongArray(values)) => {
                check_len(values.len(), count)?;
                values.iter().for_each(|&v| self.writer.write_long(v, byte_order));
                Ok(())
            }
            (TypeCode::Var, Field::VarArray(values)) => {
                check_len(values.len(), count)?;
                for v in values {
                    let writer = self.var_writer.as_deref_mut().ok_or(Error::MissingVarWriter)?;
                    writer.write_var(&mut self.writer, v, name, extra, little_endian)?;
                }
                Ok(())
            }
            (TypeCode::CustomType, Field::CustomArray(values)) => {
                check_len(values.len(), count)?;
                let _descriptor_idx =
                    read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
                for v in values {
                    let writer = self.custom_writer.as_deref_mut().ok_or(Error::MissingCustomWriter)?;
                    writer.write_custom(&mut self.writer, v, name, extra, little_endian)?;
                }
                Ok(())
            }
            _ => Err(Error::FieldShapeMismatch),
        }
    }
}

fn check_len(actual: usize, expected: usize) -> Result<(), Error> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::FieldShapeMismatch)
    }
}
