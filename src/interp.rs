//! Walks a [`CompiledBlock`] against a [`BitStream`], producing a [`Field`]
//! tree. Four cursors stay in lockstep while the walk proceeds: `pc` into
//! the opcode bytes, `name_idx` into `named_fields`, `eval_idx` into
//! `size_evaluators`, and the implicit Rust call-stack depth for nested
//! struct recursion.

use std::{error, fmt};

use crate::bits::{self, BitStream, ByteOrder};
use crate::eval::{self, evaluate};
use crate::field::{Atom, ExternalValueProvider, Field, NamedFieldInfo, NamedNumericFieldMap, Struct};
use crate::opcode::{decode_opcode_byte, read_varint, CompiledBlock, CustomTypeDescriptor, ExtFlags, OpcodeFlags, ParseFlags, TypeCode};

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Bits(bits::Error),
    Eval(eval::Error),
    MissingVarProcessor,
    MissingCustomProcessor,
    NegativeArrayLength(i32),
    /// A `VarFieldProcessor`/`CustomFieldTypeProcessor` returned an
    /// array-shaped field for a single-value (`ArraySite::Scalar`) request.
    ProcessorReturnedArrayForScalarSite,
    /// A `VarFieldProcessor`/`CustomFieldTypeProcessor` returned a named
    /// `Field::Struct` whose own name disagrees with the field site it was
    /// asked to fill.
    ProcessorNameMismatch { expected: String, actual: String },
    /// The low nibble of an opcode byte was the reserved type code 15.
    UnexpectedOpcode(u8),
    MalformedBytecode,
    /// Wraps another variant with the dotted path of the field being parsed
    /// when it occurred. Only the innermost (most specific) path is kept.
    AtField { path: String, source: Box<Error> },
}

impl Error {
    fn at(scope: &NamedFieldInfo, err: Error) -> Error {
        match err {
            Error::AtField { .. } => err,
            other => Error::AtField { path: scope.path.clone(), source: Box::new(other) },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bits(e) => e.fmt(f),
            Self::Eval(e) => e.fmt(f),
            Self::MissingVarProcessor => f.write_str("script declares a `var` field but no VarFieldProcessor was supplied"),
            Self::MissingCustomProcessor => {
                f.write_str("script declares a custom-type field but no CustomFieldTypeProcessor was supplied")
            }
            Self::AtField { path, source } => {
                if path.is_empty() {
                    write!(f, "at root: {source}")
                } else {
                    write!(f, "at `{path}`: {source}")
                }
            }
            Self::NegativeArrayLength(n) => write!(f, "evaluated array length `{n}` is negative"),
            Self::ProcessorReturnedArrayForScalarSite => {
                f.write_str("var/custom processor returned an array field for a scalar field site")
            }
            Self::ProcessorNameMismatch { expected, actual } => write!(
                f,
                "var/custom processor returned a field named `{actual}`, expected `{expected}`"
            ),
            Self::UnexpectedOpcode(byte) => write!(f, "unexpected opcode byte {byte:#04x}"),
            Self::MalformedBytecode => f.write_str("compiled block is not well-formed"),
        }
    }
}

impl error::Error for Error {}

impl From<bits::Error> for Error {
    fn from(e: bits::Error) -> Self {
        Self::Bits(e)
    }
}

impl From<eval::Error> for Error {
    fn from(e: eval::Error) -> Self {
        Self::Eval(e)
    }
}

/// Which call shape a `VarFieldProcessor`/`CustomFieldTypeProcessor` is
/// being invoked for. Mirrors the interpreter's own internal `ArrayLen`,
/// exposed to plug-in implementors since they need to know it too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArraySite {
    /// A single value, not an array element.
    Scalar,
    /// A `[N]` array of `N` elements.
    Count(usize),
    /// A `[_]` whole-stream array: read until the stream is exhausted.
    WholeStream,
}

/// Delegates interpretation of a `var` field to caller code.
pub trait VarFieldProcessor {
    fn read_var(
        &mut self,
        stream: &mut BitStream<'_>,
        name: &str,
        extra: i64,
        little_endian: bool,
    ) -> Result<Field, Error>;

    /// Reads an entire `var[N]`/`var[_]` array site in one call, rather than
    /// being driven one element at a time: `array_len` is `-1` for a
    /// whole-stream (`[_]`) site, otherwise the element count.
    fn read_var_array(
        &mut self,
        stream: &mut BitStream<'_>,
        array_len: i64,
        name: &str,
        extra: i64,
        little_endian: bool,
    ) -> Result<Vec<Field>, Error>;
}

/// Delegates interpretation of a user-declared custom field type. `site`
/// tells the processor whether it is filling a scalar field, a fixed-count
/// array, or a whole-stream array, so it can read the right shape in one
/// call instead of being driven element-by-element. For `Count`/
/// `WholeStream` sites the returned `Field` must itself be array-shaped
/// (typically `Field::CustomArray`) so `CustomFieldTypeWriter::write_custom`
/// can round-trip it back to bytes.
pub trait CustomFieldTypeProcessor {
    fn read_custom(
        &mut self,
        stream: &mut BitStream<'_>,
        descriptor: &CustomTypeDescriptor,
        name: &str,
        extra: i64,
        little_endian: bool,
        site: ArraySite,
    ) -> Result<Field, Error>;
}

/// Rejects a `VarFieldProcessor`/`CustomFieldTypeProcessor` result that
/// can't legally fill a scalar field site: an array-shaped field, or a
/// `Field::Struct` whose own name disagrees with `scope`.
fn validate_scalar_processor_result(scope: &NamedFieldInfo, field: &Field) -> Result<(), Error> {
    if field.is_array() {
        return Err(Error::ProcessorReturnedArrayForScalarSite);
    }
    if let Field::Struct(s) = field {
        if !s.info.local_name.is_empty() && s.info.local_name != scope.local_name {
            return Err(Error::ProcessorNameMismatch {
                expected: scope.local_name.clone(),
                actual: s.info.local_name.clone(),
            });
        }
    }
    Ok(())
}

enum ArrayLen {
    None,
    Fixed(usize),
    WholeStream,
}

/// Walks one [`CompiledBlock`] against one [`BitStream`] to completion.
/// Not reused across parses: construct a fresh `Interpreter` per call to
/// `interp::run`.
pub struct Interpreter<'a, 'input> {
    block: &'a CompiledBlock,
    stream: &'a mut BitStream<'input>,
    field_map: NamedNumericFieldMap,
    external: Option<&'a dyn ExternalValueProvider>,
    var_processor: Option<&'a mut dyn VarFieldProcessor>,
    custom_processor: Option<&'a mut dyn CustomFieldTypeProcessor>,
    flags: ParseFlags,
    name_idx: usize,
    eval_idx: usize,
}

/// Runs `block` against `stream` from the start, returning the root struct.
#[allow(clippy::too_many_arguments)]
pub fn run<'a, 'input>(
    block: &'a CompiledBlock,
    stream: &'a mut BitStream<'input>,
    external: Option<&'a dyn ExternalValueProvider>,
    var_processor: Option<&'a mut dyn VarFieldProcessor>,
    custom_processor: Option<&'a mut dyn CustomFieldTypeProcessor>,
    flags: ParseFlags,
) -> Result<Struct, Error> {
    let mut interp = Interpreter {
        block,
        stream,
        field_map: NamedNumericFieldMap::new(),
        external,
        var_processor,
        custom_processor,
        flags,
        name_idx: 0,
        eval_idx: 0,
    };
    let mut pc = 0usize;
    let root = NamedFieldInfo::root();
    let (fields, _stopped) = interp.run_fields(&mut pc, None, &root)?;
    Ok(Struct { info: root, fields })
}

impl<'a, 'input> Interpreter<'a, 'input> {
    /// Runs statements starting at `*pc`. `struct_end` is `None` for the
    /// implicit root (terminates at end-of-bytecode) or `Some` when running
    /// a nested struct body (terminates at its `StructEnd` opcode, which is
    /// consumed along with its trailing back-pointer before returning).
    ///
    /// Returns the fields produced and whether the walk stopped early
    /// because the input stream ran dry under `SKIP_REMAINING_FIELDS_IF_EOF`.
    fn run_fields(
        &mut self,
        pc: &mut usize,
        struct_end: Option<()>,
        scope: &NamedFieldInfo,
    ) -> Result<(Vec<(NamedFieldInfo, Field)>, bool), Error> {
        let mut fields = Vec::new();
        loop {
            match struct_end {
                None if *pc >= self.block.code.len() => return Ok((fields, false)),
                None => {}
                Some(()) => {
                    if *pc >= self.block.code.len() {
                        return Err(Error::MalformedBytecode);
                    }
                }
            }

            if self.flags.contains(ParseFlags::SKIP_REMAINING_FIELDS_IF_EOF)
                && !self.stream.has_available_data()
            {
                if struct_end.is_some() {
                    // Still owe the parent a well-formed cursor: scan forward
                    // past this struct's own StructEnd without executing it.
                    self.skip_to_matching_struct_end(pc)?;
                }
                return Ok((fields, true));
            }

            let byte = self.block.code[*pc];
            *pc += 1;
            let (type_code, opflags) = decode_opcode_byte(byte).ok_or(Error::UnexpectedOpcode(byte))?;

            if type_code == TypeCode::StructEnd {
                match struct_end {
                    Some(()) => {
                        read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
                        return Ok((fields, false));
                    }
                    None => return Err(Error::MalformedBytecode),
                }
            }

            if let TypeCode::ResetCounter | TypeCode::Align | TypeCode::Skip = type_code {
                let extra = read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
                match type_code {
                    TypeCode::ResetCounter => self.stream.reset_counter(),
                    TypeCode::Align => self.stream.align(extra as u32)?,
                    TypeCode::Skip => {
                        self.stream.skip(extra as i64)?;
                    }
                    _ => unreachable!(),
                }
                continue;
            }

            let (name_info, field, stopped) = self
                .run_instruction(pc, type_code, opflags, scope)
                .map_err(|e| Error::at(scope, e))?;
            if let Some(info) = name_info {
                if let Some(value) = field.as_i64() {
                    self.field_map.record(&info, value);
                }
                fields.push((info, field));
            } else {
                fields.push((NamedFieldInfo::unnamed(scope), field));
            }
            if stopped {
                return Ok((fields, true));
            }
        }
    }

    /// Used only to keep `pc` consistent when a struct body is abandoned
    /// mid-way by the EOF-skip policy: advances past bytes without
    /// interpreting them, by tracking only brace nesting depth.
    fn skip_to_matching_struct_end(&self, pc: &mut usize) -> Result<(), Error> {
        let mut depth = 0i32;
        loop {
            let byte = *self.block.code.get(*pc).ok_or(Error::MalformedBytecode)?;
            *pc += 1;
            let (type_code, opflags) = decode_opcode_byte(byte).ok_or(Error::UnexpectedOpcode(byte))?;
            if opflags.contains(OpcodeFlags::WIDE) {
                *pc += 1;
            }
            match type_code {
                TypeCode::StructStart => depth += 1,
                TypeCode::StructEnd => {
                    read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                    continue;
                }
                _ => {}
            }
            // Skip past whatever literal/extra/custom-type-index fields this
            // instruction carries; their exact count mirrors the compiler.
            if opflags.contains(OpcodeFlags::ARRAY) && !opflags.contains(OpcodeFlags::WIDE) {
                read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
            }
            if crate::compiler::has_extra_literal(type_code) {
                read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
            }
            if type_code == TypeCode::CustomType {
                read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run_instruction(
        &mut self,
        pc: &mut usize,
        type_code: TypeCode,
        opflags: OpcodeFlags,
        scope: &NamedFieldInfo,
    ) -> Result<(Option<NamedFieldInfo>, Field, bool), Error> {
        let ext = if opflags.contains(OpcodeFlags::WIDE) {
            let b = *self.block.code.get(*pc).ok_or(Error::MalformedBytecode)?;
            *pc += 1;
            ExtFlags::from_bits_truncate(b)
        } else {
            ExtFlags::empty()
        };

        let array_len = if opflags.contains(OpcodeFlags::ARRAY)
            && !ext.contains(ExtFlags::EXPRESSION_OR_WHOLESTREAM)
        {
            let n = read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
            ArrayLen::Fixed(n as usize)
        } else if !opflags.contains(OpcodeFlags::ARRAY) && ext.contains(ExtFlags::EXPRESSION_OR_WHOLESTREAM) {
            ArrayLen::WholeStream
        } else if opflags.contains(OpcodeFlags::ARRAY) && ext.contains(ExtFlags::EXPRESSION_OR_WHOLESTREAM) {
            let expr = self
                .block
                .size_evaluators
                .get(self.eval_idx)
                .ok_or(Error::MalformedBytecode)?;
            self.eval_idx += 1;
            let n = evaluate(expr, &self.field_map, &scope.path, self.external, self.stream.counter())?;
            if n < 0 {
                return Err(Error::NegativeArrayLength(n));
            }
            ArrayLen::Fixed(n as usize)
        } else {
            ArrayLen::None
        };

        let extra = if crate::compiler::has_extra_literal(type_code) {
            read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)? as i64
        } else {
            0
        };

        let name_info = if opflags.contains(OpcodeFlags::NAMED) {
            let info = self
                .block
                .named_fields
                .get(self.name_idx)
                .cloned()
                .ok_or(Error::MalformedBytecode)?;
            self.name_idx += 1;
            Some(info)
        } else {
            None
        };
        let field_scope = name_info.clone().unwrap_or_else(|| NamedFieldInfo::unnamed(scope));

        let byte_order = if opflags.contains(OpcodeFlags::LITTLE_ENDIAN) {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        };

        match type_code {
            TypeCode::ResetCounter | TypeCode::Align | TypeCode::Skip => {
                unreachable!("directives are dispatched in run_fields before reaching here")
            }
            TypeCode::StructStart => {
                let (field, stopped) = self.run_struct(pc, array_len, &field_scope)?;
                Ok((name_info, field, stopped))
            }
            _ => {
                let (field, stopped) = self.run_atomic(pc, type_code, array_len, extra, byte_order, &field_scope)?;
                Ok((name_info, field, stopped))
            }
        }
    }

    fn run_struct(
        &mut self,
        pc: &mut usize,
        array_len: ArrayLen,
        scope: &NamedFieldInfo,
    ) -> Result<(Field, bool), Error> {
        match array_len {
            ArrayLen::None => {
                let (fields, stopped) = self.run_fields(pc, Some(()), scope)?;
                Ok((Field::Struct(Struct { info: scope.clone(), fields }), stopped))
            }
            ArrayLen::Fixed(count) => {
                let body_start = *pc;
                let name_idx_start = self.name_idx;
                let eval_idx_start = self.eval_idx;
                if count == 0 {
                    // Skip mode: still walk the body once to advance
                    // `pc`/`name_idx`/`eval_idx` past it, without touching the
                    // stream or producing fields.
                    self.skip_struct_body(pc)?;
                    return Ok((Field::ArrayStruct(Vec::new()), false));
                }
                let mut elements = Vec::with_capacity(count);
                let mut stopped = false;
                for _ in 0..count {
                    *pc = body_start;
                    self.name_idx = name_idx_start;
                    self.eval_idx = eval_idx_start;
                    let (fields, s) = self.run_fields(pc, Some(()), scope)?;
                    elements.push(Struct { info: scope.clone(), fields });
                    if s {
                        stopped = true;
                        break;
                    }
                }
                Ok((Field::ArrayStruct(elements), stopped))
            }
            ArrayLen::WholeStream => {
                let body_start = *pc;
                let name_idx_start = self.name_idx;
                let eval_idx_start = self.eval_idx;
                let mut elements = Vec::new();
                let mut stopped = false;
                loop {
                    if !self.stream.has_available_data() {
                        break;
                    }
                    *pc = body_start;
                    self.name_idx = name_idx_start;
                    self.eval_idx = eval_idx_start;
                    let (fields, s) = self.run_fields(pc, Some(()), scope)?;
                    elements.push(Struct { info: scope.clone(), fields });
                    if s {
                        stopped = true;
                        break;
                    }
                }
                if elements.is_empty() {
                    // Same skip-mode bookkeeping as the zero-count case: the
                    // stream was already exhausted before the first element,
                    // so the body never ran and its cursors never advanced.
                    *pc = body_start;
                    self.name_idx = name_idx_start;
                    self.eval_idx = eval_idx_start;
                    self.skip_struct_body(pc)?;
                }
                Ok((Field::ArrayStruct(elements), stopped))
            }
        }
    }

    /// Advances `pc`, `name_idx`, and `eval_idx` past one structure body
    /// without touching the input stream or building any `Field`s. Used
    /// when a counted struct array's count is zero, or a whole-stream
    /// struct array never runs a single iteration: the body still owns
    /// named-field and evaluator-table slots that later instructions must
    /// not mistakenly consume, so the cursors have to walk past it exactly
    /// as a real run would, just without reading or recording anything.
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
            } else if opflags.contains(OpcodeFlags::ARRAY) && ext.contains(ExtFlags::EXPRESSION_OR_WHOLESTREAM) {
                self.eval_idx += 1;
            }

            if crate::compiler::has_extra_literal(type_code) {
                read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
            }

            if opflags.contains(OpcodeFlags::NAMED) {
                self.name_idx += 1;
            }

            if type_code == TypeCode::StructStart {
                self.skip_struct_body(pc)?;
            } else if type_code == TypeCode::CustomType {
                read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)?;
            }
        }
    }

    fn run_atomic(
        &mut self,
        pc: &mut usize,
        type_code: TypeCode,
        array_len: ArrayLen,
        extra: i64,
        byte_order: ByteOrder,
        scope: &NamedFieldInfo,
    ) -> Result<(Field, bool), Error> {
        let little_endian = byte_order == ByteOrder::LittleEndian;
        let name = scope.local_name.clone();

        macro_rules! read_array {
            ($count:expr, $read_one:expr) => {{
                let mut v = Vec::with_capacity($count);
                for _ in 0..$count {
                    v.push($read_one?);
                }
                v
            }};
        }

        match array_len {
            ArrayLen::None => {
                let field = match type_code {
                    TypeCode::Bit => {
                        let width = extra as u8;
                        Field::Atom(Atom::Bit { width, value: self.stream.read_bit_field(width)? })
                    }
                    TypeCode::Bool => Field::Atom(Atom::Bool(self.stream.read_boolean()?)),
                    TypeCode::Byte => Field::Atom(Atom::Byte(self.stream.read_byte()?)),
                    TypeCode::UByte => Field::Atom(Atom::UByte(self.stream.read_ubyte()?)),
                    TypeCode::Short => Field::Atom(Atom::Short(self.stream.read_short(byte_order)?)),
                    TypeCode::UShort => Field::Atom(Atom::UShort(self.stream.read_ushort(byte_order)?)),
                    TypeCode::Int => Field::Atom(Atom::Int(self.stream.read_int(byte_order)?)),
                    TypeCode::Long => Field::Atom(Atom::Long(self.stream.read_long(byte_order)?)),
                    TypeCode::Var => {
                        let processor = self.var_processor.as_deref_mut().ok_or(Error::MissingVarProcessor)?;
                        let inner = processor.read_var(self.stream, &name, extra, little_endian)?;
                        validate_scalar_processor_result(scope, &inner)?;
                        Field::Atom(Atom::Var(Box::new(inner)))
                    }
                    TypeCode::CustomType => {
                        let descriptor_idx = read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)? as usize;
                        let descriptor = self
                            .block
                            .custom_type_descriptors
                            .get(descriptor_idx)
                            .ok_or(Error::MalformedBytecode)?
                            .clone();
                        let processor = self.custom_processor.as_deref_mut().ok_or(Error::MissingCustomProcessor)?;
                        let inner = processor
                            .read_custom(self.stream, &descriptor, &name, extra, little_endian, ArraySite::Scalar)?;
                        validate_scalar_processor_result(scope, &inner)?;
                        Field::Atom(Atom::Custom(Box::new(inner)))
                    }
                    _ => unreachable!("struct/directive opcodes are dispatched elsewhere"),
                };
                Ok((field, false))
            }
            ArrayLen::Fixed(count) => {
                let field = match type_code {
                    TypeCode::Bit => Field::BitArray { width: extra as u8, values: self.stream.read_bit_array(count as i64, extra as u8)? },
                    TypeCode::Bool => Field::BoolArray(read_array!(count, self.stream.read_boolean())),
                    TypeCode::Byte => Field::ByteArray(self.stream.read_byte_array(count as i64)?),
                    TypeCode::UByte => Field::UByteArray(self.stream.read_ubyte_array(count as i64)?),
                    TypeCode::Short => Field::ShortArray(self.stream.read_short_array(count as i64, byte_order)?),
                    TypeCode::UShort => Field::UShortArray(self.stream.read_ushort_array(count as i64, byte_order)?),
                    TypeCode::Int => Field::IntArray(self.stream.read_int_array(count as i64, byte_order)?),
                    TypeCode::Long => Field::LongArray(self.stream.read_long_array(count as i64, byte_order)?),
                    TypeCode::Var => {
                        let processor = self.var_processor.as_deref_mut().ok_or(Error::MissingVarProcessor)?;
                        let values =
                            processor.read_var_array(self.stream, count as i64, &name, extra, little_endian)?;
                        Field::VarArray(values)
                    }
                    TypeCode::CustomType => {
                        let descriptor_idx = read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)? as usize;
                        let descriptor = self
                            .block
                            .custom_type_descriptors
                            .get(descriptor_idx)
                            .ok_or(Error::MalformedBytecode)?
                            .clone();
                        let processor = self.custom_processor.as_deref_mut().ok_or(Error::MissingCustomProcessor)?;
                        processor.read_custom(
                            self.stream,
                            &descriptor,
                            &name,
                            extra,
                            little_endian,
                            ArraySite::Count(count),
                        )?
                    }
                    _ => unreachable!("struct/directive opcodes are dispatched elsewhere"),
                };
                Ok((field, false))
            }
            ArrayLen::WholeStream => {
                // Whole-stream custom-type index still precedes the loop,
                // same byte position as the fixed-count case.
                let descriptor = if type_code == TypeCode::CustomType {
                    let idx = read_varint(&self.block.code, pc).ok_or(Error::MalformedBytecode)? as usize;
                    Some(self.block.custom_type_descriptors.get(idx).ok_or(Error::MalformedBytecode)?.clone())
                } else {
                    None
                };
                let field = match type_code {
                    TypeCode::Bit => {
                        let width = extra as u8;
                        let mut values = Vec::new();
                        while self.stream.has_available_data() {
                            values.push(self.stream.read_bit_field(width)?);
                        }
                        Field::BitArray { width, values }
                    }
                    TypeCode::Bool => {
                        let mut values = Vec::new();
                        while self.stream.has_available_data() {
                            values.push(self.stream.read_boolean()?);
                        }
                        Field::BoolArray(values)
                    }
                    TypeCode::Byte => Field::ByteArray(self.whole_stream_ints(|s| s.read_byte())?),
                    TypeCode::UByte => Field::UByteArray(self.whole_stream_ints(|s| s.read_ubyte())?),
                    TypeCode::Short => Field::ShortArray(self.whole_stream_ints(|s| s.read_short(byte_order))?),
                    TypeCode::UShort => Field::UShortArray(self.whole_stream_ints(|s| s.read_ushort(byte_order))?),
                    TypeCode::Int => Field::IntArray(self.whole_stream_ints(|s| s.read_int(byte_order))?),
                    TypeCode::Long => {
                        let mut values = Vec::new();
                        while self.stream.has_available_data() {
                            values.push(self.stream.read_long(byte_order)?);
                        }
                        Field::LongArray(values)
                    }
                    TypeCode::Var => {
                        let processor = self.var_processor.as_deref_mut().ok_or(Error::MissingVarProcessor)?;
                        let values = processor.read_var_array(self.stream, -1, &name, extra, little_endian)?;
                        Field::VarArray(values)
                    }
                    TypeCode::CustomType => {
                        let descriptor = descriptor.expect("populated above for CustomType");
                        let processor = self.custom_processor.as_deref_mut().ok_or(Error::MissingCustomProcessor)?;
                        processor.read_custom(
                            self.stream,
                            &descriptor,
                            &name,
                            extra,
                            little_endian,
                            ArraySite::WholeStream,
                        )?
                    }
                    _ => unreachable!("struct/directive opcodes are dispatched elsewhere"),
                };
                Ok((field, false))
            }
        }
    }

    fn whole_stream_ints<F>(&mut self, mut read_one: F) -> Result<Vec<i32>, Error>
    where
        F: FnMut(&mut BitStream<'input>) -> Result<i32, bits::Error>,
    {
        let mut values = Vec::new();
        while self.stream.has_available_data() {
            values.push(read_one(self.stream)?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::token::tokenize;

    fn compiled(script: &str) -> CompiledBlock {
        let tokens = tokenize(script).unwrap();
        Compiler::compile(&tokens, &[]).unwrap()
    }

    #[test]
    fn interprets_flat_fields() {
        let block = compiled("int Width; int Height;");
        let mut stream = BitStream::new(&[0, 0, 2, 0x80, 0, 0, 1, 0x20], bits::BitOrder::Msb0);
        let root = run(&block, &mut stream, None, None, None, ParseFlags::empty()).unwrap();
        assert_eq!(Some(640), root.by_name("Width").and_then(Field::as_i64));
        assert_eq!(Some(288), root.by_name("Height").and_then(Field::as_i64));
    }

    #[test]
    fn interprets_expression_sized_struct_array() {
        let block = compiled("int Count; Entry[Count]{ byte Value; }");
        let data = [0, 0, 0, 2, 10, 20];
        let mut stream = BitStream::new(&data, bits::BitOrder::Msb0);
        let root = run(&block, &mut stream, None, None, None, ParseFlags::empty()).unwrap();
        let entries = root.by_name("Entry").unwrap();
        assert_eq!(Some(2), entries.array_len());
        if let Field::ArrayStruct(structs) = entries {
            assert_eq!(Some(10), structs[0].by_name("Value").and_then(Field::as_i64));
            assert_eq!(Some(20), structs[1].by_name("Value").and_then(Field::as_i64));
        } else {
            panic!("expected ArrayStruct");
        }
    }

    #[test]
    fn interprets_whole_stream_byte_array() {
        let block = compiled("byte[_] Data;");
        let data = [1i32 as u8, 2, 3, 4];
        let mut stream = BitStream::new(&data, bits::BitOrder::Msb0);
        let root = run(&block, &mut stream, None, None, None, ParseFlags::empty()).unwrap();
        assert_eq!(Some(4), root.by_name("Data").and_then(Field::array_len));
    }

    #[test]
    fn missing_var_processor_is_an_error() {
        let block = compiled("var foo;");
        let mut stream = BitStream::new(&[0], bits::BitOrder::Msb0);
        let err = run(&block, &mut stream, None, None, None, ParseFlags::empty()).unwrap_err();
        assert_eq!(Error::MissingVarProcessor, err);
    }

    #[test]
    fn counted_zero_struct_array_advances_past_its_body_untouched() {
        let block = compiled("S[0]{ int a; } int after;");
        let data = [0, 0, 0, 42];
        let mut stream = BitStream::new(&data, bits::BitOrder::Msb0);
        let root = run(&block, &mut stream, None, None, None, ParseFlags::empty()).unwrap();
        assert_eq!(Some(0), root.by_name("S").and_then(Field::array_len));
        assert_eq!(4, stream.absolute_byte_position());
        assert_eq!(Some(42), root.by_name("after").and_then(Field::as_i64));
    }

    #[test]
    fn whole_stream_struct_array_with_no_data_advances_past_its_body() {
        // The whole-stream byte array eats every remaining byte, so the
        // struct array that follows starts with nothing left to read.
        let block = compiled("byte[_] eaten; Entry[_]{ int a; }");
        let data: [u8; 4] = [0, 0, 0, 7];
        let mut stream = BitStream::new(&data, bits::BitOrder::Msb0);
        let root = run(&block, &mut stream, None, None, None, ParseFlags::empty()).unwrap();
        assert_eq!(Some(0), root.by_name("Entry").and_then(Field::array_len));
    }

    /// A `VarFieldProcessor` that always hands back an array-shaped field,
    /// regardless of the site it was asked to fill.
    struct ArrayHappyVarProcessor;

    impl VarFieldProcessor for ArrayHappyVarProcessor {
        fn read_var(
            &mut self,
            _stream: &mut BitStream<'_>,
            _name: &str,
            _extra: i64,
            _little_endian: bool,
        ) -> Result<Field, Error> {
            Ok(Field::ByteArray(vec![1, 2]))
        }

        fn read_var_array(
            &mut self,
            _stream: &mut BitStream<'_>,
            _array_len: i64,
            _name: &str,
            _extra: i64,
            _little_endian: bool,
        ) -> Result<Vec<Field>, Error> {
            Ok(vec![])
        }
    }

    #[test]
    fn var_processor_returning_an_array_for_a_scalar_site_is_an_error() {
        let block = compiled("var foo;");
        let mut stream = BitStream::new(&[0], bits::BitOrder::Msb0);
        let mut processor = ArrayHappyVarProcessor;
        let err = run(&block, &mut stream, None, Some(&mut processor), None, ParseFlags::empty()).unwrap_err();
        match err {
            Error::AtField { source, .. } => assert_eq!(Error::ProcessorReturnedArrayForScalarSite, *source),
            other => panic!("expected ProcessorReturnedArrayForScalarSite, got {other:?}"),
        }
    }

    /// A `CustomFieldTypeProcessor` that returns a `Field::Struct` named
    /// differently from whatever field site it was asked to fill.
    struct MisnamedStructCustomProcessor;

    impl CustomFieldTypeProcessor for MisnamedStructCustomProcessor {
        fn read_custom(
            &mut self,
            _stream: &mut BitStream<'_>,
            _descriptor: &CustomTypeDescriptor,
            _name: &str,
            _extra: i64,
            _little_endian: bool,
            _site: ArraySite,
        ) -> Result<Field, Error> {
            let info = NamedFieldInfo::root().child("SomeOtherName");
            Ok(Field::Struct(Struct { info, fields: Vec::new() }))
        }
    }

    #[test]
    fn custom_processor_returning_a_mismatched_name_is_an_error() {
        let block = Compiler::compile(&tokenize("rgb Pixel;").unwrap(), &["rgb".to_string()]).unwrap();
        let mut stream = BitStream::new(&[0], bits::BitOrder::Msb0);
        let mut processor = MisnamedStructCustomProcessor;
        let err = run(&block, &mut stream, None, None, Some(&mut processor), ParseFlags::empty()).unwrap_err();
        match err {
            Error::AtField { source, .. } => match *source {
                Error::ProcessorNameMismatch { expected, actual } => {
                    assert_eq!("Pixel", expected);
                    assert_eq!("SomeOtherName", actual);
                }
                other => panic!("expected ProcessorNameMismatch, got {other:?}"),
            },
            other => panic!("expected an AtField-wrapped error, got {other:?}"),
        }
    }

    /// Records whether `read_var` (per-element) or `read_var_array` (the
    /// whole site at once) was called, to confirm the interpreter drives
    /// fixed-count array sites through the batch method.
    struct CountingVarProcessor {
        read_var_calls: usize,
        read_var_array_calls: usize,
    }

    impl VarFieldProcessor for CountingVarProcessor {
        fn read_var(
            &mut self,
            stream: &mut BitStream<'_>,
            _name: &str,
            _extra: i64,
            _little_endian: bool,
        ) -> Result<Field, Error> {
            self.read_var_calls += 1;
            Ok(Field::Atom(Atom::UByte(stream.read_ubyte()?)))
        }

        fn read_var_array(
            &mut self,
            stream: &mut BitStream<'_>,
            array_len: i64,
            _name: &str,
            _extra: i64,
            _little_endian: bool,
        ) -> Result<Vec<Field>, Error> {
            self.read_var_array_calls += 1;
            let mut values = Vec::new();
            for _ in 0..array_len {
                values.push(Field::Atom(Atom::UByte(stream.read_ubyte()?)));
            }
            Ok(values)
        }
    }

    #[test]
    fn fixed_count_var_array_is_read_as_a_single_batch_call() {
        let block = compiled("var[3] foo;");
        let mut stream = BitStream::new(&[1, 2, 3], bits::BitOrder::Msb0);
        let mut processor = CountingVarProcessor { read_var_calls: 0, read_var_array_calls: 0 };
        let root = run(&block, &mut stream, None, Some(&mut processor), None, ParseFlags::empty()).unwrap();
        assert_eq!(0, processor.read_var_calls);
        assert_eq!(1, processor.read_var_array_calls);
        assert_eq!(Some(3), root.by_name("foo").and_then(Field::array_len));
    }
}
