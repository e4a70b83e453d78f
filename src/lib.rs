//! Compiles a declarative binary-layout script into compact bytecode, then
//! interprets that bytecode against a bit-granular input stream to produce a
//! typed field tree -- for PNG/WAV/TGA/Z80-snapshot-style binary formats.
//!
//! [`Parser::prepare`] compiles a script once; [`Parser::parse`] replays the
//! resulting [`CompiledBlock`] against any number of inputs without
//! re-parsing the script text.

mod bits;
mod compiler;
mod emit;
mod eval;
mod field;
mod interp;
mod opcode;
mod token;

pub use self::bits::{BitOrder, BitStream, BitWriter, ByteOrder};
pub use self::compiler::{CompileError, Compiler};
pub use self::emit::{CustomFieldTypeWriter, Error as EmitError, VarFieldWriter};
pub use self::eval::{CompiledExpr, Error as EvalError, ExprOp, ExprToken};
pub use self::field::{
    Atom, ExternalValueProvider, Field, NamedFieldInfo, NamedNumericFieldMap, Struct,
};
pub use self::interp::{ArraySite, CustomFieldTypeProcessor, Error as InterpError, VarFieldProcessor};
pub use self::opcode::{CompiledBlock, CustomTypeDescriptor, ParseFlags};
pub use self::token::{tokenize, Error as TokenError, Token};

use std::{error, fmt};

/// The single error type surfaced by [`Parser`]. Compile-time failures
/// (`Tokenize`, `Compile`) point at the offending script; `Interp` failures
/// carry the dotted field path active in the input when they occurred.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsingError {
    Tokenize(TokenError),
    Compile(CompileError),
    Interp(InterpError),
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tokenize(e) => write!(f, "script error: {e}"),
            Self::Compile(e) => write!(f, "script error: {e}"),
            Self::Interp(e) => write!(f, "{e}"),
        }
    }
}

impl error::Error for ParsingError {}

impl From<TokenError> for ParsingError {
    fn from(e: TokenError) -> Self {
        Self::Tokenize(e)
    }
}

impl From<CompileError> for ParsingError {
    fn from(e: CompileError) -> Self {
        Self::Compile(e)
    }
}

impl From<InterpError> for ParsingError {
    fn from(e: InterpError) -> Self {
        Self::Interp(e)
    }
}

/// The result of one [`Parser::parse`] call: the root [`Struct`] of the
/// field tree plus the stream's final byte counter (the external
/// `final_stream_byte_counter()` query in the script surface's Parse API).
/// Bundled per-call rather than tracked as mutable state on [`Parser`]
/// itself, since a single compiled `Parser` is shared across concurrently
/// running parses (see the crate's concurrency notes) and has no instance
/// to safely stash a "last" counter in.
///
/// Derefs to its `root` for convenient field lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    pub root: Struct,
    pub final_stream_byte_counter: i64,
}

impl std::ops::Deref for ParseOutcome {
    type Target = Struct;

    fn deref(&self) -> &Struct {
        &self.root
    }
}

/// A script compiled once, ready to parse any number of inputs against.
/// Immutable and cheap to share: clone the held [`CompiledBlock`] (or wrap a
/// `Parser` in an `Arc`) to use it across threads.
#[derive(Debug, Clone)]
pub struct Parser {
    block: CompiledBlock,
}

impl Parser {
    /// Tokenizes and compiles `script`. `known_custom_types` lists the
    /// identifiers a `CustomFieldTypeProcessor` passed to `parse` will
    /// recognize; any other bare identifier used as a field type is a
    /// [`CompileError::UnknownCustomType`].
    pub fn prepare(script: &str, known_custom_types: &[String]) -> Result<Self, ParsingError> {
        let tokens = tokenize(script)?;
        let block = Compiler::compile(&tokens, known_custom_types)?;
        Ok(Self { block })
    }

    /// Interprets `data` against the compiled script, producing the root
    /// [`Struct`] of the field tree plus the stream's final byte counter
    /// (see [`ParseOutcome`]).
    ///
    /// `external` resolves names the script references but never itself
    /// produces (e.g. a caller-supplied "file length" constant).
    /// `var_processor`/`custom_processor` are required only if the script
    /// actually uses `var` fields or custom field types; parsing one without
    /// a processor is [`InterpError::MissingVarProcessor`] /
    /// [`InterpError::MissingCustomProcessor`].
    pub fn parse(
        &self,
        data: &[u8],
        bit_order: BitOrder,
        external: Option<&dyn ExternalValueProvider>,
        var_processor: Option<&mut dyn VarFieldProcessor>,
        custom_processor: Option<&mut dyn CustomFieldTypeProcessor>,
        flags: ParseFlags,
    ) -> Result<ParseOutcome, ParsingError> {
        let mut stream = BitStream::new(data, bit_order);
        let root = interp::run(&self.block, &mut stream, external, var_processor, custom_processor, flags)?;
        Ok(ParseOutcome { root, final_stream_byte_counter: stream.counter() })
    }

    /// Re-serializes `root` against this parser's compiled script, producing
    /// the exact bytes a matching `parse` call would have consumed (the
    /// round-trip property: `parser.emit(&parser.parse(b, ...)?, ...) == b`
    /// for any `b` that parsed without error).
    pub fn emit(
        &self,
        root: &Struct,
        bit_order: BitOrder,
        var_writer: Option<&mut dyn VarFieldWriter>,
        custom_writer: Option<&mut dyn CustomFieldTypeWriter>,
    ) -> Result<Vec<u8>, EmitError> {
        emit::emit(&self.block, root, bit_order, var_writer, custom_writer)
    }

    /// The compiled bytecode and side tables backing this parser. Exposed
    /// for introspection and disassembly tooling; callers driving ordinary
    /// parses only need [`Parser::prepare`]/[`Parser::parse`].
    #[must_use]
    pub fn compiled_block(&self) -> &CompiledBlock {
        &self.block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepares_and_parses_a_flat_script() {
        let parser = Parser::prepare("int Width; int Height;", &[]).unwrap();
        let data = [0, 0, 2, 0x80, 0, 0, 1, 0x20];
        let root = parser
            .parse(&data, BitOrder::Msb0, None, None, None, ParseFlags::empty())
            .unwrap();
        assert_eq!(Some(640), root.by_name("Width").and_then(Field::as_i64));
        assert_eq!(Some(288), root.by_name("Height").and_then(Field::as_i64));
    }

    #[test]
    fn reports_compile_errors_without_touching_the_interpreter() {
        let err = Parser::prepare("bit:9 bad;", &[]).unwrap_err();
        assert!(matches!(err, ParsingError::Compile(CompileError::BadBitWidth(9))));
    }

    #[test]
    fn emit_reproduces_the_bytes_it_was_parsed_from() {
        let parser = Parser::prepare("int Width; int Height;", &[]).unwrap();
        let data = [0, 0, 2, 0x80, 0, 0, 1, 0x20];
        let root = parser
            .parse(&data, BitOrder::Msb0, None, None, None, ParseFlags::empty())
            .unwrap();
        let out = parser.emit(&root, BitOrder::Msb0, None, None).unwrap();
        assert_eq!(&data[..], &out[..]);
    }

    #[test]
    fn parse_outcome_exposes_the_final_stream_byte_counter() {
        let parser = Parser::prepare("int Width; int Height;", &[]).unwrap();
        let data = [0, 0, 2, 0x80, 0, 0, 1, 0x20];
        let outcome = parser
            .parse(&data, BitOrder::Msb0, None, None, None, ParseFlags::empty())
            .unwrap();
        assert_eq!(data.len() as i64, outcome.final_stream_byte_counter);
    }

    #[test]
    fn reports_field_path_on_interpreter_errors() {
        let parser = Parser::prepare("Header{ int Width; }", &[]).unwrap();
        let err = parser
            .parse(&[0, 0], BitOrder::Msb0, None, None, None, ParseFlags::empty())
            .unwrap_err();
        match err {
            ParsingError::Interp(InterpError::AtField { path, .. }) => {
                assert_eq!("Header.Width", path);
            }
            other => panic!("expected a field-path-tagged interpreter error, got {other:?}"),
        }
    }
}
