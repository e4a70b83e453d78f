//! Consumes a token sequence from the external tokenizer and emits a
//! [`CompiledBlock`]. A single-pass recursive-descent routine over the
//! token slice, emitting opcode bytes directly into `code` as each token
//! is consumed, rather than building an intermediate AST.

use std::collections::HashSet;
use std::{error, fmt};

use crate::eval::{self, CompiledExpr, ExprToken};
use crate::field::NamedFieldInfo;
use crate::opcode::{
    opcode_byte, write_varint, CompiledBlock, CustomTypeDescriptor, ExtFlags, OpcodeFlags,
    TypeCode,
};
use crate::token::Token;

const PRIMITIVES: &[&str] = &[
    "bit", "bool", "byte", "ubyte", "short", "ushort", "int", "long", "var",
];

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    UnexpectedToken,
    UnexpectedEnd,
    DuplicateFieldName(String),
    BadBitWidth(u8),
    UnknownCustomType(String),
    /// `_` on a struct array nested directly inside another `_` array: the
    /// outer whole-stream array already consumes the stream, so an inner
    /// one can never observe its own end-of-stream.
    NestedWholeStreamArray,
    Expr(eval::CompileError),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedToken => f.write_str("unexpected token"),
            Self::UnexpectedEnd => f.write_str("unexpected end of script"),
            Self::DuplicateFieldName(name) => {
                write!(f, "duplicate field name `{name}` in this struct")
            }
            Self::BadBitWidth(width) => write!(f, "bit width `{width}` out of range 1..=8"),
            Self::UnknownCustomType(name) => write!(f, "unknown custom type `{name}`"),
            Self::NestedWholeStreamArray => {
                f.write_str("whole-stream array nested inside another whole-stream array")
            }
            Self::Expr(e) => e.fmt(f),
        }
    }
}

impl error::Error for CompileError {}

impl From<eval::CompileError> for CompileError {
    fn from(e: eval::CompileError) -> Self {
        Self::Expr(e)
    }
}

enum ArrayKind {
    None,
    Literal(u64),
    WholeStream,
    Expr(CompiledExpr),
}

struct ArrayEncoding {
    array_flag: bool,
    wide: bool,
    ext: ExtFlags,
    literal: Option<u64>,
}

/// Types whose instruction always carries a literal "extra" packed int
/// (bit width / skip count / align value / var extra) -- the reference
/// compiler never compiles an expression into this slot, so the presence
/// of this literal is determined purely by type code on both the emission
/// and decoding sides.
pub fn has_extra_literal(type_code: TypeCode) -> bool {
    matches!(
        type_code,
        TypeCode::Bit | TypeCode::Align | TypeCode::Skip | TypeCode::Var | TypeCode::CustomType
    )
}

pub struct Compiler<'a> {
    code: Vec<u8>,
    named_fields: Vec<NamedFieldInfo>,
    size_evaluators: Vec<CompiledExpr>,
    custom_type_descriptors: Vec<CustomTypeDescriptor>,
    has_var_fields: bool,
    has_evaluated_arrays: bool,
    known_custom_types: &'a [String],
}

impl<'a> Compiler<'a> {
    /// Compiles a full script's token stream into a [`CompiledBlock`].
    /// `known_custom_types` lists the identifiers the caller's
    /// `CustomFieldTypeProcessor` is prepared to handle.
    pub fn compile(
        tokens: &[Token],
        known_custom_types: &'a [String],
    ) -> Result<CompiledBlock, CompileError> {
        let mut compiler = Compiler {
            code: Vec::new(),
            named_fields: Vec::new(),
            size_evaluators: Vec::new(),
            custom_type_descriptors: Vec::new(),
            has_var_fields: false,
            has_evaluated_arrays: false,
            known_custom_types,
        };
        let mut pos = 0;
        let root = NamedFieldInfo::root();
        let mut names = HashSet::new();
        compiler.compile_stmts(tokens, &mut pos, &root, None, false, &mut names)?;
        Ok(CompiledBlock {
            code: compiler.code,
            named_fields: compiler.named_fields,
            size_evaluators: compiler.size_evaluators,
            custom_type_descriptors: compiler.custom_type_descriptors,
            has_var_fields: compiler.has_var_fields,
            has_evaluated_arrays: compiler.has_evaluated_arrays,
        })
    }

    fn compile_stmts(
        &mut self,
        tokens: &[Token],
        pos: &mut usize,
        scope: &NamedFieldInfo,
        terminator: Option<&Token>,
        in_whole_stream_array: bool,
        names: &mut HashSet<String>,
    ) -> Result<(), CompileError> {
        loop {
            match (tokens.get(*pos), terminator) {
                (None, None) => return Ok(()),
                (None, Some(_)) => return Err(CompileError::UnexpectedEnd),
                (Some(t), Some(term)) if t == term => return Ok(()),
                _ => {}
            }
            self.compile_stmt(tokens, pos, scope, in_whole_stream_array, names)?;
        }
    }

    fn compile_stmt(
        &mut self,
        tokens: &[Token],
        pos: &mut usize,
        scope: &NamedFieldInfo,
        in_whole_stream_array: bool,
        names: &mut HashSet<String>,
    ) -> Result<(), CompileError> {
        let little_endian = match tokens.get(*pos) {
            Some(Token::Lt) => {
                *pos += 1;
                true
            }
            Some(Token::Gt) => {
                *pos += 1;
                false
            }
            _ => false,
        };

        let name = match tokens.get(*pos) {
            Some(Token::Ident(name)) => name.clone(),
            _ => return Err(CompileError::UnexpectedToken),
        };
        *pos += 1;

        match name.as_str() {
            "align" => {
                self.expect(tokens, pos, &Token::Colon)?;
                let n = self.expect_number(tokens, pos)?;
                self.expect(tokens, pos, &Token::Semicolon)?;
                self.emit_directive(TypeCode::Align, n as u64);
                return Ok(());
            }
            "skip" => {
                self.expect(tokens, pos, &Token::Colon)?;
                let n = self.expect_number(tokens, pos)?;
                self.expect(tokens, pos, &Token::Semicolon)?;
                self.emit_directive(TypeCode::Skip, n as u64);
                return Ok(());
            }
            "reset" => {
                self.expect(tokens, pos, &Token::DollarDollar)?;
                self.expect(tokens, pos, &Token::Semicolon)?;
                self.emit_directive(TypeCode::ResetCounter, 0);
                return Ok(());
            }
            _ => {}
        }

        if PRIMITIVES.contains(&name.as_str()) {
            let width = if name == "bit" {
                if matches!(tokens.get(*pos), Some(Token::Colon)) {
                    *pos += 1;
                    let w = self.expect_number(tokens, pos)?;
                    if !(1..=8).contains(&w) {
                        return Err(CompileError::BadBitWidth(w as u8));
                    }
                    w as u8
                } else {
                    1
                }
            } else {
                0
            };
            let extra = if name == "var" {
                if matches!(tokens.get(*pos), Some(Token::Colon)) {
                    *pos += 1;
                    self.expect_number(tokens, pos)?
                } else {
                    0
                }
            } else {
                0
            };
            let array_kind = self.parse_array_suffix(tokens, pos)?;
            let field_name = self.parse_optional_name(tokens, pos)?;
            self.expect(tokens, pos, &Token::Semicolon)?;
            self.check_array_nesting(&array_kind, in_whole_stream_array)?;
            self.emit_atomic(&name, width, extra, little_endian, array_kind, field_name, scope, names)?;
            return Ok(());
        }

        // Either a nested struct (`Name { ... }` / `Name[n] { ... }`) or a
        // custom-type field (`CustomIdent name;`).
        let array_kind = self.parse_array_suffix(tokens, pos)?;
        match tokens.get(*pos) {
            Some(Token::LBrace) => {
                *pos += 1;
                self.check_array_nesting(&array_kind, in_whole_stream_array)?;
                self.emit_struct(&name, array_kind, scope, tokens, pos, names)?;
                Ok(())
            }
            _ => {
                if !self.known_custom_types.iter().any(|t| t == &name) {
                    return Err(CompileError::UnknownCustomType(name));
                }
                let extra = if matches!(tokens.get(*pos), Some(Token::Colon)) {
                    *pos += 1;
                    self.expect_number(tokens, pos)?
                } else {
                    0
                };
                let field_name = self.parse_optional_name(tokens, pos)?;
                self.expect(tokens, pos, &Token::Semicolon)?;
                self.check_array_nesting(&array_kind, in_whole_stream_array)?;
                self.emit_custom(&name, extra, little_endian, array_kind, field_name, scope, names)?;
                Ok(())
            }
        }
    }

    fn check_array_nesting(
        &self,
        kind: &ArrayKind,
        in_whole_stream_array: bool,
    ) -> Result<(), CompileError> {
        if in_whole_stream_array && matches!(kind, ArrayKind::WholeStream) {
            return Err(CompileError::NestedWholeStreamArray);
        }
        Ok(())
    }

    fn expect(&self, tokens: &[Token], pos: &mut usize, expected: &Token) -> Result<(), CompileError> {
        if tokens.get(*pos) == Some(expected) {
            *pos += 1;
            Ok(())
        } else {
            Err(CompileError::UnexpectedToken)
        }
    }

    fn expect_number(&self, tokens: &[Token], pos: &mut usize) -> Result<i64, CompileError> {
        match tokens.get(*pos) {
            Some(Token::Number(n)) => {
                *pos += 1;
                Ok(*n)
            }
            _ => Err(CompileError::UnexpectedToken),
        }
    }

    fn parse_optional_name(
        &self,
        tokens: &[Token],
        pos: &mut usize,
    ) -> Result<Option<String>, CompileError> {
        match tokens.get(*pos) {
            Some(Token::Ident(name)) => {
                *pos += 1;
                Ok(Some(name.clone()))
            }
            _ => Ok(None),
        }
    }

    /// Parses an optional `[N]` / `[_]` / `[expr]` array suffix.
    fn parse_array_suffix(&self, tokens: &[Token], pos: &mut usize) -> Result<ArrayKind, CompileError> {
        if tokens.get(*pos) != Some(&Token::LBracket) {
            return Ok(ArrayKind::None);
        }
        *pos += 1;
        if tokens.get(*pos) == Some(&Token::Underscore) {
            *pos += 1;
            self.expect(tokens, pos, &Token::RBracket)?;
            return Ok(ArrayKind::WholeStream);
        }
        let start = *pos;
        let mut depth = 0i32;
        loop {
            match tokens.get(*pos) {
                Some(Token::LParen) => {
                    depth += 1;
                    *pos += 1;
                }
                Some(Token::RParen) => {
                    depth -= 1;
                    *pos += 1;
                }
                Some(Token::RBracket) if depth == 0 => break,
                Some(_) => {
                    *pos += 1;
                }
                None => return Err(CompileError::UnexpectedEnd),
            }
        }
        let inner = &tokens[start..*pos];
        self.expect(tokens, pos, &Token::RBracket)?;
        if let [Token::Number(n)] = inner {
            return Ok(ArrayKind::Literal(*n as u64));
        }
        let expr_tokens = inner
            .iter()
            .map(to_expr_token)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ArrayKind::Expr(eval::compile(&expr_tokens)?))
    }

    fn compute_array(&mut self, kind: ArrayKind) -> ArrayEncoding {
        match kind {
            ArrayKind::None => ArrayEncoding {
                array_flag: false,
                wide: false,
                ext: ExtFlags::empty(),
                literal: None,
            },
            ArrayKind::Literal(n) => ArrayEncoding {
                array_flag: true,
                wide: false,
                ext: ExtFlags::empty(),
                literal: Some(n),
            },
            ArrayKind::WholeStream => ArrayEncoding {
                array_flag: false,
                wide: true,
                ext: ExtFlags::EXPRESSION_OR_WHOLESTREAM,
                literal: None,
            },
            ArrayKind::Expr(expr) => {
                self.has_evaluated_arrays = true;
                self.size_evaluators.push(expr);
                ArrayEncoding {
                    array_flag: true,
                    wide: true,
                    ext: ExtFlags::EXPRESSION_OR_WHOLESTREAM,
                    literal: None,
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_instruction(
        &mut self,
        type_code: TypeCode,
        name_info: Option<NamedFieldInfo>,
        little_endian: bool,
        array: ArrayEncoding,
        extra_literal: Option<u64>,
        custom_type_idx: Option<u64>,
    ) {
        let mut flags = OpcodeFlags::empty();
        if name_info.is_some() {
            flags |= OpcodeFlags::NAMED;
        }
        if array.array_flag {
            flags |= OpcodeFlags::ARRAY;
        }
        if little_endian {
            flags |= OpcodeFlags::LITTLE_ENDIAN;
        }
        if array.wide {
            flags |= OpcodeFlags::WIDE;
        }
        self.code.push(opcode_byte(type_code, flags));
        if array.wide {
            self.code.push(array.ext.bits());
        }
        if let Some(n) = array.literal {
            write_varint(&mut self.code, n);
        }
        if let Some(e) = extra_literal {
            write_varint(&mut self.code, e);
        }
        if let Some(idx) = custom_type_idx {
            write_varint(&mut self.code, idx);
        }
        if let Some(info) = name_info {
            self.named_fields.push(info);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_atomic(
        &mut self,
        primitive: &str,
        width: u8,
        extra: i64,
        little_endian: bool,
        array_kind: ArrayKind,
        field_name: Option<String>,
        scope: &NamedFieldInfo,
        names: &mut HashSet<String>,
    ) -> Result<(), CompileError> {
        let type_code = match primitive {
            "bit" => TypeCode::Bit,
            "bool" => TypeCode::Bool,
            "byte" => TypeCode::Byte,
            "ubyte" => TypeCode::UByte,
            "short" => TypeCode::Short,
            "ushort" => TypeCode::UShort,
            "int" => TypeCode::Int,
            "long" => TypeCode::Long,
            "var" => TypeCode::Var,
            _ => unreachable!("caller only passes primitive type words"),
        };
        if type_code == TypeCode::Var {
            self.has_var_fields = true;
        }
        let info = self.named_info(field_name, scope, names)?;
        let array = self.compute_array(array_kind);
        let extra_literal = if type_code == TypeCode::Bit {
            Some(width as u64)
        } else if type_code == TypeCode::Var {
            Some(extra as u64)
        } else {
            None
        };
        self.emit_instruction(type_code, info, little_endian, array, extra_literal, None);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_custom(
        &mut self,
        type_name: &str,
        extra: i64,
        little_endian: bool,
        array_kind: ArrayKind,
        field_name: Option<String>,
        scope: &NamedFieldInfo,
        names: &mut HashSet<String>,
    ) -> Result<(), CompileError> {
        let info = self.named_info(field_name, scope, names)?;
        let array = self.compute_array(array_kind);
        let idx = self.custom_type_descriptors.len() as u64;
        self.custom_type_descriptors.push(CustomTypeDescriptor {
            type_name: type_name.to_string(),
        });
        self.emit_instruction(
            TypeCode::CustomType,
            info,
            little_endian,
            array,
            Some(extra as u64),
            Some(idx),
        );
        Ok(())
    }

    fn emit_struct(
        &mut self,
        local_name: &str,
        array_kind: ArrayKind,
        scope: &NamedFieldInfo,
        tokens: &[Token],
        pos: &mut usize,
        parent_names: &mut HashSet<String>,
    ) -> Result<(), CompileError> {
        if !parent_names.insert(local_name.to_string()) {
            return Err(CompileError::DuplicateFieldName(local_name.to_string()));
        }
        let info = scope.child(local_name);
        let is_whole_stream = matches!(array_kind, ArrayKind::WholeStream);
        let array = self.compute_array(array_kind);

        let mut flags = OpcodeFlags::NAMED;
        if array.array_flag {
            flags |= OpcodeFlags::ARRAY;
        }
        if array.wide {
            flags |= OpcodeFlags::WIDE;
        }
        self.code.push(opcode_byte(TypeCode::StructStart, flags));
        if array.wide {
            self.code.push(array.ext.bits());
        }
        if let Some(n) = array.literal {
            write_varint(&mut self.code, n);
        }
        self.named_fields.push(info.clone());

        let body_start = self.code.len() as u64;
        let mut body_names = HashSet::new();
        self.compile_stmts(
            tokens,
            pos,
            &info,
            Some(&Token::RBrace),
            is_whole_stream,
            &mut body_names,
        )?;
        self.expect(tokens, pos, &Token::RBrace)?;

        self.code.push(opcode_byte(TypeCode::StructEnd, OpcodeFlags::empty()));
        write_varint(&mut self.code, body_start);
        Ok(())
    }

    fn emit_directive(&mut self, type_code: TypeCode, extra: u64) {
        self.code.push(opcode_byte(type_code, OpcodeFlags::empty()));
        write_varint(&mut self.code, extra);
    }

    fn named_info(
        &self,
        field_name: Option<String>,
        scope: &NamedFieldInfo,
        names: &mut HashSet<String>,
    ) -> Result<Option<NamedFieldInfo>, CompileError> {
        match field_name {
            Some(name) => {
                if !names.insert(name.clone()) {
                    return Err(CompileError::DuplicateFieldName(name));
                }
                Ok(Some(scope.child(&name)))
            }
            None => Ok(None),
        }
    }
}

fn to_expr_token(token: &Token) -> Result<ExprToken, CompileError> {
    Ok(match token {
        Token::Number(n) => ExprToken::Number(*n),
        Token::Ident(name) => ExprToken::Ident(name.clone()),
        Token::DollarDollar => ExprToken::StreamCounter,
        Token::Plus => ExprToken::Plus,
        Token::Minus => ExprToken::Minus,
        Token::Star => ExprToken::Star,
        Token::Slash => ExprToken::Slash,
        Token::Percent => ExprToken::Percent,
        Token::Amp => ExprToken::Amp,
        Token::Pipe => ExprToken::Pipe,
        Token::Caret => ExprToken::Caret,
        Token::Tilde => ExprToken::Tilde,
        Token::Shl => ExprToken::Shl,
        Token::Shr => ExprToken::Shr,
        Token::UShr => ExprToken::UShr,
        Token::LParen => ExprToken::LParen,
        Token::RParen => ExprToken::RParen,
        _ => return Err(CompileError::UnexpectedToken),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tokenize;

    fn compile(script: &str) -> Result<CompiledBlock, CompileError> {
        let tokens = tokenize(script).unwrap();
        Compiler::compile(&tokens, &[])
    }

    #[test]
    fn compiles_simple_field() {
        let block = compile("int foo;").unwrap();
        assert_eq!(1, block.named_fields.len());
        assert_eq!("foo", block.named_fields[0].path);
    }

    #[test]
    fn rejects_bad_bit_width() {
        let err = compile("bit:9 foo;").unwrap_err();
        assert_eq!(CompileError::BadBitWidth(9), err);
    }

    #[test]
    fn rejects_duplicate_name() {
        let err = compile("int foo; int foo;").unwrap_err();
        assert_eq!(CompileError::DuplicateFieldName("foo".to_string()), err);
    }

    #[test]
    fn rejects_nested_whole_stream_array() {
        let err = compile("Outer[_]{ Inner[_]{ int a; } }").unwrap_err();
        assert_eq!(CompileError::NestedWholeStreamArray, err);
    }

    #[test]
    fn compiles_struct_array_with_expression_length() {
        let block = compile("int n; S[n]{ int a; }").unwrap();
        assert!(block.has_evaluated_arrays);
        assert_eq!(1, block.size_evaluators.len());
    }

    #[test]
    fn records_var_field_flag() {
        let block = compile("var foo;").unwrap();
        assert!(block.has_var_fields);
    }

    #[test]
    fn unnamed_field_is_not_pushed_to_named_fields() {
        let block = compile("int;").unwrap();
        assert!(block.named_fields.is_empty());
    }
}
