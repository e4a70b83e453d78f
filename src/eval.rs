//! The integer expression evaluator used for array lengths, skip/align
//! counts, and bit widths.
//!
//! Expressions are parsed once, at compile time, into a flat postfix
//! `CompiledExpr`; evaluating one is a stack walk with no further parsing,
//! matching the "no parser runs per-field" property of the design notes.

use std::{error, fmt};

use crate::field::{ExternalValueProvider, NamedNumericFieldMap};

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ArithmeticError,
    UnknownField(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArithmeticError => f.write_str("division by zero in expression"),
            Self::UnknownField(name) => write!(f, "unknown field `{name}` in expression"),
        }
    }
}

impl error::Error for Error {}

/// Token-level expression surface, as handed to the evaluator's compiler by
/// the external tokenizer (or by the reference `token` module).
#[derive(Debug, Clone, PartialEq)]
pub enum ExprToken {
    Number(i64),
    Ident(String),
    /// `$$`, the current stream byte counter.
    StreamCounter,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    UShr,
    LParen,
    RParen,
}

/// One step of the postfix program produced by compiling an `ExprToken`
/// sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprOp {
    Literal(i32),
    FieldRef(String),
    StreamCounter,
    Neg,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
}

/// A compiled expression: a flat postfix instruction list.
pub type CompiledExpr = Vec<ExprOp>;

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    UnexpectedToken,
    UnbalancedParens,
    TrailingTokens,
    EmptyExpression,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedToken => f.write_str("unexpected token in expression"),
            Self::UnbalancedParens => f.write_str("unbalanced parentheses in expression"),
            Self::TrailingTokens => f.write_str("trailing tokens after expression"),
            Self::EmptyExpression => f.write_str("empty expression"),
        }
    }
}

impl error::Error for CompileError {}

/// Precedence-climbing compiler from infix tokens to postfix ops.
/// Precedence (low to high): `|`, `^`, `&`, `<< >> >>>`, `+ -`, `* / %`,
/// unary `- ~`.
struct ExprCompiler<'a> {
    tokens: &'a [ExprToken],
    pos: usize,
}

impl<'a> ExprCompiler<'a> {
    fn peek(&self) -> Option<&'a ExprToken> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&'a ExprToken> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn parse_binary(&mut self, min_prec: u8, out: &mut CompiledExpr) -> Result<(), CompileError> {
        self.parse_unary(out)?;
        loop {
            let Some((prec, op)) = self.peek().and_then(binary_op) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.bump();
            self.parse_binary(prec + 1, out)?;
            out.push(op);
        }
        Ok(())
    }

    fn parse_unary(&mut self, out: &mut CompiledExpr) -> Result<(), CompileError> {
        match self.peek() {
            Some(ExprToken::Minus) => {
                self.bump();
                self.parse_unary(out)?;
                out.push(ExprOp::Neg);
                Ok(())
            }
            Some(ExprToken::Tilde) => {
                self.bump();
                self.parse_unary(out)?;
                out.push(ExprOp::Not);
                Ok(())
            }
            _ => self.parse_primary(out),
        }
    }

    fn parse_primary(&mut self, out: &mut CompiledExpr) -> Result<(), CompileError> {
        match self.bump() {
            Some(ExprToken::Number(n)) => {
                out.push(ExprOp::Literal(*n as i32));
                Ok(())
            }
            Some(ExprToken::Ident(name)) => {
                out.push(ExprOp::FieldRef(name.clone()));
                Ok(())
            }
            Some(ExprToken::StreamCounter) => {
                out.push(ExprOp::StreamCounter);
                Ok(())
            }
            Some(ExprToken::LParen) => {
                self.parse_binary(0, out)?;
                match self.bump() {
                    Some(ExprToken::RParen) => Ok(()),
                    _ => Err(CompileError::UnbalancedParens),
                }
            }
            _ => Err(CompileError::UnexpectedToken),
        }
    }
}

fn binary_op(token: &ExprToken) -> Option<(u8, ExprOp)> {
    Some(match token {
        ExprToken::Pipe => (1, ExprOp::Or),
        ExprToken::Caret => (2, ExprOp::Xor),
        ExprToken::Amp => (3, ExprOp::And),
        ExprToken::Shl => (4, ExprOp::Shl),
        ExprToken::Shr => (4, ExprOp::Shr),
        ExprToken::UShr => (4, ExprOp::UShr),
        ExprToken::Plus => (5, ExprOp::Add),
        ExprToken::Minus => (5, ExprOp::Sub),
        ExprToken::Star => (6, ExprOp::Mul),
        ExprToken::Slash => (6, ExprOp::Div),
        ExprToken::Percent => (6, ExprOp::Rem),
        _ => return None,
    })
}

/// Compiles an infix token sequence into postfix form.
pub fn compile(tokens: &[ExprToken]) -> Result<CompiledExpr, CompileError> {
    if tokens.is_empty() {
        return Err(CompileError::EmptyExpression);
    }
    let mut compiler = ExprCompiler { tokens, pos: 0 };
    let mut out = Vec::new();
    compiler.parse_binary(0, &mut out)?;
    if compiler.pos != tokens.len() {
        return Err(CompileError::TrailingTokens);
    }
    Ok(out)
}

/// Evaluates a compiled expression against the current parse state.
///
/// `scope_path` is the dotted path of the struct currently being parsed
/// (used to resolve bare names outward-in). Named-field
/// references first try the `NamedNumericFieldMap`; on a miss, the
/// `ExternalValueProvider` (if any) is queried with the raw name.
pub fn evaluate(
    expr: &CompiledExpr,
    field_map: &NamedNumericFieldMap,
    scope_path: &str,
    external: Option<&dyn ExternalValueProvider>,
    stream_counter: i64,
) -> Result<i32, Error> {
    let mut stack: Vec<i32> = Vec::with_capacity(expr.len());
    for op in expr {
        match op {
            ExprOp::Literal(v) => stack.push(*v),
            ExprOp::StreamCounter => stack.push(stream_counter as i32),
            ExprOp::FieldRef(name) => {
                let value = field_map
                    .resolve(scope_path, name)
                    .map(|v| v as i32)
                    .or_else(|| external.and_then(|p| p.get(name)))
                    .ok_or_else(|| Error::UnknownField(name.clone()))?;
                stack.push(value);
            }
            ExprOp::Neg => {
                let a = stack.pop().expect("postfix expr is well-formed");
                stack.push(a.wrapping_neg());
            }
            ExprOp::Not => {
                let a = stack.pop().expect("postfix expr is well-formed");
                stack.push(!a);
            }
            ExprOp::Add | ExprOp::Sub | ExprOp::Mul | ExprOp::Div | ExprOp::Rem | ExprOp::And
            | ExprOp::Or | ExprOp::Xor | ExprOp::Shl | ExprOp::Shr | ExprOp::UShr => {
                let b = stack.pop().expect("postfix expr is well-formed");
                let a = stack.pop().expect("postfix expr is well-formed");
                let result = match op {
                    ExprOp::Add => a.wrapping_add(b),
                    ExprOp::Sub => a.wrapping_sub(b),
                    ExprOp::Mul => a.wrapping_mul(b),
                    ExprOp::Div => {
                        if b == 0 {
                            return Err(Error::ArithmeticError);
                        }
                        a.wrapping_div(b)
                    }
                    ExprOp::Rem => {
                        if b == 0 {
                            return Err(Error::ArithmeticError);
                        }
                        a.wrapping_rem(b)
                    }
                    ExprOp::And => a & b,
                    ExprOp::Or => a | b,
                    ExprOp::Xor => a ^ b,
                    ExprOp::Shl => ((a as u32).wrapping_shl(b as u32 & 31)) as i32,
                    ExprOp::Shr => a.wrapping_shr(b as u32 & 31),
                    ExprOp::UShr => ((a as u32) >> (b as u32 & 31)) as i32,
                    _ => unreachable!(),
                };
                stack.push(result);
            }
        }
    }
    Ok(stack.pop().expect("postfix expr produces exactly one value"))
}
