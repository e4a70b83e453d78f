//! A minimal reference tokenizer for the script surface.
//!
//! This is deliberately thin: just enough lexing to drive the end-to-end
//! scenarios the crate tests against. The tokenizer is an external
//! collaborator per the core's scope -- a full, forgiving
//! script-language frontend is explicitly not this module's job.

use std::{error, fmt};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(i64),
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Semicolon,
    Colon,
    Underscore,
    /// `<`, the little-endian byte-order prefix.
    Lt,
    /// `>`, the big-endian byte-order prefix.
    Gt,
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
    /// `$$`, used by the `reset$$;` directive and as the stream-counter
    /// reference inside expressions.
    DollarDollar,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    UnexpectedChar(char),
    UnterminatedHexLiteral,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedChar(c) => write!(f, "unexpected character `{c}`"),
            Self::UnterminatedHexLiteral => f.write_str("unterminated hex literal"),
        }
    }
}

impl error::Error for Error {}

/// Lexes `source` into a flat token stream.
pub fn tokenize(source: &str) -> Result<Vec<Token>, Error> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '&' => {
                tokens.push(Token::Amp);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '~' => {
                tokens.push(Token::Tilde);
                i += 1;
            }
            '$' => {
                if chars.get(i + 1) == Some(&'$') {
                    tokens.push(Token::DollarDollar);
                    i += 2;
                } else {
                    return Err(Error::UnexpectedChar(c));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'<') {
                    tokens.push(Token::Shl);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'>') && chars.get(i + 2) == Some(&'>') {
                    tokens.push(Token::UShr);
                    i += 3;
                } else if chars.get(i + 1) == Some(&'>') {
                    tokens.push(Token::Shr);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '_' if !chars
                .get(i + 1)
                .is_some_and(|c| c.is_alphanumeric() || *c == '_') =>
            {
                tokens.push(Token::Underscore);
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let (value, consumed) = lex_number(&chars[i..])?;
                tokens.push(Token::Number(value));
                i += consumed;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(Error::UnexpectedChar(other)),
        }
    }
    Ok(tokens)
}

fn lex_number(chars: &[char]) -> Result<(i64, usize), Error> {
    if chars.starts_with(&['0', 'x']) || chars.starts_with(&['0', 'X']) {
        let mut end = 2;
        while end < chars.len() && chars[end].is_ascii_hexdigit() {
            end += 1;
        }
        if end == 2 {
            return Err(Error::UnterminatedHexLiteral);
        }
        let digits: String = chars[2..end].iter().collect();
        let value = i64::from_str_radix(&digits, 16).expect("validated hex digits");
        Ok((value, end))
    } else {
        let mut end = 0;
        while end < chars.len() && chars[end].is_ascii_digit() {
            end += 1;
        }
        let digits: String = chars[..end].iter().collect();
        let value: i64 = digits.parse().expect("validated decimal digits");
        Ok((value, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_primitive_field_declaration() {
        let tokens = tokenize("long header;").unwrap();
        assert_eq!(
            vec![
                Token::Ident("long".to_string()),
                Token::Ident("header".to_string()),
                Token::Semicolon,
            ],
            tokens
        );
    }

    #[test]
    fn tokenizes_whole_stream_array_and_struct() {
        let tokens = tokenize("chunk[_]{int length;}").unwrap();
        assert_eq!(
            vec![
                Token::Ident("chunk".to_string()),
                Token::LBracket,
                Token::Underscore,
                Token::RBracket,
                Token::LBrace,
                Token::Ident("int".to_string()),
                Token::Ident("length".to_string()),
                Token::Semicolon,
                Token::RBrace,
            ],
            tokens
        );
    }

    #[test]
    fn tokenizes_dotted_identifier_and_shift_operators() {
        let tokens = tokenize("(Header.ColorMapType & 1) >>> 3").unwrap();
        assert_eq!(
            vec![
                Token::LParen,
                Token::Ident("Header.ColorMapType".to_string()),
                Token::Amp,
                Token::Number(1),
                Token::RParen,
                Token::UShr,
                Token::Number(3),
            ],
            tokens
        );
    }

    #[test]
    fn tokenizes_byte_order_prefix_distinctly_from_shift() {
        let tokens = tokenize("<int ChunkID;").unwrap();
        assert_eq!(Token::Lt, tokens[0]);
        let tokens = tokenize("a << 2").unwrap();
        assert_eq!(Token::Shl, tokens[1]);
    }

    #[test]
    fn tokenizes_hex_and_decimal_literals() {
        let tokens = tokenize("0x1A 26").unwrap();
        assert_eq!(vec![Token::Number(26), Token::Number(26)], tokens);
    }
}
