//! Tokenizer for the SQL filter grammar.
//!
//! Every token carries the byte position it started at, so parse errors can
//! report where in the expression they occurred. Keywords are not resolved
//! here — the parser matches identifiers case-insensitively.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    /// Bare identifier: property name, `sys`, or a keyword (AND, OR, NOT,
    /// IN, LIKE, IS, NULL, TRUE, FALSE).
    Ident(String),
    /// Single-quoted string literal, quotes stripped, `''` unescaped.
    Str(String),
    Int(i64),
    Float(f64),
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    LParen,
    RParen,
    Comma,
    Dot,
    Minus,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub pos: usize,
}

fn syntax_error(position: usize, message: impl Into<String>) -> Error {
    Error::FilterSyntax {
        position,
        message: message.into(),
    }
}

/// Tokenizes a filter expression.
pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        let pos = i;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
            }
            '(' => {
                tokens.push(Token { kind: TokenKind::LParen, pos });
                i += 1;
            }
            ')' => {
                tokens.push(Token { kind: TokenKind::RParen, pos });
                i += 1;
            }
            ',' => {
                tokens.push(Token { kind: TokenKind::Comma, pos });
                i += 1;
            }
            '.' => {
                tokens.push(Token { kind: TokenKind::Dot, pos });
                i += 1;
            }
            '-' => {
                tokens.push(Token { kind: TokenKind::Minus, pos });
                i += 1;
            }
            '=' => {
                tokens.push(Token { kind: TokenKind::Eq, pos });
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Ne, pos });
                    i += 2;
                } else {
                    return Err(syntax_error(pos, "expected '=' after '!'"));
                }
            }
            '<' => match bytes.get(i + 1) {
                Some(&b'>') => {
                    tokens.push(Token { kind: TokenKind::Ne, pos });
                    i += 2;
                }
                Some(&b'=') => {
                    tokens.push(Token { kind: TokenKind::Le, pos });
                    i += 2;
                }
                _ => {
                    tokens.push(Token { kind: TokenKind::Lt, pos });
                    i += 1;
                }
            },
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Ge, pos });
                    i += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Gt, pos });
                    i += 1;
                }
            }
            '\'' => {
                let (s, next) = scan_string(input, i)?;
                tokens.push(Token { kind: TokenKind::Str(s), pos });
                i = next;
            }
            '0'..='9' => {
                let (kind, next) = scan_number(input, i)?;
                tokens.push(Token { kind, pos });
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(input[start..i].to_string()),
                    pos,
                });
            }
            other => {
                return Err(syntax_error(pos, format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

/// Scans a single-quoted string starting at `start`. Doubled quotes escape a
/// literal quote, SQL style. Returns the unescaped content and the index just
/// past the closing quote.
fn scan_string(input: &str, start: usize) -> Result<(String, usize)> {
    let bytes = input.as_bytes();
    let mut out = String::new();
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                out.push('\'');
                i += 2;
            } else {
                return Ok((out, i + 1));
            }
        } else {
            // Advance by whole characters, not bytes.
            let ch = input[i..].chars().next().unwrap_or('\0');
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    Err(syntax_error(start, "unterminated string literal"))
}

/// Scans an integer or float literal starting at `start`.
fn scan_number(input: &str, start: usize) -> Result<(TokenKind, usize)> {
    let bytes = input.as_bytes();
    let mut i = start;
    let mut is_float = false;

    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit()) {
        is_float = true;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }

    let text = &input[start..i];
    if is_float {
        let value = text
            .parse::<f64>()
            .map_err(|_| syntax_error(start, format!("invalid number '{text}'")))?;
        Ok((TokenKind::Float(value), i))
    } else {
        let value = text
            .parse::<i64>()
            .map_err(|_| syntax_error(start, format!("invalid number '{text}'")))?;
        Ok((TokenKind::Int(value), i))
    }
}
