//! Recursive-descent parser for the SQL filter grammar.
//!
//! Grammar (binding loosest to tightest: OR, AND, NOT, predicate):
//!
//! ```text
//! expr       := and ( OR and )*
//! and        := unary ( AND unary )*
//! unary      := NOT unary | '(' expr ')' | predicate
//! predicate  := operand ( cmp operand
//!                       | IS [NOT] NULL
//!                       | [NOT] IN '(' literal ( ',' literal )* ')'
//!                       | [NOT] LIKE string )
//! operand    := literal | 'sys' '.' ident | ident
//! literal    := string | [-] number | TRUE | FALSE
//! ```
//!
//! Compilation happens once at rule-creation time; the resulting AST is
//! immutable and evaluated per message without re-parsing.

use crate::error::{Error, Result};
use crate::filter::lexer::{tokenize, Token, TokenKind};

/// Maximum accepted expression length in characters.
pub const MAX_EXPRESSION_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        op: CompareOp,
        lhs: Operand,
        rhs: Operand,
    },
    In {
        operand: Operand,
        list: Vec<Literal>,
        negated: bool,
    },
    Like {
        operand: Operand,
        pattern: String,
        negated: bool,
    },
    IsNull {
        operand: Operand,
        negated: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    Literal(Literal),
    /// `sys.<Name>` reference.
    System(SystemProperty),
    /// Bare identifier: user property, resolved by exact name.
    User(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// System properties addressable as `sys.<Name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SystemProperty {
    MessageId,
    Label,
    ContentType,
    CorrelationId,
    SessionId,
    ReplyTo,
    To,
    DeliveryCount,
    EnqueuedTimeUtc,
    SequenceNumber,
}

impl SystemProperty {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "MessageId" => Some(Self::MessageId),
            "Label" => Some(Self::Label),
            "ContentType" => Some(Self::ContentType),
            "CorrelationId" => Some(Self::CorrelationId),
            "SessionId" => Some(Self::SessionId),
            "ReplyTo" => Some(Self::ReplyTo),
            "To" => Some(Self::To),
            "DeliveryCount" => Some(Self::DeliveryCount),
            "EnqueuedTimeUtc" => Some(Self::EnqueuedTimeUtc),
            "SequenceNumber" => Some(Self::SequenceNumber),
            _ => None,
        }
    }
}

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "in", "like", "is", "null", "true", "false",
];

fn is_keyword(ident: &str) -> bool {
    KEYWORDS.iter().any(|k| ident.eq_ignore_ascii_case(k))
}

fn syntax_error(position: usize, message: impl Into<String>) -> Error {
    Error::FilterSyntax {
        position,
        message: message.into(),
    }
}

/// Compiles a filter expression into an AST.
pub(crate) fn parse(expression: &str) -> Result<Expr> {
    if expression.chars().count() > MAX_EXPRESSION_LEN {
        return Err(syntax_error(
            MAX_EXPRESSION_LEN,
            format!("expression exceeds {MAX_EXPRESSION_LEN} characters"),
        ));
    }
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(syntax_error(0, "empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: expression.len(),
    };
    let expr = parser.parse_or()?;
    if let Some(tok) = parser.peek() {
        return Err(syntax_error(
            tok.pos,
            format!("unexpected trailing input near {}", describe(&tok.kind)),
        ));
    }
    Ok(expr)
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(s) => format!("'{s}'"),
        TokenKind::Str(s) => format!("'{s}'"),
        TokenKind::Int(n) => format!("'{n}'"),
        TokenKind::Float(x) => format!("'{x}'"),
        TokenKind::Eq => "'='".to_string(),
        TokenKind::Ne => "'!='".to_string(),
        TokenKind::Lt => "'<'".to_string(),
        TokenKind::Gt => "'>'".to_string(),
        TokenKind::Le => "'<='".to_string(),
        TokenKind::Ge => "'>='".to_string(),
        TokenKind::LParen => "'('".to_string(),
        TokenKind::RParen => "')'".to_string(),
        TokenKind::Comma => "','".to_string(),
        TokenKind::Dot => "'.'".to_string(),
        TokenKind::Minus => "'-'".to_string(),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Length of the source expression, used as the position for
    /// unexpected-end-of-input errors.
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// Consumes the next token if it is the given keyword.
    fn eat_keyword(&mut self, kw: &str) -> bool {
        if let Some(Token {
            kind: TokenKind::Ident(s),
            ..
        }) = self.peek()
        {
            if s.eq_ignore_ascii_case(kw) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Ident(ref s),
                ..
            }) if s.eq_ignore_ascii_case(kw) => {
                self.pos += 1;
                Ok(())
            }
            Some(tok) => Err(syntax_error(
                tok.pos,
                format!("expected {} but found {}", kw.to_uppercase(), describe(&tok.kind)),
            )),
            None => Err(syntax_error(
                self.end,
                format!("expected {} but found end of expression", kw.to_uppercase()),
            )),
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<()> {
        match self.peek() {
            Some(tok) if tok.kind == kind => {
                self.pos += 1;
                Ok(())
            }
            Some(tok) => Err(syntax_error(
                tok.pos,
                format!("expected {what} but found {}", describe(&tok.kind)),
            )),
            None => Err(syntax_error(
                self.end,
                format!("expected {what} but found end of expression"),
            )),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_keyword("or") {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while self.eat_keyword("and") {
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        if matches!(
            self.peek(),
            Some(Token {
                kind: TokenKind::LParen,
                ..
            })
        ) {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.expect(TokenKind::RParen, "')'")?;
            return Ok(inner);
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Expr> {
        let operand = self.parse_operand()?;

        // IS [NOT] NULL
        if self.eat_keyword("is") {
            let negated = self.eat_keyword("not");
            self.expect_keyword("null")?;
            return Ok(Expr::IsNull { operand, negated });
        }

        // [NOT] IN / [NOT] LIKE
        let negated = self.eat_keyword("not");
        if self.eat_keyword("in") {
            return self.parse_in(operand, negated);
        }
        if self.eat_keyword("like") {
            return self.parse_like(operand, negated);
        }
        if negated {
            let pos = self.peek().map(|t| t.pos).unwrap_or(self.end);
            return Err(syntax_error(pos, "expected IN or LIKE after NOT"));
        }

        // Comparison
        let op = match self.advance() {
            Some(Token {
                kind: TokenKind::Eq, ..
            }) => CompareOp::Eq,
            Some(Token {
                kind: TokenKind::Ne, ..
            }) => CompareOp::Ne,
            Some(Token {
                kind: TokenKind::Lt, ..
            }) => CompareOp::Lt,
            Some(Token {
                kind: TokenKind::Gt, ..
            }) => CompareOp::Gt,
            Some(Token {
                kind: TokenKind::Le, ..
            }) => CompareOp::Le,
            Some(Token {
                kind: TokenKind::Ge, ..
            }) => CompareOp::Ge,
            Some(tok) => {
                return Err(syntax_error(
                    tok.pos,
                    format!("expected comparison operator but found {}", describe(&tok.kind)),
                ))
            }
            None => {
                return Err(syntax_error(
                    self.end,
                    "expected comparison operator but found end of expression",
                ))
            }
        };
        let rhs = self.parse_operand()?;
        Ok(Expr::Compare {
            op,
            lhs: operand,
            rhs,
        })
    }

    fn parse_in(&mut self, operand: Operand, negated: bool) -> Result<Expr> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut list = Vec::new();
        loop {
            list.push(self.parse_literal()?);
            match self.peek() {
                Some(Token {
                    kind: TokenKind::Comma,
                    ..
                }) => {
                    self.pos += 1;
                }
                Some(Token {
                    kind: TokenKind::RParen,
                    ..
                }) => {
                    self.pos += 1;
                    break;
                }
                Some(tok) => {
                    return Err(syntax_error(
                        tok.pos,
                        format!("expected ',' or ')' but found {}", describe(&tok.kind)),
                    ))
                }
                None => {
                    return Err(syntax_error(self.end, "unmatched '(' in IN list"));
                }
            }
        }
        Ok(Expr::In {
            operand,
            list,
            negated,
        })
    }

    fn parse_like(&mut self, operand: Operand, negated: bool) -> Result<Expr> {
        match self.advance() {
            Some(Token {
                kind: TokenKind::Str(pattern),
                ..
            }) => Ok(Expr::Like {
                operand,
                pattern,
                negated,
            }),
            Some(tok) => Err(syntax_error(
                tok.pos,
                format!("LIKE requires a string pattern, found {}", describe(&tok.kind)),
            )),
            None => Err(syntax_error(
                self.end,
                "LIKE requires a string pattern, found end of expression",
            )),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.advance() {
            Some(Token {
                kind: TokenKind::Str(s),
                ..
            }) => Ok(Operand::Literal(Literal::Str(s))),
            Some(Token {
                kind: TokenKind::Int(n),
                ..
            }) => Ok(Operand::Literal(Literal::Int(n))),
            Some(Token {
                kind: TokenKind::Float(x),
                ..
            }) => Ok(Operand::Literal(Literal::Float(x))),
            Some(Token {
                kind: TokenKind::Minus,
                pos,
            }) => match self.advance() {
                Some(Token {
                    kind: TokenKind::Int(n),
                    ..
                }) => Ok(Operand::Literal(Literal::Int(-n))),
                Some(Token {
                    kind: TokenKind::Float(x),
                    ..
                }) => Ok(Operand::Literal(Literal::Float(-x))),
                _ => Err(syntax_error(pos, "expected number after '-'")),
            },
            Some(Token {
                kind: TokenKind::Ident(name),
                pos,
            }) => {
                if name.eq_ignore_ascii_case("true") {
                    return Ok(Operand::Literal(Literal::Bool(true)));
                }
                if name.eq_ignore_ascii_case("false") {
                    return Ok(Operand::Literal(Literal::Bool(false)));
                }
                if is_keyword(&name) {
                    return Err(syntax_error(
                        pos,
                        format!("unexpected keyword '{name}'"),
                    ));
                }
                if name == "sys" {
                    self.expect(TokenKind::Dot, "'.' after 'sys'")?;
                    return match self.advance() {
                        Some(Token {
                            kind: TokenKind::Ident(prop),
                            pos,
                        }) => SystemProperty::from_name(&prop)
                            .map(Operand::System)
                            .ok_or_else(|| {
                                syntax_error(pos, format!("unknown system property '{prop}'"))
                            }),
                        Some(tok) => Err(syntax_error(
                            tok.pos,
                            format!("expected system property name, found {}", describe(&tok.kind)),
                        )),
                        None => Err(syntax_error(
                            self.end,
                            "expected system property name, found end of expression",
                        )),
                    };
                }
                Ok(Operand::User(name))
            }
            Some(tok) => Err(syntax_error(
                tok.pos,
                format!("expected operand but found {}", describe(&tok.kind)),
            )),
            None => Err(syntax_error(
                self.end,
                "expected operand but found end of expression",
            )),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        let pos = self.peek().map(|t| t.pos).unwrap_or(self.end);
        match self.parse_operand()? {
            Operand::Literal(lit) => Ok(lit),
            _ => Err(syntax_error(pos, "expected literal")),
        }
    }
}
