//! Expression lexer and recursive-descent parser.
//!
//! The grammar is a small, side-effect-free expression language:
//!
//! ```text
//! expr     := or
//! or       := and ("||" and)*
//! and      := cmp ("&&" cmp)*
//! cmp      := add (("==" | "!=" | "<" | "<=" | ">" | ">=") add)?
//! add      := mul (("+" | "-") mul)*
//! mul      := unary (("*" | "/" | "%") unary)*
//! unary    := ("!" | "-") unary | postfix
//! postfix  := primary ("." ident | "[" expr "]")*
//! primary  := number | string | "true" | "false" | "null"
//!           | ident "(" args ")" | ident | "(" expr ")" | "[" args "]"
//! ```
//!
//! There is intentionally no assignment, no loops, and no way to name
//! anything outside the supplied context: the language is pure.

use crate::error::{EvalError, Result};

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Binary operators in precedence-agnostic form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// A parsed expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal (quotes removed, escapes resolved).
    Str(String),
    /// Boolean literal.
    Bool(bool),
    /// The `null` literal.
    Null,
    /// A root identifier resolved against the context.
    Ident(String),
    /// Member access: `base.field`.
    Member(Box<Expr>, String),
    /// Index access: `base[index]`.
    Index(Box<Expr>, Box<Expr>),
    /// Whitelisted helper call: `name(args...)`.
    Call(String, Vec<Expr>),
    /// List literal: `[a, b, c]`.
    List(Vec<Expr>),
    /// Binary operation.
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
    /// Arithmetic negation.
    Neg(Box<Expr>),
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    Eof,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Parse {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn next(&mut self) -> Result<(Token, usize)> {
        self.skip_ws();
        let start = self.pos;
        if self.pos >= self.bytes.len() {
            return Ok((Token::Eof, start));
        }
        let c = self.bytes[self.pos];

        // Two-character operators first.
        for op in ["==", "!=", "<=", ">=", "&&", "||"] {
            if self.src[self.pos..].starts_with(op) {
                self.pos += 2;
                return Ok((Token::Op(op), start));
            }
        }
        if let Some(op) = match c {
            b'+' => Some("+"),
            b'-' => Some("-"),
            b'*' => Some("*"),
            b'/' => Some("/"),
            b'%' => Some("%"),
            b'<' => Some("<"),
            b'>' => Some(">"),
            b'!' => Some("!"),
            b'(' => Some("("),
            b')' => Some(")"),
            b'[' => Some("["),
            b']' => Some("]"),
            b'.' => Some("."),
            b',' => Some(","),
            _ => None,
        } {
            self.pos += 1;
            return Ok((Token::Op(op), start));
        }

        if c == b'\'' || c == b'"' {
            return self.string(c).map(|t| (t, start));
        }
        if c.is_ascii_digit() {
            return self.number().map(|t| (t, start));
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            let from = self.pos;
            while self.pos < self.bytes.len()
                && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
            {
                self.pos += 1;
            }
            return Ok((Token::Ident(self.src[from..self.pos].to_string()), start));
        }
        Err(self.error(format!("unexpected character `{}`", c as char)))
    }

    fn string(&mut self, quote: u8) -> Result<Token> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        while self.pos < self.bytes.len() {
            let c = self.bytes[self.pos];
            if c == quote {
                self.pos += 1;
                return Ok(Token::Str(out));
            }
            if c == b'\\' && self.pos + 1 < self.bytes.len() {
                self.pos += 1;
                let esc = self.bytes[self.pos];
                match esc {
                    b'n' => out.push('\n'),
                    b't' => out.push('\t'),
                    b'\\' => out.push('\\'),
                    b'\'' => out.push('\''),
                    b'"' => out.push('"'),
                    other => return Err(self.error(format!("bad escape `\\{}`", other as char))),
                }
                self.pos += 1;
                continue;
            }
            // Multi-byte UTF-8 passes through untouched.
            let ch_len = self.src[self.pos..]
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(1);
            out.push_str(&self.src[self.pos..self.pos + ch_len]);
            self.pos += ch_len;
        }
        Err(self.error("unterminated string literal"))
    }

    fn number(&mut self) -> Result<Token> {
        let from = self.pos;
        let mut is_float = false;
        while self.pos < self.bytes.len() {
            let c = self.bytes[self.pos];
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == b'.'
                && !is_float
                && self
                    .bytes
                    .get(self.pos + 1)
                    .is_some_and(u8::is_ascii_digit)
            {
                is_float = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.src[from..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|e| self.error(format!("bad float literal: {e}")))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|e| self.error(format!("bad integer literal: {e}")))
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a single expression, requiring that the whole input is consumed.
pub fn parse(src: &str) -> Result<Expr> {
    let mut p = Parser::new(src)?;
    let expr = p.or_expr()?;
    if p.current != Token::Eof {
        return Err(EvalError::Parse {
            offset: p.offset,
            message: "trailing input after expression".into(),
        });
    }
    Ok(expr)
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    offset: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Result<Self> {
        let mut lexer = Lexer::new(src);
        let (current, offset) = lexer.next()?;
        Ok(Self {
            lexer,
            current,
            offset,
        })
    }

    fn advance(&mut self) -> Result<Token> {
        let (next, offset) = self.lexer.next()?;
        self.offset = offset;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Parse {
            offset: self.offset,
            message: message.into(),
        }
    }

    fn eat_op(&mut self, op: &'static str) -> Result<()> {
        if self.current == Token::Op(op) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.error(format!("expected `{op}`, found {:?}", self.current)))
        }
    }

    fn binary_chain(
        &mut self,
        ops: &[(&'static str, BinOp)],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut lhs = next(self)?;
        loop {
            let Some((_, op)) = ops
                .iter()
                .copied()
                .find(|(s, _)| self.current == Token::Op(*s))
            else {
                return Ok(lhs);
            };
            self.advance()?;
            let rhs = next(self)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn or_expr(&mut self) -> Result<Expr> {
        self.binary_chain(&[("||", BinOp::Or)], Self::and_expr)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        self.binary_chain(&[("&&", BinOp::And)], Self::cmp_expr)
    }

    fn cmp_expr(&mut self) -> Result<Expr> {
        let lhs = self.add_expr()?;
        let op = match &self.current {
            Token::Op("==") => BinOp::Eq,
            Token::Op("!=") => BinOp::Ne,
            Token::Op("<=") => BinOp::Le,
            Token::Op(">=") => BinOp::Ge,
            Token::Op("<") => BinOp::Lt,
            Token::Op(">") => BinOp::Gt,
            _ => return Ok(lhs),
        };
        self.advance()?;
        let rhs = self.add_expr()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn add_expr(&mut self) -> Result<Expr> {
        self.binary_chain(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::mul_expr)
    }

    fn mul_expr(&mut self) -> Result<Expr> {
        self.binary_chain(
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Rem)],
            Self::unary_expr,
        )
    }

    fn unary_expr(&mut self) -> Result<Expr> {
        match &self.current {
            Token::Op("!") => {
                self.advance()?;
                Ok(Expr::Not(Box::new(self.unary_expr()?)))
            }
            Token::Op("-") => {
                self.advance()?;
                Ok(Expr::Neg(Box::new(self.unary_expr()?)))
            }
            _ => self.postfix_expr(),
        }
    }

    fn postfix_expr(&mut self) -> Result<Expr> {
        let mut expr = self.primary_expr()?;
        loop {
            match &self.current {
                Token::Op(".") => {
                    self.advance()?;
                    match self.advance()? {
                        Token::Ident(name) => expr = Expr::Member(Box::new(expr), name),
                        other => {
                            return Err(self.error(format!(
                                "expected field name after `.`, found {other:?}"
                            )));
                        }
                    }
                }
                Token::Op("[") => {
                    self.advance()?;
                    let index = self.or_expr()?;
                    self.eat_op("]")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary_expr(&mut self) -> Result<Expr> {
        match self.advance()? {
            Token::Int(n) => Ok(Expr::Int(n)),
            Token::Float(f) => Ok(Expr::Float(f)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                _ => {
                    if self.current == Token::Op("(") {
                        self.advance()?;
                        let args = self.arg_list(")")?;
                        Ok(Expr::Call(name, args))
                    } else {
                        Ok(Expr::Ident(name))
                    }
                }
            },
            Token::Op("(") => {
                let inner = self.or_expr()?;
                self.eat_op(")")?;
                Ok(inner)
            }
            Token::Op("[") => {
                let items = self.arg_list("]")?;
                Ok(Expr::List(items))
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    /// Parse a comma-separated expression list terminated by `close`.
    fn arg_list(&mut self, close: &'static str) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.current == Token::Op(close) {
            self.advance()?;
            return Ok(args);
        }
        loop {
            args.push(self.or_expr()?);
            match &self.current {
                Token::Op(",") => {
                    self.advance()?;
                }
                Token::Op(op) if *op == close => {
                    self.advance()?;
                    return Ok(args);
                }
                other => {
                    return Err(self.error(format!("expected `,` or `{close}`, found {other:?}")));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
