//! Safe arithmetic evaluator for PID formulas
//!
//! Formulas are written over the response bytes `A`, `B`, `C`, ... and may use
//! `+ - * /`, parentheses, unary minus, numeric literals and a short list of
//! functions (`abs`, `min`, `max`, `round`, `floor`, `signed`). Nothing else is
//! accepted, so a profile file can never smuggle in code.

use std::fmt;
use thiserror::Error;

/// Errors raised while parsing or evaluating a formula
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FormulaError {
    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("invalid number {0:?}")]
    InvalidNumber(String),

    #[error("unexpected token {found} (expected {expected})")]
    UnexpectedToken { found: String, expected: &'static str },

    #[error("unexpected end of formula")]
    UnexpectedEnd,

    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    #[error("{name}() takes {expected} argument(s), got {found}")]
    Arity {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("unknown variable {0:?}")]
    UnknownVariable(String),

    #[error("byte {0} missing from response")]
    MissingByte(char),

    #[error("division by zero")]
    DivisionByZero,

    #[error("result is not a finite number")]
    NonFinite,

    #[error("formula is {len} characters long (limit {max})")]
    TooLong { len: usize, max: usize },

    #[error("formula nests deeper than {0} levels")]
    TooDeep(usize),
}

/// Longest accepted formula source, in characters
pub const MAX_FORMULA_LEN: usize = 256;

/// Deepest accepted nesting of parentheses, calls and unary minus
pub const MAX_NESTING: usize = 32;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Ident(s) => write!(f, "{s}"),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
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
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                let is_hex = c == '0' && matches!(chars.get(i + 1), Some('x') | Some('X'));
                if is_hex {
                    i += 2;
                    while i < chars.len() && chars[i].is_ascii_hexdigit() {
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    let value = u32::from_str_radix(&text[2..], 16)
                        .map_err(|_| FormulaError::InvalidNumber(text.clone()))?;
                    tokens.push(Token::Number(value as f64));
                } else {
                    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| FormulaError::InvalidNumber(text.clone()))?;
                    tokens.push(Token::Number(value));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(FormulaError::UnexpectedChar { ch, offset: i }),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Abs,
    Min,
    Max,
    Round,
    Floor,
    Signed,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Function::Abs),
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "round" => Some(Function::Round),
            "floor" => Some(Function::Floor),
            "signed" => Some(Function::Signed),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Function::Abs => "abs",
            Function::Min => "min",
            Function::Max => "max",
            Function::Round => "round",
            Function::Floor => "floor",
            Function::Signed => "signed",
        }
    }

    fn arity(self) -> usize {
        match self {
            Function::Min | Function::Max => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Function::Abs => args[0].abs(),
            Function::Min => args[0].min(args[1]),
            Function::Max => args[0].max(args[1]),
            Function::Round => args[0].round(),
            Function::Floor => args[0].floor(),
            Function::Signed => {
                let byte = args[0] as i64 & 0xFF;
                if byte > 127 {
                    (byte - 256) as f64
                } else {
                    byte as f64
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Byte(usize),
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

/// Recursive-descent parser over the token stream
///
/// ```text
/// expr   := term (('+' | '-') term)*
/// term   := unary (('*' | '/') unary)*
/// unary  := '-' unary | atom
/// atom   := number | variable | func '(' expr (',' expr)* ')' | '(' expr ')'
/// ```
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self) -> Result<(), FormulaError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(FormulaError::TooDeep(MAX_NESTING));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, wanted: Token, expected: &'static str) -> Result<(), FormulaError> {
        match self.next() {
            Some(t) if t == wanted => Ok(()),
            Some(t) => Err(FormulaError::UnexpectedToken {
                found: t.to_string(),
                expected,
            }),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Negate(Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.expr()?;
                self.expect(Token::RParen, "')'")?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.call(name)
                } else {
                    variable_index(&name)
                        .map(Expr::Byte)
                        .ok_or(FormulaError::UnknownVariable(name))
                }
            }
            Some(t) => Err(FormulaError::UnexpectedToken {
                found: t.to_string(),
                expected: "a number, byte or '('",
            }),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }

    fn call(&mut self, name: String) -> Result<Expr, FormulaError> {
        let function = Function::lookup(&name).ok_or(FormulaError::UnknownFunction(name))?;
        self.expect(Token::LParen, "'('")?;
        self.descend()?;

        let mut args = vec![self.expr()?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            args.push(self.expr()?);
        }
        self.expect(Token::RParen, "')'")?;
        self.depth -= 1;

        if args.len() != function.arity() {
            return Err(FormulaError::Arity {
                name: function.name(),
                expected: function.arity(),
                found: args.len(),
            });
        }
        Ok(Expr::Call(function, args))
    }
}

fn variable_index(name: &str) -> Option<usize> {
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_uppercase() => Some((c as u8 - b'A') as usize),
        _ => None,
    }
}

fn byte_name(index: usize) -> char {
    (b'A' + index as u8) as char
}

fn evaluate(expr: &Expr, bytes: &[u8]) -> Result<f64, FormulaError> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Byte(i) => bytes
            .get(*i)
            .map(|b| f64::from(*b))
            .ok_or(FormulaError::MissingByte(byte_name(*i))),
        Expr::Negate(inner) => Ok(-evaluate(inner, bytes)?),
        Expr::Binary(op, lhs, rhs) => {
            let l = evaluate(lhs, bytes)?;
            let r = evaluate(rhs, bytes)?;
            match op {
                BinaryOp::Add => Ok(l + r),
                BinaryOp::Sub => Ok(l - r),
                BinaryOp::Mul => Ok(l * r),
                BinaryOp::Div if r == 0.0 => Err(FormulaError::DivisionByZero),
                BinaryOp::Div => Ok(l / r),
            }
        }
        Expr::Call(function, args) => {
            let values = args
                .iter()
                .map(|a| evaluate(a, bytes))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(function.apply(&values))
        }
    }
}

fn highest_byte(expr: &Expr) -> Option<usize> {
    match expr {
        Expr::Number(_) => None,
        Expr::Byte(i) => Some(*i),
        Expr::Negate(inner) => highest_byte(inner),
        Expr::Binary(_, lhs, rhs) => highest_byte(lhs).max(highest_byte(rhs)),
        Expr::Call(_, args) => args.iter().filter_map(highest_byte).max(),
    }
}

/// A parsed, immutable PID formula
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Parse a formula
    ///
    /// Sources longer than [`MAX_FORMULA_LEN`] or nested deeper than
    /// [`MAX_NESTING`] are rejected, which also bounds evaluation depth.
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let len = source.chars().count();
        if len > MAX_FORMULA_LEN {
            return Err(FormulaError::TooLong {
                len,
                max: MAX_FORMULA_LEN,
            });
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        if let Some(extra) = parser.next() {
            return Err(FormulaError::UnexpectedToken {
                found: extra.to_string(),
                expected: "end of formula",
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Evaluate against response bytes (`A` = `bytes[0]`)
    pub fn evaluate(&self, bytes: &[u8]) -> Result<f64, FormulaError> {
        let value = evaluate(&self.expr, bytes)?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(FormulaError::NonFinite)
        }
    }

    /// Number of bytes the formula needs (highest referenced variable + 1)
    pub fn bytes_required(&self) -> usize {
        highest_byte(&self.expr).map_or(0, |i| i + 1)
    }

    /// Original formula text
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
