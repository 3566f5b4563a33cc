//! Arithmetic expression parser for the built-in `calculator` tool.
//!
//! Grammar (whitespace ignored):
//!
//! ```text
//! expr    = term { ("+" | "-") term }
//! term    = unary { ("*" | "/") unary }
//! unary   = "-" unary | power
//! power   = primary [ "^" unary ]
//! primary = number | "(" expr ")"
//! ```
//!
//! `^` is right-associative and binds tighter than unary minus, so
//! `-2^2 == -4` and `2^3^2 == 512`. Input is parsed into an `Expr` tree and
//! evaluated directly; nothing else is ever executed.

use serde_json::Value;

use super::errors::CalcError;

/// Nesting limit for parentheses and unary minus chains.
const MAX_DEPTH: usize = 64;

/// Token limit. Operator chains build a tree as deep as they are long, and
/// both `eval` and drop recurse over it.
const MAX_TOKENS: usize = 512;

// ─── Syntax tree ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn eval(&self) -> Result<f64, CalcError> {
        let value = match self {
            Expr::Number(n) => *n,
            Expr::Neg(inner) => -inner.eval()?,
            Expr::Binary { op, lhs, rhs } => {
                let (a, b) = (lhs.eval()?, rhs.eval()?);
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div if b == 0.0 => return Err(CalcError::DivisionByZero),
                    BinOp::Div => a / b,
                    BinOp::Pow => a.powf(b),
                }
            }
        };
        if value.is_finite() {
            Ok(value)
        } else {
            Err(CalcError::NotFinite)
        }
    }
}

// ─── Tokenizer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, CalcError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        if tokens.len() >= MAX_TOKENS && !ch.is_whitespace() {
            return Err(CalcError::TooLong { max: MAX_TOKENS });
        }
        let token = match ch {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '0'..='9' | '.' => {
                let mut text = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = text
                    .parse::<f64>()
                    .map_err(|_| CalcError::InvalidNumber { text })?;
                tokens.push((Token::Number(value), pos));
                continue;
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '^' => Token::Caret,
            '(' => Token::LParen,
            ')' => Token::RParen,
            other => return Err(CalcError::UnexpectedChar { ch: other, pos }),
        };
        tokens.push((token, pos));
        chars.next();
    }

    Ok(tokens)
}

// ─── Parser ──────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).map(|(t, _)| *t)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn additive_op(&self) -> Option<BinOp> {
        match self.peek() {
            Some(Token::Plus) => Some(BinOp::Add),
            Some(Token::Minus) => Some(BinOp::Sub),
            _ => None,
        }
    }

    fn multiplicative_op(&self) -> Option<BinOp> {
        match self.peek() {
            Some(Token::Star) => Some(BinOp::Mul),
            Some(Token::Slash) => Some(BinOp::Div),
            _ => None,
        }
    }

    fn descend(&mut self) -> Result<(), CalcError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CalcError::TooDeep { max: MAX_DEPTH });
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, CalcError> {
        self.descend()?;
        let mut lhs = self.term()?;
        while let Some(op) = self.additive_op() {
            self.bump();
            lhs = Expr::binary(op, lhs, self.term()?);
        }
        self.depth -= 1;
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, CalcError> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.multiplicative_op() {
            self.bump();
            lhs = Expr::binary(op, lhs, self.unary()?);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, CalcError> {
        if self.peek() == Some(Token::Minus) {
            self.bump();
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, CalcError> {
        let base = self.primary()?;
        if self.peek() == Some(Token::Caret) {
            self.bump();
            self.descend()?;
            let exponent = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, CalcError> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    Some(_) => Err(CalcError::TrailingInput {
                        pos: self.tokens[self.pos - 1].1,
                    }),
                    None => Err(CalcError::UnexpectedEnd),
                }
            }
            Some(_) => Err(CalcError::UnexpectedChar {
                ch: self.char_at(self.pos - 1),
                pos: self.tokens[self.pos - 1].1,
            }),
            None => Err(CalcError::UnexpectedEnd),
        }
    }

    fn char_at(&self, index: usize) -> char {
        match self.tokens.get(index).map(|(t, _)| *t) {
            Some(Token::Plus) => '+',
            Some(Token::Minus) => '-',
            Some(Token::Star) => '*',
            Some(Token::Slash) => '/',
            Some(Token::Caret) => '^',
            Some(Token::LParen) => '(',
            Some(Token::RParen) => ')',
            _ => '?',
        }
    }
}

/// Parse an expression into a syntax tree.
pub fn parse(input: &str) -> Result<Expr, CalcError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(CalcError::Empty);
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;

    if let Some((_, pos)) = parser.tokens.get(parser.pos) {
        return Err(CalcError::TrailingInput { pos: *pos });
    }
    Ok(expr)
}

/// Parse and evaluate in one step.
pub fn evaluate(input: &str) -> Result<f64, CalcError> {
    parse(input)?.eval()
}

/// JSON form of a result: whole numbers become integers (`4`, not `4.0`).
pub fn number_to_json(value: f64) -> Value {
    const MAX_SAFE_INT: f64 = 9_007_199_254_740_992.0;
    if value.fract() == 0.0 && value.abs() < MAX_SAFE_INT {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
