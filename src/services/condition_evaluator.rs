//! Edge condition evaluation.
//!
//! Conditions are written in a safe CEL-like subset: comparisons, boolean
//! connectives, dot-path access into the `{result, input}` completion
//! context, and literals. Evaluation is pure and total on well-formed
//! expressions: an undefined path resolves to null, and a type-mismatched
//! comparison yields `false` rather than an error. Anything outside the
//! grammar is an [`EvalError`], which propagation treats as an inactive
//! edge, never as a task failure.

use serde_json::{Number, Value};
use thiserror::Error;

use crate::domain::models::{Condition, Evaluator};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("Unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("Unterminated string literal")]
    UnterminatedString,

    #[error("Invalid number literal '{0}'")]
    InvalidNumber(String),

    #[error("Unexpected token: {0}")]
    UnexpectedToken(String),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Trailing input after expression")]
    TrailingInput,

    #[error("Operand of '{0}' is not a boolean")]
    NonBooleanOperand(&'static str),

    #[error("Condition did not evaluate to a boolean")]
    NotABoolean,

    #[error("Unsupported condition evaluator")]
    UnsupportedEvaluator,
}

/// Evaluate an edge condition against a completion context.
///
/// The context is the JSON object `{"result": …, "input": …}` of the source
/// task. A missing condition is handled by the caller (absent == active).
pub fn evaluate(condition: &Condition, context: &Value) -> Result<bool, EvalError> {
    match condition.evaluator {
        Evaluator::Cel => {}
        Evaluator::Unknown => return Err(EvalError::UnsupportedEvaluator),
    }
    match eval_expression(&condition.expression, context)? {
        Value::Bool(b) => Ok(b),
        _ => Err(EvalError::NotABoolean),
    }
}

/// Parse and evaluate a bare expression, returning its JSON value. Used by
/// data-flow mappings, where non-boolean results are the point.
pub fn eval_expression(expression: &str, root: &Value) -> Result<Value, EvalError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_or()?;
    parser.expect_end()?;
    eval(&expr, root)
}

// --- Lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            ' ' | '\t' | '\n' | '\r' => pos += 1,
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                pos += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                pos += 1;
            }
            '=' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    pos += 2;
                } else {
                    return Err(EvalError::UnexpectedChar('=', pos));
                }
            }
            '!' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    pos += 2;
                } else {
                    return Err(EvalError::UnexpectedChar('!', pos));
                }
            }
            '<' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    pos += 2;
                } else {
                    tokens.push(Token::Lt);
                    pos += 1;
                }
            }
            '>' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    pos += 2;
                } else {
                    tokens.push(Token::Gt);
                    pos += 1;
                }
            }
            '\'' | '"' => {
                let (s, consumed) = lex_string(&chars[pos..], c)?;
                tokens.push(Token::Str(s));
                pos += consumed;
            }
            '-' => {
                let (token, consumed) = lex_number(&chars[pos..])?;
                tokens.push(token);
                pos += consumed;
            }
            c if c.is_ascii_digit() => {
                let (token, consumed) = lex_number(&chars[pos..])?;
                tokens.push(token);
                pos += consumed;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = pos;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let word: String = chars[pos..end].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
                pos = end;
            }
            other => return Err(EvalError::UnexpectedChar(other, pos)),
        }
    }

    Ok(tokens)
}

fn lex_string(chars: &[char], quote: char) -> Result<(String, usize), EvalError> {
    let mut out = String::new();
    let mut i = 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars.get(i + 1).ok_or(EvalError::UnterminatedString)?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(EvalError::UnterminatedString)
}

fn lex_number(chars: &[char]) -> Result<(Token, usize), EvalError> {
    let mut end = 0;
    if chars[0] == '-' {
        end = 1;
    }
    let mut is_float = false;
    while end < chars.len() {
        match chars[end] {
            c if c.is_ascii_digit() => end += 1,
            '.' if !is_float && chars.get(end + 1).is_some_and(|c| c.is_ascii_digit()) => {
                is_float = true;
                end += 1;
            }
            _ => break,
        }
    }
    let raw: String = chars[..end].iter().collect();
    if is_float {
        raw.parse::<f64>()
            .map(|f| (Token::Float(f), end))
            .map_err(|_| EvalError::InvalidNumber(raw))
    } else {
        raw.parse::<i64>()
            .map(|i| (Token::Int(i), end))
            .map_err(|_| EvalError::InvalidNumber(raw))
    }
}

// --- Parser ---

#[derive(Debug, Clone, PartialEq)]
enum PathSeg {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Path(Vec<PathSeg>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), EvalError> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(EvalError::UnexpectedToken(format!("{token:?}"))),
            None => Err(EvalError::UnexpectedEnd),
        }
    }

    fn expect_end(&self) -> Result<(), EvalError> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(EvalError::TrailingInput)
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            Ok(Expr::Not(Box::new(self.parse_not()?)))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.parse_term()?;
        let op = match self.peek() {
            Some(Token::EqEq) => CmpOp::Eq,
            Some(Token::NotEq) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_term()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_term(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Number(i.into()))),
            Some(Token::Float(f)) => Ok(Expr::Literal(
                Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => self.parse_list(),
            Some(Token::Ident(first)) => self.parse_path(first),
            Some(token) => Err(EvalError::UnexpectedToken(format!("{token:?}"))),
            None => Err(EvalError::UnexpectedEnd),
        }
    }

    fn parse_list(&mut self) -> Result<Expr, EvalError> {
        let mut items = Vec::new();
        if self.peek() == Some(&Token::RBracket) {
            self.next();
            return Ok(Expr::List(items));
        }
        loop {
            items.push(self.parse_or()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => return Ok(Expr::List(items)),
                Some(token) => return Err(EvalError::UnexpectedToken(format!("{token:?}"))),
                None => return Err(EvalError::UnexpectedEnd),
            }
        }
    }

    fn parse_path(&mut self, first: String) -> Result<Expr, EvalError> {
        let mut segments = vec![PathSeg::Key(first)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(key)) => segments.push(PathSeg::Key(key)),
                        Some(token) => {
                            return Err(EvalError::UnexpectedToken(format!("{token:?}")))
                        }
                        None => return Err(EvalError::UnexpectedEnd),
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    match self.next() {
                        Some(Token::Int(i)) if i >= 0 => segments.push(PathSeg::Index(i as usize)),
                        Some(token) => {
                            return Err(EvalError::UnexpectedToken(format!("{token:?}")))
                        }
                        None => return Err(EvalError::UnexpectedEnd),
                    }
                    self.expect(&Token::RBracket)?;
                }
                _ => return Ok(Expr::Path(segments)),
            }
        }
    }
}

// --- Evaluator ---

fn eval(expr: &Expr, root: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, root)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Path(segments) => Ok(resolve_path(segments, root)),
        Expr::Not(inner) => match eval(inner, root)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            _ => Err(EvalError::NonBooleanOperand("not")),
        },
        Expr::And(left, right) => match eval(left, root)? {
            Value::Bool(false) => Ok(Value::Bool(false)),
            Value::Bool(true) => match eval(right, root)? {
                Value::Bool(b) => Ok(Value::Bool(b)),
                _ => Err(EvalError::NonBooleanOperand("and")),
            },
            _ => Err(EvalError::NonBooleanOperand("and")),
        },
        Expr::Or(left, right) => match eval(left, root)? {
            Value::Bool(true) => Ok(Value::Bool(true)),
            Value::Bool(false) => match eval(right, root)? {
                Value::Bool(b) => Ok(Value::Bool(b)),
                _ => Err(EvalError::NonBooleanOperand("or")),
            },
            _ => Err(EvalError::NonBooleanOperand("or")),
        },
        Expr::Compare(op, left, right) => {
            let lhs = eval(left, root)?;
            let rhs = eval(right, root)?;
            Ok(Value::Bool(compare(*op, &lhs, &rhs)))
        }
    }
}

/// Undefined segments resolve to null rather than faulting.
fn resolve_path(segments: &[PathSeg], root: &Value) -> Value {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (PathSeg::Key(key), Value::Object(map)) => match map.get(key) {
                Some(value) => value,
                None => return Value::Null,
            },
            (PathSeg::Index(i), Value::Array(items)) => match items.get(*i) {
                Some(value) => value,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

/// Comparison policy: null operands compare false except `null == null`;
/// numbers promote; strings order lexicographically; bools, lists, and
/// objects support equality only. Mismatched types are `false`, never an
/// error.
fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> bool {
    if lhs.is_null() || rhs.is_null() {
        return op == CmpOp::Eq && lhs.is_null() && rhs.is_null();
    }

    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => apply_ord(op, x.cmp(&y)),
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => match x.partial_cmp(&y) {
                        Some(ordering) => apply_ord(op, ordering),
                        None => false, // NaN
                    },
                    _ => false,
                },
            }
        }
        (Value::String(a), Value::String(b)) => apply_ord(op, a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            _ => false,
        },
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => match op {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            _ => false,
        },
        _ => false,
    }
}

fn apply_ord(op: CmpOp, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CmpOp::Eq => ordering == Equal,
        CmpOp::Ne => ordering != Equal,
        CmpOp::Lt => ordering == Less,
        CmpOp::Le => ordering != Greater,
        CmpOp::Gt => ordering == Greater,
        CmpOp::Ge => ordering != Less,
    }
}
