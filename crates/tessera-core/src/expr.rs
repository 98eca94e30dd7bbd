//! Sandboxed condition language.
//!
//! Expressions are parsed once into an AST and evaluated against a variable
//! map. The grammar only covers literals, variable paths, arithmetic,
//! comparisons, `contains`, and boolean combinators; there is no call syntax
//! and nothing can reach outside the supplied variables.
//!
//! ```text
//! expr     := or
//! or       := and (("||" | "or") and)*
//! and      := equality (("&&" | "and") equality)*
//! equality := compare (("==" | "!=") compare)*
//! compare  := additive (("<" | "<=" | ">" | ">=" | "contains") additive)*
//! additive := term (("+" | "-") term)*
//! term     := unary (("*" | "/" | "%") unary)*
//! unary    := ("!" | "not" | "-") unary | primary
//! primary  := number | string | true | false | null | path | "(" expr ")"
//! ```

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Result, TesseraError};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted path, e.g. `lead.address.city` or `items.0`.
    Var(Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// A parsed expression together with its source text.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(TesseraError::Expression(format!(
                "unexpected token {:?} in `{}`",
                tok, source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn evaluate(&self, vars: &HashMap<String, Value>) -> Result<Value> {
        eval(&self.ast, vars)
    }

    pub fn is_true(&self, vars: &HashMap<String, Value>) -> Result<bool> {
        Ok(truthy(&self.evaluate(vars)?))
    }
}

/// Parse and evaluate a condition in one go.
pub fn evaluate_condition(source: &str, vars: &HashMap<String, Value>) -> Result<bool> {
    Expression::parse(source)?.is_true(vars)
}

/// null, false, 0, "", [] and {} are false; everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Resolve a dotted path against the variable map. Missing segments yield null.
pub fn lookup(path: &[String], vars: &HashMap<String, Value>) -> Value {
    let Some((head, rest)) = path.split_first() else {
        return Value::Null;
    };
    let mut current = match vars.get(head) {
        Some(v) => v,
        None => return Value::Null,
    };
    for segment in rest {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Op(BinaryOp),
    Not,
    Minus,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Op(BinaryOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(BinaryOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(BinaryOp::Div));
                i += 1;
            }
            '%' => {
                tokens.push(Token::Op(BinaryOp::Rem));
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(BinaryOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(BinaryOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(BinaryOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(BinaryOp::Lt));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(BinaryOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(BinaryOp::Gt));
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::Op(BinaryOp::And));
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Op(BinaryOp::Or));
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(TesseraError::Expression(format!(
                                "unterminated string in `{}`",
                                src
                            )))
                        }
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                s.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    TesseraError::Expression(format!("invalid number `{}` in `{}`", text, src))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::Op(BinaryOp::And),
                    "or" => Token::Op(BinaryOp::Or),
                    "not" => Token::Not,
                    "contains" => Token::Op(BinaryOp::Contains),
                    _ => {
                        if word.ends_with('.') || word.contains("..") {
                            return Err(TesseraError::Expression(format!(
                                "invalid variable path `{}`",
                                word
                            )));
                        }
                        Token::Ident(word)
                    }
                });
            }
            other => {
                return Err(TesseraError::Expression(format!(
                    "unexpected character `{}` in `{}`",
                    other, src
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn peek_op(&self, ops: &[BinaryOp]) -> Option<BinaryOp> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => Some(*op),
            Some(Token::Minus) if ops.contains(&BinaryOp::Sub) => Some(BinaryOp::Sub),
            _ => None,
        }
    }

    fn binary_level(
        &mut self,
        ops: &[BinaryOp],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut left = next(self)?;
        while let Some(op) = self.peek_op(ops) {
            self.pos += 1;
            let right = next(self)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        self.binary_level(&[BinaryOp::Or], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        self.binary_level(&[BinaryOp::And], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        self.binary_level(&[BinaryOp::Eq, BinaryOp::Ne], Self::parse_compare)
    }

    fn parse_compare(&mut self) -> Result<Expr> {
        self.binary_level(
            &[
                BinaryOp::Lt,
                BinaryOp::Le,
                BinaryOp::Gt,
                BinaryOp::Ge,
                BinaryOp::Contains,
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        self.binary_level(&[BinaryOp::Add, BinaryOp::Sub], Self::parse_term)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        self.binary_level(
            &[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Rem],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Var(
                name.split('.').map(|s| s.to_string()).collect(),
            )),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(TesseraError::Expression("missing closing `)`".into())),
                }
            }
            Some(tok) => Err(TesseraError::Expression(format!(
                "unexpected token {:?}",
                tok
            ))),
            None => Err(TesseraError::Expression("unexpected end of expression".into())),
        }
    }
}

/// Integral values become JSON integers so `1 + 1 == 2` round-trips cleanly.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn as_number(value: &Value, op: BinaryOp) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        TesseraError::Expression(format!("operator {:?} expects numbers, got {}", op, value))
    })
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn eval(expr: &Expr, vars: &HashMap<String, Value>) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(path) => Ok(lookup(path, vars)),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!truthy(&eval(inner, vars)?))),
        Expr::Unary(UnaryOp::Neg, inner) => {
            let v = eval(inner, vars)?;
            Ok(number(-as_number(&v, BinaryOp::Sub)?))
        }
        Expr::Binary(BinaryOp::And, l, r) => {
            if !truthy(&eval(l, vars)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(r, vars)?)))
        }
        Expr::Binary(BinaryOp::Or, l, r) => {
            if truthy(&eval(l, vars)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(r, vars)?)))
        }
        Expr::Binary(op, l, r) => {
            let left = eval(l, vars)?;
            let right = eval(r, vars)?;
            apply(*op, &left, &right)
        }
    }
}

fn apply(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    use std::cmp::Ordering;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(loosely_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!loosely_equal(left, right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(left, right) == Some(Ordering::Less))),
        BinaryOp::Le => Ok(Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinaryOp::Gt => Ok(Value::Bool(compare(left, right) == Some(Ordering::Greater))),
        BinaryOp::Ge => Ok(Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ))),
        BinaryOp::Contains => Ok(Value::Bool(match (left, right) {
            (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| loosely_equal(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        })),
        BinaryOp::Add => match (left, right) {
            (Value::String(a), b) => Ok(Value::String(format!("{}{}", a, display(b)))),
            (a, Value::String(b)) => Ok(Value::String(format!("{}{}", display(a), b))),
            _ => Ok(number(as_number(left, op)? + as_number(right, op)?)),
        },
        BinaryOp::Sub => Ok(number(as_number(left, op)? - as_number(right, op)?)),
        BinaryOp::Mul => Ok(number(as_number(left, op)? * as_number(right, op)?)),
        BinaryOp::Div | BinaryOp::Rem => {
            let divisor = as_number(right, op)?;
            if divisor == 0.0 {
                return Err(TesseraError::Expression("division by zero".into()));
            }
            let dividend = as_number(left, op)?;
            Ok(number(if op == BinaryOp::Div {
                dividend / divisor
            } else {
                dividend % divisor
            }))
        }
        BinaryOp::And => Ok(Value::Bool(truthy(left) && truthy(right))),
        BinaryOp::Or => Ok(Value::Bool(truthy(left) || truthy(right))),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
