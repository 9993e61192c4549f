//! Step execution conditions.
//!
//! A condition is a small boolean expression evaluated against the
//! accumulated workflow data before a step runs:
//!
//! ```text
//! ${review.approved} && score >= 0.8
//! !skip_tests || env == "prod"
//! tags contains "urgent"
//! ```
//!
//! Paths may be written bare (`review.approved`) or wrapped as `${...}`.
//! Missing keys evaluate to null.

use std::cmp::Ordering;
use std::fmt;

use crate::models::value::{lookup_path, Value, ValueMap};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid condition '{source_text}': {message}")]
pub struct ConditionError {
    pub source_text: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Cmp(CmpOp),
    Literal(Value),
    Path(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

/// A parsed execution condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let err = |message: String| ConditionError {
            source_text: source.to_string(),
            message,
        };

        let tokens = tokenize(source).map_err(err)?;
        if tokens.is_empty() {
            return Err(err("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or().map_err(err)?;
        if let Some(tok) = parser.peek() {
            return Err(err(format!("unexpected token {:?}", tok)));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against workflow data; the result is the truthiness of the expression.
    pub fn evaluate(&self, data: &ValueMap) -> bool {
        eval(&self.expr, data).truthy()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ─── Tokenizer ─────────────────────────────────────────────────────────────

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || c == '-'
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            _ if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let op = match (c, next == Some('=')) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('<', true) => CmpOp::Le,
                    _ => CmpOp::Lt,
                };
                tokens.push(Token::Cmp(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                let text: String = chars[i + 1..i + 1 + end].iter().collect();
                tokens.push(Token::Literal(Value::String(text)));
                i += end + 2;
            }
            '$' if next == Some('{') => {
                let end = chars[i + 2..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .ok_or_else(|| "unterminated '${'".to_string())?;
                let path: String = chars[i + 2..i + 2 + end].iter().collect();
                let path = path.trim();
                if path.is_empty() {
                    return Err("empty '${}' reference".to_string());
                }
                tokens.push(Token::Path(path.to_string()));
                i += end + 3;
            }
            _ if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = if let Ok(n) = text.parse::<i64>() {
                    Value::Int(n)
                } else {
                    let parsed = text
                        .parse::<f64>()
                        .map_err(|_| format!("invalid number '{}'", text))?;
                    Value::Float(parsed)
                };
                tokens.push(Token::Literal(value));
            }
            _ if is_path_char(c) => {
                let start = i;
                while i < chars.len() && is_path_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    "contains" => Token::Cmp(CmpOp::Contains),
                    _ => Token::Path(word),
                });
            }
            _ => return Err(format!("unexpected character '{}'", c)),
        }
    }
    Ok(tokens)
}

// ─── Parser ────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::Path(p)) => Ok(Expr::Path(p)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(tok) => Err(format!("unexpected token {:?}", tok)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

// ─── Evaluation ────────────────────────────────────────────────────────────

fn eval(expr: &Expr, data: &ValueMap) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(p) => lookup_path(data, p).cloned().unwrap_or(Value::Null),
        Expr::Not(inner) => Value::Bool(!eval(inner, data).truthy()),
        Expr::And(l, r) => Value::Bool(eval(l, data).truthy() && eval(r, data).truthy()),
        Expr::Or(l, r) => Value::Bool(eval(l, data).truthy() || eval(r, data).truthy()),
        Expr::Compare(op, l, r) => Value::Bool(compare(*op, &eval(l, data), &eval(r, data))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => loosely_equal(left, right),
        CmpOp::Ne => !loosely_equal(left, right),
        CmpOp::Contains => contains(left, right),
        CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => match ordering(left, right) {
            Some(ord) => match op {
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Ge => ord != Ordering::Less,
                CmpOp::Lt => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            },
            None => false,
        },
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => left.as_f64()?.partial_cmp(&right.as_f64()?),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::List(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Map(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    fn evaluate(source: &str, data: &ValueMap) -> Result<bool, ConditionError> {
        Ok(Condition::parse(source)?.evaluate(data))
    }

    fn data() -> ValueMap {
        value_map! {
            "score" => 0.92,
            "count" => 3,
            "env" => "prod",
            "review" => value_map! { "approved" => true, "comments" => 0 },
            "tags" => vec![Value::from("urgent"), Value::from("backend")],
        }
    }

    #[test]
    fn test_bare_paths_use_truthiness() {
        let d = data();
        assert!(evaluate("review.approved", &d).unwrap());
        assert!(!evaluate("review.comments", &d).unwrap());
        assert!(!evaluate("missing", &d).unwrap());
        assert!(evaluate("${review.approved}", &d).unwrap());
    }

    #[test]
    fn test_comparisons() {
        let d = data();
        assert!(evaluate("score >= 0.9", &d).unwrap());
        assert!(evaluate("count == 3.0", &d).unwrap());
        assert!(evaluate("env == 'prod'", &d).unwrap());
        assert!(evaluate("env != \"dev\"", &d).unwrap());
        assert!(!evaluate("count < -1", &d).unwrap());
        assert!(evaluate("missing == null", &d).unwrap());
        assert!(!evaluate("env > 3", &d).unwrap());
    }

    #[test]
    fn test_logic_and_grouping() {
        let d = data();
        assert!(evaluate("!missing && (count > 5 || tags contains 'urgent')", &d).unwrap());
        assert!(!evaluate("review.approved && env == 'dev'", &d).unwrap());
        assert!(evaluate("!(count > 5)", &d).unwrap());
        assert!(evaluate("env contains 'ro'", &d).unwrap());
        assert!(evaluate("review contains 'approved'", &d).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("a &&").is_err());
        assert!(Condition::parse("(a").is_err());
        assert!(Condition::parse("a == 'x").is_err());
        assert!(Condition::parse("a b").is_err());
        assert!(Condition::parse("a # b").is_err());
        let err = Condition::parse("${}").unwrap_err();
        assert_eq!(err.source_text, "${}");
    }
}
