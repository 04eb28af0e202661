//! Rule conditions: a small expression language compiled once into an AST.
//!
//! Expressions compare named payload fields against literals and combine the
//! results with boolean operators:
//!
//! ```text
//! relevance >= 0.8 AND categories intersects [breaking, major]
//! NOT (source in ["rumor-mill"]) OR abs_change_pct > 5
//! ```
//!
//! Field names may use dots to reach into nested objects (`quote.change_pct`).
//! Keywords are case-insensitive; `&&`, `||` and `!` are accepted as aliases.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing or evaluating a condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("parse error at offset {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("type mismatch on field '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
}

impl Comparison {
    fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Comparison::Ge => ordering != Less,
            Comparison::Le => ordering != Greater,
            Comparison::Eq => ordering == Equal,
            Comparison::Ne => ordering != Equal,
            Comparison::Gt => ordering == Greater,
            Comparison::Lt => ordering == Less,
        }
    }

    fn is_equality(self) -> bool {
        matches!(self, Comparison::Eq | Comparison::Ne)
    }
}

/// A literal operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Literal {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match (self, value) {
            (Literal::Text(s), serde_json::Value::String(v)) => s == v,
            (Literal::Number(n), serde_json::Value::Number(v)) => {
                v.as_f64().is_some_and(|v| (v - n).abs() < f64::EPSILON)
            }
            (Literal::Bool(b), serde_json::Value::Bool(v)) => b == v,
            _ => false,
        }
    }
}

/// Compiled condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Compare {
        field: String,
        cmp: Comparison,
        value: Literal,
    },
    /// Scalar field is one of `values`, or array field shares an element with them.
    Member { field: String, values: Vec<Literal> },
    And { all: Vec<Condition> },
    Or { any: Vec<Condition> },
    Not { inner: Box<Condition> },
}

impl Condition {
    /// Parse a textual expression into a condition tree.
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: input.len(),
        };
        let condition = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(ConditionError::Parse {
                position: token.position,
                message: "unexpected trailing input".to_string(),
            });
        }
        Ok(condition)
    }

    /// Evaluate against an event payload.
    ///
    /// Every branch is evaluated so that a reference to a missing field is
    /// reported regardless of the values of sibling clauses.
    pub fn evaluate(&self, payload: &serde_json::Value) -> Result<bool, ConditionError> {
        match self {
            Condition::Compare { field, cmp, value } => {
                compare(field, *cmp, value, lookup(payload, field)?)
            }
            Condition::Member { field, values } => member(field, values, lookup(payload, field)?),
            Condition::And { all } => {
                let mut result = true;
                for child in all {
                    result &= child.evaluate(payload)?;
                }
                Ok(result)
            }
            Condition::Or { any } => {
                let mut result = false;
                for child in any {
                    result |= child.evaluate(payload)?;
                }
                Ok(result)
            }
            Condition::Not { inner } => Ok(!inner.evaluate(payload)?),
        }
    }
}

impl std::str::FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::parse(s)
    }
}

fn lookup<'a>(
    payload: &'a serde_json::Value,
    field: &str,
) -> Result<&'a serde_json::Value, ConditionError> {
    let mut current = payload;
    for segment in field.split('.') {
        current = current
            .get(segment)
            .ok_or_else(|| ConditionError::UnknownField(field.to_string()))?;
    }
    if current.is_null() {
        return Err(ConditionError::UnknownField(field.to_string()));
    }
    Ok(current)
}

fn type_name(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
    .to_string()
}

fn compare(
    field: &str,
    cmp: Comparison,
    literal: &Literal,
    actual: &serde_json::Value,
) -> Result<bool, ConditionError> {
    let mismatch = |expected: &'static str| ConditionError::TypeMismatch {
        field: field.to_string(),
        expected,
        found: type_name(actual),
    };

    match literal {
        Literal::Number(expected) => {
            // Numeric strings are accepted (large values are often serialized as text)
            let value = match actual {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .ok_or_else(|| mismatch("number"))?;
            let ordering = if (value - expected).abs() < f64::EPSILON {
                std::cmp::Ordering::Equal
            } else {
                value
                    .partial_cmp(expected)
                    .ok_or_else(|| mismatch("number"))?
            };
            Ok(cmp.holds(ordering))
        }
        Literal::Text(expected) => {
            let value = actual.as_str().ok_or_else(|| mismatch("string"))?;
            Ok(cmp.holds(value.cmp(expected.as_str())))
        }
        Literal::Bool(expected) => {
            let value = actual.as_bool().ok_or_else(|| mismatch("bool"))?;
            if !cmp.is_equality() {
                return Err(mismatch("number"));
            }
            Ok(cmp.holds(value.cmp(expected)))
        }
    }
}

fn member(
    field: &str,
    values: &[Literal],
    actual: &serde_json::Value,
) -> Result<bool, ConditionError> {
    match actual {
        serde_json::Value::Array(items) => Ok(items
            .iter()
            .any(|item| values.iter().any(|literal| literal.matches(item)))),
        serde_json::Value::String(_) | serde_json::Value::Number(_) | serde_json::Value::Bool(_) => {
            Ok(values.iter().any(|literal| literal.matches(actual)))
        }
        other => Err(ConditionError::TypeMismatch {
            field: field.to_string(),
            expected: "scalar or array",
            found: type_name(other),
        }),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),
    Cmp(Comparison),
    And,
    Or,
    Not,
    In,
    True,
    False,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let parse_error = |position: usize, message: String| ConditionError::Parse { position, message };

    while i < chars.len() {
        let (position, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        let (kind, consumed) = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => (TokenKind::LParen, 1),
            ')' => (TokenKind::RParen, 1),
            '[' => (TokenKind::LBracket, 1),
            ']' => (TokenKind::RBracket, 1),
            ',' => (TokenKind::Comma, 1),
            '>' if next == Some('=') => (TokenKind::Cmp(Comparison::Ge), 2),
            '<' if next == Some('=') => (TokenKind::Cmp(Comparison::Le), 2),
            '=' if next == Some('=') => (TokenKind::Cmp(Comparison::Eq), 2),
            '!' if next == Some('=') => (TokenKind::Cmp(Comparison::Ne), 2),
            '>' => (TokenKind::Cmp(Comparison::Gt), 1),
            '<' => (TokenKind::Cmp(Comparison::Lt), 1),
            '!' => (TokenKind::Not, 1),
            '&' if next == Some('&') => (TokenKind::And, 2),
            '|' if next == Some('|') => (TokenKind::Or, 2),
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        Some((_, ch)) if *ch == quote => break,
                        Some((_, ch)) => text.push(*ch),
                        None => {
                            return Err(parse_error(position, "unterminated string".to_string()));
                        }
                    }
                    j += 1;
                }
                (TokenKind::Str(text), j - i + 1)
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.is_some_and(|n| n.is_ascii_digit() || n == '.')) =>
            {
                let mut j = i + 1;
                while let Some((_, ch)) = chars.get(j) {
                    if ch.is_ascii_digit() || *ch == '.' || *ch == 'e' || *ch == 'E' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                if chars.get(j).is_some_and(|(_, ch)| *ch == ':') {
                    // Clock times such as 15:30 are bare strings
                    while let Some((_, ch)) = chars.get(j) {
                        if ch.is_ascii_digit() || *ch == ':' {
                            j += 1;
                        } else {
                            break;
                        }
                    }
                    let end = chars.get(j).map(|(p, _)| *p).unwrap_or(input.len());
                    tokens.push(Token {
                        kind: TokenKind::Str(input[position..end].to_string()),
                        position,
                    });
                    i = j;
                    continue;
                }
                let end = chars.get(j).map(|(p, _)| *p).unwrap_or(input.len());
                let raw = &input[position..end];
                let number = raw
                    .parse::<f64>()
                    .map_err(|_| parse_error(position, format!("invalid number '{}'", raw)))?;
                (TokenKind::Number(number), j - i)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while let Some((_, ch)) = chars.get(j) {
                    if ch.is_alphanumeric() || matches!(ch, '_' | '.' | '-' | ':') {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let end = chars.get(j).map(|(p, _)| *p).unwrap_or(input.len());
                let word = &input[position..end];
                let kind = match word.to_ascii_lowercase().as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "in" | "intersects" => TokenKind::In,
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    _ => TokenKind::Ident(word.to_string()),
                };
                (kind, j - i)
            }
            other => {
                return Err(parse_error(position, format!("unexpected character '{}'", other)));
            }
        };

        tokens.push(Token { kind, position });
        i += consumed;
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn error_here(&self, message: impl Into<String>) -> ConditionError {
        ConditionError::Parse {
            position: self.peek().map(|t| t.position).unwrap_or(self.end),
            message: message.into(),
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|t| &t.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Condition, ConditionError> {
        let mut any = vec![self.parse_and()?];
        while self.eat(&TokenKind::Or) {
            any.push(self.parse_and()?);
        }
        Ok(if any.len() == 1 {
            any.remove(0)
        } else {
            Condition::Or { any }
        })
    }

    fn parse_and(&mut self) -> Result<Condition, ConditionError> {
        let mut all = vec![self.parse_unary()?];
        while self.eat(&TokenKind::And) {
            all.push(self.parse_unary()?);
        }
        Ok(if all.len() == 1 {
            all.remove(0)
        } else {
            Condition::And { all }
        })
    }

    fn parse_unary(&mut self) -> Result<Condition, ConditionError> {
        if self.eat(&TokenKind::Not) {
            let inner = self.parse_unary()?;
            return Ok(Condition::Not {
                inner: Box::new(inner),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, ConditionError> {
        if self.eat(&TokenKind::LParen) {
            let inner = self.parse_or()?;
            if !self.eat(&TokenKind::RParen) {
                return Err(self.error_here("expected ')'"));
            }
            return Ok(inner);
        }

        let field = match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Ident(name)) => name,
            _ => return Err(self.error_here("expected field name")),
        };
        self.pos += 1;

        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Cmp(cmp)) => {
                self.pos += 1;
                let value = self.parse_literal()?;
                Ok(Condition::Compare { field, cmp, value })
            }
            Some(TokenKind::In) => {
                self.pos += 1;
                let values = self.parse_list()?;
                Ok(Condition::Member { field, values })
            }
            _ => Err(self.error_here(format!(
                "expected comparison or 'in' after field '{}'",
                field
            ))),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, ConditionError> {
        let literal = match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Number(n)) => Literal::Number(n),
            Some(TokenKind::Str(s)) | Some(TokenKind::Ident(s)) => Literal::Text(s),
            Some(TokenKind::True) => Literal::Bool(true),
            Some(TokenKind::False) => Literal::Bool(false),
            _ => return Err(self.error_here("expected literal value")),
        };
        self.pos += 1;
        Ok(literal)
    }

    fn parse_list(&mut self) -> Result<Vec<Literal>, ConditionError> {
        if !self.eat(&TokenKind::LBracket) {
            return Err(self.error_here("expected '['"));
        }
        let mut values = Vec::new();
        if self.eat(&TokenKind::RBracket) {
            return Ok(values);
        }
        loop {
            values.push(self.parse_literal()?);
            if self.eat(&TokenKind::Comma) {
                continue;
            }
            if self.eat(&TokenKind::RBracket) {
                return Ok(values);
            }
            return Err(self.error_here("expected ',' or ']'"));
        }
    }
}
