//! Selector expressions used to pick the idempotent part of a payload.
//!
//! The grammar is a small subset of JMESPath:
//!
//! | Form | Example |
//! |------|---------|
//! | field access | `order_id`, `body.customer.id` |
//! | quoted field | `headers."Idempotency-Key"` |
//! | array index | `items[0]`, `items[-1]` |
//! | multi-select list | `[user, order_id]` |
//! | multi-select hash | `{user: user.id, order: order_id}` |
//! | JSON string decode | `powertools_json(body).order_id` |
//! | current node | `@` |
//!
//! Missing fields, out-of-range indexes and type mismatches evaluate to
//! `null` rather than failing. An empty expression selects the whole payload.
//!
//! # Example
//!
//! ```rust
//! use lambda_idempotency::expression::Expression;
//! use serde_json::json;
//!
//! let expr = Expression::parse("[user.id, items[-1]]").unwrap();
//! let payload = json!({"user": {"id": 7}, "items": ["a", "b"]});
//! assert_eq!(expr.search(&payload), json!([7, "b"]));
//! ```

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

/// Error returned when an expression cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid expression '{expression}' at position {position}: {message}")]
pub struct ExpressionError {
    /// The expression source
    pub expression: String,
    /// Byte offset where parsing failed
    pub position: usize,
    /// What was expected
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Current,
    Field(String),
    Index(i64),
    Chain(Box<Node>, Box<Node>),
    MultiList(Vec<Node>),
    MultiHash(Vec<(String, Node)>),
    JsonDecode(Box<Node>),
}

/// A parsed selector expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Parses an expression.
    ///
    /// # Arguments
    ///
    /// * `source` - The expression text; empty or whitespace selects the whole payload
    ///
    /// # Returns
    ///
    /// The parsed expression, or an [`ExpressionError`] describing the first problem found.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let mut parser = Parser::new(source);
        parser.skip_ws();
        let root = if parser.at_end() {
            Node::Current
        } else {
            let node = parser.expression()?;
            parser.skip_ws();
            if !parser.at_end() {
                return Err(parser.error("unexpected trailing input"));
            }
            node
        };
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Returns the expression selecting the whole payload.
    pub fn identity() -> Self {
        Self {
            source: String::new(),
            root: Node::Current,
        }
    }

    /// Returns true if this expression selects the whole payload.
    pub fn is_identity(&self) -> bool {
        self.root == Node::Current
    }

    /// Returns the source text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression against a payload.
    pub fn search(&self, payload: &Value) -> Value {
        evaluate(&self.root, payload)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn evaluate(node: &Node, value: &Value) -> Value {
    match node {
        Node::Current => value.clone(),
        Node::Field(name) => value.get(name.as_str()).cloned().unwrap_or(Value::Null),
        Node::Index(index) => match value {
            Value::Array(items) => {
                let len = items.len() as i64;
                let resolved = if *index < 0 { len + index } else { *index };
                if (0..len).contains(&resolved) {
                    items[resolved as usize].clone()
                } else {
                    Value::Null
                }
            }
            _ => Value::Null,
        },
        Node::Chain(left, right) => {
            let intermediate = evaluate(left, value);
            if intermediate.is_null() {
                Value::Null
            } else {
                evaluate(right, &intermediate)
            }
        }
        Node::MultiList(items) => {
            if value.is_null() {
                return Value::Null;
            }
            Value::Array(items.iter().map(|item| evaluate(item, value)).collect())
        }
        Node::MultiHash(entries) => {
            if value.is_null() {
                return Value::Null;
            }
            let map: Map<String, Value> = entries
                .iter()
                .map(|(name, item)| (name.clone(), evaluate(item, value)))
                .collect();
            Value::Object(map)
        }
        Node::JsonDecode(inner) => match evaluate(inner, value) {
            Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::Null),
            _ => Value::Null,
        },
    }
}

struct Parser<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError {
            expression: self.source.to_string(),
            position: self.pos,
            message: message.into(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), ExpressionError> {
        self.skip_ws();
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", byte as char)))
        }
    }

    fn expression(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.primary()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'.') => {
                    self.pos += 1;
                    let rhs = self.after_dot()?;
                    node = Node::Chain(Box::new(node), Box::new(rhs));
                }
                Some(b'[') => {
                    let index = self.index()?;
                    node = Node::Chain(Box::new(node), Box::new(index));
                }
                _ => return Ok(node),
            }
        }
    }

    fn primary(&mut self) -> Result<Node, ExpressionError> {
        self.skip_ws();
        match self.peek() {
            Some(b'[') => {
                if self.looks_like_index() {
                    self.index()
                } else {
                    self.multi_list()
                }
            }
            Some(b'{') => self.multi_hash(),
            Some(b'"') => Ok(Node::Field(self.quoted()?)),
            Some(b'@') => {
                self.pos += 1;
                Ok(Node::Current)
            }
            Some(c) if is_ident_start(c) => {
                let name = self.identifier();
                self.skip_ws();
                if self.peek() == Some(b'(') {
                    self.function(name)
                } else {
                    Ok(Node::Field(name))
                }
            }
            Some(_) => Err(self.error("expected an identifier, '[', '{' or '@'")),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn after_dot(&mut self) -> Result<Node, ExpressionError> {
        self.skip_ws();
        match self.peek() {
            Some(b'"') => Ok(Node::Field(self.quoted()?)),
            Some(b'[') => self.multi_list(),
            Some(b'{') => self.multi_hash(),
            Some(c) if is_ident_start(c) => Ok(Node::Field(self.identifier())),
            _ => Err(self.error("expected a field name after '.'")),
        }
    }

    fn function(&mut self, name: String) -> Result<Node, ExpressionError> {
        if name != "powertools_json" {
            return Err(self.error(format!("unknown function '{name}'")));
        }
        self.expect(b'(')?;
        let argument = self.expression()?;
        self.expect(b')')?;
        Ok(Node::JsonDecode(Box::new(argument)))
    }

    fn looks_like_index(&self) -> bool {
        let rest = &self.bytes[self.pos + 1..];
        let mut i = 0;
        while matches!(rest.get(i), Some(b' ')) {
            i += 1;
        }
        if rest.get(i) == Some(&b'-') {
            i += 1;
        }
        let digits_start = i;
        while matches!(rest.get(i), Some(b'0'..=b'9')) {
            i += 1;
        }
        if i == digits_start {
            return false;
        }
        while matches!(rest.get(i), Some(b' ')) {
            i += 1;
        }
        rest.get(i) == Some(&b']')
    }

    fn index(&mut self) -> Result<Node, ExpressionError> {
        self.expect(b'[')?;
        self.skip_ws();
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let index = self.source[start..self.pos]
            .parse::<i64>()
            .map_err(|_| self.error("expected an integer index"))?;
        self.expect(b']')?;
        Ok(Node::Index(index))
    }

    fn multi_list(&mut self) -> Result<Node, ExpressionError> {
        self.expect(b'[')?;
        let mut items = vec![self.expression()?];
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    items.push(self.expression()?);
                }
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Node::MultiList(items));
                }
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn multi_hash(&mut self) -> Result<Node, ExpressionError> {
        self.expect(b'{')?;
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            let name = match self.peek() {
                Some(b'"') => self.quoted()?,
                Some(c) if is_ident_start(c) => self.identifier(),
                _ => return Err(self.error("expected a key name")),
            };
            self.expect(b':')?;
            entries.push((name, self.expression()?));
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Node::MultiHash(entries));
                }
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn identifier(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_continue(c)) {
            self.pos += 1;
        }
        self.source[start..self.pos].to_string()
    }

    fn quoted(&mut self) -> Result<String, ExpressionError> {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.peek() {
                Some(b'\\') => self.pos += 2,
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
                None => return Err(self.error("unterminated quoted identifier")),
            }
        }
        let literal = self.source.get(start..self.pos).unwrap_or_default();
        serde_json::from_str::<String>(literal)
            .map_err(|e| self.error(format!("invalid quoted identifier: {e}")))
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}
