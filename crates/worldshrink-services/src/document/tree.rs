//! Structural document tree
//!
//! A JSON value parsed into objects, arrays, strings and scalars, where every string
//! remembers the byte range of its literal in the source file. Input is validated with
//! `serde_json` before it reaches this parser, and string literals are decoded by
//! `serde_json`, so this module only tracks structure and positions.

use std::fmt;
use worldshrink_core::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Object(Vec<(String, Node)>),
    Array(Vec<Node>),
    String { value: String, span: Span },
    Scalar,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at byte {offset}")]
pub struct TreeError {
    pub offset: usize,
    pub message: String,
}

/// Parse one JSON value. `base` is added to every recorded span.
pub fn parse(bytes: &[u8], base: usize) -> Result<Node, TreeError> {
    serde_json::from_slice::<serde::de::IgnoredAny>(bytes).map_err(|e| TreeError {
        offset: base,
        message: e.to_string(),
    })?;

    let mut parser = Parser {
        bytes,
        pos: 0,
        base,
    };
    let node = parser.parse_value()?;
    parser.skip_ws();
    if parser.pos != bytes.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(node)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> TreeError {
        TreeError {
            offset: self.base + self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), TreeError> {
        self.skip_ws();
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn parse_value(&mut self) -> Result<Node, TreeError> {
        self.skip_ws();
        match self.peek() {
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => {
                let (value, span) = self.parse_string()?;
                Ok(Node::String { value, span })
            }
            Some(_) => self.parse_scalar(),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_object(&mut self) -> Result<Node, TreeError> {
        self.expect(b'{')?;
        let mut entries = Vec::new();

        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Node::Object(entries));
        }

        loop {
            self.skip_ws();
            let (key, _) = self.parse_string()?;
            self.expect(b':')?;
            let value = self.parse_value()?;
            entries.push((key, value));

            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Node::Object(entries));
                }
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn parse_array(&mut self) -> Result<Node, TreeError> {
        self.expect(b'[')?;
        let mut items = Vec::new();

        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Node::Array(items));
        }

        loop {
            items.push(self.parse_value()?);

            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Node::Array(items));
                }
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn parse_string(&mut self) -> Result<(String, Span), TreeError> {
        if self.peek() != Some(b'"') {
            return Err(self.error("expected string"));
        }
        let start = self.pos;
        let mut i = start + 1;
        loop {
            match self.bytes.get(i) {
                Some(b'\\') => i += 2,
                Some(b'"') => break,
                Some(_) => i += 1,
                None => return Err(self.error("unterminated string")),
            }
        }
        let end = i + 1;

        let literal = std::str::from_utf8(&self.bytes[start..end])
            .map_err(|_| self.error("invalid UTF-8 in string"))?;
        let value: String =
            serde_json::from_str(literal).map_err(|e| self.error(&e.to_string()))?;

        self.pos = end;
        Ok((value, Span::new(self.base + start, self.base + end)))
    }

    fn parse_scalar(&mut self) -> Result<Node, TreeError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r') {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected value"));
        }
        Ok(Node::Scalar)
    }
}

/// JSON pointer (RFC 6901) maintained while walking a tree.
#[derive(Debug, Clone, Default)]
pub struct Pointer {
    path: String,
    marks: Vec<usize>,
}

impl Pointer {
    pub fn push(&mut self, segment: &str) {
        self.marks.push(self.path.len());
        self.path.push('/');
        for c in segment.chars() {
            match c {
                '~' => self.path.push_str("~0"),
                '/' => self.path.push_str("~1"),
                c => self.path.push(c),
            }
        }
    }

    pub fn pop(&mut self) {
        if let Some(mark) = self.marks.pop() {
            self.path.truncate(mark);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str("/")
        } else {
            f.write_str(&self.path)
        }
    }
}

/// Visitor over node kinds. The default methods walk the whole tree.
pub trait Visitor {
    fn visit_object(&mut self, pointer: &mut Pointer, entries: &[(String, Node)]) {
        for (key, value) in entries {
            pointer.push(key);
            self.visit_node(pointer, value);
            pointer.pop();
        }
    }

    fn visit_array(&mut self, pointer: &mut Pointer, items: &[Node]) {
        for (index, item) in items.iter().enumerate() {
            pointer.push(&index.to_string());
            self.visit_node(pointer, item);
            pointer.pop();
        }
    }

    fn visit_string(&mut self, pointer: &Pointer, value: &str, span: Span);

    fn visit_scalar(&mut self, _pointer: &Pointer) {}

    fn visit_node(&mut self, pointer: &mut Pointer, node: &Node) {
        match node {
            Node::Object(entries) => self.visit_object(pointer, entries),
            Node::Array(items) => self.visit_array(pointer, items),
            Node::String { value, span } => self.visit_string(pointer, value, *span),
            Node::Scalar => self.visit_scalar(pointer),
        }
    }
}

impl Node {
    pub fn accept<V: Visitor + ?Sized>(&self, visitor: &mut V) {
        let mut pointer = Pointer::default();
        visitor.visit_node(&mut pointer, self);
    }
}
