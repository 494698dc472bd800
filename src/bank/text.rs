//! The on-disk text asset format: a typed S-expression-like tree.
//!
//! ```text
//! ThingType thing_tag {
//!     attribute_name: value
//!     ChildType child_tag { … }
//! }
//! ```
//!
//! No parser-combinator crate is pulled in for this - the grammar is a
//! handful of token kinds and one level of recursion, and nothing in
//! this crate's corpus reaches for `nom`/`pest` for something this
//! small, so a direct recursive-descent reader/writer over
//! [`AttributeType`]-driven value parsing matches the rest of the
//! crate's hand-rolled binary readers (e.g. [`crate::vif::parse`]).

use crate::bank::node::{NodeId, Tree};
use crate::bank::schema::Schema;
use crate::bank::value::{AttributeType, Value};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f32),
    Str(String),
    AssetLink(String),
    Color([u8; 4]),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Colon,
    Comma,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer { chars: src.chars().peekable() }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() => {
                    self.chars.next();
                }
                Some('/') => {
                    let mut clone = self.chars.clone();
                    clone.next();
                    if clone.peek() == Some(&'/') {
                        self.chars.next();
                        self.chars.next();
                        for c in self.chars.by_ref() {
                            if c == '\n' {
                                break;
                            }
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn read_string(&mut self) -> Result<String> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some('"') => return Ok(out),
                Some('\\') => match self.chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some(c) => out.push(c),
                    None => return Err(Error::Parse("unterminated string escape")),
                },
                Some(c) => out.push(c),
                None => return Err(Error::Parse("unterminated string literal")),
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        self.skip_trivia();
        let Some(&c) = self.chars.peek() else {
            return Ok(None);
        };
        let token = match c {
            '{' => { self.chars.next(); Token::LBrace }
            '}' => { self.chars.next(); Token::RBrace }
            '[' => { self.chars.next(); Token::LBracket }
            ']' => { self.chars.next(); Token::RBracket }
            '(' => { self.chars.next(); Token::LParen }
            ')' => { self.chars.next(); Token::RParen }
            ':' => { self.chars.next(); Token::Colon }
            ',' => { self.chars.next(); Token::Comma }
            '"' => {
                self.chars.next();
                Token::Str(self.read_string()?)
            }
            '@' => {
                self.chars.next();
                let mut path = String::from("@");
                while let Some(&c) = self.chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | ',' | ')' | ']') {
                        break;
                    }
                    path.push(c);
                    self.chars.next();
                }
                Token::AssetLink(path)
            }
            '#' => {
                self.chars.next();
                let mut hex = String::new();
                while let Some(&c) = self.chars.peek() {
                    if c.is_ascii_hexdigit() {
                        hex.push(c);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                if hex.len() != 8 {
                    return Err(Error::Parse("color literal must be 8 hex digits"));
                }
                let byte = |i: usize| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap_or(0);
                Token::Color([byte(0), byte(1), byte(2), byte(3)])
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut num = String::new();
                num.push(c);
                self.chars.next();
                let mut is_float = false;
                while let Some(&c) = self.chars.peek() {
                    if c.is_ascii_digit() {
                        num.push(c);
                        self.chars.next();
                    } else if c == '.' && !is_float {
                        is_float = true;
                        num.push(c);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                if is_float {
                    Token::Float(num.parse().map_err(|_| Error::Parse("bad float literal"))?)
                } else {
                    Token::Int(num.parse().map_err(|_| Error::Parse("bad int literal"))?)
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = self.chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                Token::Ident(ident)
            }
            _ => return Err(Error::Parse("unexpected character in asset text")),
        };
        Ok(Some(token))
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    schema: &'a Schema,
}

impl<'a> Parser<'a> {
    fn new(src: &str, schema: &'a Schema) -> Result<Self> {
        let mut lexer = Lexer::new(src);
        let mut tokens = Vec::new();
        while let Some(tok) = lexer.next_token()? {
            tokens.push(tok);
        }
        Ok(Parser { tokens, pos: 0, schema })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.advance() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(Error::FileFormatError(format!("expected identifier, got {other:?}"))),
        }
    }

    fn expect(&mut self, want: &Token) -> Result<()> {
        match self.advance() {
            Some(ref t) if t == want => Ok(()),
            other => Err(Error::FileFormatError(format!("expected {want:?}, got {other:?}"))),
        }
    }

    fn parse_value(&mut self, ty: &AttributeType) -> Result<Value> {
        match ty {
            AttributeType::Int => match self.advance() {
                Some(Token::Int(v)) => Ok(Value::Int(v)),
                other => Err(Error::FileFormatError(format!("expected int, got {other:?}"))),
            },
            AttributeType::Float => match self.advance() {
                Some(Token::Float(v)) => Ok(Value::Float(v)),
                Some(Token::Int(v)) => Ok(Value::Float(v as f32)),
                other => Err(Error::FileFormatError(format!("expected float, got {other:?}"))),
            },
            AttributeType::Bool => match self.advance() {
                Some(Token::Ident(s)) if s == "true" => Ok(Value::Bool(true)),
                Some(Token::Ident(s)) if s == "false" => Ok(Value::Bool(false)),
                other => Err(Error::FileFormatError(format!("expected bool, got {other:?}"))),
            },
            AttributeType::String => match self.advance() {
                Some(Token::Str(s)) => Ok(Value::String(s)),
                other => Err(Error::FileFormatError(format!("expected string, got {other:?}"))),
            },
            AttributeType::FileReference => match self.advance() {
                Some(Token::Str(s)) => Ok(Value::FileReference(s)),
                other => Err(Error::FileFormatError(format!("expected file reference, got {other:?}"))),
            },
            AttributeType::AssetLink => match self.advance() {
                Some(Token::AssetLink(s)) => Ok(Value::AssetLink(s.trim_start_matches('@').to_string())),
                other => Err(Error::FileFormatError(format!("expected asset link, got {other:?}"))),
            },
            AttributeType::Vec3 => {
                self.expect(&Token::LParen)?;
                let x = self.parse_number()?;
                self.expect(&Token::Comma)?;
                let y = self.parse_number()?;
                self.expect(&Token::Comma)?;
                let z = self.parse_number()?;
                self.expect(&Token::RParen)?;
                Ok(Value::Vec3([x, y, z]))
            }
            AttributeType::Color => match self.advance() {
                Some(Token::Color(c)) => Ok(Value::Color(c)),
                other => Err(Error::FileFormatError(format!("expected color, got {other:?}"))),
            },
            AttributeType::Array(elem) => {
                self.expect(&Token::LBracket)?;
                let mut items = Vec::new();
                while self.peek() != Some(&Token::RBracket) {
                    items.push(self.parse_value(elem)?);
                    if self.peek() == Some(&Token::Comma) {
                        self.advance();
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Value::Array(items))
            }
        }
    }

    fn parse_number(&mut self) -> Result<f32> {
        match self.advance() {
            Some(Token::Float(v)) => Ok(v),
            Some(Token::Int(v)) => Ok(v as f32),
            other => Err(Error::FileFormatError(format!("expected number, got {other:?}"))),
        }
    }

    /// Parse one `Type tag { ... }` block into `tree`, under `parent`
    /// (or as the tree's existing root, for the outermost call).
    fn parse_block(&mut self, tree: &mut Tree, parent: Option<NodeId>) -> Result<NodeId> {
        let type_name = self.expect_ident()?;
        let tag = self.expect_ident()?;
        let id = match parent {
            Some(p) => tree.insert_child(p, type_name.clone(), tag)?,
            None => tree.root(),
        };
        self.expect(&Token::LBrace)?;
        loop {
            match self.peek() {
                Some(Token::RBrace) => {
                    self.advance();
                    break;
                }
                Some(Token::Ident(_)) => {
                    // Lookahead: `name :` is an attribute; `Type tag {`
                    // is a nested child block.
                    let save = self.pos;
                    let first = self.expect_ident()?;
                    if self.peek() == Some(&Token::Colon) {
                        self.advance();
                        let type_def = self.schema.type_by_name(&type_name)?;
                        let idx = type_def.attribute_index(&first).ok_or_else(|| {
                            Error::SchemaViolation(format!("{type_name} has no attribute {first}"))
                        })?;
                        let ty = type_def.attributes[idx].ty.clone();
                        let value = self.parse_value(&ty)?;
                        tree.set_attribute(id, idx, value)?;
                    } else {
                        self.pos = save;
                        self.parse_block(tree, Some(id))?;
                    }
                }
                other => return Err(Error::FileFormatError(format!("expected attribute or child block, got {other:?}"))),
            }
        }
        Ok(id)
    }
}

/// Parse a bank text file into a fresh [`Tree`] rooted at the file's
/// single top-level block.
pub fn parse_bank_text(schema: &Schema, source: &str) -> Result<Tree> {
    let mut parser = Parser::new(source, schema)?;
    let save = parser.pos;
    let type_name = parser.expect_ident()?;
    let _tag = parser.expect_ident()?;
    parser.pos = save;
    let mut tree = Tree::new(type_name);
    parser.parse_block(&mut tree, None)?;
    Ok(tree)
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
        Value::String(s) => format!("{s:?}"),
        Value::FileReference(s) => format!("{s:?}"),
        Value::AssetLink(s) => format!("@{s}"),
        Value::Vec3([x, y, z]) => format!("({x}, {y}, {z})"),
        Value::Color([r, g, b, a]) => format!("#{r:02x}{g:02x}{b:02x}{a:02x}"),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(format_value).collect();
            format!("[{}]", inner.join(", "))
        }
    }
}

/// Serialize `node` and its descendants back to bank text. The top-level
/// node is written without a surrounding tag/brace requirement from a
/// parent.
pub fn write_bank_text(schema: &Schema, tree: &Tree, node: NodeId, indent: usize) -> Result<String> {
    let pad = "    ".repeat(indent);
    let n = tree.node(node);
    let type_def = schema.type_by_name(&n.type_name)?;
    let mut out = format!("{pad}{} {} {{\n", n.type_name, n.tag);
    for (i, attr) in type_def.attributes.iter().enumerate() {
        if let Some(value) = n.attribute(i) {
            out.push_str(&format!("{pad}    {}: {}\n", attr.name, format_value(value)));
        }
    }
    for &child in n.children() {
        out.push_str(&write_bank_text(schema, tree, child, indent + 1)?);
    }
    out.push_str(&format!("{pad}}}\n"));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::schema::Schema;

    fn test_schema() -> Schema {
        let mut schema = Schema::new();
        schema
            .register("World", vec![("name", AttributeType::String)], vec!["Area"])
            .unwrap();
        schema
            .register(
                "Area",
                vec![
                    ("elevation", AttributeType::Float),
                    ("sky_ref", AttributeType::AssetLink),
                    ("tint", AttributeType::Color),
                ],
                vec![],
            )
            .unwrap();
        schema
    }

    #[test]
    fn round_trips_attributes_and_nested_children() {
        let schema = test_schema();
        let source = r#"
            World planet {
                name: "Kalebo III"
                Area area0 {
                    elevation: 12.5
                    sky_ref: @/skies/day
                    tint: #ff00ffaa
                }
            }
        "#;
        let tree = parse_bank_text(&schema, source).unwrap();
        let area = tree.resolve("/area0").unwrap();
        assert_eq!(tree.node(area).attribute(0), Some(&Value::Float(12.5)));
        assert_eq!(tree.node(area).attribute(1), Some(&Value::AssetLink("/skies/day".to_string())));
        assert_eq!(tree.node(area).attribute(2), Some(&Value::Color([0xff, 0x00, 0xff, 0xaa])));

        let text = write_bank_text(&schema, &tree, tree.root(), 0).unwrap();
        let reparsed = parse_bank_text(&schema, &text).unwrap();
        let area2 = reparsed.resolve("/area0").unwrap();
        assert_eq!(reparsed.node(area2).attribute(0), Some(&Value::Float(12.5)));
    }

    #[test]
    fn unknown_attribute_is_a_schema_violation() {
        let schema = test_schema();
        let source = r#"World planet { bogus: 1 }"#;
        assert!(matches!(parse_bank_text(&schema, source), Err(Error::SchemaViolation(_))));
    }
}
