// Expression lexer and parser
// Byte-level lexer feeding a Pratt parser with a current/peek token pair

use thiserror::Error;

use crate::ast::{BinaryOp, Expr, MacroKind, UnaryOp};
use crate::value::Value;

/// Lexical errors. Fatal for the expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated string literal at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedCharacter { ch: char, offset: usize },
}

/// Parser diagnostics, accumulated during the parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("parse errors: {}", .messages.join("; "))]
pub struct ParseError {
    pub messages: Vec<String>,
}

/// Token types
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Float(f64),
    String(String),
    True,
    False,
    Null,

    // Identifiers and keywords
    Identifier(String),
    In,
    Between,
    And,
    Or,
    Not,
    Like,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Bang,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Colon,
    Semicolon,
    Question,
    Dot,
    Pipe,

    // Special
    Eof,
}

impl Token {
    /// Short description for diagnostics.
    fn describe(&self) -> String {
        match self {
            Token::Int(n) => format!("number '{}'", n),
            Token::Float(n) => format!("number '{}'", n),
            Token::String(s) => format!("string '{}'", s),
            Token::Identifier(name) => format!("identifier '{}'", name),
            Token::Eof => "end of expression".to_string(),
            other => format!("'{}'", other.literal()),
        }
    }

    fn literal(&self) -> &'static str {
        match self {
            Token::True => "true",
            Token::False => "false",
            Token::Null => "null",
            Token::In => "in",
            Token::Between => "between",
            Token::And => "and",
            Token::Or => "or",
            Token::Not => "not",
            Token::Like => "like",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Caret => "^",
            Token::Equal => "==",
            Token::NotEqual => "!=",
            Token::LessThan => "<",
            Token::LessThanOrEqual => "<=",
            Token::GreaterThan => ">",
            Token::GreaterThanOrEqual => ">=",
            Token::Bang => "!",
            Token::LeftParen => "(",
            Token::RightParen => ")",
            Token::LeftBracket => "[",
            Token::RightBracket => "]",
            Token::LeftBrace => "{",
            Token::RightBrace => "}",
            Token::Comma => ",",
            Token::Colon => ":",
            Token::Semicolon => ";",
            Token::Question => "?",
            Token::Dot => ".",
            Token::Pipe => "|",
            _ => "",
        }
    }
}

// ── Lexer ────────────────────────────────────────────────────────────────────

/// Byte-level lexer producing offset-tagged tokens.
pub struct Lexer {
    input: Vec<u8>,
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.as_bytes().to_vec(),
            position: 0,
        }
    }

    fn current(&self) -> Option<u8> {
        self.input.get(self.position).copied()
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        if self.position < self.input.len() {
            self.position += 1;
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.current() {
            if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self, quote: u8) -> Result<String, LexError> {
        let start = self.position;
        self.advance(); // skip opening quote
        let mut bytes = Vec::new();

        loop {
            match self.current() {
                None => return Err(LexError::UnterminatedString { offset: start }),
                Some(b) if b == quote => {
                    self.advance(); // skip closing quote
                    return Ok(String::from_utf8_lossy(&bytes).into_owned());
                }
                Some(b'\\') => {
                    self.advance();
                    match self.current() {
                        None => return Err(LexError::UnterminatedString { offset: start }),
                        Some(b'n') => bytes.push(b'\n'),
                        Some(b't') => bytes.push(b'\t'),
                        Some(b'"') => bytes.push(b'"'),
                        Some(b'\'') => bytes.push(b'\''),
                        Some(b'\\') => bytes.push(b'\\'),
                        // Unknown escapes pass through verbatim
                        Some(other) => {
                            bytes.push(b'\\');
                            bytes.push(other);
                        }
                    }
                    self.advance();
                }
                Some(b) => {
                    bytes.push(b);
                    self.advance();
                }
            }
        }
    }

    fn read_number(&mut self) -> Token {
        let start = self.position;
        let mut is_float = false;

        while matches!(self.current(), Some(b) if b.is_ascii_digit() || b == b'_') {
            self.advance();
        }

        // Fractional part only when the dot is followed by a digit, so that
        // `1.abs()` lexes as Int(1) Dot Identifier
        if self.current() == Some(b'.') && matches!(self.peek(1), Some(b) if b.is_ascii_digit()) {
            is_float = true;
            self.advance();
            while matches!(self.current(), Some(b) if b.is_ascii_digit() || b == b'_') {
                self.advance();
            }
        }

        if matches!(self.current(), Some(b'e') | Some(b'E')) {
            let mut lookahead = 1;
            if matches!(self.peek(1), Some(b'+') | Some(b'-')) {
                lookahead = 2;
            }
            if matches!(self.peek(lookahead), Some(b) if b.is_ascii_digit()) {
                is_float = true;
                self.advance(); // e
                if matches!(self.current(), Some(b'+') | Some(b'-')) {
                    self.advance();
                }
                while matches!(self.current(), Some(b) if b.is_ascii_digit()) {
                    self.advance();
                }
            }
        }

        let raw: String = self.input[start..self.position]
            .iter()
            .filter(|&&b| b != b'_')
            .map(|&b| b as char)
            .collect();

        if is_float {
            match raw.parse::<f64>() {
                Ok(n) => Token::Float(n),
                Err(_) => Token::Float(f64::NAN),
            }
        } else {
            match raw.parse::<i64>() {
                Ok(n) => Token::Int(n),
                // Overflowing integer literals widen to float
                Err(_) => Token::Float(raw.parse::<f64>().unwrap_or(f64::NAN)),
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let start = self.position;
        while matches!(self.current(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.advance();
        }
        String::from_utf8_lossy(&self.input[start..self.position]).into_owned()
    }

    /// Produce the next token along with its starting byte offset.
    pub fn next_token(&mut self) -> Result<(Token, usize), LexError> {
        self.skip_whitespace();
        let offset = self.position;

        let b = match self.current() {
            None => return Ok((Token::Eof, offset)),
            Some(b) => b,
        };

        // String literals
        if b == b'"' || b == b'\'' {
            return Ok((Token::String(self.read_string(b)?), offset));
        }

        // Numbers
        if b.is_ascii_digit() {
            return Ok((self.read_number(), offset));
        }

        // Identifiers and keywords (keywords are case-insensitive)
        if b.is_ascii_alphabetic() || b == b'_' {
            let ident = self.read_identifier();
            let token = match ident.to_ascii_lowercase().as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                "in" => Token::In,
                "between" => Token::Between,
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                "like" => Token::Like,
                _ => Token::Identifier(ident),
            };
            return Ok((token, offset));
        }

        // Two-character operators, matched eagerly
        if let Some(next) = self.peek(1) {
            let token = match (b, next) {
                (b'=', b'=') => Some(Token::Equal),
                (b'!', b'=') => Some(Token::NotEqual),
                (b'<', b'=') => Some(Token::LessThanOrEqual),
                (b'>', b'=') => Some(Token::GreaterThanOrEqual),
                (b'&', b'&') => Some(Token::And),
                (b'|', b'|') => Some(Token::Or),
                _ => None,
            };
            if let Some(token) = token {
                self.advance();
                self.advance();
                return Ok((token, offset));
            }
        }

        // Single-character operators and punctuation
        let token = match b {
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => Token::Star,
            b'/' => Token::Slash,
            b'%' => Token::Percent,
            b'^' => Token::Caret,
            b'<' => Token::LessThan,
            b'>' => Token::GreaterThan,
            b'!' => Token::Bang,
            b'(' => Token::LeftParen,
            b')' => Token::RightParen,
            b'[' => Token::LeftBracket,
            b']' => Token::RightBracket,
            b'{' => Token::LeftBrace,
            b'}' => Token::RightBrace,
            b',' => Token::Comma,
            b':' => Token::Colon,
            b';' => Token::Semicolon,
            b'?' => Token::Question,
            b'.' => Token::Dot,
            b'|' => Token::Pipe,
            _ => {
                return Err(LexError::UnexpectedCharacter {
                    ch: b as char,
                    offset,
                })
            }
        };
        self.advance();
        Ok((token, offset))
    }
}

// ── Parser ───────────────────────────────────────────────────────────────────

/// Operator precedence, higher binds tighter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Ternary,
    Or,
    And,
    Equality,
    Relational,
    Membership,
    Between,
    Like,
    Sum,
    Product,
    Power,
    Unary,
    Postfix,
}

fn token_precedence(token: &Token) -> Precedence {
    match token {
        Token::Question => Precedence::Ternary,
        Token::Or => Precedence::Or,
        Token::And => Precedence::And,
        Token::Equal | Token::NotEqual => Precedence::Equality,
        Token::LessThan
        | Token::LessThanOrEqual
        | Token::GreaterThan
        | Token::GreaterThanOrEqual => Precedence::Relational,
        // `not` only continues an expression as `not in` / `not between`
        Token::In | Token::Not => Precedence::Membership,
        Token::Between => Precedence::Between,
        Token::Like => Precedence::Like,
        Token::Plus | Token::Minus => Precedence::Sum,
        Token::Star | Token::Slash | Token::Percent => Precedence::Product,
        Token::Caret => Precedence::Power,
        Token::LeftParen | Token::LeftBracket | Token::Dot => Precedence::Postfix,
        _ => Precedence::Lowest,
    }
}

/// Pratt parser over the token stream.
///
/// State is the current/peek token pair plus an error list; diagnostics
/// accumulate and `parse()` fails if any were recorded.
pub struct Parser {
    lexer: Lexer,
    cur: Token,
    cur_offset: usize,
    peek: Token,
    peek_offset: usize,
    errors: Vec<String>,
    lex_error: Option<LexError>,
}

impl Parser {
    pub fn new(input: &str) -> Self {
        let mut parser = Parser {
            lexer: Lexer::new(input),
            cur: Token::Eof,
            cur_offset: 0,
            peek: Token::Eof,
            peek_offset: 0,
            errors: Vec::new(),
            lex_error: None,
        };
        // Prime the current/peek pair
        parser.advance();
        parser.advance();
        parser
    }

    fn advance(&mut self) {
        self.cur = std::mem::replace(&mut self.peek, Token::Eof);
        self.cur_offset = self.peek_offset;
        if self.lex_error.is_some() {
            return;
        }
        match self.lexer.next_token() {
            Ok((token, offset)) => {
                self.peek = token;
                self.peek_offset = offset;
            }
            Err(e) => {
                self.lex_error = Some(e);
                self.peek = Token::Eof;
            }
        }
    }

    fn expect_peek(&mut self, expected: Token) -> bool {
        if self.peek == expected {
            self.advance();
            true
        } else {
            self.errors.push(format!(
                "expected {} but found {} at offset {}",
                expected.describe(),
                self.peek.describe(),
                self.peek_offset
            ));
            false
        }
    }

    fn expect_identifier(&mut self) -> Option<String> {
        if let Token::Identifier(name) = &self.peek {
            let name = name.clone();
            self.advance();
            Some(name)
        } else {
            self.errors.push(format!(
                "expected identifier but found {} at offset {}",
                self.peek.describe(),
                self.peek_offset
            ));
            None
        }
    }

    /// Parse the whole source as a single expression.
    pub fn parse(&mut self) -> Result<Expr, crate::Error> {
        let expr = self.parse_expression(Precedence::Lowest);

        if let Some(lex_error) = self.lex_error.take() {
            return Err(lex_error.into());
        }
        if expr.is_some() && self.peek != Token::Eof {
            self.errors.push(format!(
                "unexpected {} after expression at offset {}",
                self.peek.describe(),
                self.peek_offset
            ));
        }
        if !self.errors.is_empty() {
            return Err(ParseError {
                messages: std::mem::take(&mut self.errors),
            }
            .into());
        }
        match expr {
            Some(expr) => Ok(expr),
            None => Err(ParseError {
                messages: vec!["empty expression".to_string()],
            }
            .into()),
        }
    }

    fn parse_expression(&mut self, precedence: Precedence) -> Option<Expr> {
        let mut left = self.parse_prefix()?;

        while self.peek != Token::Eof && precedence < token_precedence(&self.peek) {
            left = match &self.peek {
                Token::Question => {
                    self.advance();
                    self.parse_ternary(left)?
                }
                Token::Between => {
                    self.advance();
                    self.parse_between(left, false)?
                }
                Token::Not => {
                    self.advance(); // cur = not
                    match self.peek {
                        Token::In => {
                            self.advance(); // cur = in
                            self.advance(); // cur = first token of rhs
                            let rhs = self.parse_expression(Precedence::Membership)?;
                            Expr::binary(BinaryOp::NotIn, left, rhs)
                        }
                        Token::Between => {
                            self.advance();
                            self.parse_between(left, true)?
                        }
                        _ => {
                            self.errors.push(format!(
                                "expected 'in' or 'between' after 'not' at offset {}",
                                self.peek_offset
                            ));
                            return None;
                        }
                    }
                }
                Token::Like => {
                    self.advance(); // cur = like
                    self.advance(); // cur = first token of pattern
                    let pattern = self.parse_expression(Precedence::Like)?;
                    Expr::binary(BinaryOp::Like, left, pattern)
                }
                Token::LeftParen => {
                    self.advance();
                    self.parse_call(left)?
                }
                Token::LeftBracket => {
                    self.advance();
                    self.parse_index(left)?
                }
                Token::Dot => {
                    self.advance();
                    self.parse_field_access(left)?
                }
                _ => {
                    self.advance();
                    self.parse_binary(left)?
                }
            };
        }

        Some(left)
    }

    // ── Prefix forms ─────────────────────────────────────────────────────

    fn parse_prefix(&mut self) -> Option<Expr> {
        match &self.cur {
            Token::Int(n) => Some(Expr::Literal(Value::Int(*n))),
            Token::Float(n) => Some(Expr::Literal(Value::Float(*n))),
            Token::String(s) => Some(Expr::Literal(Value::string(s.clone()))),
            Token::True => Some(Expr::Literal(Value::Bool(true))),
            Token::False => Some(Expr::Literal(Value::Bool(false))),
            Token::Null => Some(Expr::Literal(Value::Null)),
            Token::Identifier(name) => Some(Expr::Variable(name.clone())),
            Token::Minus => {
                self.advance();
                let operand = self.parse_expression(Precedence::Unary)?;
                Some(Expr::unary(UnaryOp::Negate, operand))
            }
            Token::Bang | Token::Not => {
                self.advance();
                let operand = self.parse_expression(Precedence::Unary)?;
                Some(Expr::unary(UnaryOp::Not, operand))
            }
            Token::LeftParen => {
                self.advance();
                let expr = self.parse_expression(Precedence::Lowest)?;
                if !self.expect_peek(Token::RightParen) {
                    return None;
                }
                Some(expr)
            }
            Token::LeftBracket => self.parse_array_or_comprehension(),
            Token::LeftBrace => self.parse_map_literal(),
            other => {
                self.errors.push(format!(
                    "no prefix parse rule for {} at offset {}",
                    other.describe(),
                    self.cur_offset
                ));
                None
            }
        }
    }

    /// `[a, b, c]`, `[]`, `[body | x in src]`, or `[body | x in src, cond]`.
    fn parse_array_or_comprehension(&mut self) -> Option<Expr> {
        if self.peek == Token::RightBracket {
            self.advance();
            return Some(Expr::ArrayLiteral(Vec::new()));
        }

        self.advance();
        let first = self.parse_expression(Precedence::Lowest)?;

        if self.peek == Token::Pipe {
            self.advance(); // cur = |
            let variable = self.expect_identifier()?;
            if !self.expect_peek(Token::In) {
                return None;
            }
            self.advance();
            let source = self.parse_expression(Precedence::Lowest)?;

            let condition = if self.peek == Token::Comma {
                self.advance();
                self.advance();
                Some(Box::new(self.parse_expression(Precedence::Lowest)?))
            } else {
                None
            };

            if !self.expect_peek(Token::RightBracket) {
                return None;
            }
            return Some(Expr::Comprehension {
                body: Box::new(first),
                variable,
                source: Box::new(source),
                condition,
            });
        }

        let mut elements = vec![first];
        while self.peek == Token::Comma {
            self.advance();
            self.advance();
            elements.push(self.parse_expression(Precedence::Lowest)?);
        }
        if !self.expect_peek(Token::RightBracket) {
            return None;
        }
        Some(Expr::ArrayLiteral(elements))
    }

    /// `{key: value, ...}` — keys are expressions that must evaluate to strings.
    fn parse_map_literal(&mut self) -> Option<Expr> {
        let mut pairs = Vec::new();

        if self.peek == Token::RightBrace {
            self.advance();
            return Some(Expr::MapLiteral(pairs));
        }

        loop {
            self.advance();
            let key = self.parse_expression(Precedence::Lowest)?;
            if !self.expect_peek(Token::Colon) {
                return None;
            }
            self.advance();
            let value = self.parse_expression(Precedence::Lowest)?;
            pairs.push((key, value));

            if self.peek == Token::Comma {
                self.advance();
            } else {
                break;
            }
        }

        if !self.expect_peek(Token::RightBrace) {
            return None;
        }
        Some(Expr::MapLiteral(pairs))
    }

    // ── Infix forms ──────────────────────────────────────────────────────

    fn parse_binary(&mut self, left: Expr) -> Option<Expr> {
        let (op, precedence) = match &self.cur {
            Token::Plus => (BinaryOp::Add, Precedence::Sum),
            Token::Minus => (BinaryOp::Subtract, Precedence::Sum),
            Token::Star => (BinaryOp::Multiply, Precedence::Product),
            Token::Slash => (BinaryOp::Divide, Precedence::Product),
            Token::Percent => (BinaryOp::Modulo, Precedence::Product),
            // Right-associative: recurse at the level below Power
            Token::Caret => (BinaryOp::Power, Precedence::Product),
            Token::Equal => (BinaryOp::Equal, Precedence::Equality),
            Token::NotEqual => (BinaryOp::NotEqual, Precedence::Equality),
            Token::LessThan => (BinaryOp::LessThan, Precedence::Relational),
            Token::LessThanOrEqual => (BinaryOp::LessThanOrEqual, Precedence::Relational),
            Token::GreaterThan => (BinaryOp::GreaterThan, Precedence::Relational),
            Token::GreaterThanOrEqual => (BinaryOp::GreaterThanOrEqual, Precedence::Relational),
            Token::And => (BinaryOp::And, Precedence::And),
            Token::Or => (BinaryOp::Or, Precedence::Or),
            Token::In => (BinaryOp::In, Precedence::Membership),
            other => {
                self.errors.push(format!(
                    "unexpected {} at offset {}",
                    other.describe(),
                    self.cur_offset
                ));
                return None;
            }
        };

        self.advance();
        let right = self.parse_expression(precedence)?;
        Some(Expr::binary(op, left, right))
    }

    fn parse_ternary(&mut self, condition: Expr) -> Option<Expr> {
        self.advance(); // cur = first token of the then-branch
        let then_branch = self.parse_expression(Precedence::Lowest)?;

        if !self.expect_peek(Token::Colon) {
            return None;
        }
        self.advance();
        // Lowest so that a trailing `? :` nests to the right
        let else_branch = self.parse_expression(Precedence::Lowest)?;

        Some(Expr::Ternary {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        })
    }

    /// `value between low and high` — the `and` here belongs to the between
    /// form, not the logical operator; precedence keeps the bounds tight.
    fn parse_between(&mut self, value: Expr, negated: bool) -> Option<Expr> {
        self.advance();
        let low = self.parse_expression(Precedence::Between)?;

        if !self.expect_peek(Token::And) {
            return None;
        }
        self.advance();
        let high = self.parse_expression(Precedence::Between)?;

        Some(Expr::Between {
            value: Box::new(value),
            low: Box::new(low),
            high: Box::new(high),
            negated,
        })
    }

    fn parse_call(&mut self, callee: Expr) -> Option<Expr> {
        let name = match callee {
            Expr::Variable(name) => name,
            _ => {
                self.errors.push(format!(
                    "invalid function call target at offset {}",
                    self.cur_offset
                ));
                return None;
            }
        };
        let args = self.parse_expression_list(Token::RightParen)?;
        Some(Expr::Call { name, args })
    }

    fn parse_index(&mut self, receiver: Expr) -> Option<Expr> {
        self.advance();
        let index = self.parse_expression(Precedence::Lowest)?;
        if !self.expect_peek(Token::RightBracket) {
            return None;
        }
        Some(Expr::IndexAccess {
            receiver: Box::new(receiver),
            index: Box::new(index),
        })
    }

    /// After a `.`: macro, method call, or plain field access.
    fn parse_field_access(&mut self, receiver: Expr) -> Option<Expr> {
        let field = self.expect_identifier()?;

        // Macro names only form macros when called; `xs.filter` alone is a field
        if let Some(kind) = MacroKind::from_name(&field) {
            if self.peek == Token::LeftParen {
                return self.parse_macro(receiver, kind);
            }
        }

        if self.peek == Token::LeftParen {
            self.advance(); // cur = (
            let args = self.parse_expression_list(Token::RightParen)?;
            return Some(Expr::MethodCall {
                receiver: Box::new(receiver),
                method: field,
                args,
            });
        }

        Some(Expr::FieldAccess {
            receiver: Box::new(receiver),
            field,
        })
    }

    /// `receiver.kind(var, body)`; `size`/`reverse` take an empty list.
    fn parse_macro(&mut self, receiver: Expr, kind: MacroKind) -> Option<Expr> {
        if !self.expect_peek(Token::LeftParen) {
            return None;
        }

        if kind.is_nullary() {
            if !self.expect_peek(Token::RightParen) {
                return None;
            }
            return Some(Expr::Macro {
                receiver: Box::new(receiver),
                kind,
                variable: None,
                body: None,
            });
        }

        let variable = self.expect_identifier()?;
        if !self.expect_peek(Token::Comma) {
            return None;
        }
        self.advance();
        let body = self.parse_expression(Precedence::Lowest)?;
        if !self.expect_peek(Token::RightParen) {
            return None;
        }

        Some(Expr::Macro {
            receiver: Box::new(receiver),
            kind,
            variable: Some(variable),
            body: Some(Box::new(body)),
        })
    }

    /// Comma-separated expressions up to (and consuming) `end`.
    /// Called with cur on the opening delimiter.
    fn parse_expression_list(&mut self, end: Token) -> Option<Vec<Expr>> {
        let mut args = Vec::new();

        if self.peek == end {
            self.advance();
            return Some(args);
        }

        self.advance();
        args.push(self.parse_expression(Precedence::Lowest)?);

        while self.peek == Token::Comma {
            self.advance();
            self.advance();
            args.push(self.parse_expression(Precedence::Lowest)?);
        }

        if !self.expect_peek(end) {
            return None;
        }
        Some(args)
    }
}

/// Parse an expression string into an AST.
///
/// This is the main entry point for parsing.
pub fn parse(input: &str) -> Result<Expr, crate::Error> {
    Parser::new(input).parse()
}
