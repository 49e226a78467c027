//! Spreadsheet expression parser.
//!
//! Formula text (without the leading `=`) is tokenized and parsed into an
//! [`Expr`] tree. Precedence, lowest first:
//!
//! | level | operators |
//! |-------|-----------|
//! | comparison | `=` `<>` `<` `>` `<=` `>=` |
//! | concatenation | `&` |
//! | additive | `+` `-` |
//! | multiplicative | `*` `/` |
//! | exponent | `^` |
//! | unary | `-` `+` |
//! | postfix | `%` |
//!
//! Bare identifiers are column aliases and are lower-cased. Identifiers
//! followed by `(` are function names and are upper-cased.

use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 1,
            BinaryOp::Concat => 2,
            BinaryOp::Add | BinaryOp::Sub => 3,
            BinaryOp::Mul | BinaryOp::Div => 4,
            BinaryOp::Pow => 5,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Concat => "&",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnaryOp {
    Neg,
    Plus,
}

/// Parsed formula expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Integer(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Column(String),
    Call { name: String, args: Vec<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Percent(Box<Expr>),
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

impl Expr {
    /// Visit this node and every descendant, parents first.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Call { args, .. } => args.iter().for_each(|a| a.walk(f)),
            Expr::Unary { expr, .. } | Expr::Percent(expr) => expr.walk(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            _ => {}
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseErrorKind {
    UnexpectedCharacter,
    UnterminatedString,
    InvalidNumber,
    UnexpectedToken,
    UnexpectedEnd,
    Empty,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::UnexpectedCharacter => "unexpected character",
            ParseErrorKind::UnterminatedString => "unterminated string",
            ParseErrorKind::InvalidNumber => "invalid number",
            ParseErrorKind::UnexpectedToken => "unexpected token",
            ParseErrorKind::UnexpectedEnd => "unexpected end of formula",
            ParseErrorKind::Empty => "empty formula",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind} at position {position}: {message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Character offset into the formula body.
    pub position: usize,
}

impl ParseError {
    fn new(kind: ParseErrorKind, position: usize, message: impl Into<String>) -> Self {
        ParseError {
            kind,
            message: message.into(),
            position,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(String),
    Text(String),
    Ident(String),
    Op(BinaryOp),
    Percent,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Text(s) => write!(f, "\"{}\"", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Op(op) => write!(f, "{}", op.symbol()),
            Token::Percent => f.write_str("%"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '"' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ParseError::new(
                                ParseErrorKind::UnterminatedString,
                                start,
                                "string literal is not closed",
                            ));
                        }
                        Some('"') if chars.get(i + 1) == Some(&'"') => {
                            text.push('"');
                            i += 2;
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Text(text)));
                continue;
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let number: String = chars[start..i].iter().collect();
                tokens.push((start, Token::Number(number)));
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push((start, Token::Ident(ident)));
                continue;
            }
            '(' => tokens.push((start, Token::LParen)),
            ')' => tokens.push((start, Token::RParen)),
            ',' | ';' => tokens.push((start, Token::Comma)),
            '%' => tokens.push((start, Token::Percent)),
            '+' => tokens.push((start, Token::Op(BinaryOp::Add))),
            '-' => tokens.push((start, Token::Op(BinaryOp::Sub))),
            '*' => tokens.push((start, Token::Op(BinaryOp::Mul))),
            '/' => tokens.push((start, Token::Op(BinaryOp::Div))),
            '^' => tokens.push((start, Token::Op(BinaryOp::Pow))),
            '&' => tokens.push((start, Token::Op(BinaryOp::Concat))),
            '=' => {
                // Accept `==` as a courtesy for people used to C-like syntax.
                if chars.get(i + 1) == Some(&'=') {
                    i += 1;
                }
                tokens.push((start, Token::Op(BinaryOp::Eq)));
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                i += 1;
                tokens.push((start, Token::Op(BinaryOp::Ne)));
            }
            '<' => match chars.get(i + 1) {
                Some('>') => {
                    i += 1;
                    tokens.push((start, Token::Op(BinaryOp::Ne)));
                }
                Some('=') => {
                    i += 1;
                    tokens.push((start, Token::Op(BinaryOp::Le)));
                }
                _ => tokens.push((start, Token::Op(BinaryOp::Lt))),
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 1;
                    tokens.push((start, Token::Op(BinaryOp::Ge)));
                } else {
                    tokens.push((start, Token::Op(BinaryOp::Gt)));
                }
            }
            other => {
                return Err(ParseError::new(
                    ParseErrorKind::UnexpectedCharacter,
                    start,
                    format!("'{}' is not allowed here", other),
                ));
            }
        }
        i += 1;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            Some(t) => Err(ParseError::new(
                ParseErrorKind::UnexpectedToken,
                offset,
                format!("expected '{}', found '{}'", expected, t),
            )),
            None => Err(ParseError::new(
                ParseErrorKind::UnexpectedEnd,
                offset,
                format!("expected '{}'", expected),
            )),
        }
    }

    fn expression(&mut self, min_precedence: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let precedence = op.precedence();
            if precedence < min_precedence {
                break;
            }
            self.pos += 1;
            // All binary operators are left-associative.
            let rhs = self.expression(precedence + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Op(BinaryOp::Sub)) => {
                self.pos += 1;
                let expr = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(expr),
                })
            }
            Some(Token::Op(BinaryOp::Add)) => {
                self.pos += 1;
                let expr = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Plus,
                    expr: Box::new(expr),
                })
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        while let Some(Token::Percent) = self.peek() {
            self.pos += 1;
            expr = Expr::Percent(Box::new(expr));
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        let Some(token) = self.next() else {
            return Err(ParseError::new(
                ParseErrorKind::UnexpectedEnd,
                offset,
                "expected a value",
            ));
        };

        match token {
            Token::Number(n) => parse_number(&n, offset),
            Token::Text(s) => Ok(Expr::Text(s)),
            Token::LParen => {
                let expr = self.expression(0)?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::Ident(name) => {
                if let Some(Token::LParen) = self.peek() {
                    self.pos += 1;
                    let args = self.arguments()?;
                    return Ok(Expr::Call {
                        name: name.to_uppercase(),
                        args,
                    });
                }
                match name.to_ascii_uppercase().as_str() {
                    "TRUE" => Ok(Expr::Bool(true)),
                    "FALSE" => Ok(Expr::Bool(false)),
                    _ => Ok(Expr::Column(name.to_lowercase())),
                }
            }
            other => Err(ParseError::new(
                ParseErrorKind::UnexpectedToken,
                offset,
                format!("unexpected '{}'", other),
            )),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression(0)?);
            let offset = self.offset();
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(t) => {
                    return Err(ParseError::new(
                        ParseErrorKind::UnexpectedToken,
                        offset,
                        format!("expected ',' or ')', found '{}'", t),
                    ));
                }
                None => {
                    return Err(ParseError::new(
                        ParseErrorKind::UnexpectedEnd,
                        offset,
                        "function call is not closed",
                    ));
                }
            }
        }
    }
}

fn parse_number(text: &str, offset: usize) -> Result<Expr, ParseError> {
    if !text.contains(['.', 'e', 'E']) {
        if let Ok(n) = text.parse::<i64>() {
            return Ok(Expr::Integer(n));
        }
    }
    match text.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(Expr::Float(n)),
        _ => Err(ParseError::new(
            ParseErrorKind::InvalidNumber,
            offset,
            format!("'{}' is not a number", text),
        )),
    }
}

/// Parse a formula body (the text after `=`).
pub fn parse_formula(body: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(body)?;
    if tokens.is_empty() {
        return Err(ParseError::new(ParseErrorKind::Empty, 0, "nothing to evaluate"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: body.chars().count(),
    };
    let expr = parser.expression(0)?;
    if let Some(token) = parser.peek() {
        let token = token.clone();
        return Err(ParseError::new(
            ParseErrorKind::UnexpectedToken,
            parser.offset(),
            format!("unexpected '{}' after end of expression", token),
        ));
    }
    Ok(expr)
}
