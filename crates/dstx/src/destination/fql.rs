//! 🔍 FQL, the little filter language subscriptions are written in.
//!
//! ```text
//! type = "track" and (event = "Order Completed" or properties.total > 100)
//! contains(event, "Order") and !match(context.page.path, "/admin*")
//! properties.coupon != null
//! ```
//!
//! Conditions in one group share a single connective: the last `and`/`or` seen in that group
//! wins. Use parentheses to mix them.
//!
//! 🔍 Hand-rolled tokenizer, hand-rolled parser. It is small on purpose. If you find yourself
//! wanting operator precedence, you want parentheses. If you want regexes, you want a therapist.

use serde_json::Value;
use thiserror::Error;

use crate::mapping::get_path;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct FqlError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connective {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Group {
        connective: Connective,
        children: Vec<Condition>,
    },
    Compare {
        target: String,
        comparison: Comparison,
        value: Literal,
    },
    Contains {
        target: String,
        needle: String,
        negate: bool,
    },
    Match {
        target: String,
        pattern: String,
        negate: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    Op(Comparison),
    Not,
    LParen,
    RParen,
    Comma,
}

/// Parses a subscription. Blank input is an error.
pub fn parse(source: &str) -> Result<Condition, FqlError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(FqlError("Subscription is empty".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let condition = parser.group(0)?;
    match parser.peek() {
        None => Ok(condition),
        Some(token) => Err(FqlError(format!("Unexpected token {token:?}"))),
    }
}

impl Condition {
    pub fn evaluate(&self, event: &Value) -> bool {
        match self {
            Condition::Group {
                connective: Connective::And,
                children,
            } => children.iter().all(|child| child.evaluate(event)),
            Condition::Group {
                connective: Connective::Or,
                children,
            } => children.iter().any(|child| child.evaluate(event)),
            Condition::Compare {
                target,
                comparison,
                value,
            } => compare(lookup(event, target), *comparison, value),
            Condition::Contains {
                target,
                needle,
                negate,
            } => {
                let found = lookup(event, target)
                    .and_then(Value::as_str)
                    .is_some_and(|haystack| haystack.contains(needle.as_str()));
                found != *negate
            }
            Condition::Match {
                target,
                pattern,
                negate,
            } => {
                let found = lookup(event, target)
                    .and_then(Value::as_str)
                    .is_some_and(|text| glob(pattern, text));
                found != *negate
            }
        }
    }
}

// properties fall back to traits for identify and group calls
fn lookup<'a>(event: &'a Value, target: &str) -> Option<&'a Value> {
    let found = get_path(event, target).filter(|value| !value.is_null());
    if found.is_some() {
        return found;
    }
    let rest = target.strip_prefix("properties.")?;
    match event.get("type").and_then(Value::as_str) {
        Some("identify" | "group") => {
            get_path(event, &format!("traits.{rest}")).filter(|value| !value.is_null())
        }
        _ => None,
    }
}

fn compare(actual: Option<&Value>, comparison: Comparison, expected: &Literal) -> bool {
    if *expected == Literal::Null {
        return match comparison {
            Comparison::Eq => actual.is_none(),
            Comparison::Ne => actual.is_some(),
            _ => false,
        };
    }
    match comparison {
        Comparison::Eq => actual.is_some_and(|actual| loosely_equal(actual, expected)),
        Comparison::Ne => !actual.is_some_and(|actual| loosely_equal(actual, expected)),
        ordering => {
            let (Some(left), Literal::Number(right)) = (actual.and_then(as_number), expected)
            else {
                return false;
            };
            match ordering {
                Comparison::Lt => left < *right,
                Comparison::Le => left <= *right,
                Comparison::Gt => left > *right,
                _ => left >= *right,
            }
        }
    }
}

fn loosely_equal(actual: &Value, expected: &Literal) -> bool {
    match (actual, expected) {
        (Value::String(actual), Literal::String(expected)) => actual == expected,
        (Value::Bool(actual), Literal::Bool(expected)) => actual == expected,
        (Value::Number(_), Literal::Number(expected)) => as_number(actual) == Some(*expected),
        (Value::String(actual), Literal::Number(expected)) => {
            actual.trim().parse::<f64>().ok() == Some(*expected)
        }
        (Value::Number(number), Literal::String(expected)) => number.to_string() == *expected,
        (Value::Bool(actual), Literal::String(expected)) => actual.to_string() == *expected,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// `*` matches any run of characters.
fn glob(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !text.starts_with(first)
        || !text.ends_with(last)
        || text.len() < first.len() + last.len()
    {
        return false;
    }
    let mut rest = &text[first.len()..text.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(at) => rest = &rest[at + middle.len()..],
            None => return false,
        }
    }
    true
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
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn group(&mut self, depth: usize) -> Result<Condition, FqlError> {
        let mut children = vec![self.unit(depth)?];
        let mut connective = Connective::And;
        loop {
            match self.peek() {
                None => break,
                Some(Token::RParen) if depth > 0 => break,
                Some(Token::Ident(word)) if word == "and" || word == "or" => {
                    connective = if word == "and" {
                        Connective::And
                    } else {
                        Connective::Or
                    };
                    self.pos += 1;
                    children.push(self.unit(depth)?);
                }
                Some(token) => return Err(FqlError(format!("Unexpected token {token:?}"))),
            }
        }
        if children.len() == 1 {
            return Ok(children.remove(0));
        }
        Ok(Condition::Group {
            connective,
            children,
        })
    }

    fn unit(&mut self, depth: usize) -> Result<Condition, FqlError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.group(depth + 1)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(FqlError("Missing closing parenthesis".into())),
                }
            }
            Some(Token::Not) => match self.next() {
                Some(Token::Ident(function)) => self.function(&function, true),
                _ => Err(FqlError("Expected a function after \"!\"".into())),
            },
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    return self.function(&name, false);
                }
                let comparison = match self.next() {
                    Some(Token::Op(comparison)) => comparison,
                    _ => return Err(FqlError("Operator token is missing".into())),
                };
                let value = self.literal()?;
                Ok(Condition::Compare {
                    target: name,
                    comparison,
                    value,
                })
            }
            Some(token) => Err(FqlError(format!("Unexpected token {token:?}"))),
            None => Err(FqlError("Unexpected end of subscription".into())),
        }
    }

    fn function(&mut self, name: &str, negate: bool) -> Result<Condition, FqlError> {
        if self.next() != Some(Token::LParen) {
            return Err(FqlError(format!("Expected \"(\" after {name}")));
        }
        let target = match self.next() {
            Some(Token::Ident(target)) => target,
            _ => return Err(FqlError(format!("{name} needs a field as its first argument"))),
        };
        if self.next() != Some(Token::Comma) {
            return Err(FqlError(format!("{name} takes two arguments")));
        }
        let argument = match self.next() {
            Some(Token::Str(argument)) => argument,
            _ => return Err(FqlError(format!("{name} needs a string as its second argument"))),
        };
        if self.next() != Some(Token::RParen) {
            return Err(FqlError("Missing closing parenthesis".into()));
        }
        match name {
            "contains" => Ok(Condition::Contains {
                target,
                needle: argument,
                negate,
            }),
            "match" => Ok(Condition::Match {
                target,
                pattern: argument,
                negate,
            }),
            other => Err(FqlError(format!("Unknown function {other}"))),
        }
    }

    fn literal(&mut self) -> Result<Literal, FqlError> {
        match self.next() {
            Some(Token::Str(text)) => Ok(Literal::String(text)),
            Some(Token::Number(number)) => Ok(Literal::Number(number)),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Literal::Bool(true)),
                "false" => Ok(Literal::Bool(false)),
                "null" => Ok(Literal::Null),
                _ => Err(FqlError(format!("Value token is invalid: {word}"))),
            },
            _ => Err(FqlError("Value token is missing".into())),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, FqlError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(Comparison::Eq));
                i += 1;
            }
            '!' | '<' | '>' => {
                let followed_by_eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, followed_by_eq) {
                    ('!', true) => Token::Op(Comparison::Ne),
                    ('!', false) => Token::Not,
                    ('<', true) => Token::Op(Comparison::Le),
                    ('<', false) => Token::Op(Comparison::Lt),
                    ('>', true) => Token::Op(Comparison::Ge),
                    _ => Token::Op(Comparison::Gt),
                };
                i += if followed_by_eq { 2 } else { 1 };
                tokens.push(token);
            }
            '"' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(FqlError("Unterminated string".into())),
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(other) => {
                            text.push(*other);
                            i += 1;
                        }
                    }
                }
                i += 1;
                tokens.push(Token::Str(text));
            }
            _ if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while chars.get(i).is_some_and(|d| d.is_ascii_digit() || *d == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse()
                    .map_err(|_| FqlError(format!("Invalid number {text}")))?;
                tokens.push(Token::Number(number));
            }
            _ if is_ident_char(c) => {
                let start = i;
                while chars.get(i).is_some_and(|d| is_ident_char(*d)) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(FqlError(format!("Unexpected character {other:?}"))),
        }
    }
    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '-')
}
