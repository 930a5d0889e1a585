//! Applicability rules: predicates deciding whether an entitlement applies
//! to an [`Environment`].
//!
//! Rules are a closed AST. A compact textual form is accepted for rules that
//! arrive as configuration data (e.g. from managed app configuration):
//!
//! ```text
//! host == "demo.owncloud.com" && (attr.tier == "pro" || !has(attr.legacy))
//! host ends_with ".example.com"
//! certificate == "ba7816bf..."
//! ```
//!
//! Fields: `id`, `bookmark`, `host`, `certificate` (SHA-256 fingerprint) and
//! `attr.<key>`. Operators: `==`, `!=`, `ends_with`, `contains`, `&&`, `||`,
//! `!`, `has(<field>)`. Literals: double-quoted strings, integers, `true`,
//! `false`.
//!
//! Evaluation fails closed: a malformed rule or a type mismatch makes the
//! rule not applicable; it never propagates past [`ApplicabilityRule::is_satisfied_by`].

use crate::environment::Environment;
use crate::LicensorError;
use serde_json::Value;
use std::fmt;
use tracing::warn;

/// Environment field a rule can inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// [`Environment::identifier`].
    Identifier,
    /// [`Environment::bookmark_id`].
    Bookmark,
    /// [`Environment::hostname`].
    Hostname,
    /// SHA-256 fingerprint of [`Environment::certificate`].
    Certificate,
    /// An entry of [`Environment::attributes`].
    Attribute(String),
}

impl Field {
    fn resolve(&self, environment: &Environment) -> Option<Value> {
        match self {
            Field::Identifier => environment.identifier.clone().map(Value::String),
            Field::Bookmark => environment.bookmark_id.clone().map(Value::String),
            Field::Hostname => environment.hostname.clone().map(Value::String),
            Field::Certificate => environment
                .certificate
                .as_ref()
                .map(|c| Value::String(c.sha256_fingerprint().to_string())),
            Field::Attribute(key) => environment.attribute(key).cloned(),
        }
    }

    /// Hostnames and fingerprints compare case-insensitively.
    fn normalize(&self, value: Value) -> Value {
        match (self, value) {
            (Field::Hostname | Field::Certificate, Value::String(s)) => {
                Value::String(s.to_ascii_lowercase())
            }
            (_, value) => value,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Identifier => f.write_str("id"),
            Field::Bookmark => f.write_str("bookmark"),
            Field::Hostname => f.write_str("host"),
            Field::Certificate => f.write_str("certificate"),
            Field::Attribute(key) => write!(f, "attr.{}", key),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `==`
    Equals,
    /// `!=`
    NotEquals,
    /// `ends_with` (strings only)
    EndsWith,
    /// `contains` (strings only)
    Contains,
}

/// Applicability predicate over an [`Environment`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplicabilityRule {
    /// Always applicable.
    Always,
    /// Never applicable.
    Never,
    /// Compare a field with a literal.
    Compare {
        /// Inspected field.
        field: Field,
        /// Operator.
        op: Comparison,
        /// Literal operand.
        value: Value,
    },
    /// The field is set.
    Present(Field),
    /// All sub-rules apply.
    All(Vec<ApplicabilityRule>),
    /// At least one sub-rule applies.
    Any(Vec<ApplicabilityRule>),
    /// The sub-rule does not apply.
    Not(Box<ApplicabilityRule>),
    /// A rule that failed to parse. Never applicable.
    Malformed {
        /// The rule text as supplied.
        source_text: String,
        /// Parse failure description.
        reason: String,
    },
}

impl ApplicabilityRule {
    /// Applies only to the given host.
    pub fn host_equals(host: impl Into<String>) -> Self {
        Self::compare(Field::Hostname, Comparison::Equals, host.into())
    }

    /// Applies to hosts ending with the suffix (e.g. `.example.com`).
    pub fn host_suffix(suffix: impl Into<String>) -> Self {
        Self::compare(Field::Hostname, Comparison::EndsWith, suffix.into())
    }

    /// Applies only to the given bookmark.
    pub fn bookmark_equals(bookmark_id: impl Into<String>) -> Self {
        Self::compare(Field::Bookmark, Comparison::Equals, bookmark_id.into())
    }

    /// Applies only to servers presenting the certificate with this SHA-256 fingerprint.
    pub fn certificate_fingerprint(fingerprint: impl Into<String>) -> Self {
        Self::compare(Field::Certificate, Comparison::Equals, fingerprint.into())
    }

    /// Applies when the attribute equals the value.
    pub fn attribute_equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(Field::Attribute(key.into()), Comparison::Equals, value)
    }

    fn compare(field: Field, op: Comparison, value: impl Into<Value>) -> Self {
        let value = field.normalize(value.into());
        Self::Compare { field, op, value }
    }

    /// Parse the textual rule form.
    pub fn parse(text: &str) -> Result<Self, LicensorError> {
        let tokens = tokenize(text).map_err(|reason| rule_error(text, reason))?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let rule = parser.parse_or().map_err(|reason| rule_error(text, reason))?;
        if let Some(token) = parser.peek() {
            return Err(rule_error(text, format!("unexpected trailing {}", token)));
        }
        Ok(rule)
    }

    /// Parse the textual rule form, keeping a parse failure as [`ApplicabilityRule::Malformed`].
    pub fn from_expression(text: &str) -> Self {
        match Self::parse(text) {
            Ok(rule) => rule,
            Err(LicensorError::ApplicabilityRule {
                source_text,
                reason,
            }) => Self::Malformed {
                source_text,
                reason,
            },
            Err(other) => Self::Malformed {
                source_text: text.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Evaluate the rule, reporting malformed rules and type mismatches as errors.
    pub fn evaluate(&self, environment: &Environment) -> Result<bool, LicensorError> {
        match self {
            Self::Always => Ok(true),
            Self::Never => Ok(false),
            Self::Present(field) => Ok(field.resolve(environment).is_some()),
            Self::Compare { field, op, value } => {
                let actual = field.resolve(environment).map(|v| field.normalize(v));
                compare(field, *op, actual.as_ref(), value)
            }
            Self::All(rules) => {
                for rule in rules {
                    if !rule.evaluate(environment)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any(rules) => {
                for rule in rules {
                    if rule.evaluate(environment)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not(rule) => Ok(!rule.evaluate(environment)?),
            Self::Malformed {
                source_text,
                reason,
            } => Err(rule_error(source_text, reason.clone())),
        }
    }

    /// Evaluate the rule, treating any evaluation failure as "not applicable".
    pub fn is_satisfied_by(&self, environment: &Environment) -> bool {
        match self.evaluate(environment) {
            Ok(applies) => applies,
            Err(error) => {
                warn!(%error, "applicability rule failed to evaluate, treating as not applicable");
                false
            }
        }
    }
}

fn rule_error(text: &str, reason: String) -> LicensorError {
    LicensorError::ApplicabilityRule {
        source_text: text.to_string(),
        reason,
    }
}

fn compare(
    field: &Field,
    op: Comparison,
    actual: Option<&Value>,
    expected: &Value,
) -> Result<bool, LicensorError> {
    match op {
        Comparison::Equals => Ok(actual == Some(expected)),
        Comparison::NotEquals => Ok(actual != Some(expected)),
        Comparison::EndsWith | Comparison::Contains => {
            let Some(actual) = actual else {
                return Ok(false);
            };
            match (actual, expected) {
                (Value::String(a), Value::String(e)) => Ok(if op == Comparison::EndsWith {
                    a.ends_with(e.as_str())
                } else {
                    a.contains(e.as_str())
                }),
                _ => Err(rule_error(
                    &format!("{} {:?} {}", field, op, expected),
                    "string operator applied to a non-string value".to_string(),
                )),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    And,
    Or,
    Bang,
    Eq,
    Ne,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier `{}`", s),
            Token::Str(s) => write!(f, "string {:?}", s),
            Token::Int(i) => write!(f, "integer {}", i),
            Token::And => f.write_str("`&&`"),
            Token::Or => f.write_str("`||`"),
            Token::Bang => f.write_str("`!`"),
            Token::Eq => f.write_str("`==`"),
            Token::Ne => f.write_str("`!=`"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            '&' | '|' | '=' => {
                if chars.next_if(|&(_, next)| next == c).is_none() {
                    return Err(format!("expected `{c}{c}` at offset {pos}"));
                }
                tokens.push(match c {
                    '&' => Token::And,
                    '|' => Token::Or,
                    _ => Token::Eq,
                });
            }
            '!' => {
                if chars.next_if(|&(_, next)| next == '=').is_some() {
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '"' => {
                let mut literal = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, escaped @ ('"' | '\\'))) => literal.push(escaped),
                            _ => return Err(format!("invalid escape in string at offset {pos}")),
                        },
                        c => literal.push(c),
                    }
                }
                if !closed {
                    return Err(format!("unterminated string at offset {pos}"));
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut digits = c.to_string();
                while let Some((_, d)) = chars.next_if(|&(_, d)| d.is_ascii_digit()) {
                    digits.push(d);
                }
                let value = digits
                    .parse::<i64>()
                    .map_err(|e| format!("invalid integer {digits:?} at offset {pos}: {e}"))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = c.to_string();
                while let Some((_, n)) = chars
                    .next_if(|&(_, n)| n.is_ascii_alphanumeric() || matches!(n, '_' | '.' | '-'))
                {
                    ident.push(n);
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character {other:?} at offset {pos}")),
        }
    }

    Ok(tokens)
}

/// Deepest `!` or `(` nesting accepted in a rule.
const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, String>,
    ) -> Result<T, String> {
        if self.depth >= MAX_NESTING {
            return Err(format!("rule nested deeper than {} levels", MAX_NESTING));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
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

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {}, found {}", expected, token)),
            None => Err(format!("expected {}, found end of rule", expected)),
        }
    }

    fn parse_or(&mut self) -> Result<ApplicabilityRule, String> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            ApplicabilityRule::Any(terms)
        })
    }

    fn parse_and(&mut self) -> Result<ApplicabilityRule, String> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            ApplicabilityRule::All(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<ApplicabilityRule, String> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            let inner = self.nested(Self::parse_unary)?;
            return Ok(ApplicabilityRule::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<ApplicabilityRule, String> {
        match self.next() {
            Some(Token::LParen) => {
                let rule = self.nested(Self::parse_or)?;
                self.expect(Token::RParen)?;
                Ok(rule)
            }
            Some(Token::Ident(ident)) => match ident.as_str() {
                "true" => Ok(ApplicabilityRule::Always),
                "false" => Ok(ApplicabilityRule::Never),
                "has" => {
                    self.expect(Token::LParen)?;
                    let field = match self.next() {
                        Some(Token::Ident(name)) => parse_field(&name)?,
                        Some(token) => return Err(format!("expected field, found {}", token)),
                        None => return Err("expected field, found end of rule".to_string()),
                    };
                    self.expect(Token::RParen)?;
                    Ok(ApplicabilityRule::Present(field))
                }
                name => {
                    let field = parse_field(name)?;
                    let op = match self.next() {
                        Some(Token::Eq) => Comparison::Equals,
                        Some(Token::Ne) => Comparison::NotEquals,
                        Some(Token::Ident(op)) if op == "ends_with" => Comparison::EndsWith,
                        Some(Token::Ident(op)) if op == "contains" => Comparison::Contains,
                        Some(token) => {
                            return Err(format!("expected operator after `{}`, found {}", name, token))
                        }
                        None => return Err(format!("expected operator after `{}`", name)),
                    };
                    let value = match self.next() {
                        Some(Token::Str(s)) => Value::String(s),
                        Some(Token::Int(i)) => Value::from(i),
                        Some(Token::Ident(b)) if b == "true" => Value::Bool(true),
                        Some(Token::Ident(b)) if b == "false" => Value::Bool(false),
                        Some(token) => return Err(format!("expected literal, found {}", token)),
                        None => return Err("expected literal, found end of rule".to_string()),
                    };
                    Ok(ApplicabilityRule::compare(field, op, value))
                }
            },
            Some(token) => Err(format!("unexpected {}", token)),
            None => Err("empty rule".to_string()),
        }
    }
}

fn parse_field(name: &str) -> Result<Field, String> {
    match name {
        "id" | "identifier" => Ok(Field::Identifier),
        "bookmark" => Ok(Field::Bookmark),
        "host" | "hostname" => Ok(Field::Hostname),
        "certificate" => Ok(Field::Certificate),
        other => match other.strip_prefix("attr.") {
            Some(key) if !key.is_empty() => Ok(Field::Attribute(key.to_string())),
            _ => Err(format!("unknown field `{}`", other)),
        },
    }
}
