//! Label expressions.
//!
//! Templates advertise a whitespace-separated set of labels. Work asks for
//! capacity with an expression over those labels:
//!
//! ```text
//! linux && (maven || gradle) && !gpu
//! ```
//!
//! `!` binds tighter than `&&`, which binds tighter than `||`.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Errors produced while parsing a label expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelParseError {
    /// The expression is empty or only whitespace.
    #[error("label expression is empty")]
    Empty,

    /// The expression ended where an operand was expected.
    #[error("unexpected end of label expression")]
    UnexpectedEnd,

    /// A token appeared where it is not allowed.
    #[error("unexpected '{token}' at position {position}")]
    UnexpectedToken { token: String, position: usize },

    /// A `(` without matching `)`.
    #[error("unclosed parenthesis opened at position {0}")]
    Unclosed(usize),
}

/// Parsed label expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelExpr {
    /// A single label.
    Atom(String),
    /// Negation.
    Not(Box<LabelExpr>),
    /// Both sides must match.
    And(Box<LabelExpr>, Box<LabelExpr>),
    /// Either side must match.
    Or(Box<LabelExpr>, Box<LabelExpr>),
}

impl LabelExpr {
    /// Parse an expression.
    pub fn parse(input: &str) -> Result<Self, LabelParseError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(LabelParseError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        match parser.tokens.get(parser.pos) {
            None => Ok(expr),
            Some((token, position)) => Err(LabelParseError::UnexpectedToken {
                token: token.to_string(),
                position: *position,
            }),
        }
    }

    /// Parse a requested label, treating a missing or blank one as "any".
    pub fn parse_request(input: Option<&str>) -> Result<Option<Self>, LabelParseError> {
        input
            .filter(|l| !l.trim().is_empty())
            .map(Self::parse)
            .transpose()
    }

    /// Evaluate against a set of labels.
    #[must_use]
    pub fn matches(&self, labels: &BTreeSet<String>) -> bool {
        match self {
            Self::Atom(name) => labels.contains(name),
            Self::Not(inner) => !inner.matches(labels),
            Self::And(lhs, rhs) => lhs.matches(labels) && rhs.matches(labels),
            Self::Or(lhs, rhs) => lhs.matches(labels) || rhs.matches(labels),
        }
    }
}

impl fmt::Display for LabelExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(name) => write!(f, "{name}"),
            Self::Not(inner) => match inner.as_ref() {
                Self::Atom(_) | Self::Not(_) => write!(f, "!{inner}"),
                _ => write!(f, "!({inner})"),
            },
            Self::And(lhs, rhs) => {
                write_operand(f, lhs, matches!(lhs.as_ref(), Self::Or(..)))?;
                write!(f, " && ")?;
                write_operand(f, rhs, matches!(rhs.as_ref(), Self::Or(..)))
            }
            Self::Or(lhs, rhs) => write!(f, "{lhs} || {rhs}"),
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &LabelExpr, parens: bool) -> fmt::Result {
    if parens {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

/// Split a template's label string into its label set.
#[must_use]
pub fn parse_label_set(labels: &str) -> BTreeSet<String> {
    labels.split_whitespace().map(str::to_string).collect()
}

/// Whether `label` can be used as a single template label.
#[must_use]
pub fn is_valid_atom(label: &str) -> bool {
    !label.is_empty() && !label.chars().any(is_reserved)
}

fn is_reserved(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '!' | '&' | '|')
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Atom(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(name) => write!(f, "{name}"),
            Self::And => write!(f, "&&"),
            Self::Or => write!(f, "||"),
            Self::Not => write!(f, "!"),
            Self::Open => write!(f, "("),
            Self::Close => write!(f, ")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, LabelParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '(' => tokens.push((Token::Open, pos)),
            ')' => tokens.push((Token::Close, pos)),
            '!' => tokens.push((Token::Not, pos)),
            '&' | '|' => {
                if chars.next_if(|&(_, next)| next == c).is_none() {
                    return Err(LabelParseError::UnexpectedToken {
                        token: c.to_string(),
                        position: pos,
                    });
                }
                tokens.push((if c == '&' { Token::And } else { Token::Or }, pos));
            }
            _ => {
                let mut atom = String::from(c);
                while let Some((_, next)) = chars.next_if(|&(_, next)| !is_reserved(next)) {
                    atom.push(next);
                }
                tokens.push((Token::Atom(atom), pos));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn or(&mut self) -> Result<LabelExpr, LabelParseError> {
        let mut expr = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            expr = LabelExpr::Or(Box::new(expr), Box::new(self.and()?));
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<LabelExpr, LabelParseError> {
        let mut expr = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            expr = LabelExpr::And(Box::new(expr), Box::new(self.unary()?));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<LabelExpr, LabelParseError> {
        let Some((token, position)) = self.tokens.get(self.pos).cloned() else {
            return Err(LabelParseError::UnexpectedEnd);
        };
        self.pos += 1;

        match token {
            Token::Atom(name) => Ok(LabelExpr::Atom(name)),
            Token::Not => Ok(LabelExpr::Not(Box::new(self.unary()?))),
            Token::Open => {
                let inner = self.or()?;
                if self.peek() == Some(&Token::Close) {
                    self.pos += 1;
                    Ok(inner)
                } else {
                    Err(LabelParseError::Unclosed(position))
                }
            }
            other => Err(LabelParseError::UnexpectedToken {
                token: other.to_string(),
                position,
            }),
        }
    }
}
