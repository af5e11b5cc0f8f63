// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tag predicates used to select fragments at collection time
//!
//! Textual form:
//!
//! ```text
//! expr   := term ("or" term)*
//! term   := factor ("and" factor)*
//! factor := "not" factor | "(" expr ")" | "tag" ("==" | "!=") STRING
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{RelayError, Result};
use crate::fragment::Fragment;

/// Boolean filter over a fragment's tag set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TagPredicate {
    /// The tag set contains exactly this tag
    Tag(String),
    Not(Box<TagPredicate>),
    And(Box<TagPredicate>, Box<TagPredicate>),
    Or(Box<TagPredicate>, Box<TagPredicate>),
}

impl TagPredicate {
    /// `tag == "<tag>"`
    pub fn tag(tag: impl Into<String>) -> Self {
        TagPredicate::Tag(tag.into())
    }

    pub fn and(self, other: TagPredicate) -> Self {
        TagPredicate::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: TagPredicate) -> Self {
        TagPredicate::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        TagPredicate::Not(Box::new(self))
    }

    pub fn matches(&self, fragment: &Fragment) -> bool {
        match self {
            TagPredicate::Tag(tag) => fragment.has_tag(tag),
            TagPredicate::Not(inner) => !inner.matches(fragment),
            TagPredicate::And(left, right) => left.matches(fragment) && right.matches(fragment),
            TagPredicate::Or(left, right) => left.matches(fragment) || right.matches(fragment),
        }
    }
}

impl fmt::Display for TagPredicate {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagPredicate::Tag(tag) => write!(formatter, "tag == {}", quoted(tag)),
            TagPredicate::Not(inner) => match inner.as_ref() {
                TagPredicate::Tag(tag) => write!(formatter, "tag != {}", quoted(tag)),
                other => write!(formatter, "not ({})", other),
            },
            TagPredicate::And(left, right) => write!(formatter, "{} and {}", left, right),
            // Always grouped so an `or` nested under `and` re-parses the same way
            TagPredicate::Or(left, right) => write!(formatter, "({} or {})", left, right),
        }
    }
}

/// String literal the tokenizer reads back verbatim
fn quoted(tag: &str) -> String {
    let mut literal = String::with_capacity(tag.len() + 2);
    literal.push('"');
    for ch in tag.chars() {
        if ch == '"' || ch == '\\' {
            literal.push('\\');
        }
        literal.push(ch);
    }
    literal.push('"');
    literal
}

impl FromStr for TagPredicate {
    type Err = RelayError;

    fn from_str(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            input,
            tokens,
            position: 0,
        };
        let predicate = parser.expression()?;
        if let Some(token) = parser.peek() {
            return Err(parser.error(format!("unexpected {}", token)));
        }
        Ok(predicate)
    }
}

impl TryFrom<String> for TagPredicate {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TagPredicate> for String {
    fn from(predicate: TagPredicate) -> Self {
        predicate.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Tag,
    Equal,
    NotEqual,
    And,
    Or,
    Not,
    Open,
    Close,
    Str(String),
}

impl fmt::Display for Token {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Tag => write!(formatter, "'tag'"),
            Token::Equal => write!(formatter, "'=='"),
            Token::NotEqual => write!(formatter, "'!='"),
            Token::And => write!(formatter, "'and'"),
            Token::Or => write!(formatter, "'or'"),
            Token::Not => write!(formatter, "'not'"),
            Token::Open => write!(formatter, "'('"),
            Token::Close => write!(formatter, "')'"),
            Token::Str(value) => write!(formatter, "string {:?}", value),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let invalid = |message: String| RelayError::InvalidPredicate {
        input: input.to_string(),
        message,
    };

    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((index, ch)) = chars.next() {
        match ch {
            c if c.is_whitespace() => {}
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            '=' | '!' => match chars.next() {
                Some((_, '=')) if ch == '=' => tokens.push(Token::Equal),
                Some((_, '=')) => tokens.push(Token::NotEqual),
                _ => return Err(invalid(format!("expected '=' after '{}' at {}", ch, index))),
            },
            '"' => {
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        },
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(invalid(format!("unterminated string starting at {}", index)));
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match word.to_lowercase().as_str() {
                    "tag" => Token::Tag,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => return Err(invalid(format!("unknown word '{}'", word))),
                };
                tokens.push(token);
            }
            other => return Err(invalid(format!("unexpected character '{}' at {}", other, index))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    position: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn error(&self, message: String) -> RelayError {
        RelayError::InvalidPredicate {
            input: self.input.to_string(),
            message,
        }
    }

    fn expression(&mut self) -> Result<TagPredicate> {
        let mut left = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            left = left.or(self.term()?);
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<TagPredicate> {
        let mut left = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            left = left.and(self.factor()?);
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<TagPredicate> {
        match self.next() {
            Some(Token::Not) => Ok(self.factor()?.negate()),
            Some(Token::Open) => {
                let inner = self.expression()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(self.error("missing ')'".to_string())),
                }
            }
            Some(Token::Tag) => {
                let negated = match self.next() {
                    Some(Token::Equal) => false,
                    Some(Token::NotEqual) => true,
                    _ => return Err(self.error("expected '==' or '!=' after 'tag'".to_string())),
                };
                match self.next() {
                    Some(Token::Str(value)) if !value.is_empty() => {
                        let predicate = TagPredicate::Tag(value);
                        Ok(if negated { predicate.negate() } else { predicate })
                    }
                    Some(Token::Str(_)) => Err(self.error("empty tag".to_string())),
                    _ => Err(self.error("expected a quoted tag".to_string())),
                }
            }
            Some(token) => Err(self.error(format!("unexpected {}", token))),
            None => Err(self.error("unexpected end of input".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentKind;

    fn tagged(tags: &[&str]) -> Fragment {
        let mut builder = Fragment::builder(FragmentKind::ServerBinding, "pg1", "pg1");
        for tag in tags {
            builder = builder.tag(*tag);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_exact_match() {
        let predicate = TagPredicate::tag("barman-db");
        assert!(predicate.matches(&tagged(&["barman-db"])));
        assert!(!predicate.matches(&tagged(&["barman-db-barman"])));
        assert!(!predicate.matches(&tagged(&["barman-web"])));
    }

    #[test]
    fn test_parse_equality() {
        let predicate: TagPredicate = r#"tag == "barman-db""#.parse().unwrap();
        assert_eq!(predicate, TagPredicate::tag("barman-db"));
    }

    #[test]
    fn test_parse_precedence() {
        let predicate: TagPredicate = r#"tag == "a" or tag == "b" and not tag == "c""#
            .parse()
            .unwrap();
        let expected = TagPredicate::tag("a")
            .or(TagPredicate::tag("b").and(TagPredicate::tag("c").negate()));
        assert_eq!(predicate, expected);

        assert!(predicate.matches(&tagged(&["a", "c"])));
        assert!(predicate.matches(&tagged(&["b"])));
        assert!(!predicate.matches(&tagged(&["b", "c"])));
    }

    #[test]
    fn test_parse_not_equal_and_groups() {
        let predicate: TagPredicate = r#"(tag == "a" or tag == "b") and tag != "c""#
            .parse()
            .unwrap();
        assert!(predicate.matches(&tagged(&["b"])));
        assert!(!predicate.matches(&tagged(&["a", "c"])));
        assert!(!predicate.matches(&tagged(&["d"])));
    }

    #[test]
    fn test_display_reparses() {
        let inputs = [
            r#"tag == "barman-db""#,
            r#"tag != "x""#,
            r#"(tag == "a" or tag == "b") and not (tag == "c" and tag == "d")"#,
        ];
        for input in inputs {
            let predicate: TagPredicate = input.parse().unwrap();
            let again: TagPredicate = predicate.to_string().parse().unwrap();
            assert_eq!(predicate, again, "{}", input);
        }

        let awkward =
            TagPredicate::tag("line\nbreak").and(TagPredicate::tag(r#"q"u\te"#).negate());
        let again: TagPredicate = awkward.to_string().parse().unwrap();
        assert_eq!(again, awkward);
    }

    #[test]
    fn test_parse_errors() {
        for input in [
            "",
            "tag",
            r#"tag = "a""#,
            r#"tag == a"#,
            r#"tag == """#,
            r#"tag == "a" and"#,
            r#"(tag == "a""#,
            r#"tag == "a")"#,
            r#"label == "a""#,
            r#"tag == "open"#,
        ] {
            assert!(input.parse::<TagPredicate>().is_err(), "{}", input);
        }
    }
}
