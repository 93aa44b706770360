//! Pattern tokenization.
//!
//! A pattern is literal text with bracketed placeholders:
//!
//! ```text
//! PATTERN ::= { TEXT | "{" IDENT { "|" PARAM } "}" }
//! ```
//!
//! `IV{Y}-{#|6|y}` yields two tokens, `Y` and `#` with parameters `["6", "y"]`.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// One parsed placeholder of a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub identifier: String,
    pub parameters: Vec<String>,
    /// Exact text to replace, braces included (e.g. `{#|6|y}`).
    pub source: String,
    /// Last advance of the owning counter.
    pub reset_reference: DateTime<Utc>,
}

impl Token {
    /// Build a token from the body between the braces.
    pub fn from_body(body: &str, reset_reference: DateTime<Utc>) -> Self {
        let mut parts = body.split('|').map(str::to_string);
        let identifier = parts.next().unwrap_or_default();
        Self {
            identifier,
            parameters: parts.collect(),
            source: format!("{{{}}}", body),
            reset_reference,
        }
    }

    pub fn parameter(&self, index: usize) -> Option<&str> {
        self.parameters.get(index).map(String::as_str)
    }
}

// Lazy and newline-free: an unclosed brace stays literal text.
static TOKEN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(.*?)\}").unwrap());

/// Split a pattern into its tokens, left to right.
///
/// Every token shares `reset_reference`. Malformed braces never fail, they
/// simply produce no token.
pub fn tokenize(pattern: &str, reset_reference: DateTime<Utc>) -> Vec<Token> {
    TOKEN_PATTERN
        .captures_iter(pattern)
        .map(|caps| {
            let body = caps.get(1).map_or("", |m| m.as_str());
            Token::from_body(body, reset_reference)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 15, 0).unwrap()
    }

    fn identifiers(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|t| t.identifier.as_str()).collect()
    }

    #[test]
    fn test_simple_counter() {
        let tokens = tokenize("{#}", reference());
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].identifier, "#");
        assert!(tokens[0].parameters.is_empty());
        assert_eq!(tokens[0].source, "{#}");
    }

    #[test]
    fn test_parameters_in_order() {
        let tokens = tokenize("{#|6|y}", reference());
        assert_eq!(tokens[0].parameters, vec!["6", "y"]);
        assert_eq!(tokens[0].parameter(0), Some("6"));
        assert_eq!(tokens[0].parameter(1), Some("y"));
        assert_eq!(tokens[0].parameter(2), None);
    }

    #[test]
    fn test_complex_patterns() {
        let tokens = tokenize("IV{Y}-{#|6|y}", reference());
        assert_eq!(identifiers(&tokens), vec!["Y", "#"]);
        assert_eq!(tokens[1].source, "{#|6|y}");

        let tokens = tokenize("DOC-{y}{m}{d}-{#|5}", reference());
        assert_eq!(identifiers(&tokens), vec!["y", "m", "d", "#"]);
    }

    #[test]
    fn test_shared_reset_reference() {
        let tokens = tokenize("{Y}{#|4|m}", reference());
        assert!(tokens.iter().all(|t| t.reset_reference == reference()));
    }

    #[test]
    fn test_malformed_braces_are_literal() {
        assert!(tokenize("KD-000", reference()).is_empty());
        assert!(tokenize("open { only", reference()).is_empty());
        assert!(tokenize("} reversed {", reference()).is_empty());

        let tokens = tokenize("A{#|3", reference());
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_empty_body_and_nested_open_brace() {
        let tokens = tokenize("{}", reference());
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].identifier, "");
        assert_eq!(tokens[0].source, "{}");

        // First closing brace wins.
        let tokens = tokenize("{a{b}c}", reference());
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].identifier, "a{b");
    }

    #[test]
    fn test_unknown_identifiers_are_tokens() {
        let tokens = tokenize("X-{foo|bar}", reference());
        assert_eq!(tokens[0].identifier, "foo");
        assert_eq!(tokens[0].parameters, vec!["bar"]);
    }
}
