//! Token handlers and the ordered registry that dispatches to them.
//!
//! Built-in vocabulary:
//!
//! ```text
//! {#}  {#|<width>}  {#|<width>|<y|m|w|d|h>}     counter, optional pad and reset period
//! {Y} {y} {m} {M} {d} {D} {H}                  current date parts
//! {w} {W}                                      current ISO-8601 week
//! ```
//!
//! The first registered handler whose `handles` accepts a token owns it for
//! both reset checks and rendering. A token nobody handles stays verbatim.

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::debug;

use crate::error::SequenceError;
use crate::token::Token;

/// A pluggable renderer for one family of pattern tokens.
pub trait TokenHandler: Send + Sync {
    /// Whether this handler owns `token`.
    fn handles(&self, token: &Token) -> bool;

    /// Replacement text for `token`. `value` is the freshly advanced counter.
    fn render(&self, token: &Token, value: i64, now: DateTime<Utc>) -> String;

    /// Whether the counter must go back to its initial value before advancing.
    fn requests_reset(&self, _token: &Token, _now: DateTime<Utc>) -> Result<bool, SequenceError> {
        Ok(false)
    }
}

/// Time boundary after which a counter starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPeriod {
    Year,
    Month,
    Week,
    Day,
    Hour,
}

impl ResetPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Year => "y",
            Self::Month => "m",
            Self::Week => "w",
            Self::Day => "d",
            Self::Hour => "h",
        }
    }

    /// Case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "y" => Some(Self::Year),
            "m" => Some(Self::Month),
            "w" => Some(Self::Week),
            "d" => Some(Self::Day),
            "h" => Some(Self::Hour),
            _ => None,
        }
    }

    /// Whether `last` and `now` fall into different periods.
    ///
    /// The week rule pairs the ISO week number with the calendar year, so
    /// Dec 29 and Jan 1 of the same ISO week still count as a crossing.
    pub fn crossed(self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Year => last.year() != now.year(),
            Self::Month => last.year() != now.year() || last.month() != now.month(),
            Self::Week => {
                last.iso_week().week() != now.iso_week().week() || last.year() != now.year()
            }
            Self::Day => last.date_naive() != now.date_naive(),
            Self::Hour => last.date_naive() != now.date_naive() || last.hour() != now.hour(),
        }
    }
}

/// Widest zero padding `{#|<width>}` honors; wider requests render unpadded.
pub const MAX_PAD_WIDTH: usize = 255;

/// `{#}`: the counter value, zero-padded, with an optional reset period.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterHandler;

impl CounterHandler {
    fn pad_width(token: &Token) -> usize {
        token
            .parameter(0)
            .and_then(|p| p.trim().parse::<usize>().ok())
            .filter(|w| *w <= MAX_PAD_WIDTH)
            .unwrap_or(0)
    }
}

impl TokenHandler for CounterHandler {
    fn handles(&self, token: &Token) -> bool {
        token.identifier == "#"
    }

    fn render(&self, token: &Token, value: i64, _now: DateTime<Utc>) -> String {
        let width = Self::pad_width(token);
        let digits = format!("{:0width$}", value.unsigned_abs(), width = width);
        if value < 0 {
            format!("-{}", digits)
        } else {
            digits
        }
    }

    fn requests_reset(&self, token: &Token, now: DateTime<Utc>) -> Result<bool, SequenceError> {
        let Some(context) = token.parameter(1) else {
            return Ok(false);
        };
        let period = ResetPeriod::parse(context)
            .ok_or_else(|| SequenceError::InvalidResetContext(context.to_string()))?;
        Ok(period.crossed(token.reset_reference, now))
    }
}

/// Date parts of the current instant.
#[derive(Debug, Default, Clone, Copy)]
pub struct DateHandler;

impl DateHandler {
    fn format_for(identifier: &str) -> Option<&'static str> {
        match identifier {
            "Y" => Some("%Y"),
            "y" => Some("%y"),
            "m" => Some("%m"),
            "M" => Some("%b"),
            "d" => Some("%d"),
            "D" => Some("%a"),
            "H" => Some("%H"),
            _ => None,
        }
    }
}

impl TokenHandler for DateHandler {
    fn handles(&self, token: &Token) -> bool {
        Self::format_for(&token.identifier).is_some()
    }

    fn render(&self, token: &Token, _value: i64, now: DateTime<Utc>) -> String {
        match Self::format_for(&token.identifier) {
            Some(fmt) => now.format(fmt).to_string(),
            None => token.source.clone(),
        }
    }
}

/// `{w}` / `{W}`: ISO-8601 week of the current instant.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeekHandler;

impl TokenHandler for WeekHandler {
    fn handles(&self, token: &Token) -> bool {
        matches!(token.identifier.as_str(), "w" | "W")
    }

    fn render(&self, _token: &Token, _value: i64, now: DateTime<Utc>) -> String {
        format!("{:02}", now.iso_week().week())
    }
}

/// Ordered handler list, first match wins.
pub struct TokenHandlerRegistry {
    handlers: Vec<Box<dyn TokenHandler>>,
}

impl TokenHandlerRegistry {
    /// A registry with no handlers; every token passes through.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Append a handler after the ones already registered.
    pub fn register<H: TokenHandler + 'static>(&mut self, handler: H) -> &mut Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn with<H: TokenHandler + 'static>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handler_for(&self, token: &Token) -> Option<&dyn TokenHandler> {
        self.handlers
            .iter()
            .find(|h| h.handles(token))
            .map(|h| h.as_ref())
    }

    /// Whether any token asks for a reset.
    ///
    /// Every token is checked so an invalid reset context always surfaces,
    /// even when an earlier token already asked for a reset.
    pub fn requests_reset(&self, tokens: &[Token], now: DateTime<Utc>) -> Result<bool, SequenceError> {
        let mut reset = false;
        for token in tokens {
            if let Some(handler) = self.handler_for(token) {
                reset |= handler.requests_reset(token, now)?;
            }
        }
        Ok(reset)
    }

    /// Check every handled token without asking for a reset decision.
    pub fn validate(&self, tokens: &[Token]) -> Result<(), SequenceError> {
        for token in tokens {
            if let Some(handler) = self.handler_for(token) {
                handler.requests_reset(token, token.reset_reference)?;
            }
        }
        Ok(())
    }

    /// Substitute every handled token of `pattern`.
    pub fn render(&self, pattern: &str, tokens: &[Token], value: i64, now: DateTime<Utc>) -> String {
        let mut result = pattern.to_string();
        for token in tokens {
            match self.handler_for(token) {
                Some(handler) => {
                    let rendered = handler.render(token, value, now);
                    result = result.replace(&token.source, &rendered);
                }
                None => debug!(token = %token.source, "no handler, leaving token verbatim"),
            }
        }
        result
    }
}

impl Default for TokenHandlerRegistry {
    /// Counter, date and week handlers, in that order.
    fn default() -> Self {
        Self::new()
            .with(CounterHandler)
            .with(DateHandler)
            .with(WeekHandler)
    }
}
