//! Segment resolution against a record's field values.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::config::{SegmentOverride, SequenceConfig};
use crate::error::SequenceError;

/// Named field access on a record.
///
/// Implemented once per record type. `field` distinguishes a field that does
/// not exist (`Err(UnknownField)`) from one that exists but holds nothing
/// (`Ok(None)`).
pub trait FieldAccess {
    fn field(&self, name: &str) -> Result<Option<String>, SequenceError>;
    fn set_field(&mut self, name: &str, value: String) -> Result<(), SequenceError>;
}

/// A plain string record, handy for dynamic callers and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    fields: BTreeMap<String, Option<String>>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), Some(value.into()));
        self
    }

    /// Declare a field that exists but holds no value.
    pub fn with_empty(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), None);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_deref())
    }
}

impl FieldAccess for FieldMap {
    fn field(&self, name: &str) -> Result<Option<String>, SequenceError> {
        self.fields
            .get(name)
            .cloned()
            .ok_or_else(|| SequenceError::UnknownField(name.to_string()))
    }

    fn set_field(&mut self, name: &str, value: String) -> Result<(), SequenceError> {
        match self.fields.get_mut(name) {
            Some(slot) => {
                *slot = Some(value);
                Ok(())
            }
            None => Err(SequenceError::UnknownField(name.to_string())),
        }
    }
}

impl FieldAccess for Map<String, Value> {
    fn field(&self, name: &str) -> Result<Option<String>, SequenceError> {
        match self.get(name) {
            None => Err(SequenceError::UnknownField(name.to_string())),
            Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Ok(Some(other.to_string())),
        }
    }

    fn set_field(&mut self, name: &str, value: String) -> Result<(), SequenceError> {
        match self.get_mut(name) {
            Some(slot) if slot.is_null() || slot.is_string() => {
                *slot = Value::String(value);
                Ok(())
            }
            Some(other) => Err(SequenceError::FieldAccess {
                field: name.to_string(),
                reason: format!("expected a string slot, found {}", other),
            }),
            None => Err(SequenceError::UnknownField(name.to_string())),
        }
    }
}

static FIELD_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").unwrap());

/// Resolve the segment of `config` for `record`.
///
/// `None` means unsegmented. An expression without placeholders is returned
/// as-is; a placeholder naming a missing field aborts with `UnknownField`.
pub fn resolve_segment_value<R>(record: &R, config: &SequenceConfig) -> Result<Option<String>, SequenceError>
where
    R: FieldAccess + ?Sized,
{
    let expression = match config.segment.as_deref() {
        None | Some("") => return Ok(None),
        Some(e) => e,
    };

    let mut resolved = String::with_capacity(expression.len());
    let mut last = 0;
    for caps in FIELD_PLACEHOLDER.captures_iter(expression) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        resolved.push_str(&expression[last..whole.start()]);
        resolved.push_str(&record.field(name.as_str())?.unwrap_or_default());
        last = whole.end();
    }
    resolved.push_str(&expression[last..]);

    Ok(Some(resolved))
}

/// First override whose match value equals `segment_value`.
pub fn resolve_override<'a>(
    config: &'a SequenceConfig,
    segment_value: Option<&str>,
) -> Option<&'a SegmentOverride> {
    let value = segment_value?;
    config.overrides.iter().find(|o| o.match_value == value)
}
