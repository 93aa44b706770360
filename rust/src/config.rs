//! Sequence configuration handed in by the caller.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SequenceError;

/// Pattern used when a configuration does not name one.
pub const DEFAULT_PATTERN: &str = "{#}";

/// A per-segment pattern replacing the default one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentOverride {
    pub match_value: String,
    pub pattern: String,
}

impl SegmentOverride {
    pub fn new(match_value: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            match_value: match_value.into(),
            pattern: pattern.into(),
        }
    }
}

/// How numbers for one family of counters are built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceConfig {
    pub key: String,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub initial_value: i64,
    /// Static text or `{FieldName}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<SegmentOverride>,
}

fn default_pattern() -> String {
    DEFAULT_PATTERN.to_string()
}

impl SequenceConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pattern: default_pattern(),
            initial_value: 0,
            segment: None,
            overrides: Vec::new(),
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn with_initial_value(mut self, initial_value: i64) -> Self {
        self.initial_value = initial_value;
        self
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    pub fn with_override(mut self, match_value: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.overrides.push(SegmentOverride::new(match_value, pattern));
        self
    }

    pub fn validate(&self) -> Result<(), SequenceError> {
        if self.key.trim().is_empty() {
            return Err(SequenceError::InvalidConfig(
                "sequence key must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, SequenceError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, SequenceError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, SequenceError> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

/// A record field that receives generated numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceField {
    pub field: String,
    #[serde(flatten)]
    pub config: SequenceConfig,
}

impl SequenceField {
    pub fn new(field: impl Into<String>, config: SequenceConfig) -> Self {
        Self {
            field: field.into(),
            config,
        }
    }

    /// Parse either a single field object or an array of them.
    pub fn list_from_json(data: &str) -> Result<Vec<Self>, SequenceError> {
        let value: serde_json::Value = serde_json::from_str(data)?;
        let fields: Vec<Self> = if value.is_array() {
            serde_json::from_value(value)?
        } else {
            vec![serde_json::from_value(value)?]
        };
        for f in &fields {
            f.config.validate()?;
        }
        Ok(fields)
    }
}

/// Record types that declare their numbered fields up front.
///
/// ```
/// use numseq::{SequenceConfig, SequenceField, Sequenced};
///
/// struct Invoice;
///
/// impl Sequenced for Invoice {
///     fn sequence_fields() -> Vec<SequenceField> {
///         vec![SequenceField::new(
///             "number",
///             SequenceConfig::new("invoice").with_pattern("IV{Y}-{#|6|y}"),
///         )]
///     }
/// }
///
/// assert_eq!(Invoice::sequence_fields()[0].config.key, "invoice");
/// ```
pub trait Sequenced {
    fn sequence_fields() -> Vec<SequenceField>;
}
