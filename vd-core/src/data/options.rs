//! Custom option binding
//!
//! Drivers and math kinds declare the free-form options they accept as a
//! static schema. Options are validated once at load time and exposed through
//! typed getters, so a misconfigured option fails controller startup instead
//! of surfacing mid-measurement.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use vd_error::{Result, VerdantError};

/// The kind (and bounds) of one option
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionKind {
    Float { min: Option<f64>, max: Option<f64> },
    Integer { min: Option<i64>, max: Option<i64> },
    Bool,
    Text,
    Select(&'static [&'static str]),
}

/// One declared option
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub key: &'static str,
    pub kind: OptionKind,
    pub required: bool,
    pub default: Option<DefaultValue>,
}

/// Compile-time default for an option
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Float(f64),
    Integer(i64),
    Bool(bool),
    Text(&'static str),
}

impl OptionSpec {
    pub const fn required(key: &'static str, kind: OptionKind) -> Self {
        Self { key, kind, required: true, default: None }
    }

    pub const fn optional(key: &'static str, kind: OptionKind, default: DefaultValue) -> Self {
        Self { key, kind, required: false, default: Some(default) }
    }
}

/// A validated option value
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Float(f64),
    Integer(i64),
    Bool(bool),
    Text(String),
}

impl From<DefaultValue> for OptionValue {
    fn from(d: DefaultValue) -> Self {
        match d {
            DefaultValue::Float(v) => Self::Float(v),
            DefaultValue::Integer(v) => Self::Integer(v),
            DefaultValue::Bool(v) => Self::Bool(v),
            DefaultValue::Text(v) => Self::Text(v.to_string()),
        }
    }
}

/// Options after validation against a schema
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundOptions {
    values: BTreeMap<&'static str, OptionValue>,
}

impl BoundOptions {
    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            OptionValue::Float(v) => Some(*v),
            OptionValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            OptionValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            OptionValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            OptionValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Validate `options` against `schema`
///
/// `owner` is used in error messages (e.g. the controller id).
pub fn bind_options(owner: &str, schema: &[OptionSpec], options: &Map<String, Value>) -> Result<BoundOptions> {
    for key in options.keys() {
        if !schema.iter().any(|s| s.key == key) {
            return Err(VerdantError::invalid_config(
                format!("{}.{}", owner, key),
                "unknown option",
            ));
        }
    }

    let mut bound = BoundOptions::default();
    for spec in schema {
        let field = format!("{}.{}", owner, spec.key);
        let value = match options.get(spec.key) {
            Some(Value::Null) | None => {
                if let Some(default) = spec.default {
                    bound.values.insert(spec.key, default.into());
                    continue;
                }
                if spec.required {
                    return Err(VerdantError::invalid_config(field, "required option missing"));
                }
                continue;
            }
            Some(v) => v,
        };
        bound.values.insert(spec.key, coerce(&field, spec.kind, value)?);
    }
    Ok(bound)
}

fn coerce(field: &str, kind: OptionKind, value: &Value) -> Result<OptionValue> {
    match kind {
        OptionKind::Float { min, max } => {
            let v = value
                .as_f64()
                .ok_or_else(|| VerdantError::invalid_config(field, "expected a number"))?;
            if !v.is_finite() {
                return Err(VerdantError::invalid_config(field, "must be finite"));
            }
            if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
                return Err(VerdantError::invalid_config(field, format!("{} out of range", v)));
            }
            Ok(OptionValue::Float(v))
        }
        OptionKind::Integer { min, max } => {
            let v = value
                .as_i64()
                .ok_or_else(|| VerdantError::invalid_config(field, "expected an integer"))?;
            if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
                return Err(VerdantError::invalid_config(field, format!("{} out of range", v)));
            }
            Ok(OptionValue::Integer(v))
        }
        OptionKind::Bool => value
            .as_bool()
            .map(OptionValue::Bool)
            .ok_or_else(|| VerdantError::invalid_config(field, "expected true or false")),
        OptionKind::Text => value
            .as_str()
            .map(|s| OptionValue::Text(s.to_string()))
            .ok_or_else(|| VerdantError::invalid_config(field, "expected a string")),
        OptionKind::Select(choices) => {
            let s = value
                .as_str()
                .ok_or_else(|| VerdantError::invalid_config(field, "expected a string"))?;
            if !choices.contains(&s) {
                return Err(VerdantError::invalid_config(
                    field,
                    format!("'{}' is not one of {:?}", s, choices),
                ));
            }
            Ok(OptionValue::Text(s.to_string()))
        }
    }
}
