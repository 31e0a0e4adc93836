//! Unit conversion resolver
//!
//! Maps a raw value through a configured conversion equation. Conversions are
//! single hop: a (from, to) unit pair resolves to zero or one conversion, so
//! no chain of conversions (and therefore no cycle) is ever followed.

use std::collections::HashMap;

use tracing::debug;
use vd_error::{Result, VerdantError};

use super::expression::Expression;
use crate::data::Conversion;

#[derive(Debug, Clone)]
struct Compiled {
    conversion: Conversion,
    expression: Expression,
}

/// Compiled conversions indexed by id and by unit pair
#[derive(Debug, Clone, Default)]
pub struct ConversionResolver {
    by_id: HashMap<String, Compiled>,
    by_units: HashMap<(String, String), String>,
}

impl ConversionResolver {
    /// Compile every conversion, rejecting malformed equations, identity
    /// conversions and duplicate unit pairs
    pub fn new(conversions: &[Conversion]) -> Result<Self> {
        let mut resolver = Self::default();
        for conversion in conversions {
            if conversion.from_unit == conversion.to_unit {
                return Err(VerdantError::conversion(
                    &conversion.id,
                    format!("from and to unit are both '{}'", conversion.from_unit),
                ));
            }
            let expression = Expression::parse(&conversion.equation).map_err(|e| {
                VerdantError::conversion(&conversion.id, format!("malformed equation '{}': {}", conversion.equation, e))
            })?;
            if !expression.uses_variable() {
                return Err(VerdantError::conversion(
                    &conversion.id,
                    "equation does not depend on x",
                ));
            }
            let pair = (conversion.from_unit.clone(), conversion.to_unit.clone());
            if let Some(existing) = resolver.by_units.get(&pair) {
                return Err(VerdantError::conversion(
                    &conversion.id,
                    format!("unit pair {} -> {} already handled by {}", pair.0, pair.1, existing),
                ));
            }
            if resolver.by_id.contains_key(&conversion.id) {
                return Err(VerdantError::conversion(&conversion.id, "duplicate conversion id"));
            }
            resolver.by_units.insert(pair, conversion.id.clone());
            resolver.by_id.insert(
                conversion.id.clone(),
                Compiled { conversion: conversion.clone(), expression },
            );
        }
        debug!("Compiled {} unit conversions", resolver.by_id.len());
        Ok(resolver)
    }

    /// Evaluate conversion `id` for a raw value
    pub fn convert(&self, id: &str, raw: f64) -> Result<f64> {
        let compiled = self
            .by_id
            .get(id)
            .ok_or_else(|| VerdantError::conversion(id, "unknown conversion"))?;
        let value = compiled.expression.eval(raw);
        if !value.is_finite() {
            return Err(VerdantError::conversion(
                id,
                format!("'{}' is not finite for x = {}", compiled.expression.source(), raw),
            ));
        }
        Ok(value)
    }

    /// Convert between two units; identical units pass through unchanged
    pub fn convert_units(&self, from: &str, to: &str, value: f64) -> Result<f64> {
        if from == to {
            return Ok(value);
        }
        let id = self
            .by_units
            .get(&(from.to_string(), to.to_string()))
            .ok_or_else(|| VerdantError::conversion(format!("{}->{}", from, to), "unknown unit pair"))?;
        self.convert(id, value)
    }

    /// Target unit of conversion `id`
    pub fn target_unit(&self, id: &str) -> Option<&str> {
        self.by_id.get(id).map(|c| c.conversion.to_unit.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }
}
