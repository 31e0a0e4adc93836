//! Derived-value computations for Math controllers
//!
//! Pure functions over already-fresh input values. The Math worker binds a
//! [`Formula`] once per configuration, gathers inputs from the store, decides
//! whether the tick can proceed, and calls [`Formula::compute`].

use vd_error::{Result, VerdantError};

use crate::data::{BoundOptions, DefaultValue, MathKind, OptionKind, OptionSpec};
use crate::measurement::Expression;

const NO_OPTIONS: &[OptionSpec] = &[];

const DIFFERENCE_OPTIONS: &[OptionSpec] = &[OptionSpec::optional(
    "absolute",
    OptionKind::Bool,
    DefaultValue::Bool(false),
)];

const VERIFICATION_OPTIONS: &[OptionSpec] = &[OptionSpec::required(
    "max_difference",
    OptionKind::Float { min: Some(0.0), max: None },
)];

const EQUATION_OPTIONS: &[OptionSpec] = &[OptionSpec::required("equation", OptionKind::Text)];

/// Custom options accepted by a math kind
pub fn option_schema(kind: MathKind) -> &'static [OptionSpec] {
    match kind {
        MathKind::Difference => DIFFERENCE_OPTIONS,
        MathKind::Verification => VERIFICATION_OPTIONS,
        MathKind::Equation => EQUATION_OPTIONS,
        _ => NO_OPTIONS,
    }
}

/// Allowed number of inputs as (min, max)
pub fn input_bounds(kind: MathKind) -> (usize, Option<usize>) {
    match kind {
        MathKind::Difference | MathKind::DewPoint | MathKind::VaporPressureDeficit => (2, Some(2)),
        MathKind::Verification => (2, None),
        MathKind::Equation => (1, Some(1)),
        _ => (1, None),
    }
}

/// A math kind with its options bound and its equation, if any, parsed
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    kind: MathKind,
    options: BoundOptions,
    equation: Option<Expression>,
}

impl Formula {
    pub fn new(kind: MathKind, options: BoundOptions) -> Result<Self> {
        let equation = match kind {
            MathKind::Equation => {
                let source = options
                    .text("equation")
                    .ok_or_else(|| VerdantError::config("equation option missing"))?;
                let expression =
                    Expression::parse(source).map_err(|e| VerdantError::invalid_config("equation", e.to_string()))?;
                Some(expression)
            }
            _ => None,
        };
        Ok(Self { kind, options, equation })
    }

    pub fn kind(&self) -> MathKind {
        self.kind
    }

    /// Compute the derived value
    ///
    /// `inputs` are the fresh values in configured order. Redundancy receives
    /// the first fresh input; every other kind requires all inputs.
    pub fn compute(&self, inputs: &[f64]) -> Result<f64> {
        if inputs.is_empty() {
            return Err(VerdantError::generic("no inputs"));
        }
        let value = match self.kind {
            MathKind::Average => inputs.iter().sum::<f64>() / inputs.len() as f64,
            MathKind::Sum => inputs.iter().sum(),
            MathKind::Min => inputs.iter().copied().fold(f64::INFINITY, f64::min),
            MathKind::Max => inputs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            MathKind::Median => median(inputs),
            MathKind::Difference => {
                let [a, b] = pair(inputs)?;
                if self.options.bool("absolute").unwrap_or(false) {
                    (a - b).abs()
                } else {
                    a - b
                }
            }
            MathKind::Verification => {
                let max_difference = self
                    .options
                    .f64("max_difference")
                    .ok_or_else(|| VerdantError::config("verification requires max_difference"))?;
                let lo = inputs.iter().copied().fold(f64::INFINITY, f64::min);
                let hi = inputs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if hi - lo > max_difference {
                    return Err(VerdantError::generic(format!(
                        "inputs differ by {:.3}, more than {}",
                        hi - lo,
                        max_difference
                    )));
                }
                inputs.iter().sum::<f64>() / inputs.len() as f64
            }
            MathKind::Equation => match &self.equation {
                Some(expression) => expression.eval(inputs[0]),
                None => return Err(VerdantError::config("equation option missing")),
            },
            MathKind::DewPoint => {
                let [temperature, humidity] = pair(inputs)?;
                dew_point(temperature, humidity)?
            }
            MathKind::VaporPressureDeficit => {
                let [temperature, humidity] = pair(inputs)?;
                vapor_pressure_deficit(temperature, humidity)?
            }
            MathKind::Redundancy => inputs[0],
        };
        if !value.is_finite() {
            return Err(VerdantError::generic("result is not finite"));
        }
        Ok(value)
    }
}

fn pair(inputs: &[f64]) -> Result<[f64; 2]> {
    match inputs {
        [a, b] => Ok([*a, *b]),
        _ => Err(VerdantError::generic(format!("expected 2 inputs, got {}", inputs.len()))),
    }
}

fn median(inputs: &[f64]) -> f64 {
    let mut sorted = inputs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn check_humidity(humidity: f64) -> Result<()> {
    if humidity <= 0.0 || humidity > 100.0 {
        return Err(VerdantError::generic(format!("relative humidity {} out of range", humidity)));
    }
    Ok(())
}

/// Dew point in °C (Magnus formula) from °C and %RH
pub fn dew_point(temperature_c: f64, humidity_pct: f64) -> Result<f64> {
    check_humidity(humidity_pct)?;
    const A: f64 = 17.62;
    const B: f64 = 243.12;
    let gamma = (humidity_pct / 100.0).ln() + A * temperature_c / (B + temperature_c);
    Ok(B * gamma / (A - gamma))
}

/// Vapor pressure deficit in kPa from °C and %RH
pub fn vapor_pressure_deficit(temperature_c: f64, humidity_pct: f64) -> Result<f64> {
    check_humidity(humidity_pct)?;
    let saturation = 0.6108 * (17.27 * temperature_c / (temperature_c + 237.3)).exp();
    Ok(saturation * (1.0 - humidity_pct / 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bind_options;
    use serde_json::{json, Map, Value};

    fn bound(kind: MathKind, v: Value) -> BoundOptions {
        let map: Map<String, Value> = v.as_object().cloned().unwrap_or_default();
        bind_options("math", option_schema(kind), &map).unwrap()
    }

    fn calc(kind: MathKind, inputs: &[f64], options: &BoundOptions) -> Result<f64> {
        Formula::new(kind, options.clone())?.compute(inputs)
    }

    #[test]
    fn test_basic_aggregates() {
        let none = BoundOptions::default();
        let inputs = [3.0, 1.0, 2.0, 6.0];
        assert_eq!(calc(MathKind::Average, &inputs, &none).unwrap(), 3.0);
        assert_eq!(calc(MathKind::Sum, &inputs, &none).unwrap(), 12.0);
        assert_eq!(calc(MathKind::Min, &inputs, &none).unwrap(), 1.0);
        assert_eq!(calc(MathKind::Max, &inputs, &none).unwrap(), 6.0);
        assert_eq!(calc(MathKind::Median, &inputs, &none).unwrap(), 2.5);
        assert_eq!(calc(MathKind::Median, &[5.0, 1.0, 9.0], &none).unwrap(), 5.0);
        assert_eq!(calc(MathKind::Redundancy, &[7.0], &none).unwrap(), 7.0);
    }

    #[test]
    fn test_difference_absolute() {
        let signed = bound(MathKind::Difference, json!({}));
        let abs = bound(MathKind::Difference, json!({"absolute": true}));
        assert_eq!(calc(MathKind::Difference, &[1.0, 4.0], &signed).unwrap(), -3.0);
        assert_eq!(calc(MathKind::Difference, &[1.0, 4.0], &abs).unwrap(), 3.0);
    }

    #[test]
    fn test_verification_rejects_disagreement() {
        let opts = bound(MathKind::Verification, json!({"max_difference": 1.0}));
        assert_eq!(calc(MathKind::Verification, &[20.0, 20.5], &opts).unwrap(), 20.25);
        assert!(calc(MathKind::Verification, &[20.0, 22.0], &opts).is_err());
    }

    #[test]
    fn test_equation() {
        let opts = bound(MathKind::Equation, json!({"equation": "x * 2 + 1"}));
        assert_eq!(calc(MathKind::Equation, &[4.0], &opts).unwrap(), 9.0);
    }

    #[test]
    fn test_equation_parsed_once_when_bound() {
        let opts = bound(MathKind::Equation, json!({"equation": "(x - 12) / 2"}));
        let formula = Formula::new(MathKind::Equation, opts).unwrap();
        assert_eq!(formula.kind(), MathKind::Equation);
        assert_eq!(formula.compute(&[212.0]).unwrap(), 100.0);
        assert_eq!(formula.compute(&[12.0]).unwrap(), 0.0);

        let broken = bound(MathKind::Equation, json!({"equation": "x * (2"}));
        assert!(Formula::new(MathKind::Equation, broken).unwrap_err().is_configuration());
    }

    #[test]
    fn test_dew_point_and_vpd() {
        let dp = dew_point(25.0, 60.0).unwrap();
        assert!((dp - 16.69).abs() < 0.05, "dew point {}", dp);
        let vpd = vapor_pressure_deficit(25.0, 60.0).unwrap();
        assert!((vpd - 1.267).abs() < 0.01, "vpd {}", vpd);
        assert!(dew_point(25.0, 0.0).is_err());
        assert!(vapor_pressure_deficit(25.0, 120.0).is_err());
    }

    #[test]
    fn test_input_bounds() {
        assert_eq!(input_bounds(MathKind::DewPoint), (2, Some(2)));
        assert_eq!(input_bounds(MathKind::Average), (1, None));
    }
}
