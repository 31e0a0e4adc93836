//! Condition evaluation
//!
//! Every condition resolves to one of three outcomes. `Indeterminate` covers
//! a missing fresh value or a failed capability query and never fires an
//! action chain. `NoneFound` is the exact complement of having a fresh value,
//! so it can never agree with a plain threshold on the same input.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::data::{ConditionKind, Direction, MeasurementRef};
use crate::hw::{Actuator, PinReader};
use crate::measurement::MeasurementStore;

/// Outcome of one condition evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Triggered,
    NotTriggered,
    Indeterminate,
}

impl RuleOutcome {
    pub fn is_triggered(self) -> bool {
        self == Self::Triggered
    }

    fn from_bool(value: bool) -> Self {
        if value {
            Self::Triggered
        } else {
            Self::NotTriggered
        }
    }
}

/// Outcome plus the value it was decided on (if any)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleEvaluation {
    pub outcome: RuleOutcome,
    pub observed: Option<f64>,
}

impl RuleEvaluation {
    fn new(outcome: RuleOutcome, observed: Option<f64>) -> Self {
        Self { outcome, observed }
    }

    fn indeterminate() -> Self {
        Self::new(RuleOutcome::Indeterminate, None)
    }
}

/// Activation state lookups for `ControllerActive` conditions
pub trait ControllerStatus: Send + Sync {
    /// `None` when the controller is unknown
    fn is_active(&self, controller_id: &str) -> Option<bool>;
}

/// Capabilities a condition may consult
#[derive(Clone, Copy)]
pub struct RuleContext<'a> {
    pub store: &'a dyn MeasurementStore,
    pub actuator: &'a dyn Actuator,
    pub pins: Option<&'a dyn PinReader>,
    pub controllers: &'a dyn ControllerStatus,
}

pub fn evaluate(condition: &ConditionKind, ctx: &RuleContext<'_>) -> RuleEvaluation {
    evaluate_at(condition, ctx, Utc::now())
}

/// Evaluate `condition` as of `now`
pub fn evaluate_at(condition: &ConditionKind, ctx: &RuleContext<'_>, now: DateTime<Utc>) -> RuleEvaluation {
    match condition {
        ConditionKind::Measurement { source, direction, setpoint, max_age_sec } => {
            let latest = ctx.store.read_latest_at(source, *max_age_sec, now).map(|s| s.value);
            threshold(*direction, latest, *setpoint)
        }
        ConditionKind::MeasurementPastAverage { source, direction, setpoint, max_age_sec } => {
            let window = window_values(ctx, source, *max_age_sec, now);
            let average = (!window.is_empty()).then(|| window.iter().sum::<f64>() / window.len() as f64);
            threshold(*direction, average, *setpoint)
        }
        ConditionKind::MeasurementPastSum { source, direction, setpoint, max_age_sec } => {
            let window = window_values(ctx, source, *max_age_sec, now);
            let sum = (!window.is_empty()).then(|| window.iter().sum::<f64>());
            threshold(*direction, sum, *setpoint)
        }
        ConditionKind::MeasurementMissing { source, max_age_sec } => {
            let latest = ctx.store.read_latest_at(source, *max_age_sec, now).map(|s| s.value);
            threshold(Direction::NoneFound, latest, 0.0)
        }
        ConditionKind::PinState { device_id, pin, state } => {
            let Some(pins) = ctx.pins else {
                debug!("RULE: No pin reader for {} pin {}", device_id, pin);
                return RuleEvaluation::indeterminate();
            };
            match pins.read(device_id, *pin) {
                Ok(level) => RuleEvaluation::new(RuleOutcome::from_bool(level == *state), Some(bool_value(level))),
                Err(e) => {
                    debug!("RULE: Pin {} of {} unreadable: {}", pin, device_id, e);
                    RuleEvaluation::indeterminate()
                }
            }
        }
        ConditionKind::OutputState { device_id, channel, state } => match ctx.actuator.state(device_id, *channel) {
            Ok(s) => RuleEvaluation::new(RuleOutcome::from_bool(s.on == *state), Some(bool_value(s.on))),
            Err(e) => {
                debug!("RULE: Output {} CH{} state unavailable: {}", device_id, channel, e);
                RuleEvaluation::indeterminate()
            }
        },
        ConditionKind::OutputDurationOn { device_id, channel, direction, setpoint_sec } => {
            match ctx.actuator.state(device_id, *channel) {
                Ok(s) => {
                    let on_for = s.on_duration_sec(now);
                    RuleEvaluation::new(RuleOutcome::from_bool(direction.compare(on_for, *setpoint_sec)), Some(on_for))
                }
                Err(e) => {
                    debug!("RULE: Output {} CH{} state unavailable: {}", device_id, channel, e);
                    RuleEvaluation::indeterminate()
                }
            }
        }
        ConditionKind::ControllerActive { controller_id, active } => match ctx.controllers.is_active(controller_id) {
            Some(is_active) => RuleEvaluation::new(RuleOutcome::from_bool(is_active == *active), Some(bool_value(is_active))),
            None => RuleEvaluation::indeterminate(),
        },
    }
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn window_values(ctx: &RuleContext<'_>, source: &MeasurementRef, max_age_sec: f64, now: DateTime<Utc>) -> Vec<f64> {
    ctx.store
        .read_range_at(source, max_age_sec, now)
        .into_iter()
        .map(|s| s.value)
        .collect()
}

fn threshold(direction: Direction, value: Option<f64>, setpoint: f64) -> RuleEvaluation {
    match (direction, value) {
        (Direction::NoneFound, None) => RuleEvaluation::new(RuleOutcome::Triggered, None),
        (Direction::NoneFound, Some(v)) => RuleEvaluation::new(RuleOutcome::NotTriggered, Some(v)),
        (_, None) => RuleEvaluation::indeterminate(),
        (dir, Some(v)) => RuleEvaluation::new(RuleOutcome::from_bool(dir.compare(v, setpoint)), Some(v)),
    }
}

/// Human readable summary used as the start of a chain message
pub fn describe(condition: &ConditionKind, evaluation: &RuleEvaluation) -> String {
    let observed = evaluation
        .observed
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| "no value".to_string());
    match condition {
        ConditionKind::Measurement { source, direction, setpoint, max_age_sec } => match direction {
            Direction::NoneFound => format!("No measurement of {} in the last {}s.", source, max_age_sec),
            _ => format!("Measurement {} = {} ({} {}).", source, observed, direction.as_str(), setpoint),
        },
        ConditionKind::MeasurementPastAverage { source, direction, setpoint, max_age_sec } => format!(
            "Average of {} over {}s = {} ({} {}).",
            source,
            max_age_sec,
            observed,
            direction.as_str(),
            setpoint
        ),
        ConditionKind::MeasurementPastSum { source, direction, setpoint, max_age_sec } => format!(
            "Sum of {} over {}s = {} ({} {}).",
            source,
            max_age_sec,
            observed,
            direction.as_str(),
            setpoint
        ),
        ConditionKind::MeasurementMissing { source, max_age_sec } => {
            format!("No measurement of {} in the last {}s.", source, max_age_sec)
        }
        ConditionKind::PinState { device_id, pin, state } => {
            format!("Pin {} of {} is {}.", pin, device_id, if *state { "high" } else { "low" })
        }
        ConditionKind::OutputState { device_id, channel, state } => {
            format!("Output {} CH{} is {}.", device_id, channel, if *state { "on" } else { "off" })
        }
        ConditionKind::OutputDurationOn { device_id, channel, direction, setpoint_sec } => format!(
            "Output {} CH{} on for {}s ({} {}s).",
            device_id,
            channel,
            observed,
            direction.as_str(),
            setpoint_sec
        ),
        ConditionKind::ControllerActive { controller_id, active } => format!(
            "Controller {} is {}.",
            controller_id,
            if *active { "active" } else { "inactive" }
        ),
    }
}
