//! Configuration validation
//!
//! Checks are split in two. Document checks (unique ids, channel layout,
//! conversions, settings) must pass for a snapshot to be used at all.
//! Controller checks cover one controller and its conditions and actions; a
//! failure there only keeps that controller from starting.

use std::collections::HashSet;

use vd_error::{Result, VerdantError};

use super::options::bind_options;
use super::types::{ActionKind, Controller, ControllerKind, PidOutputMode, TriggerKind, VerdantConfig};
use crate::constants::timing;
use crate::engine::{math, schedule};
use crate::hw::DriverRegistry;
use crate::measurement::ConversionResolver;

fn unique_ids<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(VerdantError::invalid_config(kind, "empty id"));
        }
        if !seen.insert(id) {
            return Err(VerdantError::invalid_config(format!("{}.{}", kind, id), "duplicate id"));
        }
    }
    Ok(())
}

fn check_period(field: &str, period_sec: f64) -> Result<()> {
    if !period_sec.is_finite() || period_sec < timing::MIN_PERIOD_SEC {
        return Err(VerdantError::invalid_config(
            field,
            format!("period {} is below the minimum of {}s", period_sec, timing::MIN_PERIOD_SEC),
        ));
    }
    Ok(())
}

fn check_finite(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(VerdantError::invalid_config(field, "must be a finite number"));
    }
    Ok(())
}

/// Document-wide checks
pub fn validate_document(config: &VerdantConfig) -> Result<()> {
    unique_ids("controllers", config.controllers.iter().map(|c| c.id.as_str()))?;
    unique_ids("conditions", config.conditions.iter().map(|c| c.id.as_str()))?;
    unique_ids("actions", config.actions.iter().map(|a| a.id.as_str()))?;
    unique_ids("methods", config.methods.iter().map(|m| m.id.as_str()))?;
    unique_ids("outputs", config.outputs.iter().map(|o| o.id.as_str()))?;
    unique_ids("conversions", config.conversions.iter().map(|c| c.id.as_str()))?;

    check_period("general.default_period_sec", config.general.default_period_sec)?;
    if config.general.init_backoff_sec < 0.0 || config.general.lock_timeout_sec <= 0.0 {
        return Err(VerdantError::invalid_config("general", "backoff and lock timeout must be positive"));
    }
    if config.general.pause_action_max_sec < 0.0 {
        return Err(VerdantError::invalid_config("general.pause_action_max_sec", "must not be negative"));
    }

    let mut channels = HashSet::new();
    for channel in &config.channels {
        if !channels.insert((channel.device_id.as_str(), channel.channel)) {
            return Err(VerdantError::invalid_config(
                format!("channels.{}.{}", channel.device_id, channel.channel),
                "channel index used twice for this device",
            ));
        }
        if let Some(conversion_id) = &channel.conversion_id {
            if config.conversion(conversion_id).is_none() {
                return Err(VerdantError::invalid_config(
                    format!("channels.{}.{}", channel.device_id, channel.channel),
                    format!("unknown conversion '{}'", conversion_id),
                ));
            }
        }
    }
    ConversionResolver::new(&config.conversions)?;

    for output in &config.outputs {
        let mut seen = HashSet::new();
        for ch in &output.channels {
            if !seen.insert(ch.channel) {
                return Err(VerdantError::invalid_config(
                    format!("outputs.{}.{}", output.id, ch.channel),
                    "channel index used twice",
                ));
            }
        }
    }

    for method in &config.methods {
        if method.segments.is_empty() {
            return Err(VerdantError::invalid_config(format!("methods.{}", method.id), "no segments"));
        }
        for (idx, segment) in method.segments.iter().enumerate() {
            let field = format!("methods.{}.segments[{}]", method.id, idx);
            check_finite(&field, segment.setpoint_start)?;
            if segment.duration_sec < 0.0 || segment.start_offset_sec < 0.0 {
                return Err(VerdantError::invalid_config(field, "offsets and durations must not be negative"));
            }
        }
    }

    for condition in &config.conditions {
        match config.controller(&condition.conditional_id).map(|c| &c.kind) {
            Some(ControllerKind::Conditional(_)) => {}
            _ => {
                return Err(VerdantError::invalid_config(
                    format!("conditions.{}", condition.id),
                    format!("'{}' is not a conditional controller", condition.conditional_id),
                ))
            }
        }
        check_period(&format!("conditions.{}.period_sec", condition.id), condition.period_sec)?;
        if condition.refractory_sec < 0.0 {
            return Err(VerdantError::invalid_config(
                format!("conditions.{}.refractory_sec", condition.id),
                "must not be negative",
            ));
        }
    }

    for action in &config.actions {
        if config.controller(&action.owner_id).is_none() {
            return Err(VerdantError::invalid_config(
                format!("actions.{}", action.id),
                format!("owner '{}' does not exist", action.owner_id),
            ));
        }
    }
    Ok(())
}

fn require_method(config: &VerdantConfig, field: &str, method_id: &str) -> Result<()> {
    if config.method(method_id).is_none() {
        return Err(VerdantError::invalid_config(field, format!("unknown method '{}'", method_id)));
    }
    Ok(())
}

fn require_pid(config: &VerdantConfig, field: &str, pid_id: &str) -> Result<()> {
    match config.controller(pid_id).map(|c| &c.kind) {
        Some(ControllerKind::Pid(_)) => Ok(()),
        _ => Err(VerdantError::invalid_config(field, format!("'{}' is not a PID controller", pid_id))),
    }
}

fn check_output_mode(field: &str, mode: &PidOutputMode) -> Result<()> {
    let (lo, hi) = match *mode {
        PidOutputMode::Duration { min_sec, max_sec } => (min_sec, max_sec),
        PidOutputMode::Pwm { min_duty, max_duty } => {
            if max_duty > 100.0 {
                return Err(VerdantError::invalid_config(field, "duty cycle above 100%"));
            }
            (min_duty, max_duty)
        }
    };
    if lo < 0.0 || lo > hi {
        return Err(VerdantError::invalid_config(field, format!("invalid range {}..{}", lo, hi)));
    }
    Ok(())
}

/// Checks for one controller, its variant settings and the actions it owns
pub fn validate_controller(config: &VerdantConfig, controller: &Controller, drivers: &DriverRegistry) -> Result<()> {
    let id = controller.id.as_str();
    if let Some(period) = controller.period_sec {
        check_period(&format!("{}.period_sec", id), period)?;
    }

    match &controller.kind {
        ControllerKind::Input(input) => {
            drivers.bind(id, &input.driver, &input.custom_options)?;
            if let Some(pre) = &input.pre_output {
                if pre.duration_sec < 0.0 {
                    return Err(VerdantError::invalid_config(format!("{}.pre_output", id), "negative duration"));
                }
            }
        }
        ControllerKind::Math(math_cfg) => {
            bind_options(id, math::option_schema(math_cfg.kind), &math_cfg.custom_options)?;
            let (min, max) = math::input_bounds(math_cfg.kind);
            let n = math_cfg.inputs.len();
            if n < min || max.is_some_and(|m| n > m) {
                return Err(VerdantError::invalid_config(
                    format!("{}.inputs", id),
                    format!("{:?} takes {}..{} inputs, got {}", math_cfg.kind, min, max.map_or("n".to_string(), |m| m.to_string()), n),
                ));
            }
            if math_cfg.max_age_sec <= 0.0 {
                return Err(VerdantError::invalid_config(format!("{}.max_age_sec", id), "must be positive"));
            }
            if let Some(equation) = math_cfg.custom_options.get("equation").and_then(|v| v.as_str()) {
                crate::measurement::Expression::parse(equation)
                    .map_err(|e| VerdantError::invalid_config(format!("{}.equation", id), e.to_string()))?;
            }
        }
        ControllerKind::Conditional(_) | ControllerKind::Function => {}
        ControllerKind::Trigger(trigger) => match &trigger.kind {
            TriggerKind::Timer { period_sec, start_offset_sec } => {
                check_period(&format!("{}.period_sec", id), *period_sec)?;
                if *start_offset_sec < 0.0 {
                    return Err(VerdantError::invalid_config(format!("{}.start_offset_sec", id), "must not be negative"));
                }
            }
            TriggerKind::DailyTimePoint { time } => {
                schedule::parse_time_of_day(time)?;
            }
            TriggerKind::DailyTimeSpan { start, end, period_sec } => {
                schedule::parse_time_of_day(start)?;
                schedule::parse_time_of_day(end)?;
                check_period(&format!("{}.period_sec", id), *period_sec)?;
            }
            TriggerKind::RunPwmMethod { method_id, period_sec, .. } => {
                require_method(config, &format!("{}.method_id", id), method_id)?;
                check_period(&format!("{}.period_sec", id), *period_sec)?;
            }
            TriggerKind::Edge { .. } => {}
        },
        ControllerKind::Pid(pid) => {
            for (name, value) in [("kp", pid.kp), ("ki", pid.ki), ("kd", pid.kd), ("setpoint", pid.setpoint)] {
                check_finite(&format!("{}.{}", id, name), value)?;
            }
            if pid.integrator_min > pid.integrator_max {
                return Err(VerdantError::invalid_config(format!("{}.integrator", id), "min above max"));
            }
            if let Some(method_id) = &pid.method_id {
                require_method(config, &format!("{}.method_id", id), method_id)?;
            }
            if let Some(raise) = &pid.raise {
                check_output_mode(&format!("{}.raise", id), &raise.mode)?;
            }
            if let Some(lower) = &pid.lower {
                check_output_mode(&format!("{}.lower", id), &lower.mode)?;
            }
        }
    }

    for action in config.actions_for(id) {
        let field = format!("actions.{}", action.id);
        match &action.kind {
            ActionKind::Activate { controller_id } | ActionKind::Deactivate { controller_id } => {
                if config.controller(controller_id).is_none() {
                    return Err(VerdantError::invalid_config(field, format!("unknown controller '{}'", controller_id)));
                }
            }
            ActionKind::PidPause { pid_id }
            | ActionKind::PidResume { pid_id }
            | ActionKind::PidHold { pid_id }
            | ActionKind::PidSetSetpoint { pid_id, .. }
            | ActionKind::PidRaiseSetpoint { pid_id, .. }
            | ActionKind::PidLowerSetpoint { pid_id, .. } => require_pid(config, &field, pid_id)?,
            ActionKind::PidSetMethod { pid_id, method_id } => {
                require_pid(config, &field, pid_id)?;
                if let Some(method_id) = method_id {
                    require_method(config, &field, method_id)?;
                }
            }
            ActionKind::PauseActions { duration_sec } if *duration_sec < 0.0 => {
                return Err(VerdantError::invalid_config(field, "negative pause"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Every check: the document, then each controller
pub fn validate_config(config: &VerdantConfig, drivers: &DriverRegistry) -> Result<()> {
    validate_document(config)?;
    for controller in &config.controllers {
        validate_controller(config, controller, drivers)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::*;
    use serde_json::json;

    fn controller(id: &str, kind: ControllerKind) -> Controller {
        Controller {
            id: id.into(),
            name: id.into(),
            active: true,
            log_level_debug: false,
            period_sec: None,
            kind,
        }
    }

    fn base() -> VerdantConfig {
        let mut config = VerdantConfig::default();
        config.controllers.push(controller(
            "in-1",
            ControllerKind::Input(InputConfig {
                driver: "command".into(),
                custom_options: json!({"command": "echo 1"}).as_object().cloned().unwrap(),
                pre_output: None,
                actions_after_measure: false,
            }),
        ));
        config.controllers.push(controller("cond-1", ControllerKind::Conditional(ConditionalConfig::default())));
        config.conditions.push(Condition {
            id: "c1".into(),
            conditional_id: "cond-1".into(),
            period_sec: 30.0,
            refractory_sec: 0.0,
            kind: ConditionKind::MeasurementMissing {
                source: MeasurementRef::new("in-1", "temperature", 0),
                max_age_sec: 60.0,
            },
        });
        config.channels.push(Channel {
            device_id: "in-1".into(),
            channel: 0,
            measurement: "temperature".into(),
            unit: "C".into(),
            conversion_id: None,
            enabled: true,
            name: None,
        });
        config
    }

    #[test]
    fn test_valid_config_passes() {
        validate_config(&base(), &DriverRegistry::with_builtin()).unwrap();
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = base();
        config.controllers.push(config.controllers[0].clone());
        assert!(validate_document(&config).unwrap_err().to_string().contains("duplicate id"));
    }

    #[test]
    fn test_channel_uniqueness_and_conversion_refs() {
        let mut config = base();
        config.channels.push(config.channels[0].clone());
        assert!(validate_document(&config).is_err());

        let mut config = base();
        config.channels[0].conversion_id = Some("missing".into());
        assert!(validate_document(&config).is_err());
    }

    #[test]
    fn test_condition_must_belong_to_conditional() {
        let mut config = base();
        config.conditions[0].conditional_id = "in-1".into();
        assert!(validate_document(&config).is_err());
    }

    #[test]
    fn test_controller_checks() {
        let drivers = DriverRegistry::with_builtin();
        let mut config = base();
        config.controllers.push(controller(
            "math-1",
            ControllerKind::Math(MathConfig {
                kind: MathKind::DewPoint,
                inputs: vec![MeasurementRef::new("in-1", "temperature", 0)],
                max_age_sec: 60.0,
                measurement: "dewpoint".into(),
                unit: "C".into(),
                custom_options: Default::default(),
            }),
        ));
        let math = config.controller("math-1").unwrap().clone();
        assert!(validate_controller(&config, &math, &drivers).is_err());

        config.actions.push(Action {
            id: "a1".into(),
            owner_id: "cond-1".into(),
            sequence: 0,
            kind: ActionKind::PidPause { pid_id: "in-1".into() },
        });
        let cond = config.controller("cond-1").unwrap().clone();
        assert!(validate_controller(&config, &cond, &drivers).is_err());
    }

    #[test]
    fn test_bad_trigger_time() {
        let mut config = base();
        config.controllers.push(controller(
            "t-1",
            ControllerKind::Trigger(TriggerConfig {
                kind: TriggerKind::DailyTimePoint { time: "7 o'clock".into() },
            }),
        ));
        let trigger = config.controller("t-1").unwrap().clone();
        assert!(validate_controller(&config, &trigger, &DriverRegistry::with_builtin()).is_err());
    }
}
