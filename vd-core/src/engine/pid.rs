//! PID regulator
//!
//! Error is `setpoint - measured`, so a positive control variable asks the
//! raise output to act and a negative one the lower output.

use crate::data::{PidConfig, PidDirection, PidOutputMode};
use crate::hw::ActuatorCommand;

/// Terms of one PID update
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PidStep {
    pub output: f64,
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

#[derive(Debug, Clone)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    setpoint: f64,
    band: f64,
    direction: PidDirection,
    integrator: f64,
    integrator_min: f64,
    integrator_max: f64,
    last_error: Option<f64>,
}

impl Pid {
    pub fn from_config(config: &PidConfig) -> Self {
        Self {
            kp: config.kp,
            ki: config.ki,
            kd: config.kd,
            setpoint: config.setpoint,
            band: config.band.max(0.0),
            direction: config.direction,
            integrator: 0.0,
            integrator_min: config.integrator_min,
            integrator_max: config.integrator_max,
            last_error: None,
        }
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    /// Take new gains and limits, keeping the integrator and setpoint
    pub fn retune(&mut self, config: &PidConfig) {
        self.kp = config.kp;
        self.ki = config.ki;
        self.kd = config.kd;
        self.band = config.band.max(0.0);
        self.direction = config.direction;
        self.integrator_min = config.integrator_min;
        self.integrator_max = config.integrator_max;
        self.integrator = self.integrator.clamp(self.integrator_min, self.integrator_max);
    }

    pub fn reset(&mut self) {
        self.integrator = 0.0;
        self.last_error = None;
    }

    /// Update with a measured value `dt_sec` after the previous update
    pub fn update(&mut self, measured: f64, dt_sec: f64) -> PidStep {
        let error = self.setpoint - measured;

        if self.band > 0.0 && error.abs() <= self.band {
            self.last_error = Some(error);
            return PidStep::default();
        }

        let p = self.kp * error;

        if dt_sec > 0.0 {
            self.integrator = (self.integrator + error * dt_sec).clamp(self.integrator_min, self.integrator_max);
        }
        let i = self.ki * self.integrator;

        let d = match self.last_error {
            Some(last) if dt_sec > 0.0 => self.kd * (error - last) / dt_sec,
            _ => 0.0,
        };
        self.last_error = Some(error);

        let raw = p + i + d;
        let output = match self.direction {
            PidDirection::Raise => raw.max(0.0),
            PidDirection::Lower => raw.min(0.0),
            PidDirection::Both => raw,
        };
        PidStep { output, p, i, d }
    }
}

/// Command for one output given the magnitude of the control variable
///
/// Duration outputs below `min_sec` are skipped (`None`); PWM outputs are
/// clamped into their duty range.
pub fn actuation_for(magnitude: f64, mode: &PidOutputMode) -> Option<ActuatorCommand> {
    let magnitude = magnitude.abs();
    match *mode {
        PidOutputMode::Duration { min_sec, max_sec } => {
            let sec = magnitude.min(max_sec);
            if sec <= 0.0 || sec < min_sec {
                None
            } else {
                Some(ActuatorCommand::Duration(sec))
            }
        }
        PidOutputMode::Pwm { min_duty, max_duty } => {
            let duty = magnitude.clamp(min_duty.min(max_duty), max_duty);
            Some(ActuatorCommand::DutyCycle(duty))
        }
    }
}

/// Command that idles an output (used when the other direction acts, or at stop)
pub fn idle_command(mode: &PidOutputMode) -> ActuatorCommand {
    match mode {
        PidOutputMode::Duration { .. } => ActuatorCommand::Off,
        PidOutputMode::Pwm { .. } => ActuatorCommand::DutyCycle(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MeasurementRef;

    fn config() -> PidConfig {
        PidConfig {
            source: MeasurementRef::new("in-1", "temperature", 0),
            max_age_sec: 60.0,
            setpoint: 25.0,
            method_id: None,
            band: 0.0,
            direction: PidDirection::Both,
            kp: 2.0,
            ki: 0.5,
            kd: 1.0,
            integrator_min: -10.0,
            integrator_max: 10.0,
            raise: None,
            lower: None,
        }
    }

    #[test]
    fn test_proportional_integral_derivative() {
        let mut pid = Pid::from_config(&config());
        let first = pid.update(20.0, 1.0);
        assert_eq!(first.p, 10.0);
        assert_eq!(first.i, 2.5);
        assert_eq!(first.d, 0.0);
        assert_eq!(first.output, 12.5);

        let second = pid.update(22.0, 1.0);
        assert_eq!(second.p, 6.0);
        assert_eq!(second.i, 4.0);
        assert_eq!(second.d, -2.0);
    }

    #[test]
    fn test_integrator_clamped() {
        let mut pid = Pid::from_config(&config());
        for _ in 0..100 {
            pid.update(0.0, 1.0);
        }
        assert_eq!(pid.update(0.0, 1.0).i, 5.0);
    }

    #[test]
    fn test_band_and_direction() {
        let mut cfg = config();
        cfg.band = 1.0;
        cfg.direction = PidDirection::Raise;
        let mut pid = Pid::from_config(&cfg);
        assert_eq!(pid.update(24.5, 1.0).output, 0.0);
        assert_eq!(pid.update(30.0, 1.0).output, 0.0);
        assert!(pid.update(20.0, 1.0).output > 0.0);
    }

    #[test]
    fn test_actuation_mapping() {
        let duration = PidOutputMode::Duration { min_sec: 2.0, max_sec: 30.0 };
        assert_eq!(actuation_for(1.0, &duration), None);
        assert_eq!(actuation_for(-12.0, &duration), Some(ActuatorCommand::Duration(12.0)));
        assert_eq!(actuation_for(100.0, &duration), Some(ActuatorCommand::Duration(30.0)));

        let pwm = PidOutputMode::Pwm { min_duty: 10.0, max_duty: 80.0 };
        assert_eq!(actuation_for(5.0, &pwm), Some(ActuatorCommand::DutyCycle(10.0)));
        assert_eq!(actuation_for(95.0, &pwm), Some(ActuatorCommand::DutyCycle(80.0)));
        assert_eq!(idle_command(&pwm), ActuatorCommand::DutyCycle(0.0));
    }
}
