//! Decision engines
//!
//! Condition evaluation, setpoint methods, PID regulation, derived-value math
//! and time-of-day scheduling.

pub mod math;
pub mod method;
mod pid;
pub mod rules;
pub mod schedule;

pub use method::MethodOutput;
pub use pid::{actuation_for, idle_command, Pid, PidStep};
pub use rules::{ControllerStatus, RuleContext, RuleEvaluation, RuleOutcome};
