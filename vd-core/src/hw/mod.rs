//! Hardware capabilities
//!
//! The engine never talks to a bus or a pin directly. It reads inputs through
//! [`InputDriver`], drives outputs through [`Actuator`], reads digital pins
//! through [`PinReader`] and takes camera stills through [`Capture`]. The
//! platform supplies implementations; the generic ones here work on any Linux
//! host.

mod input;
mod output;
mod pins;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vd_error::{Result, VerdantError};

pub use input::{CommandInput, DriverConstructor, DriverRegistry, SysfsInput, COMMAND_OPTIONS, SYSFS_OPTIONS};
pub use output::OutputBank;
pub use pins::SysfsPinReader;

/// Raw readings of one measurement, keyed by channel index
pub type RawReadings = BTreeMap<u32, f64>;

/// Reads one input device
#[async_trait]
pub trait InputDriver: Send {
    /// Take one measurement of every channel the device provides
    async fn measure(&mut self) -> Result<RawReadings>;

    /// Release any resources held by the driver
    async fn stop(&mut self) {}
}

/// A command sent to one output channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActuatorCommand {
    On,
    Off,
    /// Turn on, then off again after the given seconds
    Duration(f64),
    /// Set a PWM duty cycle in percent; zero turns the output off
    DutyCycle(f64),
}

/// Observed state of one output channel
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OutputState {
    pub on: bool,
    pub duty_cycle: f64,
    pub on_since: Option<DateTime<Utc>>,
}

impl OutputState {
    /// Seconds the output has been continuously on
    pub fn on_duration_sec(&self, now: DateTime<Utc>) -> f64 {
        match (self.on, self.on_since) {
            (true, Some(since)) => ((now - since).num_milliseconds() as f64 / 1000.0).max(0.0),
            _ => 0.0,
        }
    }
}

/// Character display commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayCommand {
    Flash { line: u32, on: bool },
    Backlight { on: bool },
}

/// Drives output channels
///
/// Calls may block (shell commands, bus writes); async callers go through
/// `spawn_blocking`.
pub trait Actuator: Send + Sync {
    fn set(&self, device_id: &str, channel: u32, command: ActuatorCommand) -> Result<()>;

    fn state(&self, device_id: &str, channel: u32) -> Result<OutputState>;

    fn display(&self, device_id: &str, command: DisplayCommand) -> Result<()> {
        let _ = command;
        Err(VerdantError::NotSupported(format!("{} has no display", device_id)))
    }
}

/// Reads the level of a digital input pin
#[cfg_attr(test, mockall::automock)]
pub trait PinReader: Send + Sync {
    fn read(&self, device_id: &str, pin: u32) -> Result<bool>;
}

/// Takes a still image for notification attachments
#[cfg_attr(test, mockall::automock)]
pub trait Capture: Send + Sync {
    fn capture(&self, camera_id: &str) -> Result<PathBuf>;
}
