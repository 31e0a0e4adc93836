//! Built-in output bank
//!
//! Drives the output devices listed in the configuration. Virtual channels
//! only track state; command channels run a shell command per transition.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use vd_error::{Result, VerdantError};

use super::{Actuator, ActuatorCommand, DisplayCommand, OutputState};
use crate::data::{OutputBackend, OutputDevice};

type ChannelKey = (String, u32);

#[derive(Debug, Clone)]
struct Slot {
    backend: OutputBackend,
    state: OutputState,
    /// Bumped on every command so a pending auto-off can tell it is stale
    generation: u64,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct DisplayState {
    backlight: bool,
    flashing: Vec<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    slots: RwLock<HashMap<ChannelKey, Slot>>,
    displays: Mutex<HashMap<String, DisplayState>>,
}

/// Actuator over the configured output devices
#[derive(Debug, Clone, Default)]
pub struct OutputBank {
    inner: Arc<Inner>,
}

impl OutputBank {
    pub fn new(devices: &[OutputDevice]) -> Self {
        let bank = Self::default();
        bank.reconfigure(devices);
        bank
    }

    /// Replace the channel set; channels that survive keep their state
    pub fn reconfigure(&self, devices: &[OutputDevice]) {
        let mut slots = self.inner.slots.write();
        let mut next = HashMap::new();
        for device in devices {
            for ch in &device.channels {
                let key = (device.id.clone(), ch.channel);
                let slot = match slots.remove(&key) {
                    Some(mut existing) => {
                        existing.backend = ch.backend.clone();
                        existing
                    }
                    None => Slot {
                        backend: ch.backend.clone(),
                        state: OutputState::default(),
                        generation: 0,
                    },
                };
                next.insert(key, slot);
            }
        }
        *slots = next;
        debug!("Output bank configured with {} channels", slots.len());
    }

    /// Turn every channel off (used at shutdown)
    pub fn all_off(&self) {
        let keys: Vec<ChannelKey> = self
            .inner
            .slots
            .read()
            .iter()
            .filter(|(_, s)| s.state.on)
            .map(|(k, _)| k.clone())
            .collect();
        for (device, channel) in keys {
            if let Err(e) = self.set(&device, channel, ActuatorCommand::Off) {
                warn!("OUTPUT: Failed to turn off {} CH{}: {}", device, channel, e);
            }
        }
    }

    /// Backlight state and flashing lines of a display device
    pub fn display_state(&self, device_id: &str) -> Option<(bool, Vec<u32>)> {
        self.inner
            .displays
            .lock()
            .get(device_id)
            .map(|d| (d.backlight, d.flashing.clone()))
    }

    fn backend(&self, device_id: &str, channel: u32) -> Result<OutputBackend> {
        self.inner
            .slots
            .read()
            .get(&(device_id.to_string(), channel))
            .map(|s| s.backend.clone())
            .ok_or_else(|| VerdantError::actuation(device_id, channel, "unknown output channel"))
    }

    /// Record the new state and return the generation it was stored under
    fn record(&self, device_id: &str, channel: u32, on: bool, duty_cycle: f64) -> u64 {
        let mut slots = self.inner.slots.write();
        match slots.get_mut(&(device_id.to_string(), channel)) {
            Some(slot) => {
                let on_since = match (slot.state.on, on) {
                    (true, true) => slot.state.on_since,
                    (false, true) => Some(Utc::now()),
                    _ => None,
                };
                slot.state = OutputState { on, duty_cycle, on_since };
                slot.generation += 1;
                slot.generation
            }
            None => 0,
        }
    }

    fn schedule_off(&self, device_id: &str, channel: u32, after_sec: f64, generation: u64) {
        let bank = self.clone();
        let device = device_id.to_string();
        let delay = Duration::from_secs_f64(after_sec.max(0.0));
        let expire = move || {
            let current = bank
                .inner
                .slots
                .read()
                .get(&(device.clone(), channel))
                .map(|s| s.generation);
            if current == Some(generation) {
                debug!("OUTPUT: Duration elapsed, turning off {} CH{}", device, channel);
                if let Err(e) = bank.set(&device, channel, ActuatorCommand::Off) {
                    warn!("OUTPUT: Auto-off of {} CH{} failed: {}", device, channel, e);
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = tokio::task::spawn_blocking(expire).await {
                        warn!("OUTPUT: Auto-off task panicked: {}", e);
                    }
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    expire();
                });
            }
        }
    }
}

fn run_shell(device_id: &str, channel: u32, command: &str) -> Result<()> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .map_err(|e| VerdantError::actuation(device_id, channel, format!("failed to spawn '{}': {}", command, e)))?;
    if !status.success() {
        return Err(VerdantError::actuation(
            device_id,
            channel,
            format!("'{}' exited with {}", command, status),
        ));
    }
    Ok(())
}

impl Actuator for OutputBank {
    fn set(&self, device_id: &str, channel: u32, command: ActuatorCommand) -> Result<()> {
        let backend = self.backend(device_id, channel)?;

        let (on, duty) = match command {
            ActuatorCommand::On | ActuatorCommand::Duration(_) => (true, 100.0),
            ActuatorCommand::Off => (false, 0.0),
            ActuatorCommand::DutyCycle(percent) => {
                if !percent.is_finite() {
                    return Err(VerdantError::actuation(device_id, channel, "duty cycle is not finite"));
                }
                let percent = percent.clamp(0.0, 100.0);
                (percent > 0.0, percent)
            }
        };

        if let OutputBackend::Command { on_command, off_command, pwm_command } = &backend {
            let shell = match (command, pwm_command) {
                (ActuatorCommand::DutyCycle(_), Some(pwm)) => pwm.replace("{duty}", &format!("{:.1}", duty)),
                _ if on => on_command.clone(),
                _ => off_command.clone(),
            };
            run_shell(device_id, channel, &shell)?;
        }

        let generation = self.record(device_id, channel, on, duty);
        debug!("OUTPUT: {} CH{} -> {:?}", device_id, channel, command);

        if let ActuatorCommand::Duration(sec) = command {
            self.schedule_off(device_id, channel, sec, generation);
        }
        Ok(())
    }

    fn state(&self, device_id: &str, channel: u32) -> Result<OutputState> {
        self.inner
            .slots
            .read()
            .get(&(device_id.to_string(), channel))
            .map(|s| s.state)
            .ok_or_else(|| VerdantError::actuation(device_id, channel, "unknown output channel"))
    }

    fn display(&self, device_id: &str, command: DisplayCommand) -> Result<()> {
        let known = self.inner.slots.read().keys().any(|(d, _)| d == device_id);
        if !known {
            return Err(VerdantError::actuation(device_id, 0, "unknown display device"));
        }
        let mut displays = self.inner.displays.lock();
        let display = displays.entry(device_id.to_string()).or_default();
        match command {
            DisplayCommand::Backlight { on } => display.backlight = on,
            DisplayCommand::Flash { line, on } => {
                display.flashing.retain(|l| *l != line);
                if on {
                    display.flashing.push(line);
                }
            }
        }
        info!("OUTPUT: Display {} {:?}", device_id, command);
        Ok(())
    }
}
