//! Generic input drivers and the driver registry

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::debug;
use vd_error::{Result, VerdantError};

use super::{InputDriver, RawReadings};
use crate::constants::input as input_const;
use crate::data::{bind_options, BoundOptions, DefaultValue, OptionKind, OptionSpec};

/// Options of the `command` driver
pub const COMMAND_OPTIONS: &[OptionSpec] = &[
    OptionSpec::required("command", OptionKind::Text),
    OptionSpec::optional(
        "timeout_sec",
        OptionKind::Float { min: Some(0.1), max: Some(3600.0) },
        DefaultValue::Float(input_const::DEFAULT_COMMAND_TIMEOUT_SEC),
    ),
    OptionSpec::optional(
        "channel_count",
        OptionKind::Integer { min: Some(1), max: Some(64) },
        DefaultValue::Integer(1),
    ),
];

/// Options of the `sysfs` driver
pub const SYSFS_OPTIONS: &[OptionSpec] = &[
    OptionSpec::required("path", OptionKind::Text),
    OptionSpec::optional("scale", OptionKind::Float { min: None, max: None }, DefaultValue::Float(1.0)),
    OptionSpec::optional(
        "channel",
        OptionKind::Integer { min: Some(0), max: Some(u32::MAX as i64) },
        DefaultValue::Integer(0),
    ),
];

/// Runs a shell command and parses whitespace-separated numbers from stdout;
/// the n-th number becomes channel n
#[derive(Debug, Clone)]
pub struct CommandInput {
    device_id: String,
    command: String,
    timeout: Duration,
    channel_count: usize,
}

impl CommandInput {
    pub fn from_options(device_id: &str, options: &BoundOptions) -> Result<Self> {
        let command = options
            .text("command")
            .ok_or_else(|| VerdantError::invalid_config(format!("{}.command", device_id), "required option missing"))?;
        Ok(Self {
            device_id: device_id.to_string(),
            command: command.to_string(),
            timeout: Duration::from_secs_f64(
                options.f64("timeout_sec").unwrap_or(input_const::DEFAULT_COMMAND_TIMEOUT_SEC),
            ),
            channel_count: options.i64("channel_count").unwrap_or(1).max(1) as usize,
        })
    }
}

/// Parse the first `count` whitespace-separated numbers of `text`
pub(crate) fn parse_readings(device_id: &str, text: &str, count: usize) -> Result<RawReadings> {
    let mut readings = RawReadings::new();
    for (channel, token) in text.split_whitespace().take(count).enumerate() {
        let value: f64 = token
            .parse()
            .map_err(|_| VerdantError::measurement(device_id, format!("'{}' is not a number", token)))?;
        readings.insert(channel as u32, value);
    }
    if readings.len() < count {
        return Err(VerdantError::measurement(
            device_id,
            format!("expected {} values, got {}", count, readings.len()),
        ));
    }
    Ok(readings)
}

#[async_trait]
impl InputDriver for CommandInput {
    async fn measure(&mut self) -> Result<RawReadings> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VerdantError::measurement(&self.device_id, format!("failed to spawn: {}", e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| VerdantError::Timeout(format!("{}: '{}'", self.device_id, self.command)))?
            .map_err(|e| VerdantError::measurement(&self.device_id, e.to_string()))?;

        if !output.status.success() {
            return Err(VerdantError::measurement(
                &self.device_id,
                format!(
                    "command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("INPUT: {} command output '{}'", self.device_id, stdout.trim());
        parse_readings(&self.device_id, &stdout, self.channel_count)
    }
}

/// Reads one numeric file (e.g. a thermal zone) and scales it
#[derive(Debug, Clone)]
pub struct SysfsInput {
    device_id: String,
    path: PathBuf,
    scale: f64,
    channel: u32,
}

impl SysfsInput {
    pub fn from_options(device_id: &str, options: &BoundOptions) -> Result<Self> {
        let path = options
            .text("path")
            .ok_or_else(|| VerdantError::invalid_config(format!("{}.path", device_id), "required option missing"))?;
        Ok(Self {
            device_id: device_id.to_string(),
            path: PathBuf::from(path),
            scale: options.f64("scale").unwrap_or(1.0),
            channel: options.i64("channel").unwrap_or(0) as u32,
        })
    }
}

#[async_trait]
impl InputDriver for SysfsInput {
    async fn measure(&mut self) -> Result<RawReadings> {
        let path = self.path.clone();
        let content = tokio::task::spawn_blocking(move || std::fs::read_to_string(&path))
            .await
            .map_err(|e| VerdantError::measurement(&self.device_id, format!("read task panicked: {}", e)))?
            .map_err(|e| VerdantError::FileRead { path: self.path.clone(), source: e })?;

        let raw: f64 = content.trim().parse().map_err(|_| {
            VerdantError::measurement(&self.device_id, format!("failed to parse '{}'", content.trim()))
        })?;
        let mut readings = RawReadings::new();
        readings.insert(self.channel, raw * self.scale);
        Ok(readings)
    }
}

/// Builds a driver from its bound options
pub type DriverConstructor = Arc<dyn Fn(&str, &BoundOptions) -> Result<Box<dyn InputDriver>> + Send + Sync>;

#[derive(Clone)]
struct DriverEntry {
    schema: &'static [OptionSpec],
    constructor: DriverConstructor,
}

/// Input drivers available by name
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, DriverEntry>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry").field("drivers", &self.names()).finish()
    }
}

impl DriverRegistry {
    /// Registry with the `command` and `sysfs` drivers
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(
            "command",
            COMMAND_OPTIONS,
            Arc::new(|id: &str, opts: &BoundOptions| Ok(Box::new(CommandInput::from_options(id, opts)?) as Box<dyn InputDriver>)),
        );
        registry.register(
            "sysfs",
            SYSFS_OPTIONS,
            Arc::new(|id: &str, opts: &BoundOptions| Ok(Box::new(SysfsInput::from_options(id, opts)?) as Box<dyn InputDriver>)),
        );
        registry
    }

    pub fn register(&mut self, name: &str, schema: &'static [OptionSpec], constructor: DriverConstructor) {
        self.drivers.insert(name.to_string(), DriverEntry { schema, constructor });
    }

    pub fn schema(&self, name: &str) -> Option<&'static [OptionSpec]> {
        self.drivers.get(name).map(|d| d.schema)
    }

    /// Sorted driver names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate options without building the driver
    pub fn bind(&self, device_id: &str, driver: &str, options: &Map<String, Value>) -> Result<BoundOptions> {
        let entry = self
            .drivers
            .get(driver)
            .ok_or_else(|| VerdantError::invalid_config(format!("{}.driver", device_id), format!("unknown driver '{}'", driver)))?;
        bind_options(device_id, entry.schema, options)
    }

    /// Bind options and construct the driver
    pub fn create(&self, device_id: &str, driver: &str, options: &Map<String, Value>) -> Result<Box<dyn InputDriver>> {
        let bound = self.bind(device_id, driver, options)?;
        let entry = &self.drivers[driver];
        (entry.constructor)(device_id, &bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn opts(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_readings() {
        let r = parse_readings("d", "21.5  55\n", 2).unwrap();
        assert_eq!(r.get(&0), Some(&21.5));
        assert_eq!(r.get(&1), Some(&55.0));
        assert!(parse_readings("d", "21.5", 2).is_err());
        assert!(parse_readings("d", "abc", 1).is_err());
    }

    #[tokio::test]
    async fn test_command_input_measures() {
        let registry = DriverRegistry::with_builtin();
        let mut driver = registry
            .create("probe", "command", &opts(json!({"command": "echo 20.25 61", "channel_count": 2})))
            .unwrap();
        let readings = driver.measure().await.unwrap();
        assert_eq!(readings.get(&0), Some(&20.25));
        assert_eq!(readings.get(&1), Some(&61.0));
    }

    #[tokio::test]
    async fn test_command_input_failure_and_timeout() {
        let registry = DriverRegistry::with_builtin();
        let mut failing = registry.create("p", "command", &opts(json!({"command": "exit 1"}))).unwrap();
        assert!(matches!(failing.measure().await, Err(VerdantError::Measurement { .. })));

        let mut slow = registry
            .create("p", "command", &opts(json!({"command": "sleep 5", "timeout_sec": 0.2})))
            .unwrap();
        assert!(matches!(slow.measure().await, Err(VerdantError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_sysfs_input_scales() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temp");
        std::fs::write(&path, "42500\n").unwrap();
        let registry = DriverRegistry::with_builtin();
        let mut driver = registry
            .create(
                "zone0",
                "sysfs",
                &opts(json!({"path": path.to_string_lossy(), "scale": 0.001, "channel": 3})),
            )
            .unwrap();
        let readings = driver.measure().await.unwrap();
        assert!((readings[&3] - 42.5).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_driver_and_bad_options() {
        let registry = DriverRegistry::with_builtin();
        assert!(registry.bind("x", "i2c", &Map::new()).is_err());
        assert!(registry.bind("x", "sysfs", &Map::new()).is_err());
        assert_eq!(registry.names(), vec!["command", "sysfs"]);
    }
}
