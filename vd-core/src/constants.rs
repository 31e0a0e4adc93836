//! Constants and configuration defaults for Verdant
//!
//! Centralizes timing defaults, limits and fixed strings used by the engine
//! and the controller runtime. Configuration defaults in `data::types` point
//! back here.

use std::time::Duration;

/// Filesystem locations
pub mod paths {
    /// System-wide configuration directory
    pub const CONFIG_DIR: &str = "/etc/verdant";

    /// Configuration document file name
    pub const CONFIG_FILE: &str = "config.json";

    /// Environment variable overriding the configuration path
    pub const CONFIG_ENV: &str = "VERDANT_CONFIG";

    /// Per-user configuration file (`~/.config/verdant/config.json`), falling
    /// back to the system-wide location when no user config dir exists.
    pub fn default_config_path() -> std::path::PathBuf {
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            if !p.trim().is_empty() {
                return std::path::PathBuf::from(p);
            }
        }
        match dirs::config_dir() {
            Some(dir) if dir.join("verdant").join(CONFIG_FILE).exists() => {
                dir.join("verdant").join(CONFIG_FILE)
            }
            _ => std::path::Path::new(CONFIG_DIR).join(CONFIG_FILE),
        }
    }
}

/// Controller loop scheduling
pub mod timing {
    use super::Duration;

    /// Default sample period for Input/Math/PID controllers without their own period
    pub const DEFAULT_PERIOD_SEC: f64 = 15.0;

    /// Lower bound for any configured period (prevents a hot loop)
    pub const MIN_PERIOD_SEC: f64 = 0.1;

    /// How many times a loop retries building its worker before giving up
    pub const DEFAULT_INIT_RETRIES: u32 = 3;

    /// Fixed backoff between initialization attempts
    pub const DEFAULT_INIT_BACKOFF_SEC: f64 = 1.0;

    /// Slack on top of the longest unit of work when waiting for a loop to park
    pub const PARK_MARGIN: Duration = Duration::from_secs(30);

    /// How often `stop` logs while it waits for a loop to finish its unit of work
    pub const STOP_WARN_INTERVAL: Duration = Duration::from_secs(60);

    /// Consecutive acquisition failures before a single warning is logged
    pub const FAILURES_BEFORE_WARNING: u32 = 3;

    /// Interval at which the daemon checks the config file for changes
    pub const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(5);
}

/// Lock coordination
pub mod lock {
    /// Default timeout for pre-output locks
    pub const DEFAULT_TIMEOUT_SEC: f64 = 30.0;

    /// Extra time added to the pre-output duration when sizing the lock timeout
    pub const PRE_OUTPUT_MARGIN_SEC: f64 = 5.0;

    /// Prefix for the lock serializing a pre-activated output
    pub const PRE_OUTPUT_PREFIX: &str = "pre-output";
}

/// Action chain behaviour
pub mod actions {
    /// Marker appended to a chain message when an action fails
    pub const ERROR_MARKER: &str = "Error executing action";

    /// Upper bound on a single "pause actions" action
    pub const DEFAULT_PAUSE_MAX_SEC: f64 = 300.0;

    /// Default timeout for "run command" actions
    pub const DEFAULT_COMMAND_TIMEOUT_SEC: f64 = 60.0;

    /// Maximum number of bytes of command output kept in a chain message
    pub const MAX_COMMAND_OUTPUT: usize = 512;
}

/// Notification limits
pub mod notify {
    use super::Duration;

    /// Default sends allowed per channel in one rolling window
    pub const DEFAULT_HOURLY_CEILING: u32 = 2;

    /// Length of the rolling rate-limit window
    pub const WINDOW: Duration = Duration::from_secs(3600);

    /// Default notification channel name
    pub const DEFAULT_CHANNEL: &str = "email";

    /// Default sendmail binary
    pub const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";
}

/// Measurement store retention
pub mod store {
    /// Samples kept per (device, measurement, channel) series in memory
    pub const DEFAULT_RETENTION: usize = 10_000;
}

/// PID defaults
pub mod pid {
    /// Default integrator clamp
    pub const DEFAULT_INTEGRATOR_MIN: f64 = -100.0;
    pub const DEFAULT_INTEGRATOR_MAX: f64 = 100.0;

    /// Channels a PID controller writes to the measurement store
    pub const CHANNEL_SETPOINT: u32 = 0;
    pub const CHANNEL_OUTPUT: u32 = 1;
    pub const CHANNEL_P: u32 = 2;
    pub const CHANNEL_I: u32 = 3;
    pub const CHANNEL_D: u32 = 4;
}

/// Input driver defaults
pub mod input {
    /// Default timeout for command-based inputs
    pub const DEFAULT_COMMAND_TIMEOUT_SEC: f64 = 30.0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_env_overrides_path() {
        std::env::set_var(paths::CONFIG_ENV, "/tmp/verdant-test.json");
        assert_eq!(paths::default_config_path(), std::path::PathBuf::from("/tmp/verdant-test.json"));
        std::env::set_var(paths::CONFIG_ENV, "  ");
        assert!(paths::default_config_path().ends_with(paths::CONFIG_FILE));
        std::env::remove_var(paths::CONFIG_ENV);
    }

    #[test]
    fn test_min_period_below_default() {
        assert!(timing::MIN_PERIOD_SEC < timing::DEFAULT_PERIOD_SEC);
    }
}
