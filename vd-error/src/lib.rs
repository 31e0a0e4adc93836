//! Unified error handling for Verdant
//!
//! This crate provides the single error type shared by the engine, the
//! controller runtime and the daemon. Staleness is deliberately absent: a
//! measurement that is too old is reported as `None` by the store, never as an
//! error.

use std::io;
use std::path::PathBuf;

/// Result type alias using VerdantError
pub type Result<T> = std::result::Result<T, VerdantError>;

/// Unified error type for all Verdant operations
#[derive(thiserror::Error, Debug)]
pub enum VerdantError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Controller not found: {0}")]
    ControllerNotFound(String),

    // ============================================================================
    // Measurement Pipeline Errors
    // ============================================================================
    #[error("Conversion {id} failed: {reason}")]
    Conversion {
        id: String,
        reason: String,
    },

    #[error("Measurement from {device} failed: {reason}")]
    Measurement {
        device: String,
        reason: String,
    },

    // ============================================================================
    // Actuation and Coordination Errors
    // ============================================================================
    #[error("Actuation of {device} CH{channel} failed: {reason}")]
    Actuation {
        device: String,
        channel: u32,
        reason: String,
    },

    #[error("Lock {name} not acquired before timeout")]
    LockTimeout {
        name: String,
    },

    #[error("Command failed: {0}")]
    Command(String),

    // ============================================================================
    // Notification Errors
    // ============================================================================
    #[error("Notification suppressed: hourly limit reached for {channel}")]
    NotificationSuppressed {
        channel: String,
    },

    #[error("Notification failed: {0}")]
    Notification(String),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl VerdantError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a configuration error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid configuration error for a named field
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a conversion error
    pub fn conversion(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conversion {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a measurement acquisition error
    pub fn measurement(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Measurement {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Create an actuation error
    pub fn actuation(device: impl Into<String>, channel: u32, reason: impl Into<String>) -> Self {
        Self::Actuation {
            device: device.into(),
            channel,
            reason: reason.into(),
        }
    }

    /// Whether this error is fatal for a controller's startup
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::InvalidConfig { .. }
                | Self::ControllerNotFound(_)
                | Self::JsonParse(_)
        )
    }
}

// Allow converting from String to VerdantError
impl From<String> for VerdantError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to VerdantError
impl From<&str> for VerdantError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
