//! Verdant Core Library
//!
//! Rule, setpoint and action engine for the Verdant environment controller.
//!
//! # Module Structure
//!
//! - `data/` - Configuration model, option binding, persistence, validation
//! - `measurement/` - Measurement store, unit conversions, expressions
//! - `engine/` - Conditions, math, methods, PID and daily schedules
//! - `hw/` - Input drivers, outputs, pins
//! - `actions/` - Action chain execution
//! - `cancel` - Stop signal for long waits inside a unit of work
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vd_core::{DeviceRegistry, JsonConfigStore};
//!
//! let store = Arc::new(JsonConfigStore::new("/etc/verdant/config.json"));
//! let registry = DeviceRegistry::load(store).unwrap();
//! println!("{} controllers", registry.snapshot().config.controllers.len());
//! ```

// Grouped modules
pub mod actions;
pub mod data;
pub mod engine;
pub mod hw;
pub mod measurement;

// Standalone modules
pub mod cancel;
pub mod constants;
pub mod lock;
pub mod notify;
pub mod registry;

pub use vd_error::{Result, VerdantError};

// Re-export primary types from data/
pub use data::{
    Action, ActionKind, Channel, Condition, ConditionKind, Controller, ControllerKind, Method, OutputCommand,
    OutputDevice, VerdantConfig,
};

// Re-export persistence and validation from data/
pub use data::{validate_config, validate_controller, ConfigStore, JsonConfigStore, MemoryConfigStore};

// Re-export runtime building blocks
pub use actions::{ActionPipeline, ChainOutcome, ControlRequest, ControllerControl, PidCommand};
pub use hw::{Actuator, ActuatorCommand, DriverRegistry, InputDriver, OutputBank, PinReader};
pub use lock::{LockGuard, LockManager};
pub use measurement::{InMemoryStore, MeasurementStore};
pub use notify::{Notifier, RateLimitedNotifier, SendOutcome};
pub use registry::{DeviceRegistry, Snapshot};
