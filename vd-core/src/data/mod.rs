//! Data types, option binding, persistence and validation

mod options;
mod persistence;
mod types;
mod validation;

pub use options::{bind_options, BoundOptions, DefaultValue, OptionKind, OptionSpec, OptionValue};
pub use persistence::{ConfigStore, JsonConfigStore, MemoryConfigStore};
pub use types::{
    Action, ActionKind, Channel, Condition, ConditionKind, ConditionalConfig, Controller, ControllerKind, Conversion,
    Direction, EdgeKind, GeneralSettings, InputConfig, MathConfig, MathKind, MeasurementRef, Method, MethodData,
    MethodKind, Note, NotificationSettings, OutputBackend, OutputChannel, OutputCommand, OutputDevice, PidConfig,
    PidDirection, PidOutput, PidOutputMode, PreOutput, TriggerConfig, TriggerKind, VerdantConfig,
};
pub use validation::{validate_config, validate_controller, validate_document};
