//! Configuration data model
//!
//! Every entity is addressed by a string id. Conditions, actions and channels
//! reference controllers and devices by id and are resolved through a
//! [`VerdantConfig`] snapshot at evaluation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{actions as action_const, lock as lock_const, notify as notify_const, pid as pid_const, store as store_const, timing};

// ============================================================================
// Controllers
// ============================================================================

/// A configured controller instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    pub id: String,
    pub name: String,
    /// Whether the supervisor should run this controller
    #[serde(default)]
    pub active: bool,
    /// Promote per-tick details from debug to info level
    #[serde(default)]
    pub log_level_debug: bool,
    /// Polling period; `None` uses the shared default (or is event driven)
    #[serde(default)]
    pub period_sec: Option<f64>,
    pub kind: ControllerKind,
}

impl Controller {
    /// Short variant name used in logs
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Variant-specific controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerKind {
    Input(InputConfig),
    Math(MathConfig),
    Conditional(ConditionalConfig),
    Trigger(TriggerConfig),
    Pid(PidConfig),
    Function,
}

impl ControllerKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Math(_) => "math",
            Self::Conditional(_) => "conditional",
            Self::Trigger(_) => "trigger",
            Self::Pid(_) => "pid",
            Self::Function => "function",
        }
    }

    /// Function controllers only run on demand and never get a loop
    pub fn has_loop(&self) -> bool {
        !matches!(self, Self::Function)
    }
}

/// Reference to one stored measurement series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeasurementRef {
    pub device_id: String,
    pub measurement: String,
    #[serde(default)]
    pub channel: u32,
}

impl MeasurementRef {
    pub fn new(device_id: impl Into<String>, measurement: impl Into<String>, channel: u32) -> Self {
        Self {
            device_id: device_id.into(),
            measurement: measurement.into(),
            channel,
        }
    }
}

impl std::fmt::Display for MeasurementRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/CH{}", self.device_id, self.measurement, self.channel)
    }
}

/// Input controller: reads a driver and stores its channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Driver name resolved by the driver factory (e.g. "command", "sysfs")
    pub driver: String,
    #[serde(default)]
    pub custom_options: Map<String, Value>,
    /// Output to energize before measuring (e.g. a sensor power relay)
    #[serde(default)]
    pub pre_output: Option<PreOutput>,
    /// Run this input's action chain after each successful measurement
    #[serde(default)]
    pub actions_after_measure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreOutput {
    pub device_id: String,
    #[serde(default)]
    pub channel: u32,
    pub duration_sec: f64,
    /// Keep the output on while measuring instead of measuring after it turns off
    #[serde(default)]
    pub during_measure: bool,
}

/// Math controller: derives one value from other stored measurements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MathConfig {
    pub kind: MathKind,
    pub inputs: Vec<MeasurementRef>,
    pub max_age_sec: f64,
    /// Measurement name and unit of the derived value (written to channel 0)
    pub measurement: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub custom_options: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathKind {
    Average,
    Sum,
    Min,
    Max,
    Median,
    Difference,
    Redundancy,
    Verification,
    Equation,
    DewPoint,
    VaporPressureDeficit,
}

/// Conditional controller; its conditions are separate entities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionalConfig {
    /// Delay before the first evaluation of every condition
    #[serde(default)]
    pub start_offset_sec: f64,
}

/// Trigger controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub kind: TriggerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fire every `period_sec`, first after `start_offset_sec`
    Timer {
        period_sec: f64,
        #[serde(default)]
        start_offset_sec: f64,
    },
    /// Fire once per day at local `time` ("HH:MM" or "HH:MM:SS")
    DailyTimePoint { time: String },
    /// Fire every `period_sec` while the local time is within `[start, end)`
    DailyTimeSpan {
        start: String,
        end: String,
        period_sec: f64,
    },
    /// Drive an output's duty cycle from a method until it ends
    RunPwmMethod {
        method_id: String,
        device_id: String,
        #[serde(default)]
        channel: u32,
        period_sec: f64,
        /// Run the trigger's actions once when the method starts
        #[serde(default)]
        trigger_actions_at_start: bool,
    },
    /// Event driven: fire on an edge reported for `device_id`/`pin`
    Edge {
        device_id: String,
        pin: u32,
        edge: EdgeKind,
        #[serde(default)]
        debounce_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Rising,
    Falling,
    Both,
}

impl EdgeKind {
    /// Whether a transition to `state` matches this edge selection
    pub fn matches(self, state: bool) -> bool {
        match self {
            Self::Rising => state,
            Self::Falling => !state,
            Self::Both => true,
        }
    }
}

/// PID regulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidConfig {
    pub source: MeasurementRef,
    pub max_age_sec: f64,
    pub setpoint: f64,
    #[serde(default)]
    pub method_id: Option<String>,
    /// Dead band around the setpoint; zero disables banding
    #[serde(default)]
    pub band: f64,
    #[serde(default = "default_pid_direction")]
    pub direction: PidDirection,
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,
    #[serde(default = "default_integrator_min")]
    pub integrator_min: f64,
    #[serde(default = "default_integrator_max")]
    pub integrator_max: f64,
    #[serde(default)]
    pub raise: Option<PidOutput>,
    #[serde(default)]
    pub lower: Option<PidOutput>,
}

fn default_pid_direction() -> PidDirection {
    PidDirection::Both
}

fn default_integrator_min() -> f64 {
    pid_const::DEFAULT_INTEGRATOR_MIN
}

fn default_integrator_max() -> f64 {
    pid_const::DEFAULT_INTEGRATOR_MAX
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PidDirection {
    Raise,
    Lower,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidOutput {
    pub device_id: String,
    #[serde(default)]
    pub channel: u32,
    pub mode: PidOutputMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PidOutputMode {
    /// Control variable is interpreted as seconds of on-time
    Duration { min_sec: f64, max_sec: f64 },
    /// Control variable is interpreted as a duty cycle percentage
    Pwm { min_duty: f64, max_duty: f64 },
}

// ============================================================================
// Channels and conversions
// ============================================================================

/// One measurable/controllable quantity of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub device_id: String,
    pub channel: u32,
    pub measurement: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub conversion_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Linear/expression conversion of a value from one unit to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub id: String,
    pub from_unit: String,
    pub to_unit: String,
    /// Expression of the single variable `x`
    pub equation: String,
}

// ============================================================================
// Conditions
// ============================================================================

/// One rule evaluated by a Conditional controller on its own timer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub id: String,
    pub conditional_id: String,
    pub period_sec: f64,
    /// After firing, skip evaluation for this long
    #[serde(default)]
    pub refractory_sec: f64,
    pub kind: ConditionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Above,
    Below,
    NoneFound,
}

impl Direction {
    /// Threshold comparison; `NoneFound` never matches a present value
    pub fn compare(self, value: f64, setpoint: f64) -> bool {
        match self {
            Self::Above => value > setpoint,
            Self::Below => value < setpoint,
            Self::NoneFound => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Above => "above",
            Self::Below => "below",
            Self::NoneFound => "none found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionKind {
    Measurement {
        source: MeasurementRef,
        direction: Direction,
        #[serde(default)]
        setpoint: f64,
        max_age_sec: f64,
    },
    MeasurementPastAverage {
        source: MeasurementRef,
        direction: Direction,
        setpoint: f64,
        max_age_sec: f64,
    },
    MeasurementPastSum {
        source: MeasurementRef,
        direction: Direction,
        setpoint: f64,
        max_age_sec: f64,
    },
    MeasurementMissing {
        source: MeasurementRef,
        max_age_sec: f64,
    },
    PinState {
        device_id: String,
        pin: u32,
        state: bool,
    },
    OutputState {
        device_id: String,
        #[serde(default)]
        channel: u32,
        state: bool,
    },
    OutputDurationOn {
        device_id: String,
        #[serde(default)]
        channel: u32,
        direction: Direction,
        setpoint_sec: f64,
    },
    ControllerActive {
        controller_id: String,
        active: bool,
    },
}

// ============================================================================
// Actions
// ============================================================================

/// One step of an action chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    /// Controller the action belongs to
    pub owner_id: String,
    /// Explicit order within the owner's chain
    #[serde(default)]
    pub sequence: i64,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Output {
        device_id: String,
        #[serde(default)]
        channel: u32,
        command: OutputCommand,
    },
    RunCommand {
        command: String,
        #[serde(default = "default_command_timeout")]
        timeout_sec: f64,
    },
    CreateNote {
        name: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    Email {
        recipients: Vec<String>,
    },
    EmailWithCapture {
        recipients: Vec<String>,
        camera_id: String,
    },
    Activate {
        controller_id: String,
    },
    Deactivate {
        controller_id: String,
    },
    PidPause {
        pid_id: String,
    },
    PidResume {
        pid_id: String,
    },
    PidHold {
        pid_id: String,
    },
    PidSetSetpoint {
        pid_id: String,
        setpoint: f64,
    },
    PidRaiseSetpoint {
        pid_id: String,
        amount: f64,
    },
    PidLowerSetpoint {
        pid_id: String,
        amount: f64,
    },
    PidSetMethod {
        pid_id: String,
        #[serde(default)]
        method_id: Option<String>,
    },
    LcdFlash {
        device_id: String,
        #[serde(default)]
        line: u32,
        on: bool,
    },
    LcdBacklight {
        device_id: String,
        on: bool,
    },
    PauseActions {
        duration_sec: f64,
    },
}

fn default_command_timeout() -> f64 {
    action_const::DEFAULT_COMMAND_TIMEOUT_SEC
}

/// Requested state for an output channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputCommand {
    On,
    Off,
    Duration { sec: f64 },
    DutyCycle { percent: f64 },
    /// Step the duty cycle from `from` to `to` over `duration_sec`
    Ramp {
        from: f64,
        to: f64,
        duration_sec: f64,
        step_sec: f64,
    },
}

// ============================================================================
// Methods
// ============================================================================

/// A time-indexed setpoint profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub id: String,
    pub name: String,
    #[serde(default = "default_method_kind")]
    pub kind: MethodKind,
    pub segments: Vec<MethodData>,
}

fn default_method_kind() -> MethodKind {
    MethodKind::Duration
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Offsets are seconds since the method was started
    Duration,
    /// Offsets are seconds since local midnight; repeats every day
    Daily,
}

/// One segment of a method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodData {
    #[serde(default)]
    pub start_offset_sec: f64,
    /// Zero marks a terminal hold/repeat segment
    pub duration_sec: f64,
    pub setpoint_start: f64,
    /// Linear ramp target; absent means a flat segment
    #[serde(default)]
    pub setpoint_end: Option<f64>,
    /// On a terminal segment: restart from the first segment instead of holding
    #[serde(default)]
    pub repeat: bool,
    /// On a repeating segment: total run time after which the method ends
    #[serde(default)]
    pub end_after_sec: Option<f64>,
}

// ============================================================================
// Outputs
// ============================================================================

/// Actuator device driven by the built-in output bank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDevice {
    pub id: String,
    pub name: String,
    pub channels: Vec<OutputChannel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChannel {
    pub channel: u32,
    #[serde(default)]
    pub backend: OutputBackend,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputBackend {
    /// State is only tracked in memory
    #[default]
    Virtual,
    /// Shell commands; `pwm_command` may contain `{duty}`
    Command {
        on_command: String,
        off_command: String,
        #[serde(default)]
        pwm_command: Option<String>,
    },
}

// ============================================================================
// Notes
// ============================================================================

/// A note created by an action chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub text: String,
    pub created: DateTime<Utc>,
}

// ============================================================================
// Settings and the config document
// ============================================================================

/// Runtime-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "default_period")]
    pub default_period_sec: f64,
    #[serde(default = "default_init_retries")]
    pub init_retries: u32,
    #[serde(default = "default_init_backoff")]
    pub init_backoff_sec: f64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_sec: f64,
    #[serde(default = "default_pause_max")]
    pub pause_action_max_sec: f64,
    #[serde(default = "default_retention")]
    pub store_retention: usize,
}

fn default_period() -> f64 {
    timing::DEFAULT_PERIOD_SEC
}

fn default_init_retries() -> u32 {
    timing::DEFAULT_INIT_RETRIES
}

fn default_init_backoff() -> f64 {
    timing::DEFAULT_INIT_BACKOFF_SEC
}

fn default_lock_timeout() -> f64 {
    lock_const::DEFAULT_TIMEOUT_SEC
}

fn default_pause_max() -> f64 {
    action_const::DEFAULT_PAUSE_MAX_SEC
}

fn default_retention() -> usize {
    store_const::DEFAULT_RETENTION
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            default_period_sec: default_period(),
            init_retries: default_init_retries(),
            init_backoff_sec: default_init_backoff(),
            lock_timeout_sec: default_lock_timeout(),
            pause_action_max_sec: default_pause_max(),
            store_retention: default_retention(),
        }
    }
}

/// Notification channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default = "default_ceiling")]
    pub hourly_ceiling: u32,
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Deliver through sendmail when set, otherwise only log
    #[serde(default)]
    pub sendmail_path: Option<String>,
    #[serde(default = "default_from")]
    pub from: String,
}

fn default_ceiling() -> u32 {
    notify_const::DEFAULT_HOURLY_CEILING
}

fn default_channel() -> String {
    notify_const::DEFAULT_CHANNEL.to_string()
}

fn default_from() -> String {
    "verdant@localhost".to_string()
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            hourly_ceiling: default_ceiling(),
            channel: default_channel(),
            sendmail_path: None,
            from: default_from(),
        }
    }
}

/// The complete persisted configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdantConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub controllers: Vec<Controller>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub conversions: Vec<Conversion>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub methods: Vec<Method>,
    #[serde(default)]
    pub outputs: Vec<OutputDevice>,
}

fn default_version() -> u32 {
    1
}

impl Default for VerdantConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            general: GeneralSettings::default(),
            notifications: NotificationSettings::default(),
            controllers: Vec::new(),
            channels: Vec::new(),
            conversions: Vec::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
            methods: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

impl VerdantConfig {
    pub fn controller(&self, id: &str) -> Option<&Controller> {
        self.controllers.iter().find(|c| c.id == id)
    }

    pub fn controller_mut(&mut self, id: &str) -> Option<&mut Controller> {
        self.controllers.iter_mut().find(|c| c.id == id)
    }

    /// Enabled channels of a device, ordered by channel index
    pub fn channels_for(&self, device_id: &str) -> Vec<&Channel> {
        let mut channels: Vec<&Channel> = self
            .channels
            .iter()
            .filter(|c| c.device_id == device_id && c.enabled)
            .collect();
        channels.sort_by_key(|c| c.channel);
        channels
    }

    pub fn conversion(&self, id: &str) -> Option<&Conversion> {
        self.conversions.iter().find(|c| c.id == id)
    }

    /// Conditions owned by a Conditional, in configuration order
    pub fn conditions_for(&self, conditional_id: &str) -> Vec<&Condition> {
        self.conditions
            .iter()
            .filter(|c| c.conditional_id == conditional_id)
            .collect()
    }

    /// Actions owned by a controller, ordered by their sequence field
    pub fn actions_for(&self, owner_id: &str) -> Vec<&Action> {
        let mut actions: Vec<&Action> = self.actions.iter().filter(|a| a.owner_id == owner_id).collect();
        actions.sort_by_key(|a| a.sequence);
        actions
    }

    /// Ordered action ids of a controller's chain
    pub fn action_ids_for(&self, owner_id: &str) -> Vec<String> {
        self.actions_for(owner_id).into_iter().map(|a| a.id.clone()).collect()
    }

    pub fn action(&self, id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn method(&self, id: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.id == id)
    }

    pub fn output(&self, id: &str) -> Option<&OutputDevice> {
        self.outputs.iter().find(|o| o.id == id)
    }
}
