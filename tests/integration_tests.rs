/*
 * Integration tests for Verdant
 *
 * These tests drive the supervisor end to end: configuration in memory,
 * measurements in the in-memory store and outputs on the virtual bank.
 */

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use serial_test::serial;
use vd_core::actions::{MemoryNoteStore, PidCommand};
use vd_core::constants::actions as action_const;
use vd_core::constants::paths;
use vd_core::data::{
    Action, ActionKind, BoundOptions, Channel, Condition, ConditionKind, ConfigStore, Controller, ControllerKind, Conversion,
    Direction, EdgeKind, InputConfig, JsonConfigStore, MathConfig, MathKind, MeasurementRef, MemoryConfigStore, Method,
    MethodData, MethodKind, OptionSpec, OutputChannel, OutputCommand, OutputDevice, PidConfig, PidDirection, PidOutput,
    PidOutputMode, PreOutput, TriggerConfig, TriggerKind, VerdantConfig,
};
use vd_core::engine::rules::{self, RuleContext, RuleOutcome};
use vd_core::hw::{Actuator, InputDriver, OutputBank, RawReadings};
use vd_core::measurement::{InMemoryStore, MeasurementStore, Sample};
use vd_core::notify::{Notification, Notifier, RateLimitedNotifier, SendOutcome};
use vd_core::registry::DeviceRegistry;
use vd_error::Result;
use verdant::{EdgeEvent, LoopCommand, LoopState, RuntimeBuilder, Supervisor};

// Test utilities

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl Notifier for RecordingNotifier {
    fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

const NO_OPTIONS: &[OptionSpec] = &[];

/// Input driver returning a fixed reading and counting its measurements
struct FixedDriver {
    value: f64,
    measured: Arc<AtomicU32>,
}

#[async_trait]
impl InputDriver for FixedDriver {
    async fn measure(&mut self) -> Result<RawReadings> {
        self.measured.fetch_add(1, Ordering::SeqCst);
        let mut readings = RawReadings::new();
        readings.insert(0, self.value);
        Ok(readings)
    }
}

/// Input driver reading a temperature on CH0 and a raw humidity on CH1
struct PairDriver {
    measured: Arc<AtomicU32>,
}

#[async_trait]
impl InputDriver for PairDriver {
    async fn measure(&mut self) -> Result<RawReadings> {
        self.measured.fetch_add(1, Ordering::SeqCst);
        let mut readings = RawReadings::new();
        readings.insert(0, 21.5);
        readings.insert(1, 55.0);
        Ok(readings)
    }
}

struct Harness {
    supervisor: Supervisor,
    config: Arc<MemoryConfigStore>,
    measurements: Arc<InMemoryStore>,
    notifier: Arc<RecordingNotifier>,
    notes: Arc<MemoryNoteStore>,
    measured: Arc<AtomicU32>,
}

impl Harness {
    fn new(config: VerdantConfig) -> Self {
        Self::with_ceiling(config, 10)
    }

    fn with_ceiling(config: VerdantConfig, ceiling: u32) -> Self {
        let config = Arc::new(MemoryConfigStore::new(config));
        let registry = Arc::new(DeviceRegistry::load(config.clone()).unwrap());
        let measurements = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let notes = Arc::new(MemoryNoteStore::new());
        let measured = Arc::new(AtomicU32::new(0));

        let mut drivers = vd_core::hw::DriverRegistry::with_builtin();
        let counter = measured.clone();
        drivers.register(
            "fixed",
            NO_OPTIONS,
            Arc::new(move |_: &str, _: &BoundOptions| {
                Ok(Box::new(FixedDriver {
                    value: 21.5,
                    measured: counter.clone(),
                }) as Box<dyn InputDriver>)
            }),
        );
        let counter = measured.clone();
        drivers.register(
            "pair",
            NO_OPTIONS,
            Arc::new(move |_: &str, _: &BoundOptions| {
                Ok(Box::new(PairDriver { measured: counter.clone() }) as Box<dyn InputDriver>)
            }),
        );

        let builder = RuntimeBuilder::new(registry)
            .store(measurements.clone())
            .drivers(drivers)
            .notes(notes.clone())
            .notifier(Arc::new(RateLimitedNotifier::new(notifier.clone(), "email", ceiling)));
        Self {
            supervisor: Supervisor::new(builder),
            config,
            measurements,
            notifier,
            notes,
            measured,
        }
    }

    fn output_on(&self, device_id: &str) -> bool {
        self.supervisor.context().actuator.state(device_id, 0).unwrap().on
    }

    fn duty(&self, device_id: &str) -> f64 {
        self.supervisor.context().actuator.state(device_id, 0).unwrap().duty_cycle
    }

    fn persisted_active(&self, id: &str) -> bool {
        self.config.load().unwrap().controller(id).unwrap().active
    }

    fn record(&self, device_id: &str, measurement: &str, value: f64) {
        self.measurements
            .append(
                &MeasurementRef::new(device_id, measurement, 0),
                "",
                Sample { timestamp: Utc::now(), value },
            )
            .unwrap();
    }
}

/// Poll `check` on the paused clock until it holds or `secs` have passed
async fn wait_until(secs: f64, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(secs);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    check()
}

fn controller(id: &str, name: &str, active: bool, kind: ControllerKind) -> Controller {
    Controller {
        id: id.into(),
        name: name.into(),
        active,
        log_level_debug: false,
        period_sec: None,
        kind,
    }
}

fn action(id: &str, owner: &str, sequence: i64, kind: ActionKind) -> Action {
    Action {
        id: id.into(),
        owner_id: owner.into(),
        sequence,
        kind,
    }
}

fn output(id: &str) -> OutputDevice {
    OutputDevice {
        id: id.into(),
        name: id.into(),
        channels: vec![OutputChannel {
            channel: 0,
            backend: Default::default(),
        }],
    }
}

fn channel(device_id: &str, channel: u32, measurement: &str, unit: &str, conversion_id: Option<&str>) -> Channel {
    Channel {
        device_id: device_id.into(),
        channel,
        measurement: measurement.into(),
        unit: unit.into(),
        conversion_id: conversion_id.map(str::to_string),
        enabled: true,
        name: None,
    }
}

fn math(kind: MathKind, inputs: Vec<MeasurementRef>) -> ControllerKind {
    ControllerKind::Math(MathConfig {
        kind,
        inputs,
        max_age_sec: 60.0,
        measurement: "temperature".into(),
        unit: "C".into(),
        custom_options: Default::default(),
    })
}

fn note_texts(h: &Harness) -> Vec<String> {
    h.notes.notes().into_iter().map(|n| n.text).collect()
}

fn input(driver: &str, period_sec: f64) -> Controller {
    let mut probe = controller(
        "probe",
        "Probe",
        true,
        ControllerKind::Input(InputConfig {
            driver: driver.into(),
            custom_options: Default::default(),
            pre_output: None,
            actions_after_measure: false,
        }),
    );
    probe.period_sec = Some(period_sec);
    probe
}

fn trigger(id: &str, kind: TriggerKind) -> Controller {
    controller(id, id, true, ControllerKind::Trigger(TriggerConfig { kind }))
}

fn note_action(id: &str, owner: &str) -> Action {
    action(id, owner, 1, ActionKind::CreateNote { name: "log".into(), tags: vec![] })
}

fn flat_method(id: &str, duration_sec: f64, value: f64) -> Method {
    Method {
        id: id.into(),
        name: id.into(),
        kind: MethodKind::Duration,
        segments: vec![MethodData {
            start_offset_sec: 0.0,
            duration_sec,
            setpoint_start: value,
            setpoint_end: None,
            repeat: false,
            end_after_sec: None,
        }],
    }
}

fn pid(setpoint: f64, method_id: Option<&str>) -> ControllerKind {
    ControllerKind::Pid(PidConfig {
        source: MeasurementRef::new("probe", "temperature", 0),
        max_age_sec: 60.0,
        setpoint,
        method_id: method_id.map(str::to_string),
        band: 0.0,
        direction: PidDirection::Both,
        kp: 1.0,
        ki: 0.0,
        kd: 0.0,
        integrator_min: -100.0,
        integrator_max: 100.0,
        raise: Some(PidOutput {
            device_id: "heater".into(),
            channel: 0,
            mode: PidOutputMode::Pwm { min_duty: 0.0, max_duty: 100.0 },
        }),
        lower: None,
    })
}

// Condition evaluation

#[test]
fn test_staleness_boundary_and_none_found() {
    let store = InMemoryStore::new();
    let key = MeasurementRef::new("probe", "temperature", 0);
    let taken = Utc::now();
    store.append(&key, "C", Sample { timestamp: taken, value: 25.0 }).unwrap();

    let registry = DeviceRegistry::load(Arc::new(MemoryConfigStore::default())).unwrap();
    let bank = OutputBank::default();
    let ctx = RuleContext {
        store: &store,
        actuator: &bank,
        pins: None,
        controllers: &registry,
    };

    let above = ConditionKind::Measurement {
        source: key.clone(),
        direction: Direction::Above,
        setpoint: 20.0,
        max_age_sec: 60.0,
    };
    let none_found = ConditionKind::Measurement {
        source: key,
        direction: Direction::NoneFound,
        setpoint: 0.0,
        max_age_sec: 60.0,
    };

    let fresh = taken + chrono::Duration::seconds(59);
    let stale = taken + chrono::Duration::seconds(61);

    assert_eq!(rules::evaluate_at(&above, &ctx, fresh).outcome, RuleOutcome::Triggered);
    assert_eq!(rules::evaluate_at(&above, &ctx, stale).outcome, RuleOutcome::Indeterminate);

    // Never both at the same instant
    for now in [fresh, stale] {
        let a = rules::evaluate_at(&above, &ctx, now).outcome.is_triggered();
        let n = rules::evaluate_at(&none_found, &ctx, now).outcome.is_triggered();
        assert!(!(a && n));
        assert!(a || n);
    }
}

// Action chains

#[tokio::test(start_paused = true)]
async fn test_chain_failure_keeps_order_and_sends_one_email() {
    let mut config = VerdantConfig::default();
    config.controllers = vec![controller("fn", "Maintenance", true, ControllerKind::Function)];
    config.actions = vec![
        action(
            "a1",
            "fn",
            1,
            ActionKind::Output {
                device_id: "missing".into(),
                channel: 0,
                command: OutputCommand::On,
            },
        ),
        action(
            "a2",
            "fn",
            2,
            ActionKind::CreateNote {
                name: "log".into(),
                tags: vec!["maintenance".into()],
            },
        ),
        action("a3", "fn", 3, ActionKind::Email { recipients: vec!["ops@example.org".into()] }),
    ];
    let h = Harness::new(config);

    let outcome = h.supervisor.run_function("fn").await.unwrap();
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].0, "a1");
    assert!(outcome.message.starts_with("Function Maintenance."));

    let failure = outcome.message.find(action_const::ERROR_MARKER).unwrap();
    let note = outcome.message.find("Note 'log' created.").unwrap();
    assert!(failure < note);

    let sent = h.notifier.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Verdant: Maintenance");
    assert_eq!(sent[0].body, outcome.message);
    assert_eq!(h.notes.notes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_email_ceiling_suppresses_extra_sends() {
    let mut config = VerdantConfig::default();
    config.controllers = vec![controller("alert", "Alert", true, ControllerKind::Function)];
    config.actions = vec![action("mail", "alert", 0, ActionKind::Email { recipients: vec!["a@b.c".into()] })];
    let h = Harness::with_ceiling(config, 2);

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(h.supervisor.run_function("alert").await.unwrap().email);
    }
    assert_eq!(
        outcomes,
        vec![Some(SendOutcome::Sent), Some(SendOutcome::Sent), Some(SendOutcome::Suppressed)]
    );
    assert_eq!(h.notifier.sent.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_activate_action_starts_controller() {
    let mut config = VerdantConfig::default();
    config.controllers = vec![
        controller("fn", "Switch on", true, ControllerKind::Function),
        controller(
            "timer",
            "Timer",
            false,
            ControllerKind::Trigger(TriggerConfig {
                kind: TriggerKind::Timer { period_sec: 30.0, start_offset_sec: 0.0 },
            }),
        ),
    ];
    config.actions = vec![action("act", "fn", 0, ActionKind::Activate { controller_id: "timer".into() })];
    let h = Harness::new(config);

    let outcome = h.supervisor.run_function("fn").await.unwrap();
    assert!(outcome.errors.is_empty());

    let mut running = Vec::new();
    for _ in 0..50 {
        running = h.supervisor.running().await;
        if !running.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(running, vec!["timer"]);
    assert!(h.persisted_active("timer"));
    h.supervisor.shutdown().await;
}

// Controller loops

#[tokio::test(start_paused = true)]
async fn test_conditional_turns_on_output() {
    let config: VerdantConfig = serde_json::from_value(json!({
        "controllers": [
            { "id": "cond", "name": "Too warm", "active": true,
              "kind": { "type": "conditional", "start_offset_sec": 0.0 } }
        ],
        "conditions": [
            { "id": "hot", "conditional_id": "cond", "period_sec": 1.0, "refractory_sec": 30.0,
              "kind": { "type": "measurement",
                        "source": { "device_id": "probe", "measurement": "temperature", "channel": 0 },
                        "direction": "above", "setpoint": 30.0, "max_age_sec": 60.0 } }
        ],
        "actions": [
            { "id": "fan-on", "owner_id": "cond", "sequence": 0,
              "kind": { "type": "output", "device_id": "fan", "channel": 0, "command": { "type": "on" } } },
            { "id": "note", "owner_id": "cond", "sequence": 1,
              "kind": { "type": "create_note", "name": "heat" } }
        ],
        "outputs": [ { "id": "fan", "name": "Fan", "channels": [ { "channel": 0 } ] } ]
    }))
    .unwrap();
    let h = Harness::new(config);
    h.record("probe", "temperature", 25.0);

    assert_eq!(h.supervisor.start_all().await, 1);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!h.output_on("fan"));

    h.record("probe", "temperature", 35.0);
    assert!(wait_until(3.0, || h.output_on("fan")).await);

    // Refractory period keeps the chain from running on every tick
    tokio::time::sleep(Duration::from_secs(5)).await;
    let notes = h.notes.notes();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].text.starts_with("Too warm (hot):"));
    h.supervisor.shutdown().await;
    assert!(!h.output_on("fan"));
}

#[tokio::test(start_paused = true)]
async fn test_edge_trigger_fires_on_matching_edge() {
    let mut config = VerdantConfig::default();
    config.controllers = vec![controller(
        "door",
        "Door switch",
        true,
        ControllerKind::Trigger(TriggerConfig {
            kind: TriggerKind::Edge {
                device_id: "gpio".into(),
                pin: 4,
                edge: EdgeKind::Rising,
                debounce_ms: 0,
            },
        }),
    )];
    config.actions = vec![action(
        "light",
        "door",
        0,
        ActionKind::Output {
            device_id: "lamp".into(),
            channel: 0,
            command: OutputCommand::On,
        },
    )];
    config.outputs = vec![output("lamp")];
    let h = Harness::new(config);
    h.supervisor.start_all().await;

    assert_eq!(h.supervisor.notify_edge(EdgeEvent::new("gpio", 5, true)).await, 0);
    assert_eq!(h.supervisor.notify_edge(EdgeEvent::new("gpio", 4, false)).await, 1);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!h.output_on("lamp"));

    assert_eq!(h.supervisor.notify_edge(EdgeEvent::new("gpio", 4, true)).await, 1);
    assert!(wait_until(2.0, || h.output_on("lamp")).await);
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stuck_pre_output_lock_is_cleared() {
    let mut config = VerdantConfig::default();
    config.general.lock_timeout_sec = 1.0;
    let mut probe = controller(
        "probe",
        "Probe",
        true,
        ControllerKind::Input(InputConfig {
            driver: "fixed".into(),
            custom_options: Default::default(),
            pre_output: Some(PreOutput {
                device_id: "relay".into(),
                channel: 0,
                duration_sec: 1.0,
                during_measure: false,
            }),
            actions_after_measure: false,
        }),
    );
    probe.period_sec = Some(10.0);
    config.controllers = vec![probe];
    config.channels = vec![channel("probe", 0, "temperature", "C", None)];
    config.outputs = vec![output("relay")];
    let h = Harness::new(config);

    let lock = "pre-output:relay:0";
    let _stuck = h
        .supervisor
        .context()
        .locks
        .acquire(lock, Duration::from_secs(1))
        .await
        .unwrap();
    h.supervisor.start_all().await;

    // Waits max(lock timeout, hold + margin) = 6s before clearing the lock
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.measured.load(Ordering::SeqCst), 0);
    assert!(!h.output_on("relay"));

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!h.supervisor.context().locks.is_held(lock));
    assert_eq!(h.measured.load(Ordering::SeqCst), 0);

    // The next tick takes the lock and measures
    let key = MeasurementRef::new("probe", "temperature", 0);
    assert!(wait_until(8.0, || h.measurements.read_latest(&key, 60.0).is_some()).await);
    assert_eq!(h.measurements.read_latest(&key, 60.0).unwrap().value, 21.5);
    assert!(!h.output_on("relay"));
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pwm_method_drives_duty_then_deactivates() {
    let mut config = VerdantConfig::default();
    config.controllers = vec![controller(
        "dawn",
        "Dawn",
        true,
        ControllerKind::Trigger(TriggerConfig {
            kind: TriggerKind::RunPwmMethod {
                method_id: "m".into(),
                device_id: "lamp".into(),
                channel: 0,
                period_sec: 1.0,
                trigger_actions_at_start: false,
            },
        }),
    )];
    config.methods = vec![flat_method("m", 4.0, 40.0)];
    config.outputs = vec![output("lamp")];
    let h = Harness::new(config);
    h.supervisor.start_all().await;

    assert!(wait_until(2.0, || h.duty("lamp") == 40.0).await);
    let mut running = h.supervisor.running().await;
    for _ in 0..100 {
        if running.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        running = h.supervisor.running().await;
    }
    assert!(running.is_empty());
    assert!(!h.persisted_active("dawn"));
    assert_eq!(h.duty("lamp"), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_pid_setpoint_command_while_running() {
    let mut config = VerdantConfig::default();
    let mut regulator = controller("pid", "Heat", true, pid(20.0, None));
    regulator.period_sec = Some(1.0);
    config.controllers = vec![regulator];
    config.outputs = vec![output("heater")];
    let h = Harness::new(config);
    h.record("probe", "temperature", 18.0);
    h.supervisor.start_all().await;

    let setpoint = MeasurementRef::new("pid", "setpoint", 0);
    assert!(wait_until(2.0, || h.measurements.read_latest(&setpoint, 60.0).is_some()).await);
    assert_eq!(h.measurements.read_latest(&setpoint, 60.0).unwrap().value, 20.0);
    assert!(h.duty("heater") > 0.0);

    h.supervisor
        .command("pid", LoopCommand::Pid(PidCommand::SetSetpoint(25.0)))
        .await
        .unwrap();
    assert!(
        wait_until(3.0, || h
            .measurements
            .read_latest(&setpoint, 60.0)
            .is_some_and(|s| s.value == 25.0))
        .await
    );
    h.supervisor.shutdown().await;
    assert_eq!(h.duty("heater"), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_pid_method_end_deactivates() {
    let mut config = VerdantConfig::default();
    let mut regulator = controller("pid", "Heat", true, pid(20.0, Some("warmup")));
    regulator.period_sec = Some(1.0);
    config.controllers = vec![regulator];
    config.methods = vec![flat_method("warmup", 3.0, 22.0)];
    config.outputs = vec![output("heater")];
    let h = Harness::new(config);
    h.record("probe", "temperature", 18.0);
    h.supervisor.start_all().await;

    let setpoint = MeasurementRef::new("pid", "setpoint", 0);
    assert!(wait_until(2.0, || h.measurements.read_latest(&setpoint, 60.0).is_some()).await);
    assert_eq!(h.measurements.read_latest(&setpoint, 60.0).unwrap().value, 22.0);

    let mut stopped = false;
    for _ in 0..100 {
        if h.supervisor.running().await.is_empty() {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(stopped);
    assert!(!h.persisted_active("pid"));
    assert_eq!(h.duty("heater"), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_sync_reloads_changed_condition() {
    let mut config = VerdantConfig::default();
    config.controllers = vec![controller(
        "cond",
        "Cold",
        true,
        ControllerKind::Conditional(Default::default()),
    )];
    config.conditions = vec![Condition {
        id: "cold".into(),
        conditional_id: "cond".into(),
        period_sec: 1.0,
        refractory_sec: 0.0,
        kind: ConditionKind::Measurement {
            source: MeasurementRef::new("probe", "temperature", 0),
            direction: Direction::Below,
            setpoint: 10.0,
            max_age_sec: 60.0,
        },
    }];
    config.actions = vec![action(
        "heat",
        "cond",
        0,
        ActionKind::Output {
            device_id: "heater".into(),
            channel: 0,
            command: OutputCommand::On,
        },
    )];
    config.outputs = vec![output("heater")];
    let h = Harness::new(config);
    h.record("probe", "temperature", 15.0);
    h.supervisor.start_all().await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!h.output_on("heater"));

    h.config.update(|c| {
        if let ConditionKind::Measurement { setpoint, .. } = &mut c.conditions[0].kind {
            *setpoint = 18.0;
        }
    });
    h.supervisor.sync().await.unwrap();
    assert_eq!(h.supervisor.running().await, vec!["cond"]);
    assert!(wait_until(3.0, || h.output_on("heater")).await);
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_config_file_edits_are_synced() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::env::set_var(paths::CONFIG_ENV, &path);
    assert_eq!(paths::default_config_path(), path);
    std::env::remove_var(paths::CONFIG_ENV);

    let file = Arc::new(JsonConfigStore::new(&path));
    let mut config = VerdantConfig::default();
    config.controllers = vec![controller(
        "timer",
        "Timer",
        false,
        ControllerKind::Trigger(TriggerConfig {
            kind: TriggerKind::Timer { period_sec: 30.0, start_offset_sec: 0.0 },
        }),
    )];
    file.save(&config).unwrap();

    let registry = Arc::new(DeviceRegistry::load(file.clone()).unwrap());
    let supervisor = Supervisor::new(RuntimeBuilder::new(registry));
    assert_eq!(supervisor.start_all().await, 0);

    config.controllers[0].active = true;
    file.save(&config).unwrap();
    supervisor.sync().await.unwrap();
    assert_eq!(supervisor.running().await, vec!["timer"]);

    supervisor.deactivate("timer").await.unwrap();
    assert!(!JsonConfigStore::new(&path).load().unwrap().controller("timer").unwrap().active);
    assert!(supervisor.running().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_math_average_writes_channel_zero() {
    let mut config = VerdantConfig::default();
    let mut avg = controller(
        "avg",
        "Average",
        true,
        math(
            MathKind::Average,
            vec![
                MeasurementRef::new("left", "temperature", 0),
                MeasurementRef::new("right", "temperature", 0),
            ],
        ),
    );
    avg.period_sec = Some(5.0);
    config.controllers = vec![avg];
    let h = Harness::new(config);
    h.record("left", "temperature", 20.0);
    h.record("right", "temperature", 24.0);

    h.supervisor.start_all().await;
    let key = MeasurementRef::new("avg", "temperature", 0);
    assert!(wait_until(2.0, || h.measurements.read_latest(&key, 60.0).is_some()).await);
    assert_eq!(h.measurements.read_latest(&key, 60.0).unwrap().value, 22.0);

    // New inputs show up on the next period
    h.record("left", "temperature", 30.0);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.measurements.read_latest(&key, 60.0).unwrap().value, 27.0);
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_math_redundancy_falls_back_to_next_input() {
    let mut config = VerdantConfig::default();
    let mut backup = controller(
        "backup",
        "Backup",
        true,
        math(
            MathKind::Redundancy,
            vec![
                MeasurementRef::new("primary", "temperature", 0),
                MeasurementRef::new("secondary", "temperature", 0),
                MeasurementRef::new("tertiary", "temperature", 0),
            ],
        ),
    );
    backup.period_sec = Some(5.0);
    config.controllers = vec![backup];
    let h = Harness::new(config);
    h.record("secondary", "temperature", 18.5);
    h.record("tertiary", "temperature", 40.0);

    h.supervisor.start_all().await;
    let key = MeasurementRef::new("backup", "temperature", 0);
    assert!(wait_until(2.0, || h.measurements.read_latest(&key, 60.0).is_some()).await);
    assert_eq!(h.measurements.read_latest(&key, 60.0).unwrap().value, 18.5);

    // Once the primary reports it wins again
    h.record("primary", "temperature", 19.0);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.measurements.read_latest(&key, 60.0).unwrap().value, 19.0);
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_math_skips_write_when_input_missing() {
    let mut config = VerdantConfig::default();
    let mut avg = controller(
        "avg",
        "Average",
        true,
        math(
            MathKind::Average,
            vec![
                MeasurementRef::new("left", "temperature", 0),
                MeasurementRef::new("ghost", "temperature", 0),
            ],
        ),
    );
    avg.period_sec = Some(5.0);
    config.controllers = vec![avg];
    let h = Harness::new(config);
    h.record("left", "temperature", 20.0);

    h.supervisor.start_all().await;
    tokio::time::sleep(Duration::from_secs(12)).await;
    let key = MeasurementRef::new("avg", "temperature", 0);
    assert!(h.measurements.read_latest(&key, 60.0).is_none());
    assert_eq!(h.supervisor.state("avg").await, Some(LoopState::Running));

    // The missing input turning up lets the next period write
    h.record("ghost", "temperature", 22.0);
    assert!(wait_until(6.0, || h.measurements.read_latest(&key, 60.0).is_some()).await);
    assert_eq!(h.measurements.read_latest(&key, 60.0).unwrap().value, 21.0);
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_input_keeps_good_channels_when_conversion_fails() {
    let mut config = VerdantConfig::default();
    config.controllers = vec![input("pair", 5.0)];
    config.conversions = vec![Conversion {
        id: "rh".into(),
        from_unit: "raw".into(),
        to_unit: "%".into(),
        equation: "sqrt(x - 100)".into(),
    }];
    config.channels = vec![
        channel("probe", 0, "temperature", "C", None),
        channel("probe", 1, "humidity", "raw", Some("rh")),
    ];
    let h = Harness::new(config);

    h.supervisor.start_all().await;
    let temperature = MeasurementRef::new("probe", "temperature", 0);
    let humidity = MeasurementRef::new("probe", "humidity", 1);
    assert!(wait_until(2.0, || h.measurements.read_latest(&temperature, 60.0).is_some()).await);
    assert_eq!(h.measurements.read_latest(&temperature, 60.0).unwrap().value, 21.5);
    assert!(h.measurements.read_latest(&humidity, 60.0).is_none());

    // The failing channel does not stop the loop
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(h.measured.load(Ordering::SeqCst) >= 3);
    assert_eq!(h.supervisor.state("probe").await, Some(LoopState::Running));
    assert!(h.measurements.read_latest(&humidity, 60.0).is_none());
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_timer_trigger_honors_offset_and_period() {
    let mut config = VerdantConfig::default();
    config.controllers = vec![trigger(
        "timer",
        TriggerKind::Timer {
            period_sec: 30.0,
            start_offset_sec: 10.0,
        },
    )];
    config.actions = vec![note_action("note", "timer")];
    let h = Harness::new(config);

    h.supervisor.start_all().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.notes.notes().is_empty());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.notes.notes().len(), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let texts = note_texts(&h);
    assert_eq!(texts.len(), 2);
    assert!(texts.iter().all(|text| text.contains("timer: timer fired.")));
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_daily_time_point_fires_once_when_reached() {
    let at = (chrono::Local::now() + chrono::Duration::seconds(3)).format("%H:%M:%S").to_string();
    let mut config = VerdantConfig::default();
    config.controllers = vec![trigger("daily", TriggerKind::DailyTimePoint { time: at.clone() })];
    config.actions = vec![note_action("note", "daily")];
    let h = Harness::new(config);

    h.supervisor.start_all().await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(h.notes.notes().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let texts = note_texts(&h);
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains(&format!("daily time {} reached.", at)));
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_daily_span_fires_only_inside_span() {
    let now = chrono::Local::now();
    let hm = |offset_hours: i64| (now + chrono::Duration::hours(offset_hours)).format("%H:%M").to_string();
    let mut config = VerdantConfig::default();
    config.controllers = vec![
        trigger(
            "inside",
            TriggerKind::DailyTimeSpan {
                start: hm(-1),
                end: hm(1),
                period_sec: 10.0,
            },
        ),
        trigger(
            "outside",
            TriggerKind::DailyTimeSpan {
                start: hm(1),
                end: hm(2),
                period_sec: 10.0,
            },
        ),
    ];
    config.actions = vec![note_action("n-in", "inside"), note_action("n-out", "outside")];
    let h = Harness::new(config);

    h.supervisor.start_all().await;
    tokio::time::sleep(Duration::from_secs(25)).await;
    let texts = note_texts(&h);
    assert_eq!(texts.len(), 3);
    let expected = format!("inside: within {} - {}.", hm(-1), hm(1));
    assert!(texts.iter().all(|text| text.contains(&expected)));
    assert_eq!(h.supervisor.state("outside").await, Some(LoopState::Running));
    h.supervisor.shutdown().await;
}
