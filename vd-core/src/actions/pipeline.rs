//! Sequential action chain execution

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, warn};
use vd_error::{Result, VerdantError};

use super::{ChainContext, ChainOutcome, ControlRequest, ControllerControl, NoteStore, PidCommand};
use crate::constants::actions as action_const;
use crate::data::{Action, ActionKind, Note, OutputCommand};
use crate::hw::{Actuator, ActuatorCommand, Capture, DisplayCommand};
use crate::notify::{Notification, RateLimitedNotifier, SendOutcome};
use crate::registry::Snapshot;

/// Executes action chains against the shared capabilities
#[derive(Clone)]
pub struct ActionPipeline {
    actuator: Arc<dyn Actuator>,
    notifier: Arc<RateLimitedNotifier>,
    notes: Arc<dyn NoteStore>,
    control: Arc<dyn ControllerControl>,
    capture: Option<Arc<dyn Capture>>,
    pause_max_sec: f64,
}

impl std::fmt::Debug for ActionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionPipeline")
            .field("notifier", &self.notifier)
            .field("has_capture", &self.capture.is_some())
            .field("pause_max_sec", &self.pause_max_sec)
            .finish()
    }
}

impl ActionPipeline {
    pub fn new(
        actuator: Arc<dyn Actuator>,
        notifier: Arc<RateLimitedNotifier>,
        notes: Arc<dyn NoteStore>,
        control: Arc<dyn ControllerControl>,
    ) -> Self {
        Self {
            actuator,
            notifier,
            notes,
            control,
            capture: None,
            pause_max_sec: action_const::DEFAULT_PAUSE_MAX_SEC,
        }
    }

    pub fn with_capture(mut self, capture: Arc<dyn Capture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_pause_max(mut self, pause_max_sec: f64) -> Self {
        self.pause_max_sec = pause_max_sec.max(0.0);
        self
    }

    /// Run `action_ids` in order, starting from `initial_message`
    ///
    /// `owner_id` names the controller in logs and in the email subject.
    pub async fn run_chain(
        &self,
        snapshot: &Snapshot,
        owner_id: &str,
        action_ids: &[String],
        initial_message: &str,
    ) -> ChainOutcome {
        let mut ctx = ChainContext::new(initial_message);
        let mut errors = Vec::new();

        for action_id in action_ids {
            let result = match snapshot.config.action(action_id) {
                Some(action) => self.execute(action, &mut ctx).await,
                None => Err(VerdantError::config(format!("action {} not found", action_id))),
            };
            if let Err(e) = result {
                warn!(controller = %owner_id, action = %action_id, "ACTION: Failed: {}", e);
                ctx.append(&format!("{} {}: {}.", action_const::ERROR_MARKER, action_id, e));
                errors.push((action_id.clone(), e.to_string()));
            }
        }

        let email = if ctx.email_recipients.is_empty() {
            None
        } else {
            let owner_name = snapshot
                .config
                .controller(owner_id)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| owner_id.to_string());
            let notification = Notification {
                recipients: ctx.email_recipients.clone(),
                subject: format!("Verdant: {}", owner_name),
                body: ctx.message.clone(),
                attachment: ctx.attachment.clone(),
            };
            match self.send(notification).await {
                Ok(outcome) => {
                    info!(controller = %owner_id, "ACTION: Email to {} {:?}", ctx.email_recipients.join(", "), outcome);
                    Some(outcome)
                }
                Err(e) => {
                    warn!(controller = %owner_id, "ACTION: Email failed: {}", e);
                    errors.push(("email".to_string(), e.to_string()));
                    None
                }
            }
        };

        ChainOutcome {
            message: ctx.message,
            note_tags: ctx.note_tags,
            email_recipients: ctx.email_recipients,
            attachment: ctx.attachment,
            errors,
            email,
        }
    }

    async fn send(&self, notification: Notification) -> Result<SendOutcome> {
        let notifier = self.notifier.clone();
        tokio::task::spawn_blocking(move || notifier.send(&notification))
            .await
            .map_err(|e| VerdantError::Notification(format!("send task panicked: {}", e)))?
    }

    async fn actuate(&self, device_id: &str, channel: u32, command: ActuatorCommand) -> Result<()> {
        let actuator = self.actuator.clone();
        let device = device_id.to_string();
        tokio::task::spawn_blocking(move || actuator.set(&device, channel, command))
            .await
            .map_err(|e| VerdantError::actuation(device_id, channel, format!("task panicked: {}", e)))?
    }

    async fn display(&self, device_id: &str, command: DisplayCommand) -> Result<()> {
        let actuator = self.actuator.clone();
        let device = device_id.to_string();
        tokio::task::spawn_blocking(move || actuator.display(&device, command))
            .await
            .map_err(|e| VerdantError::actuation(device_id, 0, format!("task panicked: {}", e)))?
    }

    fn post(&self, ctx: &mut ChainContext, request: ControlRequest, text: String) -> Result<()> {
        self.control.post(request)?;
        ctx.append(&text);
        Ok(())
    }

    async fn execute(&self, action: &Action, ctx: &mut ChainContext) -> Result<()> {
        debug!(action = %action.id, "ACTION: Executing {:?}", action.kind);
        match &action.kind {
            ActionKind::Output { device_id, channel, command } => {
                self.output(device_id, *channel, *command).await?;
                ctx.append(&format!("Output {} CH{} {}.", device_id, channel, describe_command(command)));
            }
            ActionKind::RunCommand { command, timeout_sec } => {
                let (code, stdout) = run_command(command, *timeout_sec).await?;
                if stdout.is_empty() {
                    ctx.append(&format!("Command '{}' returned {}.", command, code));
                } else {
                    ctx.append(&format!("Command '{}' returned {}: {}", command, code, stdout));
                }
            }
            ActionKind::CreateNote { name, tags } => {
                let note = Note {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: name.clone(),
                    tags: tags.clone(),
                    text: ctx.message.clone(),
                    created: Utc::now(),
                };
                self.notes.add(note)?;
                for tag in tags {
                    if !ctx.note_tags.contains(tag) {
                        ctx.note_tags.push(tag.clone());
                    }
                }
                ctx.append(&format!("Note '{}' created.", name));
            }
            ActionKind::Email { recipients } => ctx.add_recipients(recipients),
            ActionKind::EmailWithCapture { recipients, camera_id } => {
                ctx.add_recipients(recipients);
                let capture = self
                    .capture
                    .clone()
                    .ok_or_else(|| VerdantError::NotSupported(format!("no capture device for camera {}", camera_id)))?;
                let camera = camera_id.clone();
                let path = tokio::task::spawn_blocking(move || capture.capture(&camera))
                    .await
                    .map_err(|e| VerdantError::generic(format!("capture task panicked: {}", e)))??;
                ctx.attachment = Some(path);
            }
            ActionKind::Activate { controller_id } => self.post(
                ctx,
                ControlRequest::Activate(controller_id.clone()),
                format!("Activate controller {}.", controller_id),
            )?,
            ActionKind::Deactivate { controller_id } => self.post(
                ctx,
                ControlRequest::Deactivate(controller_id.clone()),
                format!("Deactivate controller {}.", controller_id),
            )?,
            ActionKind::PidPause { pid_id } => self.pid(ctx, pid_id, PidCommand::Pause, "Pause")?,
            ActionKind::PidResume { pid_id } => self.pid(ctx, pid_id, PidCommand::Resume, "Resume")?,
            ActionKind::PidHold { pid_id } => self.pid(ctx, pid_id, PidCommand::Hold, "Hold")?,
            ActionKind::PidSetSetpoint { pid_id, setpoint } => {
                self.pid(ctx, pid_id, PidCommand::SetSetpoint(*setpoint), &format!("Set setpoint {} of", setpoint))?
            }
            ActionKind::PidRaiseSetpoint { pid_id, amount } => {
                self.pid(ctx, pid_id, PidCommand::RaiseSetpoint(*amount), &format!("Raise setpoint by {} of", amount))?
            }
            ActionKind::PidLowerSetpoint { pid_id, amount } => {
                self.pid(ctx, pid_id, PidCommand::LowerSetpoint(*amount), &format!("Lower setpoint by {} of", amount))?
            }
            ActionKind::PidSetMethod { pid_id, method_id } => {
                let label = match method_id {
                    Some(m) => format!("Set method {} of", m),
                    None => "Clear method of".to_string(),
                };
                self.pid(ctx, pid_id, PidCommand::SetMethod(method_id.clone()), &label)?
            }
            ActionKind::LcdFlash { device_id, line, on } => {
                self.display(device_id, DisplayCommand::Flash { line: *line, on: *on }).await?;
                ctx.append(&format!("Display {} line {} flash {}.", device_id, line, on_off(*on)));
            }
            ActionKind::LcdBacklight { device_id, on } => {
                self.display(device_id, DisplayCommand::Backlight { on: *on }).await?;
                ctx.append(&format!("Display {} backlight {}.", device_id, on_off(*on)));
            }
            ActionKind::PauseActions { duration_sec } => {
                let sec = duration_sec.clamp(0.0, self.pause_max_sec);
                if sec < *duration_sec {
                    warn!(action = %action.id, "ACTION: Pause of {}s capped at {}s", duration_sec, sec);
                }
                if crate::cancel::sleep_unless_stopped(Duration::from_secs_f64(sec)).await {
                    ctx.append(&format!("Paused {}s.", sec));
                } else {
                    info!(action = %action.id, "ACTION: Pause interrupted by stop");
                    ctx.append("Pause interrupted.");
                }
            }
        }
        Ok(())
    }

    fn pid(&self, ctx: &mut ChainContext, pid_id: &str, command: PidCommand, verb: &str) -> Result<()> {
        self.post(
            ctx,
            ControlRequest::Pid { pid_id: pid_id.to_string(), command },
            format!("{} PID {}.", verb, pid_id),
        )
    }

    async fn output(&self, device_id: &str, channel: u32, command: OutputCommand) -> Result<()> {
        match command {
            OutputCommand::On => self.actuate(device_id, channel, ActuatorCommand::On).await,
            OutputCommand::Off => self.actuate(device_id, channel, ActuatorCommand::Off).await,
            OutputCommand::Duration { sec } => self.actuate(device_id, channel, ActuatorCommand::Duration(sec)).await,
            OutputCommand::DutyCycle { percent } => {
                self.actuate(device_id, channel, ActuatorCommand::DutyCycle(percent)).await
            }
            OutputCommand::Ramp { from, to, duration_sec, step_sec } => {
                let step = step_sec.max(0.1);
                let steps = (duration_sec / step).ceil().max(1.0) as u32;
                self.actuate(device_id, channel, ActuatorCommand::DutyCycle(from)).await?;
                for i in 1..=steps {
                    tokio::time::sleep(Duration::from_secs_f64(step.min(duration_sec.max(0.0)))).await;
                    let duty = from + (to - from) * (i as f64 / steps as f64);
                    self.actuate(device_id, channel, ActuatorCommand::DutyCycle(duty)).await?;
                }
                Ok(())
            }
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn describe_command(command: &OutputCommand) -> String {
    match command {
        OutputCommand::On => "on".to_string(),
        OutputCommand::Off => "off".to_string(),
        OutputCommand::Duration { sec } => format!("on for {}s", sec),
        OutputCommand::DutyCycle { percent } => format!("duty cycle {}%", percent),
        OutputCommand::Ramp { from, to, duration_sec, .. } => {
            format!("ramped {}% to {}% over {}s", from, to, duration_sec)
        }
    }
}

/// Run `sh -c command`; returns the exit code and trimmed, truncated stdout
async fn run_command(command: &str, timeout_sec: f64) -> Result<(i32, String)> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| VerdantError::Command(format!("failed to spawn '{}': {}", command, e)))?;

    let output = tokio::time::timeout(Duration::from_secs_f64(timeout_sec.max(0.0)), child.wait_with_output())
        .await
        .map_err(|_| VerdantError::Timeout(format!("'{}' after {}s", command, timeout_sec)))?
        .map_err(|e| VerdantError::Command(e.to_string()))?;

    let mut stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.len() > action_const::MAX_COMMAND_OUTPUT {
        let mut cut = action_const::MAX_COMMAND_OUTPUT;
        while !stdout.is_char_boundary(cut) {
            cut -= 1;
        }
        stdout.truncate(cut);
    }
    Ok((output.status.code().unwrap_or(-1), stdout))
}
