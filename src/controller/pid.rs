/*
 * This file is part of Verdant.
 *
 * Copyright (C) 2025 Verdant contributors
 *
 * Verdant is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Verdant is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Verdant. If not, see <https://www.gnu.org/licenses/>.
 */

//! PID worker
//!
//! Each tick resolves the setpoint (fixed or from a method), reads the
//! process variable, updates the regulator and drives the raise/lower
//! outputs. Setpoint, output and the three terms are stored on the PID's
//! own channels so conditions and graphs can follow them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{info, warn};
use vd_core::actions::{ControlRequest, PidCommand};
use vd_core::constants::pid as pid_const;
use vd_core::data::{Controller, ControllerKind, MethodKind, PidConfig, PidOutput};
use vd_core::engine::{actuation_for, idle_command, method, Pid, PidStep};
use vd_core::hw::ActuatorCommand;
use vd_core::measurement::ChannelValue;
use vd_core::registry::Snapshot;
use vd_error::{Result, VerdantError};

use super::{period_of, tick, ControllerWorker, LoopCommand, Ticker};
use crate::context::RuntimeContext;

/// A method driving the setpoint, with its start time
#[derive(Debug, Clone)]
struct ActiveMethod {
    id: String,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl ActiveMethod {
    fn start(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

pub struct PidWorker {
    ctx: Arc<RuntimeContext>,
    snapshot: Arc<Snapshot>,
    controller: Controller,
    config: PidConfig,
    pid: Pid,
    method: Option<ActiveMethod>,
    ticker: Ticker,
    last_update: Option<Instant>,
    paused: bool,
    held: bool,
    /// Method ran out; waiting for the supervisor to deactivate us
    finished: bool,
}

fn pid_config(controller: &Controller) -> Result<PidConfig> {
    match &controller.kind {
        ControllerKind::Pid(config) => Ok(config.clone()),
        other => Err(VerdantError::config(format!(
            "{} is a {} controller, not a PID",
            controller.id,
            other.name()
        ))),
    }
}

impl PidWorker {
    pub fn new(ctx: Arc<RuntimeContext>, snapshot: Arc<Snapshot>, controller: Controller) -> Result<Self> {
        let config = pid_config(&controller)?;
        let ticker = Ticker::new(period_of(&controller, &snapshot), 0.0);
        Ok(Self {
            ctx,
            pid: Pid::from_config(&config),
            method: config.method_id.as_deref().map(ActiveMethod::start),
            snapshot,
            controller,
            config,
            ticker,
            last_update: None,
            paused: false,
            held: false,
            finished: false,
        })
    }

    async fn drive(&self, output: &PidOutput, command: ActuatorCommand) -> Result<()> {
        let actuator = self.ctx.actuator.clone();
        let device = output.device_id.clone();
        let channel = output.channel;
        tokio::task::spawn_blocking(move || actuator.set(&device, channel, command))
            .await
            .map_err(|e| VerdantError::actuation(&output.device_id, output.channel, format!("task panicked: {}", e)))?
    }

    /// Idle both outputs, logging rather than failing
    async fn idle_outputs(&self) {
        for output in [&self.config.raise, &self.config.lower].into_iter().flatten() {
            if let Err(e) = self.drive(output, idle_command(&output.mode)).await {
                warn!(controller = %self.controller.id, "OUTPUT: Could not idle {} CH{}: {}", output.device_id, output.channel, e);
            }
        }
    }

    async fn actuate(&self, step: &PidStep) -> Result<()> {
        if step.output == 0.0 {
            self.idle_outputs().await;
            return Ok(());
        }
        let (active, idle) = if step.output > 0.0 {
            (&self.config.raise, &self.config.lower)
        } else {
            (&self.config.lower, &self.config.raise)
        };
        if let Some(output) = idle {
            self.drive(output, idle_command(&output.mode)).await?;
        }
        if let Some(output) = active {
            if let Some(command) = actuation_for(step.output, &output.mode) {
                self.drive(output, command).await?;
            }
        }
        Ok(())
    }

    /// Setpoint for this tick; `None` once the method has ended
    fn resolve_setpoint(&self) -> Result<Option<f64>> {
        let Some(active) = &self.method else {
            return Ok(Some(self.pid.setpoint()));
        };
        let plan = self
            .snapshot
            .config
            .method(&active.id)
            .ok_or_else(|| VerdantError::config(format!("method {} not found", active.id)))?;
        let output = match plan.kind {
            MethodKind::Daily => method::evaluate_at(plan, active.started_at, Utc::now())?,
            MethodKind::Duration => method::evaluate(plan, active.started.elapsed().as_secs_f64())?,
        };
        Ok((!output.ended).then_some(output.value))
    }

    fn store_terms(&self, setpoint: f64, step: &PidStep) -> Result<()> {
        let mut values = BTreeMap::new();
        values.insert(pid_const::CHANNEL_SETPOINT, ChannelValue::new("setpoint", "", setpoint));
        values.insert(pid_const::CHANNEL_OUTPUT, ChannelValue::new("output", "", step.output));
        values.insert(pid_const::CHANNEL_P, ChannelValue::new("p", "", step.p));
        values.insert(pid_const::CHANNEL_I, ChannelValue::new("i", "", step.i));
        values.insert(pid_const::CHANNEL_D, ChannelValue::new("d", "", step.d));
        self.ctx.store.write(&self.controller.id, &values, true)?;
        Ok(())
    }
}

#[async_trait]
impl ControllerWorker for PidWorker {
    fn next_wake(&self) -> Option<Instant> {
        if self.finished {
            None
        } else {
            Some(self.ticker.next())
        }
    }

    async fn run_once(&mut self) -> Result<()> {
        let now = Instant::now();
        self.ticker.advance(now);
        if self.paused {
            return Ok(());
        }

        let Some(setpoint) = self.resolve_setpoint()? else {
            info!(controller = %self.controller.id, "CONTROL: Method ended, deactivating");
            self.finished = true;
            self.idle_outputs().await;
            return self.ctx.control.post(ControlRequest::Deactivate(self.controller.id.clone()));
        };
        self.pid.set_setpoint(setpoint);

        let measured = self
            .ctx
            .store
            .read_latest(&self.config.source, self.config.max_age_sec)
            .ok_or_else(|| {
                VerdantError::measurement(
                    &self.controller.id,
                    format!("no value for {} within {}s", self.config.source, self.config.max_age_sec),
                )
            })?
            .value;

        if self.held {
            self.store_terms(setpoint, &PidStep::default())?;
            return Ok(());
        }

        let dt = self
            .last_update
            .map(|at| now.duration_since(at).as_secs_f64())
            .unwrap_or_else(|| period_of(&self.controller, &self.snapshot));
        self.last_update = Some(now);

        let step = self.pid.update(measured, dt);
        self.actuate(&step).await?;
        self.store_terms(setpoint, &step)?;
        tick!(
            self.controller.log_level_debug,
            controller = %self.controller.id,
            "CONTROL: PV {:.2} SP {:.2} -> {:.2} (P {:.2} I {:.2} D {:.2})",
            measured,
            setpoint,
            step.output,
            step.p,
            step.i,
            step.d
        );
        Ok(())
    }

    fn reload(&mut self, snapshot: Arc<Snapshot>) -> Result<()> {
        let controller = snapshot
            .config
            .controller(&self.controller.id)
            .ok_or_else(|| VerdantError::ControllerNotFound(self.controller.id.clone()))?
            .clone();
        let config = pid_config(&controller)?;

        self.pid.retune(&config);
        if config.setpoint != self.config.setpoint {
            self.pid.set_setpoint(config.setpoint);
        }
        if config.method_id != self.config.method_id {
            self.method = config.method_id.as_deref().map(ActiveMethod::start);
            self.finished = false;
        }
        self.ticker.set_period(period_of(&controller, &snapshot));
        self.config = config;
        self.controller = controller;
        self.snapshot = snapshot;
        Ok(())
    }

    async fn apply(&mut self, command: LoopCommand) -> Result<()> {
        let LoopCommand::Pid(command) = command;
        info!(controller = %self.controller.id, "CONTROL: PID command {:?}", command);
        match command {
            PidCommand::Pause => {
                self.paused = true;
                self.idle_outputs().await;
            }
            PidCommand::Resume => {
                self.paused = false;
                self.held = false;
                self.last_update = None;
            }
            PidCommand::Hold => self.held = true,
            PidCommand::SetSetpoint(value) => {
                self.method = None;
                self.pid.set_setpoint(value);
            }
            PidCommand::RaiseSetpoint(amount) => {
                self.method = None;
                self.pid.set_setpoint(self.pid.setpoint() + amount);
            }
            PidCommand::LowerSetpoint(amount) => {
                self.method = None;
                self.pid.set_setpoint(self.pid.setpoint() - amount);
            }
            PidCommand::SetMethod(Some(method_id)) => {
                if self.snapshot.config.method(&method_id).is_none() {
                    return Err(VerdantError::config(format!("method {} not found", method_id)));
                }
                self.method = Some(ActiveMethod::start(method_id));
                self.finished = false;
            }
            PidCommand::SetMethod(None) => {
                self.method = None;
                self.pid.set_setpoint(self.config.setpoint);
            }
        }
        Ok(())
    }

    async fn on_stop(&mut self) {
        self.idle_outputs().await;
    }
}
