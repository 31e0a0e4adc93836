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

//! Trigger worker: timers, daily schedules, PWM methods and pin edges

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveTime, Utc};
use tokio::time::Instant;
use tracing::{info, warn};
use vd_core::actions::ControlRequest;
use vd_core::data::{Controller, ControllerKind, MethodKind, TriggerKind};
use vd_core::engine::{method, schedule};
use vd_core::hw::ActuatorCommand;
use vd_core::registry::Snapshot;
use vd_error::{Result, VerdantError};

use super::{tick, ControllerWorker, EdgeEvent, Ticker};
use crate::context::RuntimeContext;

/// Schedule state derived from the trigger kind
enum Schedule {
    Timer(Ticker),
    DailyPoint { time: NaiveTime, next: Instant },
    DailySpan { start: NaiveTime, end: NaiveTime, ticker: Ticker },
    PwmMethod {
        ticker: Ticker,
        started: Instant,
        started_at: chrono::DateTime<Utc>,
        first: bool,
        ended: bool,
    },
    Edge { last_fired: Option<Instant> },
}

pub struct TriggerWorker {
    ctx: Arc<RuntimeContext>,
    snapshot: Arc<Snapshot>,
    controller: Controller,
    kind: TriggerKind,
    schedule: Schedule,
}

fn trigger_kind(controller: &Controller) -> Result<TriggerKind> {
    match &controller.kind {
        ControllerKind::Trigger(config) => Ok(config.kind.clone()),
        other => Err(VerdantError::config(format!(
            "{} is a {} controller, not a trigger",
            controller.id,
            other.name()
        ))),
    }
}

/// Tokio instant of the next daily occurrence of `time` in local time
fn next_daily_instant(time: NaiveTime) -> Instant {
    let now = Local::now();
    let next = schedule::next_daily(time, &now);
    let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + wait
}

fn build_schedule(kind: &TriggerKind) -> Result<Schedule> {
    Ok(match kind {
        TriggerKind::Timer { period_sec, start_offset_sec } => Schedule::Timer(Ticker::new(*period_sec, *start_offset_sec)),
        TriggerKind::DailyTimePoint { time } => {
            let time = schedule::parse_time_of_day(time)?;
            Schedule::DailyPoint {
                time,
                next: next_daily_instant(time),
            }
        }
        TriggerKind::DailyTimeSpan { start, end, period_sec } => Schedule::DailySpan {
            start: schedule::parse_time_of_day(start)?,
            end: schedule::parse_time_of_day(end)?,
            ticker: Ticker::new(*period_sec, 0.0),
        },
        TriggerKind::RunPwmMethod { period_sec, .. } => Schedule::PwmMethod {
            ticker: Ticker::new(*period_sec, 0.0),
            started: Instant::now(),
            started_at: Utc::now(),
            first: true,
            ended: false,
        },
        TriggerKind::Edge { .. } => Schedule::Edge { last_fired: None },
    })
}

impl TriggerWorker {
    pub fn new(ctx: Arc<RuntimeContext>, snapshot: Arc<Snapshot>, controller: Controller) -> Result<Self> {
        let kind = trigger_kind(&controller)?;
        let schedule = build_schedule(&kind)?;
        Ok(Self {
            ctx,
            snapshot,
            controller,
            kind,
            schedule,
        })
    }

    async fn fire(&self, message: String) {
        let action_ids = self.snapshot.config.action_ids_for(&self.controller.id);
        if action_ids.is_empty() {
            return;
        }
        info!(controller = %self.controller.id, "RULE: Trigger fired: {}", message);
        let outcome = self
            .ctx
            .pipeline
            .run_chain(&self.snapshot, &self.controller.id, &action_ids, &message)
            .await;
        if !outcome.errors.is_empty() {
            warn!(controller = %self.controller.id, "RULE: {} action(s) failed", outcome.errors.len());
        }
    }

    async fn set_duty(&self, device_id: &str, channel: u32, duty: f64) -> Result<()> {
        let actuator = self.ctx.actuator.clone();
        let device = device_id.to_string();
        tokio::task::spawn_blocking(move || actuator.set(&device, channel, ActuatorCommand::DutyCycle(duty)))
            .await
            .map_err(|e| VerdantError::actuation(device_id, channel, format!("task panicked: {}", e)))?
    }

    async fn run_method(&mut self) -> Result<()> {
        let TriggerKind::RunPwmMethod { method_id, device_id, channel, trigger_actions_at_start, .. } = self.kind.clone()
        else {
            return Ok(());
        };
        let (started, started_at, first) = match &mut self.schedule {
            Schedule::PwmMethod { ticker, started, started_at, first, ended } => {
                if *ended {
                    return Ok(());
                }
                ticker.advance(Instant::now());
                let was_first = std::mem::replace(first, false);
                (*started, *started_at, was_first)
            }
            _ => return Ok(()),
        };

        let plan = self
            .snapshot
            .config
            .method(&method_id)
            .ok_or_else(|| VerdantError::config(format!("method {} not found", method_id)))?;
        let output = match plan.kind {
            MethodKind::Daily => method::evaluate_at(plan, started_at, Utc::now())?,
            MethodKind::Duration => method::evaluate(plan, started.elapsed().as_secs_f64())?,
        };

        if first && trigger_actions_at_start {
            self.fire(format!("{}: method {} started.", self.controller.name, method_id)).await;
        }

        if output.ended {
            self.set_duty(&device_id, channel, 0.0).await?;
            if let Schedule::PwmMethod { ended, .. } = &mut self.schedule {
                *ended = true;
            }
            info!(controller = %self.controller.id, "RULE: Method {} ended, deactivating", method_id);
            return self.ctx.control.post(ControlRequest::Deactivate(self.controller.id.clone()));
        }

        let duty = output.value.clamp(0.0, 100.0);
        self.set_duty(&device_id, channel, duty).await?;
        tick!(
            self.controller.log_level_debug,
            controller = %self.controller.id,
            "RULE: Method {} duty {:.1}%",
            method_id,
            duty
        );
        Ok(())
    }
}

#[async_trait]
impl ControllerWorker for TriggerWorker {
    fn next_wake(&self) -> Option<Instant> {
        match &self.schedule {
            Schedule::Timer(ticker) => Some(ticker.next()),
            Schedule::DailyPoint { next, .. } => Some(*next),
            Schedule::DailySpan { ticker, .. } => Some(ticker.next()),
            Schedule::PwmMethod { ended: true, .. } => None,
            Schedule::PwmMethod { ticker, .. } => Some(ticker.next()),
            Schedule::Edge { .. } => None,
        }
    }

    async fn run_once(&mut self) -> Result<()> {
        match self.schedule {
            Schedule::PwmMethod { .. } => return self.run_method().await,
            Schedule::Edge { .. } => return Ok(()),
            _ => {}
        }
        let now = Instant::now();
        let message = match &mut self.schedule {
            Schedule::Timer(ticker) => {
                ticker.advance(now);
                format!("{}: timer fired.", self.controller.name)
            }
            Schedule::DailyPoint { time, next } => {
                // Recomputed from the wall clock so DST shifts are honored
                *next = next_daily_instant(*time);
                format!("{}: daily time {} reached.", self.controller.name, time.format("%H:%M:%S"))
            }
            Schedule::DailySpan { start, end, ticker } => {
                ticker.advance(now);
                if !schedule::in_daily_span(*start, *end, Local::now().time()) {
                    return Ok(());
                }
                format!(
                    "{}: within {} - {}.",
                    self.controller.name,
                    start.format("%H:%M"),
                    end.format("%H:%M")
                )
            }
            Schedule::PwmMethod { .. } | Schedule::Edge { .. } => return Ok(()),
        };
        self.fire(message).await;
        Ok(())
    }

    async fn on_event(&mut self, event: &EdgeEvent) -> Result<()> {
        let TriggerKind::Edge { device_id, pin, edge, debounce_ms } = &self.kind else {
            return Ok(());
        };
        if event.device_id != *device_id || event.pin != *pin || !edge.matches(event.state) {
            return Ok(());
        }

        let now = Instant::now();
        let debounce = Duration::from_millis(*debounce_ms);
        if let Schedule::Edge { last_fired } = &mut self.schedule {
            if last_fired.is_some_and(|at| now.duration_since(at) < debounce) {
                tick!(self.controller.log_level_debug, controller = %self.controller.id, "RULE: Edge debounced");
                return Ok(());
            }
            *last_fired = Some(now);
        }

        let message = format!(
            "{}: {} edge on {} pin {}.",
            self.controller.name,
            if event.state { "rising" } else { "falling" },
            event.device_id,
            event.pin
        );
        self.fire(message).await;
        Ok(())
    }

    fn reload(&mut self, snapshot: Arc<Snapshot>) -> Result<()> {
        let controller = snapshot
            .config
            .controller(&self.controller.id)
            .ok_or_else(|| VerdantError::ControllerNotFound(self.controller.id.clone()))?
            .clone();
        let kind = trigger_kind(&controller)?;
        if kind != self.kind {
            self.schedule = build_schedule(&kind)?;
            self.kind = kind;
        }
        self.controller = controller;
        self.snapshot = snapshot;
        Ok(())
    }

    async fn on_stop(&mut self) {
        if let TriggerKind::RunPwmMethod { device_id, channel, .. } = &self.kind {
            if let Err(e) = self.set_duty(device_id, *channel, 0.0).await {
                warn!(controller = %self.controller.id, "OUTPUT: Could not reset {} CH{}: {}", device_id, channel, e);
            }
        }
    }
}
