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

//! Conditional worker
//!
//! Each condition keeps its own timer. A due condition is evaluated on its
//! own; every `Triggered` outcome runs the conditional's action chain once,
//! then the condition rests for its refractory period.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};
use vd_core::data::{Condition, Controller, ControllerKind};
use vd_core::engine::rules::{self, RuleContext, RuleOutcome};
use vd_core::registry::Snapshot;
use vd_error::{Result, VerdantError};

use super::{tick, ControllerWorker, Ticker};
use crate::context::RuntimeContext;

struct ConditionTimer {
    condition: Condition,
    ticker: Ticker,
    resting_until: Option<Instant>,
}

pub struct ConditionalWorker {
    ctx: Arc<RuntimeContext>,
    snapshot: Arc<Snapshot>,
    controller: Controller,
    timers: Vec<ConditionTimer>,
}

fn start_offset(controller: &Controller) -> Result<f64> {
    match &controller.kind {
        ControllerKind::Conditional(config) => Ok(config.start_offset_sec),
        other => Err(VerdantError::config(format!(
            "{} is a {} controller, not a conditional",
            controller.id,
            other.name()
        ))),
    }
}

impl ConditionalWorker {
    pub fn new(ctx: Arc<RuntimeContext>, snapshot: Arc<Snapshot>, controller: Controller) -> Result<Self> {
        let offset = start_offset(&controller)?;
        let timers = snapshot
            .config
            .conditions_for(&controller.id)
            .into_iter()
            .map(|c| ConditionTimer {
                condition: c.clone(),
                ticker: Ticker::new(c.period_sec, offset),
                resting_until: None,
            })
            .collect();
        Ok(Self {
            ctx,
            snapshot,
            controller,
            timers,
        })
    }

    /// Evaluate every due condition; ids of the triggered ones with their messages
    fn evaluate_due(&mut self, now: Instant) -> Vec<(String, String)> {
        let ctx = RuleContext {
            store: &*self.ctx.store,
            actuator: &*self.ctx.actuator,
            pins: self.ctx.pins.as_deref(),
            controllers: &*self.ctx.registry,
        };
        let verbose = self.controller.log_level_debug;

        let mut fired = Vec::new();
        for timer in &mut self.timers {
            if !timer.ticker.is_due(now) {
                continue;
            }
            timer.ticker.advance(now);
            if timer.resting_until.is_some_and(|until| now < until) {
                continue;
            }

            let evaluation = rules::evaluate(&timer.condition.kind, &ctx);
            tick!(
                verbose,
                controller = %self.controller.id,
                "RULE: {} -> {:?}",
                timer.condition.id,
                evaluation.outcome
            );
            if evaluation.outcome == RuleOutcome::Triggered {
                if timer.condition.refractory_sec > 0.0 {
                    timer.resting_until = Some(now + Duration::from_secs_f64(timer.condition.refractory_sec));
                }
                fired.push((
                    timer.condition.id.clone(),
                    rules::describe(&timer.condition.kind, &evaluation),
                ));
            }
        }
        fired
    }
}

#[async_trait]
impl ControllerWorker for ConditionalWorker {
    fn next_wake(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.ticker.next()).min()
    }

    async fn run_once(&mut self) -> Result<()> {
        let fired = self.evaluate_due(Instant::now());
        if fired.is_empty() {
            return Ok(());
        }

        let action_ids = self.snapshot.config.action_ids_for(&self.controller.id);
        for (condition_id, description) in fired {
            info!(controller = %self.controller.id, "RULE: Condition {} triggered: {}", condition_id, description);
            let message = format!("{} ({}): {}", self.controller.name, condition_id, description);
            let outcome = self
                .ctx
                .pipeline
                .run_chain(&self.snapshot, &self.controller.id, &action_ids, &message)
                .await;
            if !outcome.errors.is_empty() {
                warn!(
                    controller = %self.controller.id,
                    "RULE: {} of {} action(s) failed for {}",
                    outcome.errors.len(),
                    action_ids.len(),
                    condition_id
                );
            }
        }
        Ok(())
    }

    fn reload(&mut self, snapshot: Arc<Snapshot>) -> Result<()> {
        let controller = snapshot
            .config
            .controller(&self.controller.id)
            .ok_or_else(|| VerdantError::ControllerNotFound(self.controller.id.clone()))?
            .clone();
        let offset = start_offset(&controller)?;

        let mut previous = std::mem::take(&mut self.timers);
        self.timers = snapshot
            .config
            .conditions_for(&controller.id)
            .into_iter()
            .map(|c| match previous.iter().position(|t| t.condition.id == c.id) {
                Some(idx) => {
                    let mut timer = previous.swap_remove(idx);
                    if timer.condition.period_sec != c.period_sec {
                        timer.ticker.set_period(c.period_sec);
                    }
                    timer.condition = c.clone();
                    timer
                }
                None => ConditionTimer {
                    condition: c.clone(),
                    ticker: Ticker::new(c.period_sec, offset),
                    resting_until: None,
                },
            })
            .collect();
        self.controller = controller;
        self.snapshot = snapshot;
        Ok(())
    }
}
