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

//! Math worker: derive one value from other stored measurements

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use vd_core::data::{bind_options, Controller, ControllerKind, MathConfig, MathKind};
use vd_core::engine::math::{self, Formula};
use vd_core::measurement::ChannelValue;
use vd_core::registry::Snapshot;
use vd_error::{Result, VerdantError};

use super::{period_of, tick, ControllerWorker, Ticker};
use crate::context::RuntimeContext;

pub struct MathWorker {
    ctx: Arc<RuntimeContext>,
    controller: Controller,
    config: MathConfig,
    formula: Formula,
    ticker: Ticker,
}

fn math_config(controller: &Controller) -> Result<(MathConfig, Formula)> {
    match &controller.kind {
        ControllerKind::Math(config) => {
            let options = bind_options(&controller.id, math::option_schema(config.kind), &config.custom_options)?;
            Ok((config.clone(), Formula::new(config.kind, options)?))
        }
        other => Err(VerdantError::config(format!(
            "{} is a {} controller, not a math controller",
            controller.id,
            other.name()
        ))),
    }
}

impl MathWorker {
    pub fn new(ctx: Arc<RuntimeContext>, snapshot: Arc<Snapshot>, controller: Controller) -> Result<Self> {
        let (config, formula) = math_config(&controller)?;
        let ticker = Ticker::new(period_of(&controller, &snapshot), 0.0);
        Ok(Self {
            ctx,
            controller,
            config,
            formula,
            ticker,
        })
    }

    /// Fresh input values; Redundancy settles for the first fresh one
    fn gather(&self) -> Result<Vec<f64>> {
        let mut values = Vec::with_capacity(self.config.inputs.len());
        for input in &self.config.inputs {
            match self.ctx.store.read_latest(input, self.config.max_age_sec) {
                Some(sample) if self.config.kind == MathKind::Redundancy => return Ok(vec![sample.value]),
                Some(sample) => values.push(sample.value),
                None if self.config.kind == MathKind::Redundancy => continue,
                None => {
                    return Err(VerdantError::measurement(
                        &self.controller.id,
                        format!("no value for {} within {}s", input, self.config.max_age_sec),
                    ))
                }
            }
        }
        if values.is_empty() {
            return Err(VerdantError::measurement(&self.controller.id, "no fresh input"));
        }
        Ok(values)
    }
}

#[async_trait]
impl ControllerWorker for MathWorker {
    fn next_wake(&self) -> Option<Instant> {
        Some(self.ticker.next())
    }

    async fn run_once(&mut self) -> Result<()> {
        self.ticker.advance(Instant::now());
        let inputs = self.gather()?;
        let value = self.formula.compute(&inputs)?;

        let mut values = BTreeMap::new();
        values.insert(0, ChannelValue::new(self.config.measurement.clone(), self.config.unit.clone(), value));
        self.ctx.store.write(&self.controller.id, &values, true)?;
        tick!(
            self.controller.log_level_debug,
            controller = %self.controller.id,
            "MATH: {:?} of {} inputs = {:.3}",
            self.config.kind,
            inputs.len(),
            value
        );
        Ok(())
    }

    fn reload(&mut self, snapshot: Arc<Snapshot>) -> Result<()> {
        let controller = snapshot
            .config
            .controller(&self.controller.id)
            .ok_or_else(|| VerdantError::ControllerNotFound(self.controller.id.clone()))?
            .clone();
        let (config, formula) = math_config(&controller)?;
        self.ticker.set_period(period_of(&controller, &snapshot));
        self.config = config;
        self.formula = formula;
        self.controller = controller;
        Ok(())
    }
}
