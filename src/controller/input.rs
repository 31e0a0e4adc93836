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

//! Input worker: measure, convert, store

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};
use vd_core::cancel;
use vd_core::constants::lock as lock_const;
use vd_core::data::{Controller, ControllerKind, InputConfig, PreOutput};
use vd_core::hw::{ActuatorCommand, InputDriver, RawReadings};
use vd_core::measurement::ChannelValue;
use vd_core::registry::Snapshot;
use vd_error::{Result, VerdantError};

use super::{period_of, tick, ControllerWorker, Ticker};
use crate::context::RuntimeContext;

pub struct InputWorker {
    ctx: Arc<RuntimeContext>,
    snapshot: Arc<Snapshot>,
    controller: Controller,
    config: InputConfig,
    driver: Box<dyn InputDriver>,
    ticker: Ticker,
}

fn input_config(controller: &Controller) -> Result<InputConfig> {
    match &controller.kind {
        ControllerKind::Input(config) => Ok(config.clone()),
        other => Err(VerdantError::config(format!(
            "{} is a {} controller, not an input",
            controller.id,
            other.name()
        ))),
    }
}

impl InputWorker {
    pub fn new(ctx: Arc<RuntimeContext>, snapshot: Arc<Snapshot>, controller: Controller) -> Result<Self> {
        let config = input_config(&controller)?;
        let driver = ctx.drivers.create(&controller.id, &config.driver, &config.custom_options)?;
        let ticker = Ticker::new(period_of(&controller, &snapshot), 0.0);
        Ok(Self {
            ctx,
            snapshot,
            controller,
            config,
            driver,
            ticker,
        })
    }

    async fn actuate(ctx: &RuntimeContext, pre: &PreOutput, command: ActuatorCommand) -> Result<()> {
        let actuator = ctx.actuator.clone();
        let device = pre.device_id.clone();
        let channel = pre.channel;
        tokio::task::spawn_blocking(move || actuator.set(&device, channel, command))
            .await
            .map_err(|e| VerdantError::actuation(&pre.device_id, pre.channel, format!("task panicked: {}", e)))?
    }

    /// Measure with the pre-output energized; the output is off again on every path
    async fn measure_with_pre_output(&mut self, pre: &PreOutput) -> Result<RawReadings> {
        let ctx = self.ctx.clone();
        let name = format!("{}:{}:{}", lock_const::PRE_OUTPUT_PREFIX, pre.device_id, pre.channel);
        let _guard = ctx
            .locks
            .acquire(&name, ctx.lock_timeout(pre.duration_sec))
            .await
            .ok_or_else(|| VerdantError::LockTimeout { name: name.clone() })?;

        let hold = Duration::from_secs_f64(pre.duration_sec.max(0.0));
        Self::actuate(&ctx, pre, ActuatorCommand::On).await?;
        if !cancel::sleep_unless_stopped(hold).await {
            Self::actuate(&ctx, pre, ActuatorCommand::Off).await?;
            return Err(VerdantError::measurement(&self.controller.id, "stopped during pre-output"));
        }
        if pre.during_measure {
            let readings = self.driver.measure().await;
            Self::actuate(&ctx, pre, ActuatorCommand::Off).await?;
            readings
        } else {
            Self::actuate(&ctx, pre, ActuatorCommand::Off).await?;
            self.driver.measure().await
        }
    }

    fn convert(&self, raw: &RawReadings) -> BTreeMap<u32, ChannelValue> {
        let mut values = BTreeMap::new();
        for channel in self.snapshot.config.channels_for(&self.controller.id) {
            let Some(value) = raw.get(&channel.channel) else {
                continue;
            };
            match self.snapshot.convert_channel(channel, *value) {
                Ok((converted, unit)) => {
                    values.insert(channel.channel, ChannelValue::new(channel.measurement.clone(), unit, converted));
                }
                Err(e) => {
                    warn!(controller = %self.controller.id, "INPUT: CH{} unavailable: {}", channel.channel, e);
                }
            }
        }
        values
    }
}

/// "temperature CH0 = 21.50 C, humidity CH1 = 55.00 %"
fn format_values(values: &BTreeMap<u32, ChannelValue>) -> String {
    values
        .iter()
        .map(|(channel, v)| format!("{} CH{} = {:.2} {}", v.measurement, channel, v.value, v.unit).trim_end().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl ControllerWorker for InputWorker {
    fn next_wake(&self) -> Option<Instant> {
        Some(self.ticker.next())
    }

    async fn run_once(&mut self) -> Result<()> {
        self.ticker.advance(Instant::now());
        let verbose = self.controller.log_level_debug;

        let raw = match self.config.pre_output.clone() {
            Some(pre) => self.measure_with_pre_output(&pre).await?,
            None => self.driver.measure().await?,
        };
        let values = self.convert(&raw);
        if values.is_empty() {
            return Err(VerdantError::measurement(&self.controller.id, "no enabled channel produced a value"));
        }

        self.ctx.store.write(&self.controller.id, &values, true)?;
        let summary = format_values(&values);
        tick!(verbose, controller = %self.controller.id, "INPUT: {}", summary);

        if self.config.actions_after_measure {
            let action_ids = self.snapshot.config.action_ids_for(&self.controller.id);
            if !action_ids.is_empty() {
                let message = format!("{}: {}.", self.controller.name, summary);
                let outcome = self
                    .ctx
                    .pipeline
                    .run_chain(&self.snapshot, &self.controller.id, &action_ids, &message)
                    .await;
                if !outcome.errors.is_empty() {
                    warn!(controller = %self.controller.id, "INPUT: {} action(s) failed after measure", outcome.errors.len());
                }
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
        let config = input_config(&controller)?;
        if config.driver != self.config.driver || config.custom_options != self.config.custom_options {
            self.driver = self.ctx.drivers.create(&controller.id, &config.driver, &config.custom_options)?;
            info!(controller = %controller.id, "INPUT: Driver {} re-created", config.driver);
        }
        self.ticker.set_period(period_of(&controller, &snapshot));
        self.config = config;
        self.controller = controller;
        self.snapshot = snapshot;
        Ok(())
    }

    async fn on_stop(&mut self) {
        self.driver.stop().await;
    }
}
