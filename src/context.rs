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

//! Shared services handed to every controller loop

use std::sync::Arc;
use std::time::Duration;

use vd_core::actions::{ActionPipeline, ControllerControl, MemoryNoteStore, NoteStore};
use vd_core::constants::{lock as lock_const, timing};
use vd_core::hw::{Actuator, Capture, DriverRegistry, OutputBank, PinReader};
use vd_core::lock::LockManager;
use vd_core::measurement::{InMemoryStore, MeasurementStore};
use vd_core::notify::{self, RateLimitedNotifier};
use vd_core::registry::DeviceRegistry;

/// Everything a worker may touch outside its own state
pub struct RuntimeContext {
    pub registry: Arc<DeviceRegistry>,
    pub store: Arc<dyn MeasurementStore>,
    pub actuator: Arc<dyn Actuator>,
    /// Set when the actuator is the built-in output bank
    pub output_bank: Option<OutputBank>,
    pub locks: LockManager,
    pub drivers: DriverRegistry,
    pub pins: Option<Arc<dyn PinReader>>,
    pub pipeline: ActionPipeline,
    pub control: Arc<dyn ControllerControl>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("registry", &self.registry)
            .field("output_bank", &self.output_bank.is_some())
            .field("drivers", &self.drivers)
            .field("pins", &self.pins.is_some())
            .finish()
    }
}

impl RuntimeContext {
    /// Lock wait used for pre-output sequences lasting `hold_sec`
    pub fn lock_timeout(&self, hold_sec: f64) -> Duration {
        let configured = self.registry.snapshot().config.general.lock_timeout_sec;
        Duration::from_secs_f64(configured.max(hold_sec + lock_const::PRE_OUTPUT_MARGIN_SEC))
    }

    /// How long a requester waits for a loop to park
    ///
    /// Covers a capped pause action plus a pre-output lock wait, so a healthy
    /// loop always parks in time.
    pub fn park_timeout(&self) -> Duration {
        let general = &self.registry.snapshot().config.general;
        let longest = general.pause_action_max_sec.max(0.0) + general.lock_timeout_sec.max(0.0);
        Duration::from_secs_f64(longest) + timing::PARK_MARGIN
    }
}

/// Collects the capabilities a [`Supervisor`](crate::Supervisor) runs with
///
/// Anything left unset falls back to the in-process implementation: the
/// in-memory measurement store, the output bank described by the
/// configuration, the built-in input drivers and the notifier from the
/// notification settings.
pub struct RuntimeBuilder {
    registry: Arc<DeviceRegistry>,
    store: Option<Arc<dyn MeasurementStore>>,
    actuator: Option<Arc<dyn Actuator>>,
    drivers: DriverRegistry,
    pins: Option<Arc<dyn PinReader>>,
    capture: Option<Arc<dyn Capture>>,
    notifier: Option<Arc<RateLimitedNotifier>>,
    notes: Option<Arc<dyn NoteStore>>,
}

impl RuntimeBuilder {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            store: None,
            actuator: None,
            drivers: DriverRegistry::with_builtin(),
            pins: None,
            capture: None,
            notifier: None,
            notes: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn MeasurementStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the built-in output bank
    pub fn actuator(mut self, actuator: Arc<dyn Actuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    pub fn drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn pins(mut self, pins: Arc<dyn PinReader>) -> Self {
        self.pins = Some(pins);
        self
    }

    pub fn capture(mut self, capture: Arc<dyn Capture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn notifier(mut self, notifier: Arc<RateLimitedNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn notes(mut self, notes: Arc<dyn NoteStore>) -> Self {
        self.notes = Some(notes);
        self
    }

    pub(crate) fn build(self, control: Arc<dyn ControllerControl>) -> RuntimeContext {
        let snapshot = self.registry.snapshot();
        let config = &snapshot.config;

        let (actuator, output_bank) = match self.actuator {
            Some(actuator) => (actuator, None),
            None => {
                let bank = OutputBank::new(&config.outputs);
                (Arc::new(bank.clone()) as Arc<dyn Actuator>, Some(bank))
            }
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::with_retention(config.general.store_retention)));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(notify::from_settings(&config.notifications)));
        let notes = self.notes.unwrap_or_else(|| Arc::new(MemoryNoteStore::new()));

        let mut pipeline = ActionPipeline::new(actuator.clone(), notifier, notes, control.clone())
            .with_pause_max(config.general.pause_action_max_sec);
        if let Some(capture) = self.capture {
            pipeline = pipeline.with_capture(capture);
        }

        RuntimeContext {
            registry: self.registry,
            store,
            actuator,
            output_bank,
            locks: LockManager::new(),
            drivers: self.drivers,
            pins: self.pins,
            pipeline,
            control,
        }
    }
}
