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

//! Verdant - controller runtime for greenhouse and terrarium automation
//!
//! This library runs the configured controllers: inputs that measure,
//! math controllers that derive values, conditionals and triggers that
//! fire action chains, and PIDs that regulate outputs. The
//! [`Supervisor`] owns one cooperative loop per active controller and
//! keeps them in line with the stored configuration.
//!
//! ```no_run
//! use std::sync::Arc;
//! use verdant::{RuntimeBuilder, Supervisor};
//! use vd_core::data::JsonConfigStore;
//! use vd_core::registry::DeviceRegistry;
//!
//! # async fn run() -> vd_core::Result<()> {
//! let store = Arc::new(JsonConfigStore::new("/etc/verdant/config.json"));
//! let registry = Arc::new(DeviceRegistry::load(store)?);
//! let supervisor = Supervisor::new(RuntimeBuilder::new(registry));
//! supervisor.start_all().await;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod controller;
pub mod supervisor;

pub use context::{RuntimeBuilder, RuntimeContext};
pub use controller::{ControllerWorker, EdgeEvent, FailureCounter, LoopCommand, LoopHandle, LoopState};
pub use supervisor::Supervisor;
