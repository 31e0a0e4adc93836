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

//! Supervisor
//!
//! Owns every running controller loop and is the only place that starts,
//! stops or reconfigures them. Requests coming from inside a loop (actions
//! that activate controllers or steer a PID, methods that run out) are
//! posted to a control queue and handled by one task, so a loop never waits
//! on itself.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vd_core::actions::{ChainOutcome, ControlRequest, ControllerControl};
use vd_core::data::{Action, Channel, Condition, Controller, ControllerKind, Method, TriggerKind, VerdantConfig};
use vd_core::registry::Snapshot;
use vd_error::{Result, VerdantError};

use crate::context::{RuntimeBuilder, RuntimeContext};
use crate::controller::{build_worker, EdgeEvent, LoopCommand, LoopHandle, LoopState, WorkerFactory};

/// Posts requests onto the supervisor's control queue
#[derive(Debug, Clone)]
struct ControlQueue {
    tx: mpsc::UnboundedSender<ControlRequest>,
}

impl ControllerControl for ControlQueue {
    fn post(&self, request: ControlRequest) -> Result<()> {
        debug!("CONTROL: Queued {:?}", request);
        self.tx
            .send(request)
            .map_err(|_| VerdantError::generic("supervisor control queue is closed"))
    }
}

/// Configuration a running loop depends on; a change triggers a reload on sync
#[derive(Debug, Clone, PartialEq)]
struct Dependencies {
    controller: Controller,
    conditions: Vec<Condition>,
    actions: Vec<Action>,
    channels: Vec<Channel>,
    methods: Vec<Method>,
}

impl Dependencies {
    fn of(config: &VerdantConfig, controller: &Controller) -> Self {
        Self {
            controller: controller.clone(),
            conditions: config.conditions_for(&controller.id).into_iter().cloned().collect(),
            actions: config.actions_for(&controller.id).into_iter().cloned().collect(),
            channels: config.channels_for(&controller.id).into_iter().cloned().collect(),
            methods: config.methods.clone(),
        }
    }
}

struct Running {
    handle: LoopHandle,
    applied: Dependencies,
}

/// One controller's loop; locked for the whole of a start or stop, so
/// transitions of the same controller never interleave
type Slot = Arc<Mutex<Option<Running>>>;

struct SupervisorInner {
    ctx: Arc<RuntimeContext>,
    loops: parking_lot::Mutex<HashMap<String, Slot>>,
    control_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Starts, stops and reconfigures controller loops
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").field("ctx", &self.inner.ctx).finish()
    }
}

impl Supervisor {
    /// Build the runtime and start the control task; needs a tokio runtime
    pub fn new(builder: RuntimeBuilder) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(builder.build(Arc::new(ControlQueue { tx })));
        let inner = Arc::new(SupervisorInner {
            ctx,
            loops: parking_lot::Mutex::new(HashMap::new()),
            control_task: parking_lot::Mutex::new(None),
        });
        let task = tokio::spawn(control_loop(Arc::downgrade(&inner), rx));
        *inner.control_task.lock() = Some(task);
        Self { inner }
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.inner.ctx
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.ctx.registry.snapshot()
    }

    fn slots(&self) -> Vec<(String, Slot)> {
        self.inner
            .loops
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect()
    }

    /// The slot for `id`, created empty when missing
    fn slot(&self, id: &str) -> Slot {
        self.inner.loops.lock().entry(id.to_string()).or_default().clone()
    }

    /// Drop an empty slot nobody else holds
    fn forget(&self, id: &str, slot: &Slot) {
        let mut loops = self.inner.loops.lock();
        // Held by the map and the caller only; clones are taken under the map lock
        let unused = loops.get(id).is_some_and(|current| {
            Arc::ptr_eq(current, slot)
                && Arc::strong_count(slot) == 2
                && slot.try_lock().is_ok_and(|running| running.is_none())
        });
        if unused {
            loops.remove(id);
        }
    }

    /// Ids of the running loops, sorted
    pub async fn running(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for (id, slot) in self.slots() {
            if slot.lock().await.is_some() {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    pub async fn state(&self, id: &str) -> Option<LoopState> {
        self.handle(id).await.map(|handle| handle.state())
    }

    async fn handle(&self, id: &str) -> Option<LoopHandle> {
        let slot = self.inner.loops.lock().get(id).cloned()?;
        let running = slot.lock().await;
        running.as_ref().map(|r| r.handle.clone())
    }

    /// Start the loop for an active controller; a running loop is left alone
    pub async fn start(&self, id: &str) -> Result<()> {
        let slot = self.slot(id);
        let mut running = slot.lock().await;
        if running.is_some() {
            debug!(controller = %id, "CONTROL: Already running");
            return Ok(());
        }
        let started = self.spawn_loop(id).await;
        let result = match started {
            Ok(Some(started)) => {
                *running = Some(started);
                return Ok(());
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        drop(running);
        self.forget(id, &slot);
        result
    }

    /// Spawn and initialize a loop; `None` for controllers that have no loop
    async fn spawn_loop(&self, id: &str) -> Result<Option<Running>> {
        let snapshot = self.snapshot();
        let controller = snapshot
            .config
            .controller(id)
            .ok_or_else(|| VerdantError::ControllerNotFound(id.to_string()))?;
        if !controller.active {
            return Err(VerdantError::config(format!("controller {} is not active", id)));
        }
        if !controller.kind.has_loop() {
            debug!(controller = %id, "CONTROL: Function controllers run on demand only");
            return Ok(None);
        }

        let general = &snapshot.config.general;
        let ctx = self.inner.ctx.clone();
        let controller_id = id.to_string();
        let factory: WorkerFactory = Arc::new(move |snapshot| build_worker(&ctx, snapshot, &controller_id));
        let registry = self.inner.ctx.registry.clone();
        let handle = LoopHandle::spawn(
            id,
            controller.log_level_debug,
            factory,
            move || registry.snapshot(),
            general.init_retries,
            Duration::from_secs_f64(general.init_backoff_sec.max(0.0)),
        )
        .await?;

        info!(controller = %id, "CONTROL: Started {} controller {}", controller.kind_name(), controller.name);
        let applied = Dependencies::of(&snapshot.config, controller);
        Ok(Some(Running { handle, applied }))
    }

    /// Stop a running loop; stopping a loop that is not running is a no-op
    ///
    /// Returns once the loop task has finished.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let Some(slot) = self.inner.loops.lock().get(id).cloned() else {
            debug!(controller = %id, "CONTROL: Not running");
            return Ok(());
        };
        let mut running = slot.lock().await;
        match running.take() {
            Some(running) => {
                running.handle.stop().await;
                info!(controller = %id, "CONTROL: Stopped");
            }
            None => debug!(controller = %id, "CONTROL: Not running"),
        }
        drop(running);
        self.forget(id, &slot);
        Ok(())
    }

    /// Reload the configuration and hand it to a running loop while it is parked
    pub async fn refresh(&self, id: &str) -> Result<()> {
        if self.handle(id).await.is_none() {
            return Err(VerdantError::ControllerNotFound(id.to_string()));
        }
        let snapshot = self.inner.ctx.registry.refresh()?;
        self.reload_loop(id, snapshot).await
    }

    async fn reload_loop(&self, id: &str, snapshot: Arc<Snapshot>) -> Result<()> {
        let Some(handle) = self.handle(id).await else {
            return Err(VerdantError::ControllerNotFound(id.to_string()));
        };
        let controller = match snapshot.config.controller(id) {
            Some(c) if c.active => c.clone(),
            _ => {
                info!(controller = %id, "CONTROL: No longer active, stopping");
                return self.stop(id).await;
            }
        };

        let reloaded = match vd_core::data::validate_controller(&snapshot.config, &controller, &self.inner.ctx.drivers) {
            Ok(()) => {
                let mut guard = handle.pause(self.inner.ctx.park_timeout()).await?;
                guard.worker().reload(snapshot.clone())
            }
            Err(e) => Err(e),
        };

        match reloaded {
            Ok(()) => {
                let slot = self.inner.loops.lock().get(id).cloned();
                if let Some(slot) = slot {
                    if let Some(running) = slot.lock().await.as_mut() {
                        running.applied = Dependencies::of(&snapshot.config, &controller);
                    }
                }
                info!(controller = %id, "CONTROL: Settings refreshed");
                Ok(())
            }
            Err(e) => {
                // The worker cannot adopt the new settings in place (e.g. its kind changed)
                warn!(controller = %id, "CONTROL: Refresh failed ({}), restarting", e);
                self.stop(id).await?;
                self.start(id).await
            }
        }
    }

    /// Apply a command to a running loop at its next parking point
    pub async fn command(&self, id: &str, command: LoopCommand) -> Result<()> {
        let handle = self
            .handle(id)
            .await
            .ok_or_else(|| VerdantError::ControllerNotFound(id.to_string()))?;
        let mut guard = handle.pause(self.inner.ctx.park_timeout()).await?;
        guard.worker().apply(command).await
    }

    async fn persist_active(&self, id: &str, active: bool) -> Result<()> {
        let registry = self.inner.ctx.registry.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || registry.set_active(&id, active))
            .await
            .map_err(|e| VerdantError::generic(format!("config write task failed: {}", e)))??;
        Ok(())
    }

    /// Persist the active flag, then start the loop
    pub async fn activate(&self, id: &str) -> Result<()> {
        self.persist_active(id, true).await?;
        info!(controller = %id, "CONTROL: Activated");
        self.start(id).await
    }

    /// Persist the inactive flag, then stop the loop
    pub async fn deactivate(&self, id: &str) -> Result<()> {
        self.persist_active(id, false).await?;
        info!(controller = %id, "CONTROL: Deactivated");
        self.stop(id).await
    }

    /// Run an arbitrary action chain on behalf of `owner_id`
    pub async fn run_chain(&self, owner_id: &str, action_ids: &[String], message: &str) -> ChainOutcome {
        let snapshot = self.snapshot();
        self.inner.ctx.pipeline.run_chain(&snapshot, owner_id, action_ids, message).await
    }

    /// Run a function controller's action chain
    pub async fn run_function(&self, id: &str) -> Result<ChainOutcome> {
        let snapshot = self.snapshot();
        let controller = snapshot
            .config
            .controller(id)
            .ok_or_else(|| VerdantError::ControllerNotFound(id.to_string()))?;
        if !matches!(controller.kind, ControllerKind::Function) {
            return Err(VerdantError::config(format!("{} is not a function controller", id)));
        }
        let action_ids = snapshot.config.action_ids_for(id);
        info!(controller = %id, "ACTION: Running function {} ({} actions)", controller.name, action_ids.len());
        let message = format!("Function {}.", controller.name);
        Ok(self.inner.ctx.pipeline.run_chain(&snapshot, id, &action_ids, &message).await)
    }

    /// Deliver a pin change to every running edge trigger watching that pin
    pub async fn notify_edge(&self, event: EdgeEvent) -> usize {
        let snapshot = self.snapshot();
        let mut delivered = 0;
        for (id, slot) in self.slots() {
            let watches = snapshot.config.controller(&id).is_some_and(|c| match &c.kind {
                ControllerKind::Trigger(t) => matches!(
                    &t.kind,
                    TriggerKind::Edge { device_id, pin, .. } if *device_id == event.device_id && *pin == event.pin
                ),
                _ => false,
            });
            if !watches {
                continue;
            }
            if slot.lock().await.as_ref().is_some_and(|r| r.handle.deliver(event.clone())) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Start every active controller; returns how many loops are running afterwards
    pub async fn start_all(&self) -> usize {
        let snapshot = self.snapshot();
        for controller in snapshot.config.controllers.iter().filter(|c| c.active && c.kind.has_loop()) {
            if let Err(e) = self.start(&controller.id).await {
                error!(controller = %controller.id, "CONTROL: Failed to start: {}", e);
            }
        }
        let count = self.running().await.len();
        info!("STARTUP: {} controller loop(s) running", count);
        count
    }

    /// Bring the running loops in line with the stored configuration
    pub async fn sync(&self) -> Result<()> {
        let snapshot = self.inner.ctx.registry.refresh()?;
        if let Some(bank) = &self.inner.ctx.output_bank {
            bank.reconfigure(&snapshot.config.outputs);
        }

        let mut running: Vec<(String, Dependencies)> = Vec::new();
        for (id, slot) in self.slots() {
            if let Some(r) = slot.lock().await.as_ref() {
                running.push((id, r.applied.clone()));
            }
        }

        for (id, applied) in &running {
            match snapshot.config.controller(id) {
                Some(c) if c.active && c.kind.has_loop() => {
                    if Dependencies::of(&snapshot.config, c) != *applied {
                        if let Err(e) = self.reload_loop(id, snapshot.clone()).await {
                            error!(controller = %id, "CONTROL: Reload failed: {}", e);
                        }
                    }
                }
                _ => self.stop(id).await?,
            }
        }

        for controller in snapshot.config.controllers.iter().filter(|c| c.active && c.kind.has_loop()) {
            if running.iter().any(|(id, _)| *id == controller.id) {
                continue;
            }
            if let Err(e) = self.start(&controller.id).await {
                error!(controller = %controller.id, "CONTROL: Failed to start: {}", e);
            }
        }
        Ok(())
    }

    /// Stop every loop and idle the built-in outputs
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.slots().into_iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(controller = %id, "SHUTDOWN: {}", e);
            }
        }
        if let Some(task) = self.inner.control_task.lock().take() {
            task.abort();
        }
        if let Some(bank) = &self.inner.ctx.output_bank {
            bank.all_off();
        }
        info!("SHUTDOWN: All controller loops stopped");
    }
}

/// Serially handle requests posted by loops and actions
async fn control_loop(inner: Weak<SupervisorInner>, mut rx: mpsc::UnboundedReceiver<ControlRequest>) {
    while let Some(request) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let supervisor = Supervisor { inner };
        let result = match &request {
            ControlRequest::Activate(id) => supervisor.activate(id).await,
            ControlRequest::Deactivate(id) => supervisor.deactivate(id).await,
            ControlRequest::Pid { pid_id, command } => supervisor.command(pid_id, LoopCommand::Pid(command.clone())).await,
        };
        if let Err(e) = result {
            warn!("CONTROL: {:?} failed: {}", request, e);
        }
    }
    debug!("CONTROL: Control queue closed");
}
