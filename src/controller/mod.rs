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

//! Controller Loop
//!
//! One tokio task per active controller. The task builds its worker from the
//! current registry snapshot, then alternates between one unit of work and
//! a sleep until the worker's next wake (or an event). Errors inside a unit
//! of work are logged and counted, never fatal.
//!
//! # Live reconfiguration
//!
//! A requester asks the loop to park through [`LoopHandle::pause`]. The loop
//! finishes its current unit of work, publishes `Paused` and waits. Only then
//! does the requester get a [`PauseGuard`] giving mutable access to the
//! worker. Dropping the guard resumes the loop.

mod conditional;
mod input;
mod math;
mod pid;
mod trigger;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use vd_core::actions::PidCommand;
use vd_core::cancel;
use vd_core::constants::timing;
use vd_core::data::{validate_controller, Controller, ControllerKind};
use vd_core::registry::Snapshot;
use vd_error::{Result, VerdantError};

use crate::context::RuntimeContext;

pub use conditional::ConditionalWorker;
pub use input::InputWorker;
pub use math::MathWorker;
pub use pid::PidWorker;
pub use trigger::TriggerWorker;

/// Log per-tick details at info for controllers with the debug flag set
macro_rules! tick {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}
pub(crate) use tick;

/// Lifecycle of one controller loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Created,
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl LoopState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Command applied to a parked worker
#[derive(Debug, Clone, PartialEq)]
pub enum LoopCommand {
    Pid(PidCommand),
}

/// Level change on a digital input
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeEvent {
    pub device_id: String,
    pub pin: u32,
    /// Level after the change
    pub state: bool,
    pub at: DateTime<Utc>,
}

impl EdgeEvent {
    pub fn new(device_id: impl Into<String>, pin: u32, state: bool) -> Self {
        Self {
            device_id: device_id.into(),
            pin,
            state,
            at: Utc::now(),
        }
    }
}

/// Variant-specific behavior run by the generic loop
#[async_trait]
pub trait ControllerWorker: Send {
    /// When the next unit of work is due; `None` waits for events only
    fn next_wake(&self) -> Option<Instant>;

    /// One unit of work
    async fn run_once(&mut self) -> Result<()>;

    async fn on_event(&mut self, event: &EdgeEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    /// Take a new configuration snapshot, keeping runtime state where possible
    fn reload(&mut self, snapshot: Arc<Snapshot>) -> Result<()>;

    async fn apply(&mut self, command: LoopCommand) -> Result<()> {
        Err(VerdantError::NotSupported(format!("{:?}", command)))
    }

    /// Runs once after the last unit of work
    async fn on_stop(&mut self) {}
}

/// Counts consecutive acquisition failures
#[derive(Debug, Clone)]
pub struct FailureCounter {
    consecutive: u32,
    threshold: u32,
}

impl Default for FailureCounter {
    fn default() -> Self {
        Self::new(timing::FAILURES_BEFORE_WARNING)
    }
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    /// Count a failure; true when it completes a run of `threshold`, which also resets the count
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Fixed-period schedule that never bunches up missed ticks
#[derive(Debug, Clone)]
pub(crate) struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    pub(crate) fn new(period_sec: f64, offset_sec: f64) -> Self {
        Self {
            period: Duration::from_secs_f64(period_sec.max(timing::MIN_PERIOD_SEC)),
            next: Instant::now() + Duration::from_secs_f64(offset_sec.max(0.0)),
        }
    }

    pub(crate) fn next(&self) -> Instant {
        self.next
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        now >= self.next
    }

    pub(crate) fn advance(&mut self, now: Instant) {
        self.next += self.period;
        if self.next <= now {
            self.next = now + self.period;
        }
    }

    /// Change the period; the pending tick keeps its place unless it is now too far out
    pub(crate) fn set_period(&mut self, period_sec: f64) {
        let period = Duration::from_secs_f64(period_sec.max(timing::MIN_PERIOD_SEC));
        let now = Instant::now();
        if self.next > now + period {
            self.next = now + period;
        }
        self.period = period;
    }
}

/// Effective polling period for a controller
pub(crate) fn period_of(controller: &Controller, snapshot: &Snapshot) -> f64 {
    controller
        .period_sec
        .unwrap_or(snapshot.config.general.default_period_sec)
}

/// Build the worker for `controller_id` from `snapshot`
pub fn build_worker(
    ctx: &Arc<RuntimeContext>,
    snapshot: Arc<Snapshot>,
    controller_id: &str,
) -> Result<Box<dyn ControllerWorker>> {
    let controller = snapshot
        .config
        .controller(controller_id)
        .ok_or_else(|| VerdantError::ControllerNotFound(controller_id.to_string()))?
        .clone();
    validate_controller(&snapshot.config, &controller, &ctx.drivers)?;

    let worker: Box<dyn ControllerWorker> = match &controller.kind {
        ControllerKind::Input(_) => Box::new(InputWorker::new(ctx.clone(), snapshot, controller)?),
        ControllerKind::Math(_) => Box::new(MathWorker::new(ctx.clone(), snapshot, controller)?),
        ControllerKind::Conditional(_) => Box::new(ConditionalWorker::new(ctx.clone(), snapshot, controller)?),
        ControllerKind::Trigger(_) => Box::new(TriggerWorker::new(ctx.clone(), snapshot, controller)?),
        ControllerKind::Pid(_) => Box::new(PidWorker::new(ctx.clone(), snapshot, controller)?),
        ControllerKind::Function => {
            return Err(VerdantError::config(format!("{} is a function controller and has no loop", controller_id)))
        }
    };
    Ok(worker)
}

/// The worker for a controller id, built from a snapshot
pub type WorkerFactory =
    Arc<dyn Fn(Arc<Snapshot>) -> Result<Box<dyn ControllerWorker>> + Send + Sync>;

type WorkerSlot = Arc<Mutex<Box<dyn ControllerWorker>>>;

#[derive(Debug)]
struct LoopShared {
    stop: watch::Sender<bool>,
    pause: watch::Sender<bool>,
    state: watch::Sender<LoopState>,
    /// Wakes the loop out of its inter-tick sleep
    wake: Notify,
    /// Serializes pause requesters
    pausers: Arc<Mutex<()>>,
}

/// Handle to a running controller loop
#[derive(Clone)]
pub struct LoopHandle {
    id: String,
    shared: Arc<LoopShared>,
    worker: WorkerSlot,
    state: watch::Receiver<LoopState>,
    events: mpsc::UnboundedSender<EdgeEvent>,
    task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// Exclusive access to a parked worker; the loop resumes on drop
pub struct PauseGuard {
    shared: Arc<LoopShared>,
    worker: OwnedMutexGuard<Box<dyn ControllerWorker>>,
    _serial: OwnedMutexGuard<()>,
}

impl PauseGuard {
    pub fn worker(&mut self) -> &mut (dyn ControllerWorker + 'static) {
        &mut **self.worker
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.shared.pause.send_replace(false);
        // Published here so the requester sees Running as soon as it lets go
        self.shared.state.send_if_modified(|state| {
            let parked = *state == LoopState::Paused;
            if parked {
                *state = LoopState::Running;
            }
            parked
        });
        self.shared.wake.notify_one();
    }
}

impl LoopHandle {
    /// Spawn the loop and wait until its worker is built
    ///
    /// Initialization is retried `retries` times with a fixed `backoff`; if it
    /// still fails the loop ends in `Failed` and the last error is returned.
    pub async fn spawn(
        id: &str,
        verbose: bool,
        factory: WorkerFactory,
        snapshot: impl Fn() -> Arc<Snapshot> + Send + 'static,
        retries: u32,
        backoff: Duration,
    ) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(LoopState::Created);
        let (stop_tx, _) = watch::channel(false);
        let (pause_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<WorkerSlot>>();
        let shared = Arc::new(LoopShared {
            stop: stop_tx,
            pause: pause_tx,
            state: state_tx,
            wake: Notify::new(),
            pausers: Arc::new(Mutex::new(())),
        });

        let runner = LoopRunner {
            id: id.to_string(),
            verbose,
            shared: shared.clone(),
            events: events_rx,
            failures: FailureCounter::default(),
        };
        let task = tokio::spawn(runner.run(factory, snapshot, retries, backoff, ready_tx));

        let worker = match ready_rx.await {
            Ok(Ok(worker)) => worker,
            Ok(Err(e)) => {
                let _ = task.await;
                return Err(e);
            }
            Err(_) => {
                return Err(VerdantError::generic(format!("controller {} exited during initialization", id)));
            }
        };

        Ok(Self {
            id: id.to_string(),
            shared,
            worker,
            state: state_rx,
            events: events_tx,
            task: Arc::new(parking_lot::Mutex::new(Some(task))),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Receiver following every state transition
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    /// Queue an edge event for the worker
    pub fn deliver(&self, event: EdgeEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Interrupt the inter-tick sleep so the loop re-checks its schedule
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    /// Park the loop after its current unit of work
    ///
    /// `timeout` bounds the wait and should cover the longest unit of work
    /// the worker can run.
    pub async fn pause(&self, timeout: Duration) -> Result<PauseGuard> {
        let serial = self.shared.pausers.clone().lock_owned().await;
        self.shared.pause.send_replace(true);
        self.shared.wake.notify_one();

        let mut state = self.state.clone();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == LoopState::Paused || s.is_finished()),
        )
        .await
        .map(|r| r.map(|s| *s));

        match reached {
            Ok(Ok(LoopState::Paused)) => {}
            Ok(Ok(other)) => {
                self.shared.pause.send_replace(false);
                return Err(VerdantError::generic(format!("controller {} is {:?}", self.id, other)));
            }
            Ok(Err(_)) => {
                self.shared.pause.send_replace(false);
                return Err(VerdantError::generic(format!("controller {} loop is gone", self.id)));
            }
            Err(_) => {
                self.shared.pause.send_replace(false);
                warn!(controller = %self.id, "CONTROL: Loop did not park in time");
                return Err(VerdantError::Timeout(format!("pausing controller {}", self.id)));
            }
        }

        let worker = self.worker.clone().lock_owned().await;
        debug!(controller = %self.id, "CONTROL: Loop parked");
        Ok(PauseGuard {
            shared: self.shared.clone(),
            worker,
            _serial: serial,
        })
    }

    /// Stop the loop cooperatively and wait until its task has finished
    ///
    /// Never returns while the loop can still run work, so a new loop for the
    /// same controller cannot overlap this one.
    pub async fn stop(&self) {
        self.shared.stop.send_replace(true);
        self.shared.wake.notify_one();

        let task = self.task.lock().take();
        let Some(mut task) = task else {
            // Another caller owns the task; wait for the loop to report the end
            let mut state = self.state.clone();
            let _ = state.wait_for(|s| s.is_finished()).await;
            return;
        };
        loop {
            match tokio::time::timeout(timing::STOP_WARN_INTERVAL, &mut task).await {
                Ok(Ok(())) => break,
                Ok(Err(e)) => {
                    error!(controller = %self.id, "CONTROL: Loop task failed: {}", e);
                    self.shared.state.send_replace(LoopState::Stopped);
                    break;
                }
                Err(_) => warn!(controller = %self.id, "CONTROL: Still waiting for the loop to stop"),
            }
        }
    }
}

struct LoopRunner {
    id: String,
    verbose: bool,
    shared: Arc<LoopShared>,
    events: mpsc::UnboundedReceiver<EdgeEvent>,
    failures: FailureCounter,
}

impl LoopRunner {
    fn set_state(&self, state: LoopState) {
        self.shared.state.send_replace(state);
    }

    fn stopping(&self) -> bool {
        *self.shared.stop.borrow()
    }

    async fn run(
        mut self,
        factory: WorkerFactory,
        snapshot: impl Fn() -> Arc<Snapshot> + Send + 'static,
        retries: u32,
        backoff: Duration,
        ready: oneshot::Sender<Result<WorkerSlot>>,
    ) {
        self.set_state(LoopState::Initializing);

        let mut attempt = 0;
        let worker = loop {
            match factory(snapshot()) {
                Ok(worker) => break worker,
                Err(e) if attempt < retries && !self.stopping() => {
                    attempt += 1;
                    warn!(controller = %self.id, "CONTROL: Initialization failed (attempt {}/{}): {}", attempt, retries + 1, e);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(controller = %self.id, "CONTROL: Initialization failed, giving up: {}", e);
                    self.set_state(LoopState::Failed);
                    let _ = ready.send(Err(VerdantError::config(format!(
                        "controller {} failed to initialize: {}",
                        self.id, e
                    ))));
                    return;
                }
            }
        };

        let slot: WorkerSlot = Arc::new(Mutex::new(worker));
        self.set_state(LoopState::Running);
        if ready.send(Ok(slot.clone())).is_err() {
            return;
        }
        info!(controller = %self.id, "CONTROL: Loop running");

        let stop = self.shared.stop.subscribe();
        cancel::scope(stop, self.main_loop(&slot)).await;

        self.set_state(LoopState::Stopping);
        slot.lock().await.on_stop().await;
        self.set_state(LoopState::Stopped);
        info!(controller = %self.id, "CONTROL: Loop stopped");
    }

    async fn main_loop(&mut self, slot: &WorkerSlot) {
        loop {
            if self.stopping() {
                break;
            }
            if *self.shared.pause.borrow() {
                self.park().await;
                continue;
            }

            let wake_at = slot.lock().await.next_wake();
            let sleep = async {
                match wake_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = sleep => {
                    let result = slot.lock().await.run_once().await;
                    self.account(result);
                }
                Some(event) = self.events.recv() => {
                    tick!(self.verbose, controller = %self.id, "CONTROL: Edge on {} pin {}", event.device_id, event.pin);
                    let result = slot.lock().await.on_event(&event).await;
                    self.account(result);
                }
                _ = self.shared.wake.notified() => {}
            }
        }
    }

    fn account(&mut self, result: Result<()>) {
        match result {
            Ok(()) => self.failures.record_success(),
            Err(e) => {
                tick!(self.verbose, controller = %self.id, "CONTROL: Unit of work failed: {}", e);
                if self.failures.record_failure() {
                    warn!(
                        controller = %self.id,
                        "CONTROL: {} consecutive failures, last: {}",
                        timing::FAILURES_BEFORE_WARNING,
                        e
                    );
                }
            }
        }
    }

    async fn park(&mut self) {
        let mut pause = self.shared.pause.subscribe();
        loop {
            if self.stopping() || !*pause.borrow_and_update() {
                break;
            }
            // Again after every wake: a released guard flips the state to Running
            // even when the next requester has already raised the flag
            self.set_state(LoopState::Paused);
            tokio::select! {
                changed = pause.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.shared.wake.notified() => {}
            }
        }
        if !self.stopping() {
            self.set_state(LoopState::Running);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vd_core::data::VerdantConfig;

    struct Counting {
        ticker: Ticker,
        runs: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl ControllerWorker for Counting {
        fn next_wake(&self) -> Option<Instant> {
            Some(self.ticker.next())
        }

        async fn run_once(&mut self) -> Result<()> {
            self.ticker.advance(Instant::now());
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(VerdantError::measurement("dev", "no reading"))
            } else {
                Ok(())
            }
        }

        fn reload(&mut self, _snapshot: Arc<Snapshot>) -> Result<()> {
            Ok(())
        }

        async fn apply(&mut self, command: LoopCommand) -> Result<()> {
            match command {
                LoopCommand::Pid(PidCommand::SetSetpoint(_)) => Ok(()),
                other => Err(VerdantError::NotSupported(format!("{:?}", other))),
            }
        }
    }

    const PARK: Duration = Duration::from_secs(30);

    /// One unit of work that takes `work` to finish
    struct Slow {
        ticker: Ticker,
        work: Duration,
        stoppable: bool,
        finished: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ControllerWorker for Slow {
        fn next_wake(&self) -> Option<Instant> {
            Some(self.ticker.next())
        }

        async fn run_once(&mut self) -> Result<()> {
            self.ticker.advance(Instant::now());
            if self.stoppable {
                cancel::sleep_unless_stopped(self.work).await;
            } else {
                tokio::time::sleep(self.work).await;
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn reload(&mut self, _snapshot: Arc<Snapshot>) -> Result<()> {
            Ok(())
        }
    }

    async fn spawn_slow(work: Duration, stoppable: bool, finished: Arc<AtomicU32>) -> LoopHandle {
        let factory: WorkerFactory = Arc::new(move |_| {
            Ok(Box::new(Slow {
                ticker: Ticker::new(1000.0, 0.0),
                work,
                stoppable,
                finished: finished.clone(),
            }) as Box<dyn ControllerWorker>)
        });
        LoopHandle::spawn("slow", false, factory, snapshot, 0, Duration::ZERO).await.unwrap()
    }

    fn snapshot() -> Arc<Snapshot> {
        Arc::new(Snapshot::new(VerdantConfig::default()).unwrap())
    }

    async fn spawn_counting(runs: Arc<AtomicU32>, period: f64) -> LoopHandle {
        let factory: WorkerFactory = Arc::new(move |_| {
            Ok(Box::new(Counting {
                ticker: Ticker::new(period, 0.0),
                runs: runs.clone(),
                fail: false,
            }) as Box<dyn ControllerWorker>)
        });
        LoopHandle::spawn("t", false, factory, snapshot, 0, Duration::ZERO).await.unwrap()
    }

    #[test]
    fn test_failure_counter_warns_once_per_run() {
        let mut counter = FailureCounter::new(3);
        assert!(!counter.record_failure());
        assert!(!counter.record_failure());
        assert!(counter.record_failure());
        assert_eq!(counter.consecutive(), 0);
        assert!(!counter.record_failure());
        counter.record_success();
        assert_eq!(counter.consecutive(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_skips_missed_ticks() {
        let mut ticker = Ticker::new(10.0, 0.0);
        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(35)).await;
        ticker.advance(Instant::now());
        assert_eq!(ticker.next(), start + Duration::from_secs(45));
        assert!(!ticker.is_due(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_on_period_and_stops() {
        let runs = Arc::new(AtomicU32::new(0));
        let handle = spawn_counting(runs.clone(), 10.0).await;
        assert_eq!(handle.state(), LoopState::Running);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        handle.stop().await;
        assert_eq!(handle.state(), LoopState::Stopped);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_then_resume_is_transparent() {
        let runs = Arc::new(AtomicU32::new(0));
        let handle = spawn_counting(runs.clone(), 10.0).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        {
            let guard = handle.pause(PARK).await.unwrap();
            assert_eq!(handle.state(), LoopState::Paused);
            drop(guard);
        }
        assert_eq!(handle.state(), LoopState::Running);
        // No extra or missing tick: the next one still lands at t=10
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_applied_while_parked() {
        let runs = Arc::new(AtomicU32::new(0));
        let handle = spawn_counting(runs, 10.0).await;
        let mut guard = handle.pause(PARK).await.unwrap();
        guard.worker().apply(LoopCommand::Pid(PidCommand::SetSetpoint(21.0))).await.unwrap();
        assert!(guard.worker().apply(LoopCommand::Pid(PidCommand::Hold)).await.is_err());
        drop(guard);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure_retries_then_fails() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let factory: WorkerFactory = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(VerdantError::invalid_config("driver", "unknown"))
        });
        let result = LoopHandle::spawn("bad", false, factory, snapshot, 2, Duration::from_secs(1)).await;
        let err = result.unwrap_err();
        assert!(err.is_configuration(), "{}", err);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_loop() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let factory: WorkerFactory = Arc::new(move |_| {
            Ok(Box::new(Counting {
                ticker: Ticker::new(1.0, 0.0),
                runs: counter.clone(),
                fail: true,
            }) as Box<dyn ControllerWorker>)
        });
        let handle = LoopHandle::spawn("f", false, factory, snapshot, 0, Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(7500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 8);
        assert_eq!(handle.state(), LoopState::Running);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_unit_of_work() {
        let finished = Arc::new(AtomicU32::new(0));
        let handle = spawn_slow(Duration::from_secs(120), false, finished.clone()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = Instant::now();
        handle.stop().await;
        assert!(started.elapsed() >= Duration::from_secs(119));
        assert_eq!(handle.state(), LoopState::Stopped);
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        // A second stop on a finished loop returns at once
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_stoppable_wait() {
        let finished = Arc::new(AtomicU32::new(0));
        let handle = spawn_slow(Duration::from_secs(300), true, finished.clone()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = Instant::now();
        handle.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handle.state(), LoopState::Stopped);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_waits_out_long_unit_of_work() {
        let finished = Arc::new(AtomicU32::new(0));
        let handle = spawn_slow(Duration::from_secs(120), false, finished.clone()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let guard = handle.pause(Duration::from_secs(330)).await.unwrap();
        assert_eq!(handle.state(), LoopState::Paused);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        drop(guard);
        assert_eq!(handle.state(), LoopState::Running);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_pauses() {
        let runs = Arc::new(AtomicU32::new(0));
        let handle = spawn_counting(runs, 10.0).await;
        drop(handle.pause(PARK).await.unwrap());
        let guard = handle.pause(PARK).await.unwrap();
        assert_eq!(handle.state(), LoopState::Paused);
        drop(guard);
        handle.stop().await;
    }
}
