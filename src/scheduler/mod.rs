//! Background task scheduler
//!
//! ```text
//! Tasks are registered by name as on-demand, timed (one shot at a set
//! time) or periodic. Each dispatch spawns exactly one future; a task is
//! never running twice at once. On completion:
//!
//!   next_run in the future   -> the run was forced early, keep the slot
//!   periodic                 -> next_run += interval (one step)
//!   timed                    -> next_run cleared
//!   rerun requested          -> run once more with the queued options
//!
//! A suspended task that comes due is skipped, but its schedule still
//! advances as if it had run.
//! ```
//!
//! The control loop in [`Scheduler::start`] calls [`Scheduler::tick`] at
//! each wakeup. Tests drive `tick` directly with a [`ManualClock`].
//!
//! [`ManualClock`]: crate::core::ManualClock

pub mod handle;
pub mod task;

pub use handle::{ScheduleHandle, TaskInfo, TaskKind, TaskOutcome, interval_string};
pub use task::{Interrupt, Task, TaskContext, task_fn};

use crate::core::{Clock, DbError, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest the control loop sleeps without re-reading the clock.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Started { name: String },
    Completed { name: String, outcome: TaskOutcome },
    /// Registrations or task states changed.
    TableChanged,
}

#[derive(Default)]
struct SchedState {
    handles: BTreeMap<String, ScheduleHandle>,
    next_generation: u64,
    stopped: bool,
}

struct SchedInner {
    clock: Arc<dyn Clock>,
    state: Mutex<SchedState>,
    wake: Notify,
    events: broadcast::Sender<TaskEvent>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedInner>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SchedInner {
                clock,
                state: Mutex::new(SchedState::default()),
                wake: Notify::new(),
                events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.inner.events.send(event);
    }

    fn wake(&self) {
        self.inner.wake.notify_waiters();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn register(
        &self,
        name: &str,
        task: Arc<dyn Task>,
        kind: TaskKind,
        next_run: Option<DateTime<Utc>>,
        interval: Option<Duration>,
    ) {
        let now = self.inner.clock.now();
        {
            let mut state = self.state();
            state.next_generation += 1;
            let handle = ScheduleHandle::new(
                name.to_string(),
                task,
                kind,
                next_run,
                interval,
                now,
                state.next_generation,
            );
            if let Some(old) = state.handles.insert(name.to_string(), handle) {
                if let Some(interrupt) = old.interrupt {
                    interrupt.set();
                }
                debug!(task = name, "replaced task registration");
            }
        }
        info!(task = name, kind = ?kind, "registered task");
        self.emit(TaskEvent::TableChanged);
        self.wake();
    }

    pub fn add_on_demand(&self, name: &str, task: Arc<dyn Task>) {
        self.register(name, task, TaskKind::OnDemand, None, None);
    }

    pub fn add_timed(&self, name: &str, at: DateTime<Utc>, task: Arc<dyn Task>) {
        self.register(name, task, TaskKind::Timed, Some(at), None);
    }

    /// Register a task first due at `first_run` and every `interval` after.
    pub fn add_periodic(
        &self,
        name: &str,
        first_run: DateTime<Utc>,
        interval: Duration,
        task: Arc<dyn Task>,
    ) -> Result<()> {
        if interval < Duration::from_secs(60) {
            return Err(DbError::TaskError(format!(
                "Interval for {} must be at least one minute",
                name
            )));
        }
        self.register(name, task, TaskKind::Periodic, Some(first_run), Some(interval));
        Ok(())
    }

    /// Register a task that runs every day at `hour:minute` UTC.
    pub fn add_daily(&self, name: &str, hour: u32, minute: u32, task: Arc<dyn Task>) -> Result<()> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| DbError::TaskError(format!("Invalid time of day {}:{:02}", hour, minute)))?;
        let now = self.inner.clock.now();
        let mut first = now.date_naive().and_time(at).and_utc();
        if first <= now {
            first += ChronoDuration::days(1);
        }
        self.add_periodic(name, first, Duration::from_secs(86_400), task)
    }

    /// Remove a task. A running task finishes its current run first and is
    /// dropped on completion without a rerun.
    pub fn unregister_task(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state();
            let handle = Self::handle_mut(&mut state, name)?;
            handle.rerun = false;
            if handle.running {
                handle.unregistered = true;
            } else {
                state.handles.remove(name);
            }
        }
        info!(task = name, "unregistered task");
        self.emit(TaskEvent::TableChanged);
        Ok(())
    }

    fn handle_mut<'a>(state: &'a mut SchedState, name: &str) -> Result<&'a mut ScheduleHandle> {
        state
            .handles
            .get_mut(name)
            .filter(|h| !h.unregistered)
            .ok_or_else(|| DbError::TaskError(format!("No such task: {}", name)))
    }

    // ========================================================================
    // Control by name
    // ========================================================================

    /// Run a task now. Returns false if it is already running.
    pub fn run_task_now(&self, name: &str) -> Result<bool> {
        let mut state = self.state();
        let handle = Self::handle_mut(&mut state, name)?;
        if handle.running {
            return Ok(false);
        }
        self.dispatch_locked(&mut state, name);
        Ok(true)
    }

    /// Run a task now, or once more after its current run if it is running.
    pub fn demand_task(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        let handle = Self::handle_mut(&mut state, name)?;
        if handle.running {
            handle.rerun = true;
            debug!(task = name, "rerun queued");
            return Ok(());
        }
        self.dispatch_locked(&mut state, name);
        Ok(())
    }

    /// Like [`Scheduler::demand_task`], with options for that run.
    pub fn run_on_completion(&self, name: &str, options: Option<Vec<String>>) -> Result<()> {
        let mut state = self.state();
        let handle = Self::handle_mut(&mut state, name)?;
        handle.options = options;
        if handle.running {
            handle.rerun = true;
            return Ok(());
        }
        self.dispatch_locked(&mut state, name);
        Ok(())
    }

    /// Options passed to the next run only.
    pub fn set_options(&self, name: &str, options: Option<Vec<String>>) -> Result<()> {
        Self::handle_mut(&mut self.state(), name)?.options = options;
        Ok(())
    }

    /// Ask a running task to stop. Returns false if it was not running.
    pub fn stop_task(&self, name: &str) -> Result<bool> {
        let mut state = self.state();
        let handle = Self::handle_mut(&mut state, name)?;
        match (&handle.interrupt, handle.running) {
            (Some(interrupt), true) => {
                interrupt.set();
                info!(task = name, "stop requested");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn disable_task(&self, name: &str) -> Result<()> {
        Self::handle_mut(&mut self.state(), name)?.suspended = true;
        self.emit(TaskEvent::TableChanged);
        Ok(())
    }

    pub fn enable_task(&self, name: &str) -> Result<()> {
        Self::handle_mut(&mut self.state(), name)?.suspended = false;
        self.emit(TaskEvent::TableChanged);
        Ok(())
    }

    pub fn task_info(&self, name: &str) -> Option<TaskInfo> {
        self.state()
            .handles
            .get(name)
            .filter(|h| !h.unregistered)
            .map(ScheduleHandle::info)
    }

    pub fn task_table(&self) -> Vec<TaskInfo> {
        self.state()
            .handles
            .values()
            .filter(|h| !h.unregistered)
            .map(ScheduleHandle::info)
            .collect()
    }

    // ========================================================================
    // Dispatch and completion
    // ========================================================================

    /// Dispatch every task due at `now`. Returns the names dispatched.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.state();
        if state.stopped {
            return Vec::new();
        }
        let due: Vec<String> = state
            .handles
            .values()
            .filter(|h| h.is_due(now))
            .map(|h| h.name.clone())
            .collect();
        for name in &due {
            self.dispatch_locked(&mut state, name);
        }
        due
    }

    fn dispatch_locked(&self, state: &mut SchedState, name: &str) {
        if state.stopped {
            return;
        }
        let Some(handle) = state.handles.get_mut(name) else {
            return;
        };
        handle.rerun = false;
        let generation = handle.generation;

        if handle.suspended {
            debug!(task = name, "skipping suspended task");
            self.complete_locked(state, name, generation, TaskOutcome::Skipped);
            return;
        }

        let interrupt = Interrupt::new();
        handle.running = true;
        handle.interrupt = Some(interrupt.clone());
        let ctx = TaskContext {
            name: name.to_string(),
            options: handle.options.take(),
            interrupt,
        };
        let task = Arc::clone(&handle.task);
        let scheduler = self.clone();
        let task_name = name.to_string();

        debug!(task = name, "dispatching task");
        self.emit(TaskEvent::Started {
            name: task_name.clone(),
        });
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(task.run(ctx)).catch_unwind().await {
                Ok(Ok(())) => TaskOutcome::Success,
                Ok(Err(e)) => {
                    warn!(task = %task_name, error = %e, "task failed");
                    TaskOutcome::Failed(e.to_string())
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(task = %task_name, panic = %message, "task panicked");
                    TaskOutcome::Panicked(message)
                }
            };
            scheduler.notify_completion(&task_name, generation, outcome);
        });
    }

    fn notify_completion(&self, name: &str, generation: u64, outcome: TaskOutcome) {
        let mut state = self.state();
        self.complete_locked(&mut state, name, generation, outcome);
    }

    fn complete_locked(&self, state: &mut SchedState, name: &str, generation: u64, outcome: TaskOutcome) {
        let now = self.inner.clock.now();
        let Some(handle) = state.handles.get_mut(name) else {
            return;
        };
        if handle.generation != generation {
            // finished run of a replaced registration
            return;
        }
        if outcome != TaskOutcome::Skipped {
            handle.running = false;
            handle.interrupt = None;
            handle.last_run = Some(now);
        }
        handle.last_outcome = Some(outcome.clone());
        self.emit(TaskEvent::Completed {
            name: name.to_string(),
            outcome,
        });

        if handle.unregistered {
            state.handles.remove(name);
            self.emit(TaskEvent::TableChanged);
            return;
        }

        handle.reschedule(now);
        let rerun = handle.rerun;
        if rerun {
            debug!(task = name, "running queued rerun");
            self.dispatch_locked(state, name);
        }
        self.wake();
    }

    // ========================================================================
    // Control loop
    // ========================================================================

    fn next_wait(&self, now: DateTime<Utc>) -> Duration {
        self.state()
            .handles
            .values()
            .filter(|h| !h.running && !h.unregistered)
            .filter_map(|h| h.next_run)
            .min()
            .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(MAX_IDLE_WAIT)
            .min(MAX_IDLE_WAIT)
    }

    /// Spawn the control loop. It runs until [`Scheduler::stop`].
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run_loop().await })
    }

    async fn run_loop(&self) {
        info!("scheduler started");
        loop {
            let notified = self.inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_stopped() {
                break;
            }
            let now = self.inner.clock.now();
            self.tick(now);
            let wait = self.next_wait(now);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = &mut notified => {}
            }
        }
        info!("scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    /// Stop dispatching and interrupt running tasks. Returns how many were
    /// running.
    pub fn stop(&self) -> usize {
        let running = {
            let mut state = self.state();
            state.stopped = true;
            let mut running = 0;
            for handle in state.handles.values_mut() {
                handle.rerun = false;
                if let Some(interrupt) = &handle.interrupt {
                    interrupt.set();
                    running += 1;
                }
            }
            running
        };
        self.wake();
        running
    }

    pub fn running_count(&self) -> usize {
        self.state().handles.values().filter(|h| h.running).count()
    }
}
