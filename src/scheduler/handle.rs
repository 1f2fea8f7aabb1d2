use super::task::{Interrupt, Task};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskKind {
    /// Runs only when demanded.
    OnDemand,
    /// Runs once at a set time, then behaves as on-demand.
    Timed,
    Periodic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TaskOutcome {
    Success,
    Failed(String),
    Panicked(String),
    /// The task was suspended when it came due.
    Skipped,
}

/// Registration record for one named task.
pub struct ScheduleHandle {
    pub(crate) name: String,
    pub(crate) task: Arc<dyn Task>,
    pub(crate) kind: TaskKind,
    pub(crate) interval: Option<Duration>,
    pub(crate) next_run: Option<DateTime<Utc>>,
    pub(crate) last_run: Option<DateTime<Utc>>,
    pub(crate) inception: DateTime<Utc>,
    pub(crate) running: bool,
    pub(crate) suspended: bool,
    pub(crate) rerun: bool,
    pub(crate) unregistered: bool,
    pub(crate) options: Option<Vec<String>>,
    pub(crate) interrupt: Option<Interrupt>,
    pub(crate) last_outcome: Option<TaskOutcome>,
    /// Distinguishes this registration from an earlier one under the same name.
    pub(crate) generation: u64,
}

impl ScheduleHandle {
    pub(crate) fn new(
        name: String,
        task: Arc<dyn Task>,
        kind: TaskKind,
        next_run: Option<DateTime<Utc>>,
        interval: Option<Duration>,
        now: DateTime<Utc>,
        generation: u64,
    ) -> Self {
        Self {
            name,
            task,
            kind,
            interval,
            next_run,
            last_run: None,
            inception: now,
            running: false,
            suspended: false,
            rerun: false,
            unregistered: false,
            options: None,
            interrupt: None,
            last_outcome: None,
            generation,
        }
    }

    pub(crate) fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.running && !self.unregistered && self.next_run.is_some_and(|t| t <= now)
    }

    /// Advance `next_run` after a run. A run forced early leaves the normal
    /// slot alone; a periodic task steps by exactly one interval from its
    /// previous scheduled time; a timed task is done.
    pub(crate) fn reschedule(&mut self, now: DateTime<Utc>) {
        let Some(next) = self.next_run else {
            return;
        };
        if next > now {
            return;
        }
        self.next_run = match (self.kind, self.interval) {
            (TaskKind::Periodic, Some(interval)) => chrono::Duration::from_std(interval)
                .ok()
                .map(|step| next + step),
            _ => None,
        };
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            name: self.name.clone(),
            kind: self.kind,
            interval: self.interval.map(interval_string).unwrap_or_default(),
            next_run: self.next_run,
            last_run: self.last_run,
            inception: self.inception,
            running: self.running,
            suspended: self.suspended,
            rerun_pending: self.rerun,
            last_outcome: self.last_outcome.clone(),
        }
    }
}

/// Task table row for admin consoles.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub kind: TaskKind,
    pub interval: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub inception: DateTime<Utc>,
    pub running: bool,
    pub suspended: bool,
    pub rerun_pending: bool,
    pub last_outcome: Option<TaskOutcome>,
}

/// Human description of an interval at minute resolution,
/// e.g. "1 week, 2 days, 3 hours".
pub fn interval_string(interval: Duration) -> String {
    let mut minutes = interval.as_secs() / 60;
    let units = [("week", 10_080), ("day", 1_440), ("hour", 60), ("minute", 1)];
    let mut parts = Vec::new();
    for (unit, size) in units {
        let count = minutes / size;
        minutes %= size;
        match count {
            0 => {}
            1 => parts.push(format!("1 {}", unit)),
            n => parts.push(format!("{} {}s", n, unit)),
        }
    }
    parts.join(", ")
}
