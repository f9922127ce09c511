//! The task scheduler.
//!
//! All pending work lives in one [`TaskList`]: an ordered collection of
//! [`Task`]s keyed by (flush-first, due time, canonical zone name), with at
//! most one task per zone.  Worker threads share the list through
//! [`TaskQueue`], which serializes access behind a single mutex and parks
//! idle workers on a condition variable until the earliest task falls due.

use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, error};

use crate::common::datetime::UnixTime;
use crate::zone::{ZoneKey, ZoneState};

pub mod backup;
pub mod task;

pub use task::{Stage, Task, TaskKey};

//----------- TaskList ---------------------------------------------------------

/// The ordered collection of pending tasks.
#[derive(Debug, Default)]
pub struct TaskList {
    /// Tasks in execution order.
    tasks: BTreeMap<TaskKey, Task>,

    /// The key of each zone's task, for duplicate detection and removal.
    by_zone: foldhash::HashMap<ZoneKey, TaskKey>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Insert a task into the list.
    ///
    /// Rejected if a worker is executing a task for the zone right now, or
    /// if the zone already has a task queued; either way the offered task is
    /// dropped and an error is logged, since this signals a logic bug or a
    /// genuinely busy zone, not a condition to retry.
    pub fn schedule(&mut self, task: Task, zone: &mut ZoneState) -> Result<(), ScheduleError> {
        if zone.in_progress {
            error!(
                "unable to schedule task [{} zone '{}']: zone in progress",
                task.stage, task.zone
            );
            return Err(ScheduleError::ZoneBusy);
        }
        if self.by_zone.contains_key(&task.zone) {
            error!(
                "unable to schedule task [{} zone '{}']: already present",
                task.stage, task.zone
            );
            return Err(ScheduleError::AlreadyScheduled);
        }

        let key = task.sort_key();
        zone.task = Some(key.clone());
        self.by_zone.insert(task.zone.clone(), key.clone());
        self.tasks.insert(key, task);
        Ok(())
    }

    /// Remove and return the first task, if it is ready to run.
    ///
    /// A task is ready if it is flushed or its due time has passed.  The
    /// flush marker is cleared on the way out.
    pub fn pop_ready(&mut self, now: UnixTime) -> Option<Task> {
        let (_, task) = self.tasks.first_key_value()?;
        if !task.flush && task.when > now {
            return None;
        }

        let (_, mut task) = self.tasks.pop_first()?;
        self.by_zone.remove(&task.zone);
        if task.flush {
            debug!("flush task for zone '{}'", task.zone);
        } else {
            debug!("pop task for zone '{}'", task.zone);
        }
        task.flush = false;
        Some(task)
    }

    /// When the first task becomes eligible, if any.
    ///
    /// Flushed tasks are eligible immediately.
    pub fn next_due(&self) -> Option<UnixTime> {
        self.tasks.first_key_value().map(|(key, _)| {
            if key.flush {
                UnixTime::from_secs(0)
            } else {
                key.when
            }
        })
    }

    /// Mark every task as flushed, optionally overriding its stage.
    ///
    /// Used to force an immediate run for all zones, e.g. a full re-sign on
    /// operator command.
    pub fn flush_all(&mut self, stage: Option<Stage>) {
        debug!("flush task list");
        let tasks = std::mem::take(&mut self.tasks);
        self.by_zone.clear();
        for (_, mut task) in tasks {
            task.flush = true;
            if let Some(stage) = stage {
                task.stage = stage;
            }
            let key = task.sort_key();
            self.by_zone.insert(task.zone.clone(), key.clone());
            self.tasks.insert(key, task);
        }
    }

    /// Remove the task of the given zone, if one is queued.
    pub fn remove_zone(&mut self, zone: &ZoneKey) -> Option<Task> {
        let key = self.by_zone.remove(zone)?;
        debug!("delete task for zone '{zone}' from list");
        self.tasks.remove(&key)
    }

    /// Redirect the queued task of the given zone to another stage.
    ///
    /// The stage is not part of the sort key, so the task keeps its place
    /// in the list.  Returns whether a task was found.
    pub fn set_stage(&mut self, zone: &ZoneKey, stage: Stage) -> bool {
        let Some(key) = self.by_zone.get(zone) else {
            return false;
        };
        match self.tasks.get_mut(key) {
            Some(task) => {
                task.stage = stage;
                true
            }
            None => false,
        }
    }

    /// The operator-facing dump of all pending tasks, in execution order.
    pub fn dump(&self, now: UnixTime) -> String {
        let mut out = String::new();
        for task in self.tasks.values() {
            let _ = writeln!(out, "{}", task.describe(now));
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }
}

//----------- TaskQueue --------------------------------------------------------

/// A [`TaskList`] shared between threads.
///
/// Critical sections cover tree operations only and are never held across
/// stage execution.
#[derive(Debug, Default)]
pub struct TaskQueue {
    list: Mutex<TaskList>,
    ready: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a task and wake one waiting worker.
    pub fn schedule(&self, task: Task, zone: &mut ZoneState) -> Result<(), ScheduleError> {
        let result = self.list.lock().unwrap().schedule(task, zone);
        if result.is_ok() {
            self.ready.notify_one();
        }
        result
    }

    /// Block until a task is ready, the queue is woken, or `max_wait` passes.
    ///
    /// Returns `None` on shutdown or when no task became ready within the
    /// wait; the caller is expected to loop.  `max_wait` doubles as a
    /// periodic fallback tick, bounding how long a worker can miss changes
    /// made without a wakeup.
    pub fn wait_pop(&self, shutdown: &AtomicBool, max_wait: Duration) -> Option<Task> {
        let mut list = self.list.lock().unwrap();
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return None;
            }

            let now = UnixTime::now();
            if let Some(task) = list.pop_ready(now) {
                return Some(task);
            }

            let wait = match list.next_due() {
                Some(due) => Duration::from_secs(due.saturating_since(now)).min(max_wait),
                None => max_wait,
            };
            let (guard, timeout) = self.ready.wait_timeout(list, wait).unwrap();
            list = guard;
            if timeout.timed_out() {
                // Take one more look at the list, then hand control back so
                // the caller can observe shutdown.
                let now = UnixTime::now();
                return list.pop_ready(now);
            }
        }
    }

    /// Flush all tasks and wake every worker.
    pub fn flush_all(&self, stage: Option<Stage>) {
        self.list.lock().unwrap().flush_all(stage);
        self.ready.notify_all();
    }

    /// Wake every worker, e.g. so they can observe shutdown.
    pub fn notify_all(&self) {
        self.ready.notify_all();
    }

    pub fn remove_zone(&self, zone: &ZoneKey) -> Option<Task> {
        self.list.lock().unwrap().remove_zone(zone)
    }

    pub fn set_stage(&self, zone: &ZoneKey, stage: Stage) -> bool {
        self.list.lock().unwrap().set_stage(zone, stage)
    }

    pub fn len(&self) -> usize {
        self.list.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().unwrap().is_empty()
    }

    pub fn dump(&self, now: UnixTime) -> String {
        self.list.lock().unwrap().dump(now)
    }
}

//----------- ScheduleError ----------------------------------------------------

/// An error in scheduling a task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    /// A worker is executing a task for this zone right now.
    ZoneBusy,

    /// The zone already has a task in the list.
    AlreadyScheduled,
}

impl std::error::Error for ScheduleError {}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ZoneBusy => "the zone's previous task has not finished",
            Self::AlreadyScheduled => "a task for the zone is already present",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::ZoneKey;

    fn zone(name: &str) -> ZoneKey {
        ZoneKey::from_str_in(name).unwrap()
    }

    fn task(name: &str, stage: Stage, when: u64) -> Task {
        Task::new(stage, UnixTime::from_secs(when), zone(name))
    }

    #[test]
    fn one_task_per_zone() {
        let mut list = TaskList::new();
        let mut state = ZoneState::default();

        list.schedule(task("example.com", Stage::Read, 100), &mut state)
            .unwrap();
        assert_eq!(
            list.schedule(task("example.com", Stage::Sign, 200), &mut state),
            Err(ScheduleError::AlreadyScheduled)
        );
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn busy_zone_rejects_new_tasks() {
        let mut list = TaskList::new();
        let mut state = ZoneState {
            in_progress: true,
            ..Default::default()
        };

        assert_eq!(
            list.schedule(task("example.com", Stage::Read, 100), &mut state),
            Err(ScheduleError::ZoneBusy)
        );
        assert!(list.is_empty());
    }

    #[test]
    fn pop_order_is_flush_then_time_then_name() {
        let mut list = TaskList::new();

        // Insert in scrambled order.
        let mut input = vec![
            task("b.example", Stage::Sign, 300),
            task("c.example", Stage::Sign, 100),
            task("a.example", Stage::Sign, 300),
            task("d.example", Stage::Write, 200),
            {
                let mut t = task("z.example", Stage::Audit, 900);
                t.flush = true;
                t
            },
        ];
        for t in input.drain(..) {
            let mut state = ZoneState::default();
            list.schedule(t, &mut state).unwrap();
        }

        // Make everything eligible and collect the pop order.
        let now = UnixTime::from_secs(1000);
        let mut order = Vec::new();
        while let Some(t) = list.pop_ready(now) {
            order.push(t.zone.to_string());
        }
        assert_eq!(
            order,
            vec!["z.example", "c.example", "d.example", "a.example", "b.example"]
        );
    }

    #[test]
    fn pop_gates_on_due_time_and_flush() {
        let mut list = TaskList::new();
        let mut state = ZoneState::default();
        list.schedule(task("example.com", Stage::Sign, 500), &mut state)
            .unwrap();

        // Not yet due and not flushed.
        assert!(list.pop_ready(UnixTime::from_secs(499)).is_none());

        // Due time passed.
        let popped = list.pop_ready(UnixTime::from_secs(500)).unwrap();
        assert!(!popped.flush);

        // Flushed tasks pop regardless of time, with the marker cleared.
        let mut state = ZoneState::default();
        list.schedule(task("example.com", Stage::Sign, 500), &mut state)
            .unwrap();
        list.flush_all(None);
        let popped = list.pop_ready(UnixTime::from_secs(0)).unwrap();
        assert!(!popped.flush);
        assert_eq!(popped.stage, Stage::Sign);
    }

    #[test]
    fn flush_all_can_force_a_stage() {
        let mut list = TaskList::new();
        for (name, when) in [("a.example", 100), ("b.example", 200)] {
            let mut state = ZoneState::default();
            list.schedule(task(name, Stage::Audit, when), &mut state)
                .unwrap();
        }

        list.flush_all(Some(Stage::Read));
        let now = UnixTime::from_secs(0);
        while let Some(t) = list.pop_ready(now) {
            assert_eq!(t.stage, Stage::Read);
        }
    }

    #[test]
    fn remove_zone_deletes_its_task() {
        let mut list = TaskList::new();
        let mut state = ZoneState::default();
        list.schedule(task("example.com", Stage::Sign, 100), &mut state)
            .unwrap();

        assert!(list.remove_zone(&zone("example.com")).is_some());
        assert!(list.remove_zone(&zone("example.com")).is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn set_stage_keeps_list_position() {
        let mut list = TaskList::new();
        for (name, when) in [("a.example", 100), ("b.example", 200)] {
            let mut state = ZoneState::default();
            list.schedule(task(name, Stage::Sign, when), &mut state)
                .unwrap();
        }

        assert!(list.set_stage(&zone("b.example"), Stage::Read));
        assert!(!list.set_stage(&zone("missing.example"), Stage::Read));

        let now = UnixTime::from_secs(1000);
        let first = list.pop_ready(now).unwrap();
        assert_eq!(first.zone, zone("a.example"));
        let second = list.pop_ready(now).unwrap();
        assert_eq!(second.stage, Stage::Read);
    }

    #[test]
    fn dump_is_one_line_per_task() {
        let mut list = TaskList::new();
        let mut state = ZoneState::default();
        list.schedule(task("example.com", Stage::Sign, 1_700_000_000), &mut state)
            .unwrap();

        let dump = list.dump(UnixTime::from_secs(1_700_000_000));
        assert_eq!(dump.lines().count(), 1);
        let line = dump.lines().next().unwrap();
        assert!(line.starts_with("On "));
        assert!(line.ends_with("I will sign zone example.com"));
    }
}
