//! Worker threads.
//!
//! Each worker loops on the task queue, picking up whatever task falls due
//! next and driving it through the pipeline.  The zone's state lock is held
//! for the whole run, so reconciliation never sees a zone mid-task.

use std::time::Duration;

use tracing::{debug, warn};

use crate::common::datetime::UnixTime;
use crate::engine::Engine;
use crate::pipeline::{self, Outcome};
use crate::scheduler::task::Task;
use crate::scheduler::backup;

/// How long a worker sleeps when the queue has nothing for it.
///
/// An upper bound only; scheduling a task wakes a worker immediately.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// The worker loop.  Returns when the engine shuts down.
pub fn run(engine: &Engine) {
    loop {
        match engine.tasks.wait_pop(engine.shutdown_flag(), IDLE_WAIT) {
            Some(task) => process(engine, task),
            None if engine.is_shutdown() => return,
            None => {}
        }
    }
}

/// Execute one task.
pub fn process(engine: &Engine, mut task: Task) {
    // Look up the zone, releasing the zone list before locking it.
    let zone = engine.zones.lock().unwrap().get(&task.zone).cloned();
    let Some(zone) = zone else {
        debug!("dropping task for unknown zone '{}'", task.zone);
        return;
    };

    let mut state = zone.state.lock().unwrap();
    state.task = None;
    if state.just_removed {
        debug!("dropping task for removed zone '{}'", task.zone);
        return;
    }

    state.in_progress = true;
    let now = UnixTime::now();
    let outcome = pipeline::drive(&mut task, &mut state, engine.tools.as_ref(), now);
    state.in_progress = false;

    if let Outcome::Failed { stage, error } = &outcome {
        warn!(
            "zone '{}': {stage} failed: {error}; retry in {}s",
            task.zone, task.backoff
        );
    }
    if matches!(outcome, Outcome::Skipped) {
        return;
    }

    if let Err(err) = backup::write(&engine.config.task_dir, &task) {
        warn!("unable to back up task for zone '{}': {err}", task.zone);
    }

    // Errors are logged by the scheduler itself.
    let _ = engine.tasks.schedule(task, &mut state);
}
