//! The signing engine.
//!
//! The [`Engine`] ties everything together: it owns the zone list, the task
//! queue, and the pipeline tools, runs the periodic reconciliation that
//! keeps the zones in sync with their files on disk, and hosts the worker
//! threads that execute tasks.
//!
//! Locks are always taken in the same order: the zone list first, then a
//! zone's state, then the task list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::common::datetime::UnixTime;
use crate::config::Config;
use crate::pipeline::ZoneTools;
use crate::scheduler::task::Stage;
use crate::scheduler::TaskQueue;
use crate::zone::zonelist::{self, ZoneList};

pub mod worker;

//----------- Engine -----------------------------------------------------------

/// The signing engine.
pub struct Engine {
    /// The daemon configuration.
    pub config: Config,

    /// The zones under management.
    pub zones: Mutex<ZoneList>,

    /// The pending tasks.
    pub tasks: TaskQueue,

    /// The pipeline stages.
    pub tools: Box<dyn ZoneTools>,

    /// Set once, when the engine is told to stop.
    shutdown: AtomicBool,

    /// Wakes the reconciliation loop out of its sleep.
    stop_mutex: Mutex<()>,
    stop_cond: Condvar,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("zones", &self.zones)
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: Config, tools: Box<dyn ZoneTools>) -> Self {
        Self {
            config,
            zones: Mutex::new(ZoneList::new()),
            tasks: TaskQueue::new(),
            tools,
            shutdown: AtomicBool::new(false),
            stop_mutex: Mutex::new(()),
            stop_cond: Condvar::new(),
        }
    }

    /// Bring the zones in sync with their files on disk.
    ///
    /// Reloads the zone list file if it changed and merges it into the live
    /// set, refreshes every zone's signconf, and finally drops the zones
    /// the list no longer declares.  Signconf refresh runs even when the
    /// zone list itself is unchanged, since signconf files change on their
    /// own schedule.
    pub fn reconcile(&self, now: UnixTime) {
        let mut zones = self.zones.lock().unwrap();

        let merged = match zonelist::load_if_changed(&self.config.zonelist, zones.last_modified) {
            Ok(Some(parsed)) => {
                debug!("zone list file {} changed, merging", self.config.zonelist);
                zones.merge(parsed);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!("unable to load zone list {}: {err}", self.config.zonelist);
                false
            }
        };

        for zone in zones.iter() {
            let mut state = zone.state.lock().unwrap();
            if state.just_removed {
                continue;
            }
            let status =
                zone.update_signconf(&mut state, &self.tasks, &self.config.task_dir, now);
            debug!("zone '{}' signconf {status}", zone.key);
        }

        if merged {
            let summary = zones.update(&self.tasks);
            info!("{summary}");
        }
    }

    /// Run the engine until [`Self::shutdown`] is called.
    ///
    /// Spawns the worker threads and then drives the periodic
    /// reconciliation loop on the calling thread.
    pub fn run(self: &Arc<Self>) -> std::io::Result<()> {
        let mut handles = Vec::new();
        for i in 0..self.config.workers {
            let engine = self.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || worker::run(&engine))?;
            handles.push(handle);
        }
        info!("engine started, {} workers", self.config.workers);

        let interval = Duration::from_secs(u64::from(self.config.check_interval.as_secs()));
        while !self.shutdown.load(Ordering::Relaxed) {
            self.reconcile(UnixTime::now());
            let guard = self.stop_mutex.lock().unwrap();
            let _ = self.stop_cond.wait_timeout(guard, interval).unwrap();
        }

        self.tasks.notify_all();
        for handle in handles {
            let _ = handle.join();
        }
        info!("engine stopped");
        Ok(())
    }

    /// Force an immediate run for every pending task.
    ///
    /// With a stage given, every task is redirected to that stage as well.
    pub fn flush_all(&self, stage: Option<Stage>) {
        info!("flushing all tasks");
        self.tasks.flush_all(stage);
    }

    /// The operator-facing dump of all pending tasks.
    pub fn dump_tasks(&self) -> String {
        self.tasks.dump(UnixTime::now())
    }

    /// The operator-facing dump of the zone list.
    pub fn dump_zones(&self) -> String {
        self.zones.lock().unwrap().dump()
    }

    /// Tell the engine to stop.
    ///
    /// Workers finish the task they are on; the reconciliation loop exits
    /// its sleep.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.stop_cond.notify_all();
        self.tasks.notify_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub(crate) fn shutdown_flag(&self) -> &AtomicBool {
        &self.shutdown
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8Path;

    use super::*;
    use crate::config::{LoggingConfig, Spec};
    use crate::pipeline::{CommandTools, StageCommands};
    use crate::zone::ZoneKey;

    const SIGNCONF: &str = r#"
        audit = false

        [signatures]
        resign = "2h"
        refresh = "3d"
        validity-default = "14d"
        validity-denial = "14d"
        jitter = "12h"
        inception-offset = "1h"

        [denial]
        type = "nsec"

        [keys]
        ttl = "1h"

        [[keys.key]]
        locator = "0f00"
        algorithm = 8
        flags = 257
        publish = true
        ksk = true

        [soa]
        ttl = "1h"
        minimum = "5m"
        serial = "unixtime"
    "#;

    fn engine_in(dir: &Utf8Path) -> Engine {
        fs::write(dir.join("signconf.toml"), SIGNCONF).unwrap();
        fs::write(
            dir.join("zonelist.toml"),
            format!(
                "[[zone]]\nname = \"example.com\"\nsignconf = \"{}\"\n",
                dir.join("signconf.toml")
            ),
        )
        .unwrap();

        let config = Config {
            zonelist: dir.join("zonelist.toml"),
            task_dir: dir.join("tasks"),
            workers: 1,
            check_interval: crate::common::datetime::TimeSpan::from_secs(60),
            logging: LoggingConfig::default(),
            tools: StageCommands::default(),
        };
        let tools = Box::new(CommandTools::new(config.tools.clone()));
        Engine::new(config, tools)
    }

    #[test]
    fn reconcile_schedules_new_zones() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let engine = engine_in(dir);

        engine.reconcile(UnixTime::from_secs(1000));
        assert_eq!(engine.zones.lock().unwrap().len(), 1);
        assert_eq!(engine.tasks.len(), 1);
        assert!(engine.dump_tasks().contains("read and sign zone example.com"));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let engine = engine_in(dir);

        engine.reconcile(UnixTime::from_secs(1000));
        engine.reconcile(UnixTime::from_secs(1001));
        assert_eq!(engine.zones.lock().unwrap().len(), 1);
        assert_eq!(engine.tasks.len(), 1);
    }

    #[test]
    fn worker_processes_and_reschedules() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let engine = engine_in(dir);
        let now = UnixTime::from_secs(1000);

        engine.reconcile(now);
        let task = engine
            .tasks
            .wait_pop(engine.shutdown_flag(), Duration::from_millis(10))
            .unwrap();
        assert_eq!(task.stage, Stage::Read);

        worker::process(&engine, task);

        // The task ran the full chain and was rescheduled for the next
        // resign cycle, and a backup was written.
        assert_eq!(engine.tasks.len(), 1);
        let key = ZoneKey::from_str_in("example.com").unwrap();
        let zones = engine.zones.lock().unwrap();
        let state = zones.get(&key).unwrap().state.lock().unwrap();
        assert!(!state.in_progress);
        assert!(state.task.is_some());
        drop(state);
        drop(zones);
        assert!(dir.join("tasks").join("example.com.task").exists());
    }

    #[test]
    fn default_config_parses() {
        let config = toml::from_str::<Spec>("").unwrap().parse();
        assert_eq!(config.workers, 4);
    }
}
