//! Zone-specific state and management.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use domain::base::iana::Class;
use domain::base::Name;
use tracing::{debug, warn};

use crate::common::datetime::UnixTime;
use crate::scheduler::backup;
use crate::scheduler::task::{Stage, Task, TaskKey};
use crate::scheduler::TaskQueue;

pub mod adapter;
pub mod signconf;
pub mod zonelist;

pub use adapter::Adapter;
pub use signconf::SignConf;

//----------- ZoneKey ----------------------------------------------------------

/// The identity of a zone: its class and canonical name.
///
/// Ordering is by class first, then canonical (RFC 4034) domain-name order,
/// which is what the zone list sorts by.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ZoneKey {
    pub class: Class,
    pub name: Name<Bytes>,
}

impl ZoneKey {
    pub fn new(name: Name<Bytes>, class: Class) -> Self {
        Self { class, name }
    }

    /// Parse a zone name in class IN.
    pub fn from_str_in(name: &str) -> Result<Self, String> {
        let name = Name::from_str(name).map_err(|e| format!("invalid zone name '{name}': {e}"))?;
        Ok(Self::new(name, Class::IN))
    }
}

impl Ord for ZoneKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.class
            .cmp(&other.class)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for ZoneKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

//----------- Zone -------------------------------------------------------------

/// A zone under management.
#[derive(Debug)]
pub struct Zone {
    /// The identity of this zone.
    pub key: ZoneKey,

    /// The state of this zone.
    ///
    /// This uses a mutex to ensure that all parts of the zone state are
    /// consistent with each other.  A worker holds the lock for the whole
    /// stage chain of a task, which is also what keeps stage execution and
    /// zone-list reconciliation from interleaving on the same zone.
    pub state: Mutex<ZoneState>,
}

impl Zone {
    /// Construct a new [`Zone`] from its parsed configuration.
    pub fn new(key: ZoneKey, config: ZoneConfig) -> Self {
        Self {
            key,
            state: Mutex::new(ZoneState {
                policy: config.policy,
                signconf_path: config.signconf_path,
                inbound: config.inbound,
                outbound: config.outbound,
                ..Default::default()
            }),
        }
    }

    /// The zone-list-controlled part of this zone's state.
    pub fn config(&self) -> ZoneConfig {
        let state = self.state.lock().unwrap();
        ZoneConfig {
            policy: state.policy.clone(),
            signconf_path: state.signconf_path.clone(),
            inbound: state.inbound.clone(),
            outbound: state.outbound.clone(),
        }
    }

    /// Take over the configuration of a freshly parsed incarnation.
    ///
    /// Field-by-field diff of the settings the zone list controls; any
    /// difference marks the zone as updated for the current reconciliation
    /// pass.  The rest of the live state (signconf, task, backoff) is left
    /// alone so in-flight work is not disturbed.
    pub fn absorb(&self, state: &mut ZoneState, fresh: ZoneConfig) {
        if state.policy != fresh.policy {
            debug!("update zone '{}': policy name changed", self.key);
            state.policy = fresh.policy;
            state.just_updated = true;
        }
        if state.signconf_path != fresh.signconf_path {
            debug!("update zone '{}': signconf filename changed", self.key);
            state.signconf_path = fresh.signconf_path;
            state.just_updated = true;
        }
        if state.inbound != fresh.inbound {
            debug!("update zone '{}': inbound adapter changed", self.key);
            state.inbound = fresh.inbound;
            state.just_updated = true;
        }
        if state.outbound != fresh.outbound {
            debug!("update zone '{}': outbound adapter changed", self.key);
            state.outbound = fresh.outbound;
            state.just_updated = true;
        }
    }

    /// Refresh the zone's signconf from its file and adjust its task.
    ///
    /// Reads the signconf file if it changed, validates it, and either
    /// schedules the zone's first task (recovering a persisted one if a
    /// backup exists) or redirects the existing task to the stage the
    /// old-versus-new comparison demands.  On any failure the zone keeps
    /// its previous signconf and task state.
    pub fn update_signconf(
        &self,
        state: &mut ZoneState,
        tasks: &TaskQueue,
        backup_dir: &Utf8Path,
        now: UnixTime,
    ) -> SignConfStatus {
        let Some(path) = state.signconf_path.clone() else {
            match &state.policy {
                None => warn!("zone '{}' has no policy", self.key),
                Some(policy) => warn!(
                    "zone '{}' has policy '{policy}' configured, \
                     but no signconf file",
                    self.key
                ),
            }
            return SignConfStatus::Errors;
        };

        let last_modified = state
            .signconf
            .as_ref()
            .map(|sc| sc.last_modified)
            .unwrap_or_default();

        let signconf = match signconf::read(&path, last_modified) {
            Ok(Some(signconf)) => signconf,
            Ok(None) => {
                debug!("zone '{}' has not changed", self.key);
                return SignConfStatus::Unchanged;
            }
            Err(err) => {
                warn!("unable to read signconf file {path} for zone '{}': {err}", self.key);
                return SignConfStatus::Errors;
            }
        };

        if let Err(errors) = signconf.check() {
            for error in &errors {
                warn!("zone '{}' signconf check failed: {error}", self.key);
            }
            return SignConfStatus::Errors;
        }

        match state.signconf.take() {
            None => {
                state.signconf = Some(signconf);
                debug!("zone '{}' now has signconf", self.key);

                // First valid signconf for this zone: pick up a persisted
                // task from a previous run, or start from scratch.
                let task = backup::recover(backup_dir, &self.key, now)
                    .unwrap_or_else(|| Task::new(Stage::Read, now, self.key.clone()));
                state.backoff = task.backoff;
                if let Err(err) = tasks.schedule(task, state) {
                    warn!(
                        "zone '{}' now has config, but could not be scheduled: {err}",
                        self.key
                    );
                }
                SignConfStatus::New
            }
            Some(old) => {
                let required = old.compare(&signconf);
                state.signconf = Some(signconf);
                debug!("zone '{}' signconf updated", self.key);

                if !tasks.set_stage(&self.key, required) {
                    // No pending task (it may be executing right now, or an
                    // earlier scheduling attempt failed); set up a new one.
                    let task = Task::new(required, now, self.key.clone());
                    if let Err(err) = tasks.schedule(task, state) {
                        warn!(
                            "zone '{}' config updated, but could not be scheduled: {err}",
                            self.key
                        );
                    }
                }
                SignConfStatus::Updated
            }
        }
    }
}

//----------- ZoneState --------------------------------------------------------

/// The mutable state of a zone.
#[derive(Debug, Default)]
pub struct ZoneState {
    /// The name of the policy this zone follows, if configured.
    pub policy: Option<String>,

    /// Where the zone's signconf file lives, if configured.
    pub signconf_path: Option<Utf8PathBuf>,

    /// Where the unsigned zone comes from.
    pub inbound: Option<Adapter>,

    /// Where the signed zone goes.
    pub outbound: Option<Adapter>,

    /// The active signconf; `None` until one passed its check.
    pub signconf: Option<SignConf>,

    /// The key of the zone's pending task in the task list, if any.
    ///
    /// The task list's per-zone index is authoritative; this field lets the
    /// reconciliation pass see at a glance that a removed zone still has
    /// work queued.
    pub task: Option<TaskKey>,

    /// The current retry backoff, in seconds.
    pub backoff: u64,

    /// Whether a worker is executing this zone's task right now.
    ///
    /// While set, no new task may be scheduled for the zone.
    pub in_progress: bool,

    /// Transient reconciliation flags, only meaningful during one merge
    /// pass over the zone list.
    pub just_added: bool,
    pub just_updated: bool,
    pub just_removed: bool,

    /// The SOA serial of the most recently read unsigned zone.
    pub inbound_serial: u32,

    /// The SOA serial of the most recently written signed zone.
    pub outbound_serial: u32,
}

impl ZoneState {
    /// Derive the next outbound SOA serial from the signconf's policy.
    pub fn next_outbound_serial(&self, now: UnixTime) -> Result<u32, SerialError> {
        let policy = self
            .signconf
            .as_ref()
            .and_then(|sc| sc.soa_serial.as_deref())
            .ok_or(SerialError::NoPolicy)?;
        let prev = self.outbound_serial;

        let (base, keep) = match signconf::SerialPolicy::from_str(policy)
            .map_err(|_| SerialError::UnknownPolicy(policy.into()))?
        {
            signconf::SerialPolicy::Unixtime => (now.as_secs() as u32, false),
            signconf::SerialPolicy::Counter => (self.inbound_serial, false),
            signconf::SerialPolicy::Datecounter => (datestamp(now).wrapping_mul(100), false),
            signconf::SerialPolicy::Keep => (self.inbound_serial, true),
        };

        if keep {
            if !serial_gt(base, prev) {
                return Err(SerialError::KeepWouldRegress {
                    inbound: base,
                    outbound: prev,
                });
            }
            return Ok(base);
        }

        let mut soa = base;
        if !serial_gt(soa, prev) {
            soa = prev.wrapping_add(1);
        }
        // The serial is stored in 32 bits.
        let update = soa.wrapping_sub(prev).min(0x7FFF_FFFF);
        Ok(prev.wrapping_add(update))
    }
}

/// RFC 1982 style "greater than" on 32-bit serials.
fn serial_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `YYYYMMDD` for the given time, as a number.
fn datestamp(now: UnixTime) -> u32 {
    jiff::Timestamp::from_second(now.as_secs() as i64)
        .ok()
        .and_then(|ts| ts.strftime("%Y%m%d").to_string().parse().ok())
        .unwrap_or(0)
}

//----------- ZoneConfig -------------------------------------------------------

/// The zone-list-controlled settings of a zone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ZoneConfig {
    pub policy: Option<String>,
    pub signconf_path: Option<Utf8PathBuf>,
    pub inbound: Option<Adapter>,
    pub outbound: Option<Adapter>,
}

//----------- SignConfStatus ---------------------------------------------------

/// The outcome of refreshing a zone's signconf.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignConfStatus {
    /// The signconf file was not modified.
    Unchanged,

    /// The signconf could not be read or did not pass its check; the zone
    /// keeps its previous signconf.
    Errors,

    /// The zone received its first valid signconf and has been scheduled.
    New,

    /// The zone's signconf was replaced and its task adjusted.
    Updated,
}

impl fmt::Display for SignConfStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unchanged => "config has not changed",
            Self::Errors => "config has errors",
            Self::New => "now has config",
            Self::Updated => "config updated",
        })
    }
}

//----------- SerialError ------------------------------------------------------

/// An error deriving the outbound SOA serial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SerialError {
    /// No serial policy is configured.
    NoPolicy,

    /// The configured policy is not recognized.
    UnknownPolicy(String),

    /// The "keep" policy cannot go backwards.
    KeepWouldRegress { inbound: u32, outbound: u32 },
}

impl std::error::Error for SerialError {}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPolicy => f.write_str("no soa serial policy configured"),
            Self::UnknownPolicy(p) => write!(f, "unknown serial policy '{p}'"),
            Self::KeepWouldRegress { inbound, outbound } => write!(
                f,
                "can not keep SOA serial from input zone ({inbound}): \
                 output SOA serial is {outbound}"
            ),
        }
    }
}
