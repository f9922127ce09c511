//! The zone list.
//!
//! The zone list file declares which zones are under management and where
//! each zone's data and signer configuration live.  The file is reloaded
//! at runtime and merged into the live set in two steps: [`ZoneList::merge`]
//! marks what changed (taking each zone's lock only briefly), and
//! [`ZoneList::update`] then acts on the marks, dropping removed zones and
//! their pending tasks.  Splitting the two lets the caller refresh signer
//! configurations in between, while removed zones are still visible.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use domain::base::iana::Class;
use domain::base::Name;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::common::datetime::UnixTime;
use crate::scheduler::TaskQueue;
use crate::zone::adapter::{Adapter, AdapterKind};
use crate::zone::{Zone, ZoneConfig, ZoneKey};

//----------- ZoneList ---------------------------------------------------------

/// The set of zones under management.
#[derive(Debug, Default)]
pub struct ZoneList {
    /// The zones, in canonical order.
    zones: BTreeMap<ZoneKey, Arc<Zone>>,

    /// When the zone list file this set was built from was last modified.
    pub last_modified: UnixTime,
}

impl ZoneList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn get(&self, key: &ZoneKey) -> Option<&Arc<Zone>> {
        self.zones.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Zone>> {
        self.zones.values()
    }

    /// Merge a freshly parsed zone list into the live set.
    ///
    /// Zones present on both sides take over the parsed configuration;
    /// zones only in the live set are marked removed; zones only in the
    /// parsed list are inserted and marked added.  Nothing is deleted
    /// here, so a marked zone can still be inspected until [`Self::update`]
    /// runs.
    pub fn merge(&mut self, parsed: ZoneList) {
        self.last_modified = parsed.last_modified;

        let mut incoming = parsed.zones;
        for (key, zone) in &self.zones {
            match incoming.remove(key) {
                Some(fresh) => {
                    let config = fresh.config();
                    let mut state = zone.state.lock().unwrap();
                    zone.absorb(&mut state, config);
                }
                None => {
                    debug!("zone '{key}' not in zone list, marking removed");
                    zone.state.lock().unwrap().just_removed = true;
                }
            }
        }
        for (key, fresh) in incoming {
            debug!("zone '{key}' added to zone list");
            fresh.state.lock().unwrap().just_added = true;
            self.zones.insert(key, fresh);
        }
    }

    /// Act on the marks left by [`Self::merge`].
    ///
    /// Removed zones are dropped along with their pending task; the marks
    /// of the surviving zones are cleared.
    pub fn update(&mut self, tasks: &TaskQueue) -> UpdateSummary {
        let mut summary = UpdateSummary::default();
        self.zones.retain(|key, zone| {
            let mut state = zone.state.lock().unwrap();
            if state.just_removed {
                tasks.remove_zone(key);
                state.task = None;
                summary.removed += 1;
                return false;
            }
            if state.just_added {
                summary.added += 1;
            } else if state.just_updated {
                summary.updated += 1;
            }
            state.just_added = false;
            state.just_updated = false;
            true
        });
        summary
    }

    /// The operator-facing dump of the zone list, one line per zone.
    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for zone in self.zones.values() {
            let state = zone.state.lock().unwrap();
            let _ = writeln!(
                out,
                "zone {} {}: policy {}, signconf {}, backoff {}s",
                zone.key,
                zone.key.class,
                state.policy.as_deref().unwrap_or("(none)"),
                if state.signconf.is_some() {
                    "loaded"
                } else {
                    "missing"
                },
                state.backoff,
            );
        }
        out
    }
}

//----------- UpdateSummary ----------------------------------------------------

/// What a zone list reconciliation changed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub removed: usize,
    pub added: usize,
    pub updated: usize,
}

impl fmt::Display for UpdateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Zone list updated: {} removed, {} added, {} updated.",
            self.removed, self.added, self.updated
        )
    }
}

//----------- Loading zone list files ------------------------------------------

/// An error loading a zone list file.
#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Zone(String),
}

impl std::error::Error for LoadError {}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::Parse(err) => err.fmt(f),
            Self::Zone(err) => f.write_str(err),
        }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Load a zone list file, unless it is unchanged.
///
/// Returns `Ok(None)` if the file has not been modified since
/// `last_modified`.
pub fn load_if_changed(
    path: &Utf8Path,
    last_modified: UnixTime,
) -> Result<Option<ZoneList>, LoadError> {
    let metadata = fs::metadata(path)?;
    let mtime = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| UnixTime::from_secs(d.as_secs()))
        .unwrap_or_default();
    if mtime <= last_modified {
        debug!("zone list file {path} is unchanged");
        return Ok(None);
    }

    let text = fs::read_to_string(path)?;
    let spec: Spec = toml::from_str(&text).map_err(LoadError::Parse)?;
    let mut list = spec.parse()?;
    list.last_modified = mtime;
    Ok(Some(list))
}

//----------- Spec -------------------------------------------------------------

/// A zone list file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Spec {
    /// The declared zones.
    #[serde(rename = "zone")]
    pub zones: Vec<ZoneSpec>,
}

/// A `[[zone]]` entry in a zone list file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ZoneSpec {
    /// The name of the zone.
    pub name: String,

    /// The class of the zone; IN when absent.
    pub class: Option<String>,

    /// The name of the policy the zone follows.
    pub policy: Option<String>,

    /// The path to the zone's signer configuration file.
    pub signconf: Option<Utf8PathBuf>,

    /// Where the unsigned zone comes from.
    pub inbound: Option<AdapterSpec>,

    /// Where the signed zone goes.
    pub outbound: Option<AdapterSpec>,
}

/// An adapter declaration in a zone list file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct AdapterSpec {
    /// The kind of adapter ("file" or "transfer").
    #[serde(rename = "type")]
    pub kind: String,

    /// The adapter's file or endpoint.
    pub path: Utf8PathBuf,
}

impl Spec {
    /// Build a [`ZoneList`] from this file.
    ///
    /// A later entry for a name and class already seen is ignored with a
    /// warning, so one bad entry does not take the whole list down.
    pub fn parse(self) -> Result<ZoneList, LoadError> {
        let mut list = ZoneList::new();
        for entry in self.zones {
            let name = Name::<Bytes>::from_str(&entry.name)
                .map_err(|err| LoadError::Zone(format!("invalid zone name '{}': {err}", entry.name)))?;
            let class = match &entry.class {
                None => Class::IN,
                Some(class) => Class::from_str(class).map_err(|err| {
                    LoadError::Zone(format!("invalid class '{class}' for zone '{}': {err}", entry.name))
                })?,
            };
            let key = ZoneKey::new(name, class);
            if list.zones.contains_key(&key) {
                warn!("duplicate zone '{key}' in zone list, ignoring");
                continue;
            }

            let config = ZoneConfig {
                policy: entry.policy,
                signconf_path: entry.signconf,
                inbound: entry.inbound.map(|a| a.parse(&key)).transpose()?,
                outbound: entry.outbound.map(|a| a.parse(&key)).transpose()?,
            };
            let zone = Arc::new(Zone::new(key.clone(), config));
            list.zones.insert(key, zone);
        }
        Ok(list)
    }
}

impl AdapterSpec {
    fn parse(self, zone: &ZoneKey) -> Result<Adapter, LoadError> {
        let kind = AdapterKind::from_str(&self.kind).map_err(|err| {
            LoadError::Zone(format!("invalid adapter for zone '{zone}': {err}"))
        })?;
        Ok(Adapter {
            kind,
            path: self.path,
        })
    }
}
