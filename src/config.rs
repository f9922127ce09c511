//! Daemon configuration.

use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::datetime::TimeSpan;
use crate::pipeline::StageCommands;

//----------- Config -----------------------------------------------------------

/// The daemon configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// The path to the zone list file.
    pub zonelist: Utf8PathBuf,

    /// The directory holding per-zone task backups.
    pub task_dir: Utf8PathBuf,

    /// The number of worker threads.
    pub workers: usize,

    /// How often to check the zone list and signconf files for changes.
    pub check_interval: TimeSpan,

    /// Logging settings.
    pub logging: LoggingConfig,

    /// The per-stage commands of the signing pipeline.
    pub tools: StageCommands,
}

impl Config {
    /// Load the configuration from a TOML file.
    pub fn load(path: &Utf8Path) -> Result<Self, LoadError> {
        let text = fs::read_to_string(path)?;
        let spec: Spec = toml::from_str(&text).map_err(LoadError::Parse)?;
        Ok(spec.parse())
    }
}

//----------- LoggingConfig ----------------------------------------------------

/// Logging settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    /// The minimum severity of messages to log.
    pub level: LogLevel,

    /// Where log messages go.
    pub target: LogTarget,

    /// Additional per-module filter directives.
    pub trace_targets: Vec<String>,
}

/// The minimum severity of log messages.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

/// Where log messages go.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LogTarget {
    /// The standard output stream.
    Stdout,

    /// The standard error stream.
    #[default]
    Stderr,

    /// A file, appended to.
    File(Utf8PathBuf),
}

// "stdout" and "stderr" are recognized names; anything else is a file path.
impl<'de> Deserialize<'de> for LogTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(match text.as_str() {
            "stdout" => Self::Stdout,
            "stderr" => Self::Stderr,
            _ => Self::File(text.into()),
        })
    }
}

impl Serialize for LogTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Stdout => serializer.serialize_str("stdout"),
            Self::Stderr => serializer.serialize_str("stderr"),
            Self::File(path) => serializer.serialize_str(path.as_str()),
        }
    }
}

//----------- Loading configuration files --------------------------------------

/// An error loading a configuration file.
#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::error::Error for LoadError {}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::Parse(err) => err.fmt(f),
        }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

//----------- Spec -------------------------------------------------------------

/// A configuration file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Spec {
    /// The path to the zone list file.
    pub zonelist: Utf8PathBuf,

    /// The directory holding per-zone task backups.
    pub task_dir: Utf8PathBuf,

    /// The number of worker threads.
    pub workers: usize,

    /// How often to check the zone list and signconf files for changes.
    pub check_interval: TimeSpan,

    /// The `[logging]` section.
    pub logging: LoggingSpec,

    /// The `[tools]` section.
    pub tools: StageCommands,
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            zonelist: "/etc/signerd/zonelist.toml".into(),
            task_dir: "/var/lib/signerd/tasks".into(),
            workers: 4,
            check_interval: TimeSpan::from_secs(3600),
            logging: Default::default(),
            tools: Default::default(),
        }
    }
}

/// The `[logging]` section of a configuration file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct LoggingSpec {
    /// The minimum severity of messages to log.
    pub level: LogLevel,

    /// Where log messages go.
    pub target: LogTarget,

    /// Additional per-module filter directives.
    pub trace_targets: Vec<String>,
}

impl Spec {
    /// Build a [`Config`] from this file.
    pub fn parse(self) -> Config {
        Config {
            zonelist: self.zonelist,
            task_dir: self.task_dir,
            workers: self.workers.max(1),
            check_interval: self.check_interval,
            logging: LoggingConfig {
                level: self.logging.level,
                target: self.logging.target,
                trace_targets: self.logging.trace_targets,
            },
            tools: self.tools,
        }
    }
}
