//! Logging from the daemon.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogLevel, LogTarget, LoggingConfig};

/// Launch the global logger.
///
/// ## Panics
///
/// Panics if a global [`tracing`] logger has been set already.
pub fn launch(config: &LoggingConfig) -> Result<(), String> {
    let filter = make_env_filter(config)?;

    match &config.target {
        LogTarget::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| e.to_string())?;

            // We never emit colors to files.
            let layer = FmtLayer::new().with_ansi(false).with_writer(file);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init()
        }
        LogTarget::Stdout => {
            // We try to determine whether to use colors in a bit more fancy
            // way than tracing does automatically (it only does `NO_COLOR`).
            let layer = FmtLayer::new()
                .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
                .with_writer(std::io::stdout);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init()
        }
        LogTarget::Stderr => {
            let layer = FmtLayer::new()
                .with_ansi(supports_color::on(supports_color::Stream::Stderr).is_some())
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init()
        }
    };

    Ok(())
}

/// Make a new [`EnvFilter`] based on the config.
fn make_env_filter(config: &LoggingConfig) -> Result<EnvFilter, String> {
    // Create an EnvFilter which won't read any env vars and only print ERROR
    // by default, which we then immediately override by adding another filter
    // on top.
    let mut filter = EnvFilter::default();
    filter = filter.add_directive(LevelFilter::from(config.level).into());

    // Add all of our trace targets to the filter.
    for target in &config.trace_targets {
        filter = filter.add_directive(
            target
                .parse()
                .map_err(|_| format!("invalid trace target: '{target}'"))?,
        );
    }

    Ok(filter)
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}
