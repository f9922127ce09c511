use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{crate_authors, crate_version};

use signerd::config::Config;
use signerd::engine::Engine;
use signerd::pipeline::CommandTools;

fn main() -> ExitCode {
    // Set up the command-line interface.
    let cmd = clap::Command::new("signerd")
        .version(crate_version!())
        .author(crate_authors!())
        .next_line_help(true)
        .arg(
            clap::Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .default_value("/etc/signerd/config.toml")
                .help("The configuration file to use"),
        )
        .arg(
            clap::Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        );

    // Process command-line arguments.
    let matches = cmd.get_matches();
    let path = Utf8PathBuf::from(
        matches
            .get_one::<String>("config")
            .map(String::as_str)
            .unwrap_or_default(),
    );

    // Construct the configuration.
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("The daemon couldn't be configured: {error}");
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("check_config") {
        return ExitCode::SUCCESS;
    }

    // Activate the configured logging setup.
    if let Err(error) = signerd::log::launch(&config.logging) {
        eprintln!("The logger couldn't be configured: {error}");
        return ExitCode::FAILURE;
    }

    // Run the engine until the process is stopped.
    let tools = Box::new(CommandTools::new(config.tools.clone()));
    let engine = Arc::new(Engine::new(config, tools));
    match engine.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("the engine failed: {error}");
            ExitCode::FAILURE
        }
    }
}
