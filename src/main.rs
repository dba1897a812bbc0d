use std::env::consts::{ARCH, FAMILY, OS};
use std::path::Path;

use anyhow::Error;
use tracing::trace;

use crate::danbooru::{init_logger, ConfigManager};
use crate::program::Program;

mod danbooru;
mod program;

/// Settings file, relative to the working directory.
const CONFIG_FILE: &str = "danbooru.toml";

/// Runs the download pipeline once without the menu.
const RUN_FLAG: &str = "--run";

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config_manager = ConfigManager::new(CONFIG_FILE)?;
    let config = config_manager.snapshot()?;

    // Held until exit so buffered log lines reach the file.
    let _guard = init_logger(&config.logging, Path::new(&config.paths.log_directory))?;
    config_manager.load_outcome().log(config_manager.path());
    log_system_information();

    let run_once = std::env::args().skip(1).any(|arg| arg == RUN_FLAG);

    let program = Program::new(config_manager);
    program.run(run_once).await
}

/// Logs information about the system being used.
fn log_system_information() {
    trace!("ARCH:   \"{}\"", ARCH);
    trace!("FAMILY: \"{}\"", FAMILY);
    trace!("OS:     \"{}\"", OS);
}
