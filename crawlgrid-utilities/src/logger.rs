use std::{env, time::SystemTime};

use crawlgrid_models::errors::SendableError;
use log::{LevelFilter, info};

pub const LOG_FILE: &str = "output.log";

/// Installs the process-wide logger: stdout plus `output.log` in the working directory.
/// `CRAWLGRID_LOG` overrides the level (`debug`, `warn`, ...).
pub fn setup_logger() -> Result<(), SendableError> {
    let level = env::var("CRAWLGRID_LOG")
        .ok()
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .chain(fern::log_file(LOG_FILE)?)
        .apply()?;
    Ok(())
}

pub fn print_env() -> std::io::Result<()> {
    let path = env::current_dir()?;
    info!("The current directory is {}", path.display());
    Ok(())
}
