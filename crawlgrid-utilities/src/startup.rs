use std::{env, path::Path};

use crawlgrid_models::errors::SendableError;
use log::info;

use crate::{
    dirutils,
    logger::{self, print_env},
};

/// Common process bootstrap for the grid binaries. With `workdir` the process
/// runs there (created if missing); otherwise next to its executable.
pub fn startup(name: &str, workdir: Option<&Path>) -> Result<(), SendableError> {
    unsafe {
        env::set_var("RUST_BACKTRACE", "1");
    }
    match workdir {
        Some(dir) => dirutils::enter_dir(dir)?,
        None => dirutils::set_exe_dir_as_cwd()?,
    }
    logger::setup_logger()?;
    log_panics::init();

    info!("--- {} ---", name);
    print_env()?;

    Ok(())
}
