use std::{env, fs, path::Path};

use crawlgrid_models::errors::{RuntimeError, SendableError};

pub fn set_exe_dir_as_cwd() -> Result<(), SendableError> {
    let exe_path = env::current_exe()?;
    let exe_dir = exe_path.parent().ok_or_else(|| {
        RuntimeError::boxed(
            "startup.exe_dir",
            format!("{} has no parent directory", exe_path.display()),
        )
    })?;
    env::set_current_dir(exe_dir)?;
    Ok(())
}

/// Make `dir` the working directory, creating it first when needed.
pub fn enter_dir(dir: &Path) -> Result<(), SendableError> {
    fs::create_dir_all(dir)?;
    env::set_current_dir(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_dir_creates_missing_directories() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("grid").join("node");
        let previous = env::current_dir().unwrap();

        enter_dir(&nested).unwrap();
        let cwd = env::current_dir().unwrap();
        env::set_current_dir(previous).unwrap();

        assert_eq!(cwd.canonicalize().unwrap(), nested.canonicalize().unwrap());
    }
}
