//! Download directory selection and the overwrite prompt.

use crate::error::{AppError, Result};
use std::path::{Path, PathBuf};

/// First non-empty of the explicit directory, the title (under `cwd`), and `cwd` itself.
pub fn resolve_output_dir(output_dir: Option<&Path>, title: &str, cwd: &Path) -> PathBuf {
    match output_dir.filter(|dir| !dir.as_os_str().is_empty()) {
        Some(dir) => cwd.join(dir),
        None if !title.is_empty() => cwd.join(title),
        None => cwd.to_path_buf(),
    }
}

/// Create `path` (and parents) unless it already exists as a directory.
pub fn prepare_output_dir(path: &Path) -> Result<()> {
    if path.exists() && !path.is_dir() {
        return Err(AppError::InvalidInput(format!(
            "{} exists and is not a directory",
            path.display()
        )));
    }
    std::fs::create_dir_all(path)?;
    Ok(())
}

pub fn contains_files(path: &Path) -> Result<bool> {
    Ok(std::fs::read_dir(path)?.next().is_some())
}

/// Ask before writing into a non-empty directory.
#[cfg(feature = "interactive")]
pub fn confirm_overwrite(path: &Path) -> Result<bool> {
    inquire::Confirm::new(&format!(
        "The directory \"{}\" is not empty. Overwrite?",
        path.display()
    ))
    .with_default(false)
    .prompt()
    .map_err(|e| AppError::Prompt(e.to_string()))
}

#[cfg(not(feature = "interactive"))]
pub fn confirm_overwrite(path: &Path) -> Result<bool> {
    Err(AppError::InvalidInput(format!(
        "the directory \"{}\" is not empty; pass --yes to overwrite",
        path.display()
    )))
}
