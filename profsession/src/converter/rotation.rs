//! Keeping the previous session's samples around.
//!
//! `<samples>/current` holds the session being written. Unless appending,
//! the last session is moved to `<samples>/previous` first, replacing any
//! older one.

use log::debug;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use crate::domain::ConvertError;

pub const CURRENT_DIR: &str = "current";
pub const PREVIOUS_DIR: &str = "previous";

fn ignore_missing(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Rotate (unless `append`) and return the `current` directory, created if
/// needed.
///
/// # Errors
/// Returns an error if an existing `previous` cannot be removed, `current`
/// cannot be moved, or `current` cannot be created
pub fn prepare_samples_dir(samples_dir: &Path, append: bool) -> Result<PathBuf, ConvertError> {
    let current = samples_dir.join(CURRENT_DIR);

    if !append {
        let previous = samples_dir.join(PREVIOUS_DIR);
        ignore_missing(fs::remove_dir_all(&previous))
            .map_err(|source| ConvertError::Rotate { path: previous.clone(), source })?;
        ignore_missing(fs::rename(&current, &previous))
            .map_err(|source| ConvertError::Rotate { path: current.clone(), source })?;
        debug!("Moved old sample data to {}", previous.display());
    }

    fs::create_dir_all(&current).map_err(|source| ConvertError::Rotate { path: current.clone(), source })?;
    Ok(current)
}
