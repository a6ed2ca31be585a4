//! Runtime paths for state and per-run scratch space.
//!
//! The state directory holds the run state file and one scratch directory per
//! service (service logs live there). `STAGEHAND_STATE_DIR` overrides the
//! location wholesale, which is how the integration tests isolate themselves.
use std::{env, fs, io, path::PathBuf};

use crate::constants::{RUN_DIR_NAME, STATE_FILE_NAME};

/// Resolves the state directory: `$STAGEHAND_STATE_DIR`, else
/// `$XDG_STATE_HOME/stagehand`, else `~/.local/share/stagehand`.
pub fn state_dir() -> PathBuf {
    if let Some(dir) = env::var_os("STAGEHAND_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(dir) = env::var_os("XDG_STATE_HOME") {
        return PathBuf::from(dir).join("stagehand");
    }
    let home = env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
    home.join(".local/share/stagehand")
}

/// Path of the run state file.
pub fn state_file_path() -> PathBuf {
    state_dir().join(STATE_FILE_NAME)
}

/// Scratch directory for a service within the current run.
pub fn run_dir(service: &str) -> PathBuf {
    state_dir().join(RUN_DIR_NAME).join(service)
}

/// Creates a directory (and parents) if needed, returning its path.
pub fn ensure_dir(path: PathBuf) -> io::Result<PathBuf> {
    fs::create_dir_all(&path)?;
    Ok(path)
}
