use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::error::TrackerError;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "file-access-tracker";
pub const APP_NAME: &str = "FileAccessTrackerService";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| TrackerError::StateDir("cannot determine data directory".into()))?;
    Ok(dirs.data_local_dir().to_path_buf())
}

/// Holds the per-build snapshot markers.
pub fn state_dir(data: &Path) -> PathBuf {
    data.join("state")
}

pub fn settings_path(data: &Path) -> PathBuf {
    data.join("settings.json")
}
