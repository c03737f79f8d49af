use std::path::PathBuf;

/// Failures that stop the tracker from reaching `Running`, or that reject a
/// configuration outright. Per-event problems never surface here; they
/// degrade to sentinel values at the point of origin.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("kernel trace sessions are not available on this platform")]
    KernelTraceUnavailable,
    #[error("failed to open kernel trace session {session}: {reason}")]
    KernelSession { session: String, reason: String },
    #[error("failed to watch {path}: {reason}")]
    WatchSetup { path: PathBuf, reason: String },
    #[error("no mounted volumes to watch")]
    NoVolumes,
    #[error("invalid exclusion pattern: {0}")]
    ExclusionPattern(#[from] regex::Error),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("state directory unavailable: {0}")]
    StateDir(String),
    #[error("service is {0}; expected it to be stopped")]
    NotStopped(&'static str),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;
