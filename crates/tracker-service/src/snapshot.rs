//! One-shot baseline inventory of every file, once per build version.
//!
//! The walk emits one `Snapshot` event per file, all sharing the timestamp
//! taken when the enumeration began. A zero-byte marker named after the build
//! version is written only when the walk finishes uncancelled; its presence
//! turns later runs into no-ops.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracker_core::identity::DeviceIdentity;
use tracker_core::record::{SnapshotRecord, SNAPSHOT_EVENT};
use tracker_core::scrub::{scrub_with, FileProbe};
use tracker_core::telemetry::{panic_error, TelemetrySink};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The marker for this build already existed.
    AlreadyTaken,
    Completed { files: u64 },
    /// Shutdown arrived mid-walk; no marker was written.
    Cancelled { files: u64 },
}

pub struct SnapshotBaseliner {
    state_dir: PathBuf,
    roots: Vec<PathBuf>,
    identity: Arc<DeviceIdentity>,
    sink: Arc<dyn TelemetrySink>,
    probe: Arc<dyn FileProbe>,
}

pub fn marker_path(state_dir: &Path, build_version: &str) -> PathBuf {
    state_dir.join(format!("snapshot-{build_version}"))
}

impl SnapshotBaseliner {
    pub fn new(
        state_dir: PathBuf,
        roots: Vec<PathBuf>,
        identity: Arc<DeviceIdentity>,
        sink: Arc<dyn TelemetrySink>,
        probe: Arc<dyn FileProbe>,
    ) -> Self {
        Self {
            state_dir,
            roots,
            identity,
            sink,
            probe,
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        marker_path(&self.state_dir, self.identity.build_version())
    }

    pub fn is_taken(&self) -> bool {
        self.marker_path().exists()
    }

    /// Blocking. Checks `shutdown` before every entry.
    pub fn run_once(&self, shutdown: &watch::Receiver<bool>) -> Result<SnapshotOutcome> {
        let marker = self.marker_path();
        if marker.exists() {
            debug!(marker = %marker.display(), "snapshot already taken for this build");
            return Ok(SnapshotOutcome::AlreadyTaken);
        }

        info!(roots = self.roots.len(), "starting file snapshot");
        let timestamp = Utc::now();
        let mut files = 0u64;

        for root in &self.roots {
            if !root.exists() {
                warn!("Snapshot root does not exist: {}", root.display());
                continue;
            }
            let walker = WalkDir::new(root).follow_links(false).same_file_system(true);
            for entry in walker.into_iter() {
                if *shutdown.borrow() {
                    info!(files, "snapshot cancelled");
                    return Ok(SnapshotOutcome::Cancelled { files });
                }
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(error = %e, "skipping inaccessible entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path().to_string_lossy();
                let record = SnapshotRecord {
                    info: scrub_with(&path, self.probe.as_ref()),
                    snapshot_timestamp: timestamp,
                    identity: self.identity.clone(),
                };
                self.sink.send_event(SNAPSHOT_EVENT, &record.to_properties());
                files += 1;
            }
        }

        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("creating state directory {}", self.state_dir.display()))?;
        fs::File::create(&marker)
            .with_context(|| format!("writing snapshot marker {}", marker.display()))?;
        info!(files, "snapshot completed");
        Ok(SnapshotOutcome::Completed { files })
    }
}

/// Runs the baseliner on the blocking pool. Errors and panics are logged and
/// reported to the sink; they never propagate.
pub fn spawn_snapshot(
    baseliner: Arc<SnapshotBaseliner>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<Option<SnapshotOutcome>> {
    tokio::spawn(async move {
        let sink = baseliner.sink.clone();
        let task = tokio::task::spawn_blocking(move || baseliner.run_once(&shutdown));
        let err = match task.await {
            Ok(Ok(outcome)) => return Some(outcome),
            Ok(Err(err)) => err,
            Err(join_err) if join_err.is_panic() => panic_error("snapshot", join_err.into_panic()),
            Err(join_err) => anyhow!("snapshot task aborted: {join_err}"),
        };
        error!(error = %err, "Snapshot task has failed");
        sink.send_exception(&err);
        None
    })
}
