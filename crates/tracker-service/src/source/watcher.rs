//! Directory watch feed using the `notify` crate.
//!
//! One recursive watcher per root (normally one per mounted volume). Each
//! watcher calls back on its own thread; events are classified, filtered
//! against the exclusion pattern and handed to the ingest callback.

use anyhow::Result;
use chrono::Utc;
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use tracker_core::drives::mounted_volumes;
use tracker_core::record::{OperationKind, RawFileEvent};
use tracker_core::{TrackerError, TrackerResult};

use super::{EventCallback, EventSource, LossProbe};

/// Directory watches cannot attribute changes to a process.
pub const UNKNOWN_PROCESS: &str = "unknown";

pub struct DirectoryWatchFeed {
    roots: Vec<PathBuf>,
    exclusion: Option<Regex>,
    watchers: Vec<RecommendedWatcher>,
}

impl DirectoryWatchFeed {
    pub fn new(roots: Vec<PathBuf>, exclusion: Option<Regex>) -> Self {
        Self {
            roots,
            exclusion,
            watchers: Vec::new(),
        }
    }

    pub fn for_mounted_volumes(exclusion: Option<Regex>) -> TrackerResult<Self> {
        let mounts: Vec<PathBuf> = mounted_volumes()
            .into_iter()
            .map(|v| v.mount_point)
            .collect();
        if mounts.is_empty() {
            return Err(TrackerError::NoVolumes);
        }
        let roots = seed_roots(&mounts, exclusion.as_ref());
        Ok(Self::new(roots, exclusion))
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn watch_root(&self, root: &PathBuf, callback: EventCallback) -> Result<RecommendedWatcher> {
        let exclusion = self.exclusion.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for (path, operation) in classify_event(&event) {
                        let path = path.to_string_lossy().to_string();
                        if is_excluded(exclusion.as_ref(), &path) {
                            continue;
                        }
                        callback(RawFileEvent {
                            path,
                            operation,
                            process_name: UNKNOWN_PROCESS.to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
            Config::default(),
        )
        .map_err(|e| TrackerError::WatchSetup {
            path: root.clone(),
            reason: e.to_string(),
        })?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| TrackerError::WatchSetup {
                path: root.clone(),
                reason: e.to_string(),
            })?;
        Ok(watcher)
    }
}

impl EventSource for DirectoryWatchFeed {
    fn name(&self) -> &'static str {
        "directory-watch"
    }

    /// Watches every root it can. Fails only when no root could be watched.
    fn start(&mut self, callback: EventCallback) -> Result<()> {
        if !self.watchers.is_empty() {
            return Ok(());
        }
        let mut last_err = None;
        let mut watchers = Vec::with_capacity(self.roots.len());
        for root in &self.roots {
            if !root.exists() {
                warn!("Path does not exist, cannot watch: {}", root.display());
                continue;
            }
            match self.watch_root(root, callback.clone()) {
                Ok(watcher) => {
                    info!("Watching: {}", root.display());
                    watchers.push(watcher);
                }
                Err(err) => {
                    warn!(root = %root.display(), error = %err, "cannot watch volume");
                    last_err = Some(err);
                }
            }
        }
        if watchers.is_empty() {
            return Err(last_err.unwrap_or_else(|| TrackerError::NoVolumes.into()));
        }
        self.watchers = watchers;
        Ok(())
    }

    fn stop(&mut self) {
        if !self.watchers.is_empty() {
            debug!(count = self.watchers.len(), "dropping directory watchers");
            self.watchers.clear();
        }
    }

    /// The OS does not report drops for directory watches.
    fn loss_probe(&self) -> LossProbe {
        std::sync::Arc::new(|| 0)
    }
}

/// Watch roots for a set of mount points. A recursive watch registers every
/// directory below it, and the exclusion pattern only filters events, so a
/// mount whose top level holds excluded directories (`/proc`, `C:\Windows`)
/// is replaced by its remaining top-level directories. Other mounts that are
/// children of a mount are left to their own entry.
pub fn seed_roots(mounts: &[PathBuf], exclusion: Option<&Regex>) -> Vec<PathBuf> {
    let Some(re) = exclusion else {
        return mounts.to_vec();
    };
    let mut roots = Vec::new();
    for mount in mounts {
        let children: Vec<PathBuf> = match fs::read_dir(mount) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .map(|e| e.path())
                .collect(),
            Err(e) => {
                debug!(mount = %mount.display(), error = %e, "cannot list mount; watching it whole");
                roots.push(mount.clone());
                continue;
            }
        };
        let excluded = |dir: &Path| is_excluded(Some(re), &dir_key(dir));
        if !children.iter().any(|c| excluded(c.as_path())) {
            roots.push(mount.clone());
            continue;
        }
        for child in children {
            if excluded(child.as_path()) || mounts.contains(&child) {
                continue;
            }
            roots.push(child);
        }
    }
    roots.sort();
    roots.dedup();
    roots
}

/// Directory path with a trailing separator, the shape exclusion patterns
/// are written against.
fn dir_key(dir: &Path) -> String {
    let mut key = dir.to_string_lossy().to_string();
    if !key.ends_with(['/', '\\']) {
        key.push(std::path::MAIN_SEPARATOR);
    }
    key
}

fn is_excluded(exclusion: Option<&Regex>, path: &str) -> bool {
    exclusion.map(|re| re.is_match(path)).unwrap_or(false)
}

/// Maps a notify event onto the operations we report.
fn classify_event(event: &Event) -> Vec<(PathBuf, OperationKind)> {
    let mut changes = Vec::new();

    match &event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                changes.push((path.clone(), OperationKind::Create));
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Renames arrive as one event with both ends, or as two halves.
            if let Some(to) = event.paths.last() {
                changes.push((to.clone(), OperationKind::Rename));
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                changes.push((path.clone(), OperationKind::Changed));
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                changes.push((path.clone(), OperationKind::Delete));
            }
        }
        _ => {}
    }

    changes
}
