use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracker_core::drives::DriveType;
use tracker_core::identity::DeviceIdentity;
use tracker_core::record::SNAPSHOT_EVENT;
use tracker_core::scrub::FileProbe;
use tracker_core::telemetry::TelemetrySink;
use tracker_service::snapshot::{marker_path, spawn_snapshot, SnapshotBaseliner, SnapshotOutcome};

/// Records everything. Optionally flips the shutdown signal after the first
/// snapshot event to cancel a walk part way.
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    exceptions: Mutex<Vec<String>>,
    cancel_after_first: Mutex<Option<watch::Sender<bool>>>,
}

impl RecordingSink {
    fn snapshot_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(name, _)| name == SNAPSHOT_EVENT)
            .count()
    }
}

impl TelemetrySink for RecordingSink {
    fn send_event(&self, name: &str, properties: &BTreeMap<String, String>) {
        self.events.lock().push((name.to_string(), properties.clone()));
        if let Some(tx) = self.cancel_after_first.lock().take() {
            let _ = tx.send(true);
        }
    }

    fn send_exception(&self, error: &anyhow::Error) {
        self.exceptions.lock().push(format!("{error:#}"));
    }

    fn send_metric(&self, _name: &str, _value: f64) {}
}

struct StatProbe;

impl FileProbe for StatProbe {
    fn size(&self, path: &str) -> Option<u64> {
        fs::metadata(path).ok().map(|m| m.len())
    }

    fn drive_type(&self, _path: &str) -> DriveType {
        DriveType::Fixed
    }
}

fn populate(root: &Path) {
    fs::create_dir_all(root.join("docs/nested")).unwrap();
    fs::write(root.join("a.txt"), b"hello").unwrap();
    fs::write(root.join("docs/b.pdf"), b"pdf").unwrap();
    fs::write(root.join("docs/nested/c.rs"), b"fn main() {}").unwrap();
}

fn baseliner(state: &Path, root: &Path, sink: &Arc<RecordingSink>) -> SnapshotBaseliner {
    SnapshotBaseliner::new(
        state.to_path_buf(),
        vec![root.to_path_buf()],
        Arc::new(DeviceIdentity::from_parts("sys", "9.9.9")),
        sink.clone(),
        Arc::new(StatProbe),
    )
}

#[test]
fn second_run_is_a_no_op() {
    let state = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    populate(root.path());
    let sink = Arc::new(RecordingSink::default());
    let snapshot = baseliner(state.path(), root.path(), &sink);
    let (_tx, rx) = watch::channel(false);

    assert!(!snapshot.is_taken());
    let first = snapshot.run_once(&rx).unwrap();
    assert_eq!(first, SnapshotOutcome::Completed { files: 3 });
    assert!(marker_path(state.path(), "9.9.9").exists());
    assert_eq!(fs::metadata(snapshot.marker_path()).unwrap().len(), 0);

    let second = snapshot.run_once(&rx).unwrap();
    assert_eq!(second, SnapshotOutcome::AlreadyTaken);
    assert_eq!(sink.snapshot_count(), 3);
}

#[test]
fn events_share_one_timestamp_and_carry_sizes() {
    let state = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    populate(root.path());
    let sink = Arc::new(RecordingSink::default());
    let (_tx, rx) = watch::channel(false);
    baseliner(state.path(), root.path(), &sink).run_once(&rx).unwrap();

    let events = sink.events.lock();
    let stamps: Vec<&String> = events.iter().map(|(_, p)| &p["snapshotTimestamp"]).collect();
    assert!(stamps.windows(2).all(|w| w[0] == w[1]));
    let sizes: Vec<&str> = events.iter().map(|(_, p)| p["fileSize"].as_str()).collect();
    assert!(sizes.contains(&"5"));
    assert!(sizes.contains(&"12"));
    assert!(events.iter().all(|(_, p)| p["buildVersion"] == "9.9.9"));
}

#[test]
fn cancelled_walk_leaves_no_marker_and_reruns() {
    let state = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    populate(root.path());
    let sink = Arc::new(RecordingSink::default());
    let snapshot = baseliner(state.path(), root.path(), &sink);

    let (tx, rx) = watch::channel(false);
    *sink.cancel_after_first.lock() = Some(tx);
    let outcome = snapshot.run_once(&rx).unwrap();
    assert_eq!(outcome, SnapshotOutcome::Cancelled { files: 1 });
    assert!(!snapshot.is_taken());

    let (_tx, rx) = watch::channel(false);
    let rerun = snapshot.run_once(&rx).unwrap();
    assert_eq!(rerun, SnapshotOutcome::Completed { files: 3 });
    assert!(snapshot.is_taken());
}

#[test]
fn missing_roots_are_skipped() {
    let state = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let snapshot = baseliner(state.path(), &state.path().join("gone"), &sink);
    let (_tx, rx) = watch::channel(false);
    assert_eq!(
        snapshot.run_once(&rx).unwrap(),
        SnapshotOutcome::Completed { files: 0 }
    );
}

#[tokio::test]
async fn failure_is_reported_not_propagated() {
    let scratch = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    populate(root.path());
    // A regular file where the state directory should be.
    let blocked = scratch.path().join("state");
    fs::write(&blocked, b"not a dir").unwrap();

    let sink = Arc::new(RecordingSink::default());
    let snapshot = Arc::new(baseliner(&blocked, root.path(), &sink));
    let (_tx, rx) = watch::channel(false);
    let outcome = spawn_snapshot(snapshot, rx).await.unwrap();

    assert!(outcome.is_none());
    let exceptions = sink.exceptions.lock();
    assert_eq!(exceptions.len(), 1);
    assert!(exceptions[0].contains("state directory"));
}
