//! Telemetry record shapes and their flat string-map wire form.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::identity::DeviceIdentity;
use crate::scrub::{scrub_with, FileProbe, ScrubbedFileInfo};

pub const FILE_ACCESS_EVENT: &str = "FileAccess";
pub const SNAPSHOT_EVENT: &str = "Snapshot";
pub const EVENTS_LOST_METRIC: &str = "EventsLost";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Delete,
    Rename,
    Read,
    Write,
    Flush,
    Changed,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "Create",
            OperationKind::Delete => "Delete",
            OperationKind::Rename => "Rename",
            OperationKind::Read => "Read",
            OperationKind::Write => "Write",
            OperationKind::Flush => "Flush",
            OperationKind::Changed => "Changed",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One activity notification as delivered by an event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFileEvent {
    pub path: String,
    pub operation: OperationKind,
    pub process_name: String,
    pub timestamp: DateTime<Utc>,
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A scrubbed activity record, ready for the `FileAccess` event.
#[derive(Debug, Clone)]
pub struct TelemetryRecord {
    pub info: ScrubbedFileInfo,
    pub operation: OperationKind,
    pub process_name: String,
    pub timestamp: DateTime<Utc>,
    pub identity: Arc<DeviceIdentity>,
}

impl TelemetryRecord {
    /// `None` when the event carries no usable path.
    pub fn from_raw(
        raw: RawFileEvent,
        identity: &Arc<DeviceIdentity>,
        probe: &dyn FileProbe,
    ) -> Option<Self> {
        if raw.path.trim().is_empty() {
            return None;
        }
        Some(Self {
            info: scrub_with(&raw.path, probe),
            operation: raw.operation,
            process_name: raw.process_name,
            timestamp: raw.timestamp,
            identity: identity.clone(),
        })
    }

    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert("processName".into(), self.process_name.clone());
        props.insert("accessType".into(), self.operation.to_string());
        props.insert("timestamp".into(), format_timestamp(&self.timestamp));
        props.insert("deviceId".into(), self.identity.device_id().to_string());
        props.insert("buildVersion".into(), self.identity.build_version().to_string());
        self.info.write_properties(&mut props);
        props
    }
}

impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileInfo: {}, ProcessName: {}, AccessType: {}, Timestamp: {}",
            self.info,
            self.process_name,
            self.operation,
            format_timestamp(&self.timestamp)
        )
    }
}

/// One file seen by the baseline enumeration.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub info: ScrubbedFileInfo,
    pub snapshot_timestamp: DateTime<Utc>,
    pub identity: Arc<DeviceIdentity>,
}

impl SnapshotRecord {
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut props = self.info.to_properties();
        props.insert(
            "snapshotTimestamp".into(),
            format_timestamp(&self.snapshot_timestamp),
        );
        props.insert("deviceId".into(), self.identity.device_id().to_string());
        props.insert("buildVersion".into(), self.identity.build_version().to_string());
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drives::DriveType;
    use crate::scrub::hash_file_name;
    use chrono::TimeZone;

    struct FixedProbe;

    impl FileProbe for FixedProbe {
        fn size(&self, _path: &str) -> Option<u64> {
            Some(2048)
        }
        fn drive_type(&self, _path: &str) -> DriveType {
            DriveType::Fixed
        }
    }

    fn identity() -> Arc<DeviceIdentity> {
        Arc::new(DeviceIdentity::from_parts("system", "1.2.3"))
    }

    #[test]
    fn builds_file_access_properties() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let raw = RawFileEvent {
            path: r"C:\Users\alice\Documents\report.docx".into(),
            operation: OperationKind::Create,
            process_name: "word.exe".into(),
            timestamp: ts,
        };
        let record = TelemetryRecord::from_raw(raw, &identity(), &FixedProbe).unwrap();
        let props = record.to_properties();
        assert_eq!(props["processName"], "word.exe");
        assert_eq!(props["accessType"], "Create");
        assert_eq!(props["timestamp"], "2024-03-01T12:00:00.000Z");
        assert_eq!(props["fileExtension"], ".docx");
        assert_eq!(props["fileSize"], "2048");
        assert_eq!(props["driveType"], "Fixed");
        assert_eq!(props["fileNameHashed"], hash_file_name("report.docx"));
        assert_eq!(props["buildVersion"], "1.2.3");
        assert!(!props.values().any(|v| v.contains("alice")));
    }

    #[test]
    fn empty_path_yields_nothing() {
        let raw = RawFileEvent {
            path: "   ".into(),
            operation: OperationKind::Read,
            process_name: "svc".into(),
            timestamp: Utc::now(),
        };
        assert!(TelemetryRecord::from_raw(raw, &identity(), &FixedProbe).is_none());
    }

    #[test]
    fn snapshot_properties_carry_shared_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let record = SnapshotRecord {
            info: scrub_with("/home/bob/a.txt", &FixedProbe),
            snapshot_timestamp: ts,
            identity: identity(),
        };
        let props = record.to_properties();
        assert_eq!(props["snapshotTimestamp"], "2024-01-02T03:04:05.000Z");
        assert_eq!(props["fileDirectoryScrubbed"], "/home/<scrubbed-user>");
        assert!(!props.contains_key("processName"));
    }
}
