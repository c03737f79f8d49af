use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{TrackerError, TrackerResult};

/// Noisy locations the directory watch feed never reports: the Windows
/// system, program and profile-cache trees, and unix pseudo filesystems.
pub const DEFAULT_EXCLUSION_PATTERN: &str = r"(?i)^(?:[a-z]:\\(?:windows|program files|program files \(x86\)|programdata|\$recycle\.bin|system volume information)\\|[a-z]:\\users\\[^\\]+\\appdata\\|/(?:proc|sys|dev|run)/)";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Kernel trace when the platform provides one, directory watch otherwise.
    #[default]
    Auto,
    Kernel,
    Watch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelSettings {
    pub session_name: String,
    pub buffer_size_mb: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSettings {
    pub enabled: bool,
    /// Empty means every mounted volume.
    #[serde(default)]
    pub roots: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackerSettings {
    #[serde(default)]
    pub source: SourceKind,
    pub exclusion_pattern: String,
    pub metrics_interval_secs: u64,
    pub kernel: KernelSettings,
    pub snapshot: SnapshotSettings,
    pub telemetry: TelemetrySettings,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            source: SourceKind::Auto,
            exclusion_pattern: DEFAULT_EXCLUSION_PATTERN.to_string(),
            metrics_interval_secs: 60,
            kernel: KernelSettings {
                session_name: "NT Kernel Logger".into(),
                buffer_size_mb: 128,
            },
            snapshot: SnapshotSettings {
                enabled: true,
                roots: vec![],
            },
            telemetry: TelemetrySettings {
                endpoint: None,
                api_key: None,
                batch_size: 256,
                flush_interval_secs: 5,
            },
        }
    }
}

impl TrackerSettings {
    pub fn validate(&self) -> TrackerResult<()> {
        if self.metrics_interval_secs == 0 {
            return Err(TrackerError::InvalidSettings(
                "metrics interval must be at least one second".into(),
            ));
        }
        if self.kernel.buffer_size_mb == 0 {
            return Err(TrackerError::InvalidSettings(
                "kernel buffer size must be non-zero".into(),
            ));
        }
        if self.telemetry.batch_size == 0 || self.telemetry.flush_interval_secs == 0 {
            return Err(TrackerError::InvalidSettings(
                "telemetry batch size and flush interval must be non-zero".into(),
            ));
        }
        if let Some(endpoint) = &self.telemetry.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(TrackerError::InvalidSettings(format!(
                    "telemetry endpoint must be an http(s) url: {endpoint}"
                )));
            }
        }
        self.exclusion()?;
        Ok(())
    }

    /// Compiled exclusion pattern; an empty pattern disables exclusion.
    pub fn exclusion(&self) -> TrackerResult<Option<Regex>> {
        if self.exclusion_pattern.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(Regex::new(&self.exclusion_pattern)?))
    }

    /// Environment variables win over the settings file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("TRACKER_TELEMETRY_ENDPOINT") {
            if !endpoint.is_empty() {
                self.telemetry.endpoint = Some(endpoint);
            }
        }
        if let Ok(key) = std::env::var("TRACKER_TELEMETRY_API_KEY") {
            if !key.is_empty() {
                self.telemetry.api_key = Some(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TrackerSettings::default().validate().unwrap();
    }

    #[test]
    fn default_exclusion_matches_system_paths() {
        let re = TrackerSettings::default().exclusion().unwrap().unwrap();
        assert!(re.is_match(r"C:\Windows\System32\drivers\etc\hosts"));
        assert!(re.is_match(r"c:\program files (x86)\Vendor\app.dll"));
        assert!(re.is_match(r"C:\Users\bob\AppData\Local\Temp\x.tmp"));
        assert!(re.is_match("/proc/1/status"));
        assert!(!re.is_match(r"C:\Users\bob\Documents\notes.txt"));
        assert!(!re.is_match("/home/bob/notes.txt"));
    }

    #[test]
    fn rejects_bad_values() {
        let mut s = TrackerSettings::default();
        s.metrics_interval_secs = 0;
        assert!(s.validate().is_err());

        let mut s = TrackerSettings::default();
        s.exclusion_pattern = "(unclosed".into();
        assert!(matches!(
            s.validate(),
            Err(TrackerError::ExclusionPattern(_))
        ));

        let mut s = TrackerSettings::default();
        s.telemetry.endpoint = Some("ftp://collector".into());
        assert!(s.validate().is_err());
    }

    #[test]
    fn empty_pattern_disables_exclusion() {
        let mut s = TrackerSettings::default();
        s.exclusion_pattern = "  ".into();
        assert!(s.exclusion().unwrap().is_none());
    }

    #[test]
    fn source_kind_serializes_lowercase() {
        let json = serde_json::to_string(&SourceKind::Watch).unwrap();
        assert_eq!(json, "\"watch\"");
    }
}
