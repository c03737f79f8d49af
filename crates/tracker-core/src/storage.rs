use anyhow::Context;
use std::fs;
use std::path::Path;

use crate::settings::TrackerSettings;

/// Loads settings from `path`, falling back to defaults when the file is absent.
pub fn load_settings(path: &Path) -> anyhow::Result<TrackerSettings> {
    if !path.exists() {
        return Ok(TrackerSettings::default());
    }
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let settings: TrackerSettings =
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &TrackerSettings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(settings)?;
    fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SourceKind;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let settings = load_settings(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, TrackerSettings::default());
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = TrackerSettings::default();
        settings.source = SourceKind::Watch;
        settings.metrics_interval_secs = 30;
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn garbage_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"not json").unwrap();
        assert!(load_settings(&path).is_err());
    }
}
