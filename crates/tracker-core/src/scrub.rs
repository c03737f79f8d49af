//! Privacy scrubbing of file paths.
//!
//! `scrub` turns a raw path into the only shape that may leave the host: the
//! directory with any user-profile segment redacted, a SHA-256 of the base
//! name, the extension, a best-effort size and the drive type. It is total;
//! every failure degrades to a sentinel.

use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::sync::OnceLock;

use crate::drives::{DriveType, VolumeTable};

pub const SCRUBBED_USER: &str = "<scrubbed-user>";

/// Size reported when the file could not be stat'ed.
pub const SIZE_UNAVAILABLE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubbedFileInfo {
    pub directory_scrubbed: String,
    pub name_hashed: String,
    pub extension: String,
    pub size_bytes: i64,
    pub drive_type: DriveType,
}

impl ScrubbedFileInfo {
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        self.write_properties(&mut props);
        props
    }

    pub fn write_properties(&self, props: &mut BTreeMap<String, String>) {
        props.insert("fileNameHashed".into(), self.name_hashed.clone());
        props.insert("fileDirectoryScrubbed".into(), self.directory_scrubbed.clone());
        props.insert("fileExtension".into(), self.extension.clone());
        props.insert("fileSize".into(), self.size_bytes.to_string());
        props.insert("driveType".into(), self.drive_type.to_string());
    }
}

impl fmt::Display for ScrubbedFileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileNameHashed: {}, FileDirectoryScrubbed: {}, FileExtension: {}, FileSize: {}, DriveType: {}",
            self.name_hashed, self.directory_scrubbed, self.extension, self.size_bytes, self.drive_type
        )
    }
}

/// The only I/O the scrubber performs, behind a seam.
pub trait FileProbe: Send + Sync {
    /// Length in bytes of a regular file, `None` if it cannot be read.
    fn size(&self, path: &str) -> Option<u64>;
    fn drive_type(&self, path: &str) -> DriveType;
}

/// Probe backed by the real filesystem and the mount table at load time.
#[derive(Debug, Default)]
pub struct SystemProbe {
    volumes: VolumeTable,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            volumes: VolumeTable::load(),
        }
    }

    pub fn with_volumes(volumes: VolumeTable) -> Self {
        Self { volumes }
    }
}

impl FileProbe for SystemProbe {
    fn size(&self, path: &str) -> Option<u64> {
        let meta = fs::metadata(path).ok()?;
        meta.is_file().then(|| meta.len())
    }

    fn drive_type(&self, path: &str) -> DriveType {
        self.volumes.lookup(path)
    }
}

/// Shared probe, loaded on first use.
pub fn system_probe() -> &'static SystemProbe {
    static PROBE: OnceLock<SystemProbe> = OnceLock::new();
    PROBE.get_or_init(SystemProbe::new)
}

pub fn scrub(path: &str) -> ScrubbedFileInfo {
    scrub_with(path, system_probe())
}

pub fn scrub_with(path: &str, probe: &dyn FileProbe) -> ScrubbedFileInfo {
    let (directory, name) = split_path(path);
    let size_bytes = probe
        .size(path)
        .and_then(|len| i64::try_from(len).ok())
        .unwrap_or(SIZE_UNAVAILABLE);
    ScrubbedFileInfo {
        directory_scrubbed: scrub_directory(directory),
        name_hashed: hash_file_name(name),
        extension: extension(name).to_string(),
        size_bytes,
        drive_type: probe.drive_type(path),
    }
}

/// Splits into (directory, base name) on either separator. A bare drive or
/// unix root keeps its trailing separator, so `C:\a.txt` has directory `C:\`.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind(['\\', '/']) {
        None => ("", path),
        Some(0) => (&path[..1], &path[1..]),
        Some(idx) => {
            let dir = &path[..idx];
            if dir.len() == 2 && dir.ends_with(':') {
                (&path[..=idx], &path[idx + 1..])
            } else {
                (dir, &path[idx + 1..])
            }
        }
    }
}

/// Final dot-suffix of a base name including the dot, or empty.
pub fn extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx + 1 < name.len() => &name[idx..],
        _ => "",
    }
}

/// Base64 SHA-256 of the UTF-8 name. No salt, so stable across runs.
pub fn hash_file_name(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    general_purpose::STANDARD.encode(digest)
}

fn windows_profile() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^([a-z]:[\\/]users[\\/])[^\\/]+").expect("static regex"))
}

fn unix_profile() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(/(?:home|Users)/)[^/]+").expect("static regex"))
}

/// Replaces the user segment of a profile directory with [`SCRUBBED_USER`].
/// Everything else is returned unchanged.
pub fn scrub_directory(directory: &str) -> String {
    let replacement = format!("${{1}}{SCRUBBED_USER}");
    for re in [windows_profile(), unix_profile()] {
        if re.is_match(directory) {
            return re.replace(directory, replacement.as_str()).into_owned();
        }
    }
    directory.to_string()
}

/// Redacts user-profile segments wherever they occur in free text, such as
/// error messages that embed paths.
pub fn scrub_message(text: &str) -> String {
    static WINDOWS: OnceLock<Regex> = OnceLock::new();
    static UNIX: OnceLock<Regex> = OnceLock::new();
    let windows = WINDOWS.get_or_init(|| {
        Regex::new(r#"(?i)([a-z]:[\\/]users[\\/])[^\\/\s"']+"#).expect("static regex")
    });
    let unix = UNIX.get_or_init(|| {
        Regex::new(r#"(/(?:home|Users)/)[^/\s"']+"#).expect("static regex")
    });
    let replacement = format!("${{1}}{SCRUBBED_USER}");
    let text = windows.replace_all(text, replacement.as_str());
    unix.replace_all(&text, replacement.as_str()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe {
        size: Option<u64>,
        drive: DriveType,
    }

    impl FileProbe for FixedProbe {
        fn size(&self, _path: &str) -> Option<u64> {
            self.size
        }
        fn drive_type(&self, _path: &str) -> DriveType {
            self.drive
        }
    }

    #[test]
    fn scrubs_windows_profile() {
        assert_eq!(
            scrub_directory(r"C:\Users\alice\Documents"),
            r"C:\Users\<scrubbed-user>\Documents"
        );
        assert_eq!(
            scrub_directory(r"d:\USERS\Bob.Smith"),
            r"d:\USERS\<scrubbed-user>"
        );
    }

    #[test]
    fn scrubs_unix_profile() {
        assert_eq!(
            scrub_directory("/home/alice/src/project"),
            "/home/<scrubbed-user>/src/project"
        );
        assert_eq!(scrub_directory("/Users/alice"), "/Users/<scrubbed-user>");
    }

    #[test]
    fn leaves_other_directories_alone() {
        for dir in [
            r"C:\Program Files\App",
            r"C:\Users",
            r"C:\data\Users\alice",
            "/var/home/alice",
            "",
        ] {
            assert_eq!(scrub_directory(dir), dir);
        }
    }

    #[test]
    fn redaction_never_leaks_user_name() {
        let names = ["alice", "Zoë", "j.doe", "ADMIN~1"];
        for name in names {
            let dir = format!(r"E:\Users\{name}\Desktop\work");
            let scrubbed = scrub_directory(&dir);
            assert!(!scrubbed.contains(name), "{scrubbed}");
            assert_eq!(scrubbed, r"E:\Users\<scrubbed-user>\Desktop\work");
        }
    }

    #[test]
    fn splits_paths() {
        assert_eq!(split_path(r"C:\Users\a\f.txt"), (r"C:\Users\a", "f.txt"));
        assert_eq!(split_path(r"C:\f.txt"), (r"C:\", "f.txt"));
        assert_eq!(split_path("/etc/hosts"), ("/etc", "hosts"));
        assert_eq!(split_path("/hosts"), ("/", "hosts"));
        assert_eq!(split_path("hosts"), ("", "hosts"));
    }

    #[test]
    fn extensions() {
        assert_eq!(extension("report.docx"), ".docx");
        assert_eq!(extension("archive.tar.gz"), ".gz");
        assert_eq!(extension("Makefile"), "");
        assert_eq!(extension("trailing."), "");
        assert_eq!(extension(".bashrc"), ".bashrc");
    }

    #[test]
    fn name_hash_is_stable_and_opaque() {
        let a = hash_file_name("report.docx");
        assert_eq!(a, hash_file_name("report.docx"));
        assert_ne!(a, hash_file_name("report.docm"));
        assert!(!a.contains("report"));
        // SHA-256 is 32 bytes, 44 chars in padded base64.
        assert_eq!(a.len(), 44);
    }

    #[test]
    fn name_hash_is_pinned() {
        assert_eq!(
            hash_file_name("report.docx"),
            "DrLs9Vk86VOzoKs0uMf+o4Cbsjni6ie9gbXtQOTLttE="
        );
    }

    #[test]
    fn hashes_base_name_only() {
        let probe = FixedProbe {
            size: Some(1),
            drive: DriveType::Fixed,
        };
        let a = scrub_with(r"C:\one\notes.txt", &probe);
        let b = scrub_with("/two/notes.txt", &probe);
        assert_eq!(a.name_hashed, b.name_hashed);
        assert_eq!(a.name_hashed, hash_file_name("notes.txt"));
    }

    #[test]
    fn missing_file_has_sentinel_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.tmp");
        let info = scrub(&path.to_string_lossy());
        assert_eq!(info.size_bytes, SIZE_UNAVAILABLE);
        assert_eq!(info.extension, ".tmp");
    }

    #[test]
    fn existing_file_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, vec![0u8; 2048]).unwrap();
        let info = scrub(&path.to_string_lossy());
        assert_eq!(info.size_bytes, 2048);
    }

    #[test]
    fn directories_have_no_size() {
        let dir = tempfile::tempdir().unwrap();
        let info = scrub(&dir.path().to_string_lossy());
        assert_eq!(info.size_bytes, SIZE_UNAVAILABLE);
    }

    #[test]
    fn properties_use_wire_keys() {
        let probe = FixedProbe {
            size: Some(2048),
            drive: DriveType::Fixed,
        };
        let props = scrub_with(r"C:\Users\alice\Documents\report.docx", &probe).to_properties();
        assert_eq!(props["fileExtension"], ".docx");
        assert_eq!(props["fileSize"], "2048");
        assert_eq!(props["driveType"], "Fixed");
        assert_eq!(
            props["fileDirectoryScrubbed"],
            r"C:\Users\<scrubbed-user>\Documents"
        );
        assert_eq!(props["fileNameHashed"], hash_file_name("report.docx"));
    }

    #[test]
    fn scrubs_profiles_inside_messages() {
        let msg = r"writing snapshot marker C:\Users\alice\AppData\Local\x: denied (also /home/bob/.cache)";
        let scrubbed = scrub_message(msg);
        assert!(!scrubbed.contains("alice"));
        assert!(!scrubbed.contains("bob"));
        assert!(scrubbed.contains(r"C:\Users\<scrubbed-user>\AppData"));
        assert!(scrubbed.contains("/home/<scrubbed-user>/.cache"));
    }
}
