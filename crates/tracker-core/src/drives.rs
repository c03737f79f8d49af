//! Volume discovery and drive-type classification.
//!
//! Volumes come from `sysinfo`; on Windows the drive type is asked of the OS
//! directly, elsewhere it is inferred from the mount's file system and
//! removability. Lookups never fail: anything unresolvable is `Unknown`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use sysinfo::Disks;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DriveType {
    Fixed,
    Removable,
    Network,
    CDRom,
    Ram,
    Unknown,
}

impl DriveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveType::Fixed => "Fixed",
            DriveType::Removable => "Removable",
            DriveType::Network => "Network",
            DriveType::CDRom => "CDRom",
            DriveType::Ram => "Ram",
            DriveType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DriveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mounted volume worth watching or enumerating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub mount_point: PathBuf,
    pub file_system: String,
    pub drive_type: DriveType,
}

const PSEUDO_FILESYSTEMS: &[&str] = &[
    "proc", "sysfs", "devtmpfs", "devpts", "cgroup", "cgroup2", "securityfs",
    "debugfs", "tracefs", "pstore", "bpf", "mqueue", "hugetlbfs", "configfs",
    "fusectl", "autofs", "binfmt_misc", "efivarfs", "squashfs", "nsfs",
];

const NETWORK_FILESYSTEMS: &[&str] = &[
    "nfs", "nfs4", "cifs", "smb", "smb2", "smbfs", "smb3", "sshfs", "fuse.sshfs",
    "9p", "afs", "ncpfs", "davfs", "fuse.davfs2", "webdav",
];

const OPTICAL_FILESYSTEMS: &[&str] = &["iso9660", "udf", "cdfs"];

const RAM_FILESYSTEMS: &[&str] = &["tmpfs", "ramfs"];

pub fn is_pseudo_filesystem(file_system: &str) -> bool {
    PSEUDO_FILESYSTEMS.contains(&file_system.to_ascii_lowercase().as_str())
}

/// Infers the drive type from what the mount table says about a volume.
pub fn classify(file_system: &str, removable: bool) -> DriveType {
    let fs = file_system.to_ascii_lowercase();
    if NETWORK_FILESYSTEMS.contains(&fs.as_str()) {
        return DriveType::Network;
    }
    if OPTICAL_FILESYSTEMS.contains(&fs.as_str()) {
        return DriveType::CDRom;
    }
    if RAM_FILESYSTEMS.contains(&fs.as_str()) {
        return DriveType::Ram;
    }
    if removable {
        return DriveType::Removable;
    }
    if fs.is_empty() {
        return DriveType::Unknown;
    }
    DriveType::Fixed
}

/// Every mounted, non-pseudo volume, sorted by mount point.
pub fn mounted_volumes() -> Vec<Volume> {
    let disks = Disks::new_with_refreshed_list();
    let mut volumes: Vec<Volume> = disks
        .list()
        .iter()
        .filter_map(|disk| {
            let file_system = disk.file_system().to_string_lossy().to_string();
            if is_pseudo_filesystem(&file_system) {
                return None;
            }
            let mount_point = disk.mount_point().to_path_buf();
            if !mount_point.is_absolute() {
                return None;
            }
            #[cfg(windows)]
            let drive_type = windows_drive_type(&mount_point.to_string_lossy());
            #[cfg(not(windows))]
            let drive_type = classify(&file_system, disk.is_removable());
            Some(Volume {
                mount_point,
                file_system,
                drive_type,
            })
        })
        .collect();
    volumes.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
    volumes.dedup_by(|a, b| a.mount_point == b.mount_point);
    volumes
}

/// Root of a path's volume: `C:\` for drive paths, `\\server\share\` for UNC
/// paths, `/` for unix paths. `None` for relative paths.
pub fn volume_root(path: &str) -> Option<String> {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Some(format!("{}\\", &path[..2]));
    }
    if path.starts_with("\\\\") {
        let mut parts = path[2..].split('\\').filter(|p| !p.is_empty());
        let server = parts.next()?;
        let share = parts.next()?;
        return Some(format!("\\\\{server}\\{share}\\"));
    }
    if path.starts_with('/') {
        return Some("/".to_string());
    }
    None
}

/// Mount table snapshot used to answer drive-type questions per path.
#[derive(Debug, Clone, Default)]
pub struct VolumeTable {
    volumes: Vec<Volume>,
}

impl VolumeTable {
    pub fn new(volumes: Vec<Volume>) -> Self {
        Self { volumes }
    }

    pub fn load() -> Self {
        Self::new(mounted_volumes())
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    pub fn lookup(&self, path: &str) -> DriveType {
        if path.starts_with("\\\\") {
            return DriveType::Network;
        }
        #[cfg(windows)]
        {
            if let Some(root) = volume_root(path) {
                return windows_drive_type(&root);
            }
        }
        // Longest mount point that prefixes the path wins.
        self.volumes
            .iter()
            .filter(|v| {
                let mount = v.mount_point.to_string_lossy();
                path_under(path, &mount)
            })
            .max_by_key(|v| v.mount_point.as_os_str().len())
            .map(|v| v.drive_type)
            .unwrap_or(DriveType::Unknown)
    }
}

/// One-off lookup against a fresh mount table. Hot paths should keep a
/// [`VolumeTable`] around instead.
pub fn drive_type_of(path: &str) -> DriveType {
    VolumeTable::load().lookup(path)
}

fn path_under(path: &str, mount: &str) -> bool {
    if mount == "/" {
        return path.starts_with('/');
    }
    if !path.starts_with(mount) {
        return false;
    }
    let rest = &path[mount.len()..];
    rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') || mount.ends_with(['/', '\\'])
}

#[cfg(windows)]
fn windows_drive_type(root: &str) -> DriveType {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::GetDriveTypeW;

    let wide: Vec<u16> = OsStr::new(root)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    // SAFETY: `wide` is a NUL-terminated UTF-16 buffer that outlives the call.
    let kind = unsafe { GetDriveTypeW(wide.as_ptr()) };
    match kind {
        2 => DriveType::Removable,
        3 => DriveType::Fixed,
        4 => DriveType::Network,
        5 => DriveType::CDRom,
        6 => DriveType::Ram,
        _ => DriveType::Unknown,
    }
}
