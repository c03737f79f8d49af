//! Device identity: a stable machine identifier bound to the build version.

use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    device_id: String,
    build_version: String,
}

impl DeviceIdentity {
    /// Resolves the platform system id (falling back to the host name) and
    /// combines it with `build_version`.
    pub fn detect(build_version: &str) -> Self {
        let system_id = collect_system_id()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "unknown-system".to_string());
        debug!("device identity derived from platform system id");
        Self::from_parts(&system_id, build_version)
    }

    pub fn from_parts(system_id: &str, build_version: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"system-uuid:");
        hasher.update(system_id.trim().as_bytes());
        hasher.update(b"\n");
        hasher.update(b"build-version:");
        hasher.update(build_version.as_bytes());
        hasher.update(b"\n");
        Self {
            device_id: hex::encode(hasher.finalize()),
            build_version: build_version.to_string(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn build_version(&self) -> &str {
        &self.build_version
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.device_id, self.build_version)
    }
}

#[cfg(target_os = "linux")]
fn collect_system_id() -> Option<String> {
    ["/sys/class/dmi/id/product_uuid", "/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

#[cfg(target_os = "macos")]
fn collect_system_id() -> Option<String> {
    let output = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines()
        .find(|line| line.contains("IOPlatformUUID"))
        .and_then(|line| line.split('"').nth(3))
        .map(|uuid| uuid.to_string())
}

/// `MachineGuid` first; `wmic` is gone from current Windows builds but still
/// answers on older ones.
#[cfg(target_os = "windows")]
fn collect_system_id() -> Option<String> {
    machine_guid().or_else(|| {
        let output = std::process::Command::new("wmic")
            .args(["csproduct", "get", "UUID", "/value"])
            .output()
            .ok()?;
        parse_wmic_uuid(&String::from_utf8_lossy(&output.stdout))
    })
}

#[cfg(target_os = "windows")]
fn machine_guid() -> Option<String> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Foundation::ERROR_SUCCESS;
    use windows_sys::Win32::System::Registry::{
        RegGetValueW, HKEY_LOCAL_MACHINE, RRF_RT_REG_SZ, RRF_SUBKEY_WOW6464KEY,
    };

    let wide = |s: &str| -> Vec<u16> {
        OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
    };
    let subkey = wide(r"SOFTWARE\Microsoft\Cryptography");
    let value = wide("MachineGuid");
    let mut buf = [0u16; 128];
    let mut len = (buf.len() * std::mem::size_of::<u16>()) as u32;
    // SAFETY: both names are nul-terminated and `len` is the byte size of `buf`.
    let status = unsafe {
        RegGetValueW(
            HKEY_LOCAL_MACHINE,
            subkey.as_ptr(),
            value.as_ptr(),
            RRF_RT_REG_SZ | RRF_SUBKEY_WOW6464KEY,
            std::ptr::null_mut(),
            buf.as_mut_ptr().cast(),
            &mut len,
        )
    };
    if status != ERROR_SUCCESS {
        debug!(status, "MachineGuid not readable");
        return None;
    }
    let chars = (len as usize / std::mem::size_of::<u16>()).min(buf.len());
    decode_reg_sz(&buf[..chars])
}

#[cfg(any(target_os = "windows", test))]
fn decode_reg_sz(data: &[u16]) -> Option<String> {
    let end = data.iter().position(|&c| c == 0).unwrap_or(data.len());
    let text = String::from_utf16_lossy(&data[..end]);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(any(target_os = "windows", test))]
fn parse_wmic_uuid(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.trim().strip_prefix("UUID="))
        .map(|uuid| uuid.trim().to_string())
        .filter(|uuid| !uuid.is_empty())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn collect_system_id() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_parts_same_id() {
        let a = DeviceIdentity::from_parts("abc-123", "1.0.0");
        let b = DeviceIdentity::from_parts("abc-123\n", "1.0.0");
        assert_eq!(a, b);
        assert_eq!(a.device_id().len(), 64);
    }

    #[test]
    fn build_version_changes_id() {
        let a = DeviceIdentity::from_parts("abc-123", "1.0.0");
        let b = DeviceIdentity::from_parts("abc-123", "1.0.1");
        assert_ne!(a.device_id(), b.device_id());
        assert_eq!(b.build_version(), "1.0.1");
    }

    #[test]
    fn reg_sz_stops_at_nul() {
        let mut data: Vec<u16> = "6f1c2b9e-0a4d-4e51-9c7b-2f3e8d1a5b60".encode_utf16().collect();
        data.extend([0, 0x41, 0x42]);
        assert_eq!(
            decode_reg_sz(&data).as_deref(),
            Some("6f1c2b9e-0a4d-4e51-9c7b-2f3e8d1a5b60")
        );
        assert_eq!(decode_reg_sz(&[0, 0]), None);
        assert_eq!(decode_reg_sz(&[]), None);
    }

    #[test]
    fn wmic_output_is_parsed() {
        let text = "\r\r\nUUID=4C4C4544-0042-3510-8052-B7C04F4E3732\r\r\n\r\n";
        assert_eq!(
            parse_wmic_uuid(text).as_deref(),
            Some("4C4C4544-0042-3510-8052-B7C04F4E3732")
        );
        assert_eq!(parse_wmic_uuid("UUID=\r\n"), None);
        assert_eq!(parse_wmic_uuid("'wmic' is not recognized"), None);
    }

    #[test]
    fn detect_is_stable_within_process() {
        let a = DeviceIdentity::detect("0.1.0");
        let b = DeviceIdentity::detect("0.1.0");
        assert_eq!(a, b);
    }
}
