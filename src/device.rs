//! Device identity derived from a network interface's hardware address.
//!
//! The identity is the MAC address as 12 upper-case hex digits without
//! separators (`00:1a:2b:3c:4d:5e` → `001A2B3C4D5E`). It is resolved once at
//! startup and then tags every outbound frame.

use std::path::{Path, PathBuf};

use crate::error::DeviceError;

const SYSFS_NET: &str = "/sys/class/net";

/// Resolve the identity of `ifname` from sysfs.
pub fn resolve_device_identity(ifname: &str) -> Result<String, DeviceError> {
    resolve_in(Path::new(SYSFS_NET), ifname)
}

fn resolve_in(root: &Path, ifname: &str) -> Result<String, DeviceError> {
    if ifname.is_empty() || ifname.contains('/') || ifname == "." || ifname == ".." {
        return Err(DeviceError::InvalidInterface(ifname.to_string()));
    }
    let path: PathBuf = root.join(ifname).join("address");
    let raw = std::fs::read_to_string(&path).map_err(|source| DeviceError::Unreadable {
        ifname: ifname.to_string(),
        source,
    })?;
    format_hw_address(raw.trim()).ok_or_else(|| DeviceError::NoAddress {
        ifname: ifname.to_string(),
        address: raw.trim().to_string(),
    })
}

/// Render a colon-separated 6-octet address compactly. `None` for anything
/// that is not exactly six hex octets, or for the all-zero address.
pub fn format_hw_address(address: &str) -> Option<String> {
    let octets: Vec<&str> = address.split(':').collect();
    if octets.len() != 6 {
        return None;
    }
    let mut out = String::with_capacity(12);
    for octet in octets {
        if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        out.push_str(&octet.to_ascii_uppercase());
    }
    if out.chars().all(|c| c == '0') {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(ifname: &str, address: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let iface = dir.path().join(ifname);
        std::fs::create_dir(&iface).unwrap();
        std::fs::write(iface.join("address"), address).unwrap();
        dir
    }

    #[test]
    fn test_format_hw_address() {
        assert_eq!(
            format_hw_address("00:1a:2b:3c:4d:5e").as_deref(),
            Some("001A2B3C4D5E")
        );
        assert!(format_hw_address("00:00:00:00:00:00").is_none());
        assert!(format_hw_address("00:1a:2b:3c:4d").is_none());
        assert!(format_hw_address("00:1a:2b:3c:4d:zz").is_none());
        assert!(format_hw_address("").is_none());
    }

    #[test]
    fn test_resolve_from_sysfs() {
        let root = fake_sysfs("eth0", "b8:27:eb:01:02:03\n");
        assert_eq!(resolve_in(root.path(), "eth0").unwrap(), "B827EB010203");
    }

    #[test]
    fn test_resolve_loopback_has_no_address() {
        let root = fake_sysfs("lo", "00:00:00:00:00:00\n");
        assert!(matches!(
            resolve_in(root.path(), "lo"),
            Err(DeviceError::NoAddress { .. })
        ));
    }

    #[test]
    fn test_resolve_missing_interface() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_in(root.path(), "eth9"),
            Err(DeviceError::Unreadable { .. })
        ));
    }

    #[test]
    fn test_resolve_rejects_path_names() {
        let root = tempfile::tempdir().unwrap();
        for bad in ["", "..", "../etc", "a/b"] {
            assert!(matches!(
                resolve_in(root.path(), bad),
                Err(DeviceError::InvalidInterface(_))
            ));
        }
    }
}
