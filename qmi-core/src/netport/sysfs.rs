//! Sysfs attribute I/O shared by the qmi-wwan backend and the device
//! layer's expected-data-format accessors (spec.md 4.4.5, 4.5.2).
//!
//! Sysfs reads/writes are ordinary blocking file I/O; run off the async
//! path the same way the rmnet backend's netlink round trip is, via
//! `spawn_blocking`, rather than pretending a `/sys` file needs a reactor.

use std::path::PathBuf;

use crate::error::{CoreError, CoreResult};

pub(crate) async fn read_attr(path: PathBuf) -> CoreResult<String> {
    tokio::task::spawn_blocking(move || std::fs::read_to_string(&path))
        .await
        .map_err(|e| CoreError::failed(format!("sysfs read task panicked: {e}")))?
        .map(|s| s.trim().to_string())
        .map_err(CoreError::Io)
}

pub(crate) async fn write_attr(path: PathBuf, value: String) -> CoreResult<()> {
    tokio::task::spawn_blocking(move || std::fs::write(&path, value))
        .await
        .map_err(|e| CoreError::failed(format!("sysfs write task panicked: {e}")))?
        .map_err(CoreError::Io)
}

/// Lists the entry names directly under `/sys/class/net` (spec.md 4.5.1
/// `list_links`/`del_all_links`: both back ends discover surviving links by
/// directory-listing this, rather than trusting only what this process's
/// own `add_link` calls have recorded).
pub(crate) async fn list_net_class_dir(sysfs_root: &std::path::Path) -> CoreResult<Vec<String>> {
    let dir = sysfs_root.join("class/net");
    tokio::task::spawn_blocking(move || -> CoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(CoreError::Io)? {
            let entry = entry.map_err(CoreError::Io)?;
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    })
    .await
    .map_err(|e| CoreError::failed(format!("sysfs directory listing task panicked: {e}")))?
}

/// Whether `/sys/class/net/<ifname>/lower_<base_ifname>` exists: the
/// kernel's marker that `ifname` is a stacked netdevice sitting on top of
/// `base_ifname` (rmnet, VLANs, bonding members all use it).
pub(crate) fn has_lower(sysfs_root: &std::path::Path, ifname: &str, base_ifname: &str) -> bool {
    sysfs_root.join("class/net").join(ifname).join(format!("lower_{base_ifname}")).exists()
}

/// Resolves the network interface a `qmi_wwan`-bound control device
/// (`/dev/cdc-wdmN`) drives, by following the USB interface's `net/`
/// child directory udev would also use (spec.md 4.4.5 netdev discovery).
pub(crate) fn net_interface_for_wdm(sysfs_root: &std::path::Path, wdm_name: &str) -> CoreResult<String> {
    let net_dir = sysfs_root.join("class/usbmisc").join(wdm_name).join("device/net");
    let mut entries = std::fs::read_dir(&net_dir).map_err(CoreError::Io)?;
    let entry = entries
        .next()
        .ok_or_else(|| CoreError::failed(format!("no network interface found under {}", net_dir.display())))?
        .map_err(CoreError::Io)?;
    entry
        .file_name()
        .into_string()
        .map_err(|_| CoreError::failed("network interface name is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("qmi-core-sysfs-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn read_attr_trims_trailing_newline() {
        let dir = scratch_dir("read");
        let path = dir.join("raw_ip");
        std::fs::write(&path, "1\n").unwrap();
        assert_eq!(read_attr(path).await.unwrap(), "1");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn write_attr_then_read_back() {
        let dir = scratch_dir("write");
        let path = dir.join("add_mux");
        write_attr(path.clone(), "5".to_string()).await.unwrap();
        assert_eq!(read_attr(path).await.unwrap(), "5");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn net_interface_for_wdm_finds_the_only_entry() {
        let root = scratch_dir("netdev");
        let net_dir = root.join("class/usbmisc/cdc-wdm0/device/net/wwan0");
        std::fs::create_dir_all(&net_dir).unwrap();
        let name = net_interface_for_wdm(&root, "cdc-wdm0").unwrap();
        assert_eq!(name, "wwan0");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn net_interface_for_wdm_errors_when_absent() {
        let root = scratch_dir("netdev-missing");
        assert!(net_interface_for_wdm(&root, "cdc-wdm1").is_err());
        let _ = std::fs::remove_dir_all(&root);
    }
}
