//! The `qmi_wwan` backend: mux links are sysfs attributes on the network
//! interface itself rather than separate netlink devices (spec.md 4.5.2).

use std::path::PathBuf;

use crate::error::{CoreError, CoreResult};

use super::sysfs::{read_attr, write_attr};

fn net_class_dir(ifname: &str) -> PathBuf {
    PathBuf::from("/sys/class/net").join(ifname).join("qmi")
}

/// Lists every `<base_ifname>.<mux_id>` sub-interface under `/sys/class/net`
/// by reading each candidate's own `qmi/mux_id` attribute, rather than
/// trusting the numeric suffix — the kernel is the source of truth for
/// which mux id a sub-interface actually carries (spec.md 4.5.2
/// SUPPLEMENTED FEATURES item 6).
pub(crate) async fn list_links(sysfs_root: &std::path::Path, base_ifname: &str) -> CoreResult<Vec<(String, u8)>> {
    let names = super::sysfs::list_net_class_dir(sysfs_root).await?;
    let prefix = format!("{base_ifname}.");
    let mut links = Vec::new();
    for name in names {
        if !name.starts_with(&prefix) {
            continue;
        }
        let mux_id_path = sysfs_root.join("class/net").join(&name).join("qmi/mux_id");
        let Ok(value) = read_attr(mux_id_path).await else { continue };
        let Ok(mux_id) = value.trim().parse::<u8>() else { continue };
        links.push((name, mux_id));
    }
    Ok(links)
}

/// `add_mux(ifname, mux_id) -> sub-interface name`: writes `mux_id` to the
/// `qmi/add_mux` attribute; the kernel driver creates `<ifname>.<mux_id>`
/// and the write returns once that's done (spec.md 4.5.2).
pub(crate) async fn add_mux(ifname: &str, mux_id: u8) -> CoreResult<String> {
    let path = net_class_dir(ifname).join("add_mux");
    write_attr(path, mux_id.to_string()).await?;
    Ok(format!("{ifname}.{mux_id}"))
}

/// `del_mux(ifname, mux_id)`: writes `mux_id` to `qmi/del_mux`.
pub(crate) async fn del_mux(ifname: &str, mux_id: u8) -> CoreResult<()> {
    let path = net_class_dir(ifname).join("del_mux");
    write_attr(path, mux_id.to_string()).await
}

/// `raw_ip(ifname) -> bool`: whether the interface is in raw-IP mode
/// (spec.md 4.4.5 expected data format).
pub(crate) async fn raw_ip(ifname: &str) -> CoreResult<bool> {
    let value = read_attr(net_class_dir(ifname).join("raw_ip")).await?;
    parse_bool_attr(&value)
}

pub(crate) async fn set_raw_ip(ifname: &str, enabled: bool) -> CoreResult<()> {
    let path = net_class_dir(ifname).join("raw_ip");
    write_attr(path, if enabled { "Y".to_string() } else { "N".to_string() }).await
}

pub(crate) async fn pass_through(ifname: &str) -> CoreResult<bool> {
    let value = read_attr(net_class_dir(ifname).join("pass_through")).await?;
    parse_bool_attr(&value)
}

pub(crate) async fn set_pass_through(ifname: &str, enabled: bool) -> CoreResult<()> {
    let path = net_class_dir(ifname).join("pass_through");
    write_attr(path, if enabled { "Y".to_string() } else { "N".to_string() }).await
}

fn parse_bool_attr(value: &str) -> CoreResult<bool> {
    match value {
        "Y" | "y" | "1" => Ok(true),
        "N" | "n" | "0" => Ok(false),
        other => Err(CoreError::invalid_message(format!("unexpected boolean sysfs value {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kernel_bool_attr_spellings() {
        assert!(parse_bool_attr("Y").unwrap());
        assert!(!parse_bool_attr("0").unwrap());
        assert!(parse_bool_attr("maybe").is_err());
    }

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("qmi-core-qmiwwan-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn list_links_reads_mux_id_from_each_sub_interface() {
        let root = scratch_dir("list");
        let qmi_dir = root.join("class/net/wwan0.3/qmi");
        std::fs::create_dir_all(&qmi_dir).unwrap();
        std::fs::write(qmi_dir.join("mux_id"), "3\n").unwrap();
        // An unrelated interface must not show up.
        std::fs::create_dir_all(root.join("class/net/eth0")).unwrap();

        let links = list_links(&root, "wwan0").await.unwrap();
        assert_eq!(links, vec![("wwan0.3".to_string(), 3)]);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn list_links_skips_sub_interfaces_with_no_mux_id_attr() {
        let root = scratch_dir("list-missing");
        std::fs::create_dir_all(root.join("class/net/wwan0.4")).unwrap();

        let links = list_links(&root, "wwan0").await.unwrap();
        assert!(links.is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }
}
