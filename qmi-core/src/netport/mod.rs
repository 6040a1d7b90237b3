//! Net-link/sysfs management for the data-plane interfaces a device's
//! control endpoint rides alongside (spec.md 4.5).

mod qmiwwan;
mod rmnet;
mod sysfs;

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use slog::o;

use crate::config::NetPortConfig;
use crate::error::{CoreError, CoreResult};

pub(crate) use sysfs::net_interface_for_wdm;

/// Valid mux id range (spec.md 4.5: 0 and 255 are reserved).
const MUX_ID_MIN: u8 = 1;
const MUX_ID_MAX: u8 = 254;

/// Sentinel passed to [`NetPortManager::add_link`] to mean "first unused
/// mux id" rather than a caller-chosen one (spec.md 4.5: "`0xFF` means
/// automatic").
pub const MUX_ID_AUTO: u8 = 0xFF;

/// Which kernel driver backs the device's data path, resolved once at
/// `NetPortManager` construction time from the control device's driver
/// (spec.md 4.4.1, 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetPortBackend {
    Rmnet,
    QmiWwan,
}

/// One multiplexed data link (spec.md 4.5: "a link per mux id").
#[derive(Debug, Clone)]
pub struct Link {
    pub ifname: String,
    pub mux_id: u8,
}

/// Owns the set of links multiplexed over one base network interface.
/// Back-end-specific operations (rmnet netlink vs qmi-wwan sysfs) are
/// dispatched once here rather than leaking the distinction to callers.
pub struct NetPortManager {
    log: slog::Logger,
    base_ifname: String,
    backend: NetPortBackend,
    config: NetPortConfig,
    links: StdMutex<HashMap<u8, Link>>,
}

impl NetPortManager {
    pub fn new(log: slog::Logger, base_ifname: impl Into<String>, backend: NetPortBackend, config: NetPortConfig) -> NetPortManager {
        NetPortManager {
            log: log.new(o!("component" => "net-port-manager")),
            base_ifname: base_ifname.into(),
            backend,
            config,
            links: StdMutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> NetPortBackend {
        self.backend
    }

    fn check_mux_id(mux_id: u8) -> CoreResult<()> {
        if (MUX_ID_MIN..=MUX_ID_MAX).contains(&mux_id) {
            Ok(())
        } else {
            Err(CoreError::invalid_args(format!(
                "mux id {mux_id} is outside the valid range {MUX_ID_MIN}..={MUX_ID_MAX}"
            )))
        }
    }

    /// Resolves [`MUX_ID_AUTO`] to the first id in `[MUX_ID_MIN,
    /// MUX_ID_MAX]` with no link yet (spec.md 4.5.1 step 1).
    fn resolve_mux_id(&self, mux_id: u8) -> CoreResult<u8> {
        if mux_id != MUX_ID_AUTO {
            Self::check_mux_id(mux_id)?;
            return Ok(mux_id);
        }
        let links = self.links.lock().unwrap();
        (MUX_ID_MIN..=MUX_ID_MAX)
            .find(|id| !links.contains_key(id))
            .ok_or_else(|| CoreError::failed("no free mux id remains"))
    }

    /// `add_link(mux_id) -> Link`: creates the data link for `mux_id` (or
    /// the first free one, if `mux_id` is [`MUX_ID_AUTO`]), using whichever
    /// back-end this device's driver requires (spec.md 4.5.1, 4.5.2).
    pub async fn add_link(&self, mux_id: u8) -> CoreResult<Link> {
        let mux_id = self.resolve_mux_id(mux_id)?;
        if self.links.lock().unwrap().contains_key(&mux_id) {
            return Err(CoreError::wrong_state(format!("mux id {mux_id} already has a link")));
        }

        let ifname = match self.backend {
            NetPortBackend::Rmnet => {
                // spec.md 9: "ifname = <prefix><mux_id - 1>", carried forward verbatim.
                let ifname = format!("{}{}", self.config.rmnet_ifname_prefix, mux_id - 1);
                rmnet::add_link(&self.base_ifname, mux_id, ifname.clone(), self.config.netlink_timeout).await?;
                ifname
            }
            NetPortBackend::QmiWwan => qmiwwan::add_mux(&self.base_ifname, mux_id).await?,
        };

        let link = Link { ifname, mux_id };
        self.links.lock().unwrap().insert(mux_id, link.clone());
        slog::debug!(self.log, "added data link"; "mux_id" => mux_id, "ifname" => &link.ifname);
        Ok(link)
    }

    /// `del_link(mux_id)`: tears down the link, if one exists. Not limited
    /// to links this process's own `add_link` created: if nothing is
    /// tracked locally, the ifname is rebuilt from the backend's naming
    /// convention so a link another process (or a prior run) created can
    /// still be torn down (spec.md 4.5.1 SUPPLEMENTED FEATURES item 6).
    pub async fn del_link(&self, mux_id: u8) -> CoreResult<()> {
        let tracked_ifname = self.links.lock().unwrap().remove(&mux_id).map(|link| link.ifname);

        match self.backend {
            NetPortBackend::Rmnet => {
                let ifname = tracked_ifname.unwrap_or_else(|| format!("{}{}", self.config.rmnet_ifname_prefix, mux_id.wrapping_sub(1)));
                rmnet::del_link(&ifname, self.config.netlink_timeout).await
            }
            NetPortBackend::QmiWwan => qmiwwan::del_mux(&self.base_ifname, mux_id).await,
        }
    }

    /// `list_links() -> [Link]`: merges what this process has tracked since
    /// it started with a fresh `/sys/class/net` listing, so a link created
    /// by another process, or surviving a restart of this one, still shows
    /// up (spec.md 4.5.1 SUPPLEMENTED FEATURES item 6).
    pub async fn links(&self) -> CoreResult<Vec<Link>> {
        let mut found: HashMap<u8, Link> = self.links.lock().unwrap().clone();
        let sysfs_root = std::path::Path::new("/sys");
        let discovered = match self.backend {
            NetPortBackend::Rmnet => rmnet::list_links(sysfs_root, &self.base_ifname, &self.config.rmnet_ifname_prefix).await?,
            NetPortBackend::QmiWwan => qmiwwan::list_links(sysfs_root, &self.base_ifname).await?,
        };
        for (ifname, mux_id) in discovered {
            found.entry(mux_id).or_insert(Link { ifname, mux_id });
        }
        Ok(found.into_values().collect())
    }

    /// Tears down every link currently live, whether this process tracked
    /// it or not (spec.md 4.5.1 `list_links`/`del_all_links`), best-effort:
    /// the first failure is returned, but every link that can be removed is.
    pub async fn del_all_links(&self) -> CoreResult<()> {
        let mux_ids: Vec<u8> = self.links().await?.iter().map(|link| link.mux_id).collect();
        let mut first_err = None;
        for mux_id in mux_ids {
            if let Err(e) = self.del_link(mux_id).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether the base interface is in raw-IP mode (spec.md 4.4.5); only
    /// meaningful for the qmi-wwan backend, which is the only one that
    /// predates rmnet's mandatory-raw-ip convention.
    pub async fn raw_ip(&self) -> CoreResult<bool> {
        match self.backend {
            NetPortBackend::QmiWwan => qmiwwan::raw_ip(&self.base_ifname).await,
            NetPortBackend::Rmnet => Ok(true),
        }
    }

    pub async fn set_raw_ip(&self, enabled: bool) -> CoreResult<()> {
        match self.backend {
            NetPortBackend::QmiWwan => qmiwwan::set_raw_ip(&self.base_ifname, enabled).await,
            NetPortBackend::Rmnet => {
                if enabled {
                    Ok(())
                } else {
                    Err(CoreError::invalid_args("rmnet devices are always raw-IP"))
                }
            }
        }
    }

    pub async fn pass_through(&self) -> CoreResult<bool> {
        match self.backend {
            NetPortBackend::QmiWwan => qmiwwan::pass_through(&self.base_ifname).await,
            NetPortBackend::Rmnet => Ok(false),
        }
    }

    pub async fn set_pass_through(&self, enabled: bool) -> CoreResult<()> {
        match self.backend {
            NetPortBackend::QmiWwan => qmiwwan::set_pass_through(&self.base_ifname, enabled).await,
            NetPortBackend::Rmnet => {
                if enabled {
                    Err(CoreError::invalid_args("rmnet devices have no pass-through mode"))
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(backend: NetPortBackend) -> NetPortManager {
        NetPortManager::new(crate::logging::default_logger(), "wwan0", backend, NetPortConfig::default())
    }

    #[test]
    fn mux_id_zero_is_rejected() {
        assert!(NetPortManager::check_mux_id(0).is_err());
    }

    #[test]
    fn mux_id_in_range_is_accepted() {
        assert!(NetPortManager::check_mux_id(1).is_ok());
        assert!(NetPortManager::check_mux_id(254).is_ok());
        assert!(NetPortManager::check_mux_id(255).is_err());
    }

    #[tokio::test]
    async fn del_link_without_add_is_an_error() {
        let manager = test_manager(NetPortBackend::Rmnet);
        assert!(manager.del_link(5).await.is_err());
    }

    #[tokio::test]
    async fn rmnet_rejects_disabling_raw_ip() {
        let manager = test_manager(NetPortBackend::Rmnet);
        assert!(manager.set_raw_ip(false).await.is_err());
        assert!(manager.set_raw_ip(true).await.is_ok());
    }

    /// spec.md 8.2 scenario 7 step 1: `mux_id=auto` resolves to the first
    /// free id, and skips ids already carrying a link.
    #[test]
    fn auto_mux_id_picks_the_first_free_one() {
        let manager = test_manager(NetPortBackend::Rmnet);
        assert_eq!(manager.resolve_mux_id(MUX_ID_AUTO).unwrap(), 1);

        manager.links.lock().unwrap().insert(1, Link { ifname: "rmnet0".into(), mux_id: 1 });
        assert_eq!(manager.resolve_mux_id(MUX_ID_AUTO).unwrap(), 2);
    }

    #[test]
    fn explicit_mux_id_out_of_range_is_still_rejected() {
        let manager = test_manager(NetPortBackend::Rmnet);
        assert!(manager.resolve_mux_id(0).is_err());
        assert!(manager.resolve_mux_id(255).is_err());
    }

    /// A link this process tracked in memory must show up from `links()`
    /// even when the real `/sys/class/net` listing (run against the host's
    /// actual sysfs, since the manager hard-codes its root) knows nothing
    /// about it.
    #[tokio::test]
    async fn links_includes_what_this_process_tracked_itself() {
        let manager = test_manager(NetPortBackend::Rmnet);
        manager.links.lock().unwrap().insert(9, Link { ifname: "rmnet_data8".into(), mux_id: 9 });
        let links = manager.links().await.unwrap();
        assert!(links.iter().any(|l| l.mux_id == 9 && l.ifname == "rmnet_data8"));
    }
}
