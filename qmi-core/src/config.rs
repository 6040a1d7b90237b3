//! Tunables that are not per-call arguments.
//!
//! Shaped after `gamecore::config::GameConfig` / `Server` / `Game`: a plain
//! struct with a `Default` impl holding the handful of constants the spec
//! pins down (proxy retry cadence, interface-name prefixes). The core does
//! not parse a config file itself (no main loop, no owned process) — the
//! embedding host builds one of these however it likes and passes it to
//! `Device::new`.

use std::time::Duration;

/// Device-level tunables (spec.md 4.2.1 proxy retry cadence).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Absolute path to the proxy's abstract UNIX socket.
    pub proxy_socket_path: String,
    /// Absolute path to the proxy binary, spawned if the socket connect fails.
    pub proxy_binary_path: String,
    /// Interval between proxy connect retries (spec.md 4.2.1: 100 ms).
    pub proxy_retry_interval: Duration,
    /// Number of proxy connect retries before giving up (spec.md 4.2.1: ten).
    pub proxy_retry_count: u32,
    /// Timeout budget for the abort protocol's nested command (spec.md 4.3.5: 30 s).
    pub abort_protocol_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> DeviceConfig {
        DeviceConfig {
            proxy_socket_path: "qmi-proxy".to_string(),
            proxy_binary_path: "/usr/libexec/qmi-proxy".to_string(),
            proxy_retry_interval: Duration::from_millis(100),
            proxy_retry_count: 10,
            abort_protocol_timeout: Duration::from_secs(30),
        }
    }
}

/// Net port manager tunables (spec.md 4.5 ifname convention).
#[derive(Debug, Clone)]
pub struct NetPortConfig {
    /// Interface-name prefix used when the caller doesn't supply one for rmnet.
    pub rmnet_ifname_prefix: String,
    /// Interface-name prefix used when the caller doesn't supply one for qmi-wwan.
    pub qmi_wwan_ifname_prefix: String,
    /// Timeout for a single netlink request/ack round trip.
    pub netlink_timeout: Duration,
}

impl Default for NetPortConfig {
    fn default() -> NetPortConfig {
        NetPortConfig {
            rmnet_ifname_prefix: "rmnet_data".to_string(),
            qmi_wwan_ifname_prefix: "qmap".to_string(),
            netlink_timeout: Duration::from_secs(5),
        }
    }
}
