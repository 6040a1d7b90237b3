//! The `rmnet` backend: one netdevice per mux id, created/destroyed with
//! `RTM_NEWLINK`/`RTM_DELLINK` carrying an `IFLA_RMNET_MUX_ID` attribute
//! (spec.md 4.5.1). Built on `neli`, the same crate the pack's netlink
//! examples use for `NETLINK_ROUTE` work.

use std::time::Duration;

use neli::consts::nl::{NlmF, NlmFFlags, Nlmsg};
use neli::consts::rtnl::{Arphrd, Ifla, IflaInfo, IffFlags, RtAddrFamily, Rtm};
use neli::consts::socket::NlFamily;
use neli::err::NlError;
use neli::nl::{NlPayload, Nlmsghdr};
use neli::rtnl::{Ifinfomsg, Rtattr};
use neli::socket::NlSocketHandle;
use neli::types::RtBuffer;

use crate::error::{CoreError, CoreResult};

fn resolve_ifindex(ifname: &str) -> CoreResult<i32> {
    let index = nix::net::if_::if_nametoindex(ifname)
        .map_err(|e| CoreError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(index as i32)
}

/// `RMNET_FLAGS_*` bits from `if_link_rmnet.h`, not exposed by `neli`.
const RMNET_FLAGS_INGRESS_DEAGGREGATION: u32 = 1 << 0;

/// Packs `IFLA_RMNET_MUX_ID` and `IFLA_RMNET_FLAGS` (attribute types 1 and
/// 2 within `IFLA_INFO_DATA`, `if_link_rmnet.h`) as raw nested attributes;
/// `neli`'s typed `Rtattr` only goes one level deep, so the inner
/// attributes are laid out by hand.
fn rmnet_info_data(mux_id: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);

    let mux_id_value = (mux_id as u16).to_ne_bytes();
    let mux_id_len = (4 + mux_id_value.len()) as u16;
    buf.extend_from_slice(&mux_id_len.to_ne_bytes());
    buf.extend_from_slice(&1u16.to_ne_bytes()); // IFLA_RMNET_MUX_ID
    buf.extend_from_slice(&mux_id_value);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }

    // struct ifla_rmnet_flags { __u32 flags; __u32 mask; }; mask matches
    // flags here since every bit this endpoint can set is also the one it
    // means to change (spec.md 4.5.1: "flags unconditionally include
    // INGRESS_DEAGGREGATION").
    let flags = RMNET_FLAGS_INGRESS_DEAGGREGATION;
    let flags_len = (4 + 8) as u16;
    buf.extend_from_slice(&flags_len.to_ne_bytes());
    buf.extend_from_slice(&2u16.to_ne_bytes()); // IFLA_RMNET_FLAGS
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());

    buf
}

fn build_newlink(base_ifindex: i32, mux_id: u8, ifname: &str) -> CoreResult<Nlmsghdr<Rtm, Ifinfomsg>> {
    let mut link_info = RtBuffer::new();
    link_info.push(rtattr(IflaInfo::Kind, "rmnet".as_bytes().to_vec())?);
    link_info.push(rtattr(IflaInfo::Data, rmnet_info_data(mux_id))?);

    let mut attrs = RtBuffer::new();
    attrs.push(rtattr(Ifla::Link, base_ifindex.to_ne_bytes().to_vec())?);
    attrs.push(rtattr(Ifla::Ifname, ifname.as_bytes().to_vec())?);
    attrs.push(rtattr(Ifla::Linkinfo, encode_nested(&link_info)?)?);

    let ifinfomsg = Ifinfomsg::new(RtAddrFamily::Unspecified, Arphrd::Netrom, 0, IffFlags::empty(), IffFlags::empty(), attrs);
    Ok(Nlmsghdr::new(
        None,
        Rtm::Newlink,
        NlmFFlags::new(&[NlmF::Request, NlmF::Create, NlmF::Excl, NlmF::Ack]),
        None,
        None,
        NlPayload::Payload(ifinfomsg),
    ))
}

fn build_dellink(ifindex: i32) -> Nlmsghdr<Rtm, Ifinfomsg> {
    let ifinfomsg = Ifinfomsg::new(RtAddrFamily::Unspecified, Arphrd::Netrom, ifindex, IffFlags::empty(), IffFlags::empty(), RtBuffer::new());
    Nlmsghdr::new(None, Rtm::Dellink, NlmFFlags::new(&[NlmF::Request, NlmF::Ack]), None, None, NlPayload::Payload(ifinfomsg))
}

fn rtattr<T: neli::consts::rtnl::RtaType>(rta_type: T, payload: Vec<u8>) -> CoreResult<Rtattr<T, Vec<u8>>> {
    Rtattr::new(None, rta_type, payload).map_err(|e| CoreError::failed(format!("failed to encode netlink attribute: {e}")))
}

fn encode_nested<T: neli::consts::rtnl::RtaType>(buffer: &RtBuffer<T, Vec<u8>>) -> CoreResult<Vec<u8>> {
    use neli::ToBytes;
    let mut cursor = std::io::Cursor::new(Vec::new());
    buffer
        .to_bytes(&mut cursor)
        .map_err(|e| CoreError::failed(format!("failed to serialize nested netlink attributes: {e}")))?;
    Ok(cursor.into_inner())
}

/// Sends `msg` and blocks until its `NLMSG_ERROR` ack arrives.
/// `NlSocketHandle` is a blocking socket; callers run this on the blocking
/// pool, the same way the qmi-wwan backend runs its sysfs writes there.
fn send_and_wait_ack(msg: Nlmsghdr<Rtm, Ifinfomsg>) -> CoreResult<()> {
    let mut socket = NlSocketHandle::connect(NlFamily::Route, None, &[])
        .map_err(|e| CoreError::failed(format!("failed to open NETLINK_ROUTE socket: {e}")))?;
    socket.send(msg).map_err(|e| CoreError::failed(format!("failed to send netlink request: {e}")))?;

    match socket.recv::<Nlmsg, neli::err::Nlmsgerr<Nlmsg>>() {
        Ok(Some(response)) => match response.get_payload() {
            Ok(ack) if ack.error == 0 => Ok(()),
            Ok(ack) => Err(CoreError::failed(format!("rmnet netlink request rejected, errno {}", -ack.error))),
            Err(e) => Err(CoreError::failed(format!("failed to parse netlink ack: {e}"))),
        },
        Ok(None) => Err(CoreError::failed("netlink socket closed before an ack arrived")),
        Err(NlError::Msg(msg)) => Err(CoreError::failed(format!("rmnet netlink request failed: {msg}"))),
        Err(e) => Err(CoreError::failed(format!("rmnet netlink request failed: {e}"))),
    }
}

pub(crate) async fn add_link(base_ifname: &str, mux_id: u8, ifname: String, timeout: Duration) -> CoreResult<()> {
    let base_ifindex = resolve_ifindex(base_ifname)?;
    tokio::time::timeout(
        timeout,
        tokio::task::spawn_blocking(move || {
            let msg = build_newlink(base_ifindex, mux_id, &ifname)?;
            send_and_wait_ack(msg)
        }),
    )
    .await
    .map_err(|_| CoreError::Timeout)?
    .map_err(|e| CoreError::failed(format!("netlink task panicked: {e}")))?
}

/// Lists every `<prefix><N>` netdevice under `/sys/class/net` stacked on
/// top of `base_ifname`, returning each as `(ifname, mux_id)` with
/// `mux_id = N + 1` — the inverse of `add_link`'s own naming convention
/// (spec.md 4.5.1 SUPPLEMENTED FEATURES item 6: discovers links this
/// process never created itself).
pub(crate) async fn list_links(sysfs_root: &std::path::Path, base_ifname: &str, ifname_prefix: &str) -> CoreResult<Vec<(String, u8)>> {
    let names = super::sysfs::list_net_class_dir(sysfs_root).await?;
    let mut links = Vec::new();
    for name in names {
        let Some(suffix) = name.strip_prefix(ifname_prefix) else { continue };
        let Ok(n) = suffix.parse::<u32>() else { continue };
        let Some(mux_id) = n.checked_add(1).and_then(|m| u8::try_from(m).ok()) else { continue };
        if !(1..=254).contains(&mux_id) {
            continue;
        }
        if !super::sysfs::has_lower(sysfs_root, &name, base_ifname) {
            continue;
        }
        links.push((name, mux_id));
    }
    Ok(links)
}

pub(crate) async fn del_link(ifname: &str, timeout: Duration) -> CoreResult<()> {
    let ifindex = resolve_ifindex(ifname)?;
    tokio::time::timeout(
        timeout,
        tokio::task::spawn_blocking(move || send_and_wait_ack(build_dellink(ifindex))),
    )
    .await
    .map_err(|_| CoreError::Timeout)?
    .map_err(|e| CoreError::failed(format!("netlink task panicked: {e}")))?
}
