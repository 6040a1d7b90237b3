//! The QRTR endpoint (spec.md 4.2.3, 6.4, 9 Open Question "QRTR CID
//! synthesis"): the kernel `AF_QIPCRTR` bus carries no QMUX framing and has
//! no control service, so this endpoint reconstructs a QMUX-shaped
//! [`Message`] per datagram and answers `ALLOCATE_CID`/`RELEASE_CID`/`SYNC`
//! locally instead of putting them on the bus.
//!
//! The allocation bookkeeping ([`QrtrCidAllocator`]) is split out as plain
//! data so it can be exercised without a real `AF_QIPCRTR` socket, which
//! this sandbox (like most CI containers) does not have.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use hashbrown::HashSet;
use slog::{o, warn};
use tokio::io::unix::AsyncFd;

use crate::codec::{Endianness, Message, MessageBuilder, SERVICE_CTL};
use crate::ctl::{ALLOCATE_CID as CTL_ALLOCATE_CID, RELEASE_CID as CTL_RELEASE_CID, SYNC as CTL_SYNC, TLV_ALLOCATION_INFO, TLV_RESULT};
use crate::error::{CoreError, CoreResult};

use super::{ensure_open, EndpointEvents, EndpointEventsTx};

const AF_QIPCRTR: libc::c_int = 42;

/// `QRTR_PORT_CTRL` (`linux/qrtr.h`): every node's control service listens
/// here for lookup requests and announces `NEW_SERVER`/`DEL_SERVER` to
/// subscribers on it.
const QRTR_PORT_CTRL: u32 = 0xFFFF_FFFF;

// `qrtr_ctrl_pkt` command ids (`linux/qrtr.h`). Only the three this
// endpoint speaks are named; the others (`HELLO`, `BYE`, `RESUME_TX`, ...)
// are part of the bus's own plumbing and never reach user space traffic.
const QRTR_TYPE_NEW_SERVER: u32 = 4;
const QRTR_TYPE_DEL_SERVER: u32 = 5;
const QRTR_TYPE_NEW_LOOKUP: u32 = 10;

/// A `NEW_SERVER`/`DEL_SERVER` announcement decoded off the control port:
/// `qrtr_ctrl_pkt`'s `server` union member (`cmd`, `service`, `instance`,
/// `node`, `port`), little-endian, 20 bytes total.
struct QrtrCtrlPkt {
    cmd: u32,
    service: u32,
    node: u32,
    port: u32,
}

fn parse_qrtr_ctrl_pkt(payload: &[u8]) -> Option<QrtrCtrlPkt> {
    if payload.len() < 20 {
        return None;
    }
    let read_u32 = |offset: usize| u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap());
    let cmd = read_u32(0);
    match cmd {
        QRTR_TYPE_NEW_SERVER | QRTR_TYPE_DEL_SERVER => {
            Some(QrtrCtrlPkt { cmd, service: read_u32(4), node: read_u32(12), port: read_u32(16) })
        }
        _ => None,
    }
}

/// A bare `QRTR_TYPE_NEW_LOOKUP` request: subscribes this socket to every
/// subsequent `NEW_SERVER`/`DEL_SERVER` announcement on the bus, the same
/// protocol the reference `qrtr-lookup` tool uses to build its listing.
fn new_lookup_request() -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[0..4].copy_from_slice(&QRTR_TYPE_NEW_LOOKUP.to_le_bytes());
    buf
}

/// `sockaddr_qrtr` as defined by `linux/qrtr.h`; not exposed by `libc` or
/// `nix`, so declared directly.
#[repr(C)]
#[derive(Clone, Copy)]
struct SockAddrQrtr {
    family: libc::sa_family_t,
    node: u32,
    port: u32,
}

/// A non-owning view of a raw fd for [`AsyncFd`], which needs an
/// `AsRawFd` value of its own while the real [`OwnedFd`] stays alive
/// elsewhere (shared with the send path).
struct BorrowedRawFd(RawFd);

impl AsRawFd for BorrowedRawFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Where a QMI service is reachable on the bus, learned by whatever
/// discovers it (spec.md 4.4.1: driver/endpoint selection already happens
/// above this layer). `QrtrEndpoint` does not itself run service-directory
/// lookups; callers register addresses as they resolve them.
pub type ServiceAddress = (u32, u32);

/// Pure CID-allocation/synthesis logic, independent of any socket (spec.md
/// 4.2.3: "the endpoint intercepts ALLOCATE_CID, RELEASE_CID and SYNC").
pub(crate) struct QrtrCidAllocator {
    allocated: HashSet<(u8, u8)>,
}

impl QrtrCidAllocator {
    pub(crate) fn new() -> QrtrCidAllocator {
        QrtrCidAllocator { allocated: HashSet::new() }
    }

    /// Returns the synthesized response for a CTL request this endpoint
    /// must answer locally, or `None` if `request` should go out over the
    /// bus unchanged (spec.md 4.2.3: `GET_VERSION_INFO` is the one CTL
    /// request QRTR's service directory already answers, so it passes
    /// through).
    pub(crate) fn handle(&mut self, request: &Message) -> Option<CoreResult<Message>> {
        if request.get_service() != SERVICE_CTL {
            return None;
        }
        match request.get_message_id() {
            CTL_ALLOCATE_CID => Some(self.allocate(request)),
            CTL_RELEASE_CID => Some(self.release(request)),
            CTL_SYNC => Some(self.sync(request)),
            _ => None,
        }
    }

    fn allocate(&mut self, request: &Message) -> CoreResult<Message> {
        let reader = crate::codec::TlvReader::find(request, TLV_ALLOCATION_INFO)?;
        let mut cursor = 0;
        let service = reader.read_u8(&mut cursor)?;

        let cid = self.next_free_cid().ok_or_else(|| CoreError::failed("no free QRTR client ids remain"))?;
        self.allocated.insert((service, cid));

        let mut builder = MessageBuilder::new(request.get_service(), request.get_client_id(), request.get_transaction_id(), request.get_message_id())?;
        builder_response_framing(&mut builder, request)?;
        let result = builder.tlv_write_init(TLV_RESULT);
        builder.append_u16(0, Endianness::Little);
        builder.append_u16(0, Endianness::Little);
        builder.tlv_write_complete(result)?;
        let info = builder.tlv_write_init(TLV_ALLOCATION_INFO);
        builder.append_u8(service);
        builder.append_u8(cid);
        builder.tlv_write_complete(info)?;
        Ok(builder.finish())
    }

    fn release(&mut self, request: &Message) -> CoreResult<Message> {
        let reader = crate::codec::TlvReader::find(request, TLV_ALLOCATION_INFO)?;
        let mut cursor = 0;
        let service = reader.read_u8(&mut cursor)?;
        let cid = reader.read_u8(&mut cursor)?;
        self.allocated.remove(&(service, cid));

        let mut builder = MessageBuilder::new(request.get_service(), request.get_client_id(), request.get_transaction_id(), request.get_message_id())?;
        builder_response_framing(&mut builder, request)?;
        let result = builder.tlv_write_init(TLV_RESULT);
        builder.append_u16(0, Endianness::Little);
        builder.append_u16(0, Endianness::Little);
        builder.tlv_write_complete(result)?;
        let info = builder.tlv_write_init(TLV_ALLOCATION_INFO);
        builder.append_u8(service);
        builder.append_u8(cid);
        builder.tlv_write_complete(info)?;
        Ok(builder.finish())
    }

    fn sync(&mut self, request: &Message) -> CoreResult<Message> {
        let mut builder = MessageBuilder::new(request.get_service(), request.get_client_id(), request.get_transaction_id(), request.get_message_id())?;
        builder_response_framing(&mut builder, request)?;
        let result = builder.tlv_write_init(TLV_RESULT);
        builder.append_u16(0, Endianness::Little);
        builder.append_u16(0, Endianness::Little);
        builder.tlv_write_complete(result)?;
        Ok(builder.finish())
    }

    /// Smallest cid in `1..=255` not already in `self.allocated` (spec.md
    /// 8.2 scenario 6; mirrors `get_next_free_id`'s tree scan over allocated
    /// ids in `qmi-endpoint-qrtr.c`).
    fn next_free_cid(&mut self) -> Option<u8> {
        (1..=255).find(|candidate| !self.allocated.iter().any(|(_, cid)| cid == candidate))
    }
}

/// `MessageBuilder::new` writes a request's control-flags byte; responses
/// need the response flag set instead. There is no direct setter, so this
/// patches the already-written header byte in place.
fn builder_response_framing(builder: &mut MessageBuilder, _request: &Message) -> CoreResult<()> {
    builder.mark_as_response();
    Ok(())
}

pub struct QrtrEndpoint {
    log: slog::Logger,
    fd: Option<std::sync::Arc<OwnedFd>>,
    rx_task: Option<tokio::task::JoinHandle<()>>,
    events_tx: Option<std::sync::Arc<EndpointEventsTx>>,
    allocator: std::sync::Arc<std::sync::Mutex<QrtrCidAllocator>>,
    service_directory: std::sync::Arc<std::sync::Mutex<HashMap<u8, ServiceAddress>>>,
}

impl QrtrEndpoint {
    pub fn new(log: slog::Logger) -> QrtrEndpoint {
        QrtrEndpoint {
            log: log.new(o!("endpoint" => "qrtr")),
            fd: None,
            rx_task: None,
            events_tx: None,
            allocator: std::sync::Arc::new(std::sync::Mutex::new(QrtrCidAllocator::new())),
            service_directory: std::sync::Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Registers where `service` is reachable on the bus, overriding
    /// whatever the control-port listener has learned (or pre-seeding it
    /// before the first `NEW_SERVER` announcement arrives). Most callers
    /// don't need this: once the endpoint is open, its own listener keeps
    /// `service_directory` current (spec.md 4.4.1; SUPPLEMENTED FEATURES
    /// item 4).
    pub fn register_service(&self, service: u8, address: ServiceAddress) {
        self.service_directory.lock().unwrap().insert(service, address);
    }

    pub async fn open(&mut self, timeout: Duration) -> CoreResult<EndpointEvents> {
        if self.is_open() {
            return Err(CoreError::wrong_state("endpoint already open"));
        }
        let fd = tokio::time::timeout(timeout, async { self.open_socket() })
            .await
            .map_err(|_| CoreError::Timeout)??;

        if let Err(e) = subscribe_to_service_directory(fd.as_raw_fd()) {
            warn!(self.log, "failed to subscribe to the QRTR control port"; "error" => %e);
        }

        let (events_tx, events) = EndpointEventsTx::new();
        let events_tx = std::sync::Arc::new(events_tx);
        let fd = std::sync::Arc::new(fd);
        self.events_tx = Some(events_tx.clone());
        self.spawn_rx_task(fd.clone(), events_tx, self.service_directory.clone());
        self.fd = Some(fd);
        Ok(events)
    }

    fn open_socket(&self) -> CoreResult<OwnedFd> {
        let raw = unsafe { libc::socket(AF_QIPCRTR, libc::SOCK_DGRAM, 0) };
        if raw < 0 {
            return Err(CoreError::Io(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = SockAddrQrtr { family: AF_QIPCRTR as libc::sa_family_t, node: 0, port: !0u32 /* QRTR_PORT_CTRL not used: any port */ };
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const SockAddrQrtr).cast(),
                std::mem::size_of::<SockAddrQrtr>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(CoreError::Io(io::Error::last_os_error()));
        }
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
        Ok(fd)
    }

    fn spawn_rx_task(
        &mut self,
        fd: std::sync::Arc<OwnedFd>,
        events_tx: std::sync::Arc<EndpointEventsTx>,
        service_directory: std::sync::Arc<std::sync::Mutex<HashMap<u8, ServiceAddress>>>,
    ) {
        let log = self.log.clone();
        let raw_fd = fd.as_raw_fd();
        let handle = tokio::spawn(async move {
            let async_fd = match AsyncFd::new(BorrowedRawFd(raw_fd)) {
                Ok(a) => a,
                Err(e) => {
                    warn!(log, "failed to register QRTR socket for readiness"; "error" => %e);
                    events_tx.signal_hangup();
                    return;
                }
            };
            let _keep_fd_alive = fd;
            let mut buf = [0u8; 8192];
            loop {
                let mut guard = match async_fd.readable().await {
                    Ok(g) => g,
                    Err(e) => {
                        warn!(log, "QRTR socket readiness error"; "error" => %e);
                        events_tx.signal_hangup();
                        return;
                    }
                };
                let result = guard.try_io(|inner| {
                    let mut src = SockAddrQrtr { family: 0, node: 0, port: 0 };
                    let mut src_len = std::mem::size_of::<SockAddrQrtr>() as libc::socklen_t;
                    let n = unsafe {
                        libc::recvfrom(
                            inner.get_ref().as_raw_fd(),
                            buf.as_mut_ptr().cast(),
                            buf.len(),
                            0,
                            (&mut src as *mut SockAddrQrtr).cast(),
                            &mut src_len,
                        )
                    };
                    if n < 0 { Err(io::Error::last_os_error()) } else { Ok((n as usize, src)) }
                });
                let (n, src) = match result {
                    Ok(Ok((0, _))) => {
                        events_tx.signal_hangup();
                        return;
                    }
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        warn!(log, "QRTR socket read error"; "error" => %e);
                        events_tx.signal_hangup();
                        return;
                    }
                    Err(_would_block) => continue,
                };

                if src.port == QRTR_PORT_CTRL {
                    match parse_qrtr_ctrl_pkt(&buf[..n]) {
                        Some(pkt) => apply_service_directory_update(&service_directory, &pkt),
                        None => {} // HELLO/BYE/lookup acks and the like: nothing to track
                    }
                    continue;
                }

                match decode_qrtr_payload(&buf[..n]) {
                    Ok(message) => {
                        let _ = events_tx.messages.send(message);
                    }
                    Err(e) => warn!(log, "dropping malformed QRTR datagram"; "error" => %e),
                }
            }
        });
        self.rx_task = Some(handle);
    }

    pub async fn setup_indications(&mut self, _timeout: Duration) -> CoreResult<()> {
        ensure_open(self.is_open())
    }

    /// Intercepts `ALLOCATE_CID`/`RELEASE_CID`/`SYNC` and answers them
    /// locally; every other request is addressed via the service directory
    /// and written to the bus as a bare payload (spec.md 4.2.3).
    pub async fn send(&mut self, message: &Message, timeout: Duration) -> CoreResult<()> {
        ensure_open(self.is_open())?;

        if let Some(result) = self.allocator.lock().unwrap().handle(message) {
            let response = result?;
            self.events_tx.as_ref().unwrap().messages.send(response).ok();
            tokio::task::yield_now().await;
            return Ok(());
        }

        let (node, port) = *self
            .service_directory
            .lock()
            .unwrap()
            .get(&message.get_service())
            .ok_or_else(|| CoreError::Unsupported { service: format!("0x{:02x}", message.get_service()) })?;

        let fd = self.fd.clone().unwrap();
        let payload = &message.get_raw()[3..]; // drop marker + length: datagram boundaries carry framing
        let addr = SockAddrQrtr { family: AF_QIPCRTR as libc::sa_family_t, node, port };
        tokio::time::timeout(timeout, async move {
            let raw_fd = fd.as_raw_fd();
            let rc = unsafe {
                libc::sendto(
                    raw_fd,
                    payload.as_ptr().cast(),
                    payload.len(),
                    0,
                    (&addr as *const SockAddrQrtr).cast(),
                    std::mem::size_of::<SockAddrQrtr>() as libc::socklen_t,
                )
            };
            if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        })
        .await
        .map_err(|_| CoreError::Timeout)?
        .map_err(CoreError::Io)
    }

    pub async fn close(&mut self, _timeout: Duration) -> CoreResult<()> {
        if let Some(task) = self.rx_task.take() {
            task.abort();
        }
        self.fd = None;
        self.events_tx = None;
        Ok(())
    }
}

/// Sends a `NEW_LOOKUP` request to the local node's control service
/// (`node: 0, port: QRTR_PORT_CTRL`), subscribing this socket to every
/// `NEW_SERVER`/`DEL_SERVER` announcement the bus makes from here on
/// (spec.md 4.4.1; SUPPLEMENTED FEATURES item 4).
fn subscribe_to_service_directory(fd: RawFd) -> CoreResult<()> {
    let request = new_lookup_request();
    let addr = SockAddrQrtr { family: AF_QIPCRTR as libc::sa_family_t, node: 0, port: QRTR_PORT_CTRL };
    let rc = unsafe {
        libc::sendto(
            fd,
            request.as_ptr().cast(),
            request.len(),
            0,
            (&addr as *const SockAddrQrtr).cast(),
            std::mem::size_of::<SockAddrQrtr>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(CoreError::Io(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

/// Applies one `NEW_SERVER`/`DEL_SERVER` announcement to the live service
/// directory: `NEW_SERVER` records where `service` is now reachable,
/// `DEL_SERVER` drops it. The QRTR `service` id is truncated to a `u8`,
/// matching `ServiceAddress`'s keying (spec.md 4.2.3's CTL-service ids are
/// themselves single bytes).
fn apply_service_directory_update(
    directory: &std::sync::Mutex<HashMap<u8, ServiceAddress>>,
    pkt: &QrtrCtrlPkt,
) {
    let service = pkt.service as u8;
    match pkt.cmd {
        QRTR_TYPE_NEW_SERVER => {
            directory.lock().unwrap().insert(service, (pkt.node, pkt.port));
        }
        QRTR_TYPE_DEL_SERVER => {
            directory.lock().unwrap().remove(&service);
        }
        _ => {}
    }
}

/// Reconstructs a [`Message`] from a raw QRTR datagram payload, which
/// carries everything a QMUX frame does except the marker and length
/// (spec.md 4.2.3).
fn decode_qrtr_payload(payload: &[u8]) -> CoreResult<Message> {
    if payload.len() < 4 {
        return Err(CoreError::invalid_message("QRTR datagram shorter than a QMI header"));
    }
    let service = payload[1];
    let client = payload[2];
    let tid_width = if service == SERVICE_CTL { 1 } else { 2 };
    if payload.len() < 4 + tid_width + 4 {
        return Err(CoreError::invalid_message("QRTR datagram too short for its own header"));
    }
    let tid = if service == SERVICE_CTL {
        payload[4] as u16
    } else {
        u16::from_le_bytes([payload[4], payload[5]])
    };
    let message_id_offset = 4 + tid_width;
    let message_id = u16::from_le_bytes([payload[message_id_offset], payload[message_id_offset + 1]]);
    let tlv_len_offset = message_id_offset + 2;
    let tlv_len = u16::from_le_bytes([payload[tlv_len_offset], payload[tlv_len_offset + 1]]) as usize;
    let tlv_start = tlv_len_offset + 2;
    if tlv_start + tlv_len != payload.len() {
        return Err(CoreError::invalid_message("QRTR datagram TLV length does not match its size"));
    }
    Message::new_from_data(service, client, tid, message_id, &payload[tlv_start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;

    fn allocate_request(service: u8, client: u8, tid: u16) -> Message {
        let mut builder = MessageBuilder::new(SERVICE_CTL, client, tid, CTL_ALLOCATE_CID).unwrap();
        let token = builder.tlv_write_init(TLV_ALLOCATION_INFO);
        builder.append_u8(service);
        builder.tlv_write_complete(token).unwrap();
        builder.finish()
    }

    #[test]
    fn allocate_cid_hands_out_sequential_ids() {
        let mut allocator = QrtrCidAllocator::new();
        let request = allocate_request(0x02, 0, 1);
        let response = allocator.handle(&request).unwrap().unwrap();
        let reader = crate::codec::TlvReader::find(&response, TLV_ALLOCATION_INFO).unwrap();
        let mut cursor = 0;
        assert_eq!(reader.read_u8(&mut cursor).unwrap(), 0x02);
        assert_eq!(reader.read_u8(&mut cursor).unwrap(), 1);
    }

    #[test]
    fn release_then_reallocate_reuses_freed_cid() {
        let mut allocator = QrtrCidAllocator::new();
        let alloc_request = allocate_request(0x02, 0, 1);
        let alloc_response = allocator.handle(&alloc_request).unwrap().unwrap();
        let reader = crate::codec::TlvReader::find(&alloc_response, TLV_ALLOCATION_INFO).unwrap();
        let mut cursor = 0;
        let service = reader.read_u8(&mut cursor).unwrap();
        let cid = reader.read_u8(&mut cursor).unwrap();

        let mut builder = MessageBuilder::new(SERVICE_CTL, 0, 2, CTL_RELEASE_CID).unwrap();
        let token = builder.tlv_write_init(TLV_ALLOCATION_INFO);
        builder.append_u8(service);
        builder.append_u8(cid);
        builder.tlv_write_complete(token).unwrap();
        let release_request = builder.finish();
        allocator.handle(&release_request).unwrap().unwrap();

        let second = allocate_request(0x02, 0, 3);
        let second_response = allocator.handle(&second).unwrap().unwrap();
        let reader = crate::codec::TlvReader::find(&second_response, TLV_ALLOCATION_INFO).unwrap();
        let mut cursor = 0;
        reader.read_u8(&mut cursor).unwrap();
        assert_eq!(reader.read_u8(&mut cursor).unwrap(), cid);
    }

    /// spec.md 8.2 scenario 6: allocation hands out the smallest free id,
    /// and releasing cid 1 while cid 2 is still held makes 1 the smallest
    /// free id again, not 3.
    #[test]
    fn first_free_cid_is_reused_after_release() {
        let mut allocator = QrtrCidAllocator::new();

        let first = allocator.handle(&allocate_request(0x02, 0, 1)).unwrap().unwrap();
        let mut cursor = 0;
        let reader = crate::codec::TlvReader::find(&first, TLV_ALLOCATION_INFO).unwrap();
        reader.read_u8(&mut cursor).unwrap();
        assert_eq!(reader.read_u8(&mut cursor).unwrap(), 1);

        let second = allocator.handle(&allocate_request(0x02, 0, 2)).unwrap().unwrap();
        let mut cursor = 0;
        let reader = crate::codec::TlvReader::find(&second, TLV_ALLOCATION_INFO).unwrap();
        reader.read_u8(&mut cursor).unwrap();
        assert_eq!(reader.read_u8(&mut cursor).unwrap(), 2);

        let mut builder = MessageBuilder::new(SERVICE_CTL, 0, 3, CTL_RELEASE_CID).unwrap();
        let token = builder.tlv_write_init(TLV_ALLOCATION_INFO);
        builder.append_u8(0x02);
        builder.append_u8(1);
        builder.tlv_write_complete(token).unwrap();
        allocator.handle(&builder.finish()).unwrap().unwrap();

        let third = allocator.handle(&allocate_request(0x02, 0, 4)).unwrap().unwrap();
        let mut cursor = 0;
        let reader = crate::codec::TlvReader::find(&third, TLV_ALLOCATION_INFO).unwrap();
        reader.read_u8(&mut cursor).unwrap();
        assert_eq!(reader.read_u8(&mut cursor).unwrap(), 1);
    }

    #[test]
    fn get_version_info_is_not_intercepted() {
        let mut allocator = QrtrCidAllocator::new();
        let request = Message::new(SERVICE_CTL, 0, 5, 0x0021).unwrap();
        assert!(allocator.handle(&request).is_none());
    }

    #[test]
    fn sync_is_answered_locally() {
        let mut allocator = QrtrCidAllocator::new();
        let request = Message::new(SERVICE_CTL, 0, 9, CTL_SYNC).unwrap();
        let response = allocator.handle(&request).unwrap().unwrap();
        assert!(response.is_response());
        assert_eq!(response.get_transaction_id(), 9);
    }

    fn ctrl_pkt(cmd: u32, service: u32, instance: u32, node: u32, port: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        buf.extend_from_slice(&cmd.to_le_bytes());
        buf.extend_from_slice(&service.to_le_bytes());
        buf.extend_from_slice(&instance.to_le_bytes());
        buf.extend_from_slice(&node.to_le_bytes());
        buf.extend_from_slice(&port.to_le_bytes());
        buf
    }

    /// spec.md 4.4.1, SUPPLEMENTED FEATURES item 4: a `NEW_SERVER`
    /// announcement on the control port populates the live directory, and a
    /// later `DEL_SERVER` for the same service removes it.
    #[test]
    fn new_server_then_del_server_updates_the_live_directory() {
        let directory = std::sync::Mutex::new(HashMap::new());

        let new_server = parse_qrtr_ctrl_pkt(&ctrl_pkt(QRTR_TYPE_NEW_SERVER, 0x02, 1, 7, 13)).unwrap();
        apply_service_directory_update(&directory, &new_server);
        assert_eq!(directory.lock().unwrap().get(&0x02), Some(&(7, 13)));

        let del_server = parse_qrtr_ctrl_pkt(&ctrl_pkt(QRTR_TYPE_DEL_SERVER, 0x02, 1, 7, 13)).unwrap();
        apply_service_directory_update(&directory, &del_server);
        assert!(directory.lock().unwrap().get(&0x02).is_none());
    }

    #[test]
    fn unrelated_control_packet_types_are_not_decoded_as_server_updates() {
        // QRTR_TYPE_HELLO
        assert!(parse_qrtr_ctrl_pkt(&ctrl_pkt(2, 0, 0, 0, 0)).is_none());
    }

    #[test]
    fn qrtr_payload_roundtrips_through_decode() {
        let original = Message::new(0x03, 4, 77, 0x0010).unwrap();
        let payload = &original.get_raw()[3..];
        let decoded = decode_qrtr_payload(payload).unwrap();
        assert_eq!(decoded.get_service(), 0x03);
        assert_eq!(decoded.get_client_id(), 4);
        assert_eq!(decoded.get_transaction_id(), 77);
        assert_eq!(decoded.get_message_id(), 0x0010);
    }
}
