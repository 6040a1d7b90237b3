//! The MBIM endpoint: QMI encapsulated inside MBIM `COMMAND` /
//! `COMMAND_DONE` / `INDICATE_STATUS` container messages over the MBIM
//! character device (spec.md 4.2.2, 6.2).

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use slog::{debug, o, warn};
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;

use crate::codec::Message;
use crate::config::DeviceConfig;
use crate::error::{CoreError, CoreResult};

use super::{ensure_open, EndpointEvents, EndpointEventsTx};

const MBIM_OPEN_MSG: u32 = 1;
const MBIM_OPEN_DONE: u32 = 2;
const MBIM_CLOSE_MSG: u32 = 3;
const MBIM_CLOSE_DONE: u32 = 4;
const MBIM_COMMAND_MSG: u32 = 5;
const MBIM_COMMAND_DONE: u32 = 6;
const MBIM_INDICATE_STATUS_MSG: u32 = 7;
const MBIM_HOST_ERROR_MSG: u32 = 8;

const MBIM_COMMAND_TYPE_QUERY: u32 = 0;
const MBIM_COMMAND_TYPE_SET: u32 = 1;

/// Fixed-header width shared by every MBIM message: MessageType, MessageLength, TransactionId.
const MBIM_HEADER_LEN: usize = 12;
/// Width of the fragment header that follows the fixed header on every
/// message kind this endpoint deals in: TotalFragments, CurrentFragment.
const MBIM_FRAGMENT_HEADER_LEN: usize = 8;
/// DeviceServiceId(16) + CID(4) + CommandType(4) + InformationBufferLength(4).
const MBIM_COMMAND_FIXED_LEN: usize = 16 + 4 + 4 + 4;

/// The QMI service's UUID within MBIM's service namespace (spec.md 6.2).
const QMI_SERVICE_UUID: [u8; 16] = [
    0xd1, 0xa3, 0x0b, 0xc2, 0xf9, 0x7a, 0x6e, 0x43, 0xbf, 0x65, 0xc7, 0xe2, 0x4f, 0xb0, 0xf0, 0xd3,
];
const QMI_MSG_CID: u32 = 1;

struct DeviceFile {
    inner: AsyncFd<OwnedFd>,
}

impl DeviceFile {
    fn new(fd: OwnedFd) -> io::Result<DeviceFile> {
        Ok(DeviceFile { inner: AsyncFd::new(fd)? })
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            let result = guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
            });
            match result {
                Ok(inner_result) => return inner_result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let mut guard = self.inner.writable().await?;
            let result = guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
                if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
            });
            match result {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => buf = &buf[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

enum Transport {
    Device(DeviceFile),
    #[cfg(test)]
    Test(tokio::io::DuplexStream),
}

impl Transport {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Device(d) => d.read(buf).await,
            #[cfg(test)]
            Transport::Test(s) => {
                use tokio::io::AsyncReadExt;
                s.read(buf).await
            }
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Transport::Device(d) => d.write_all(buf).await,
            #[cfg(test)]
            Transport::Test(s) => {
                use tokio::io::AsyncWriteExt;
                s.write_all(buf).await
            }
        }
    }
}

/// Reassembles MBIM message fragments into one complete container before
/// it's handed to the caller (spec.md 4.2.2: "fragments are reassembled in
/// TotalFragments/CurrentFragment order before the QMI payload is extracted").
#[derive(Default)]
struct FragmentBuffer {
    pending: VecDeque<(u32, u32, u32, Vec<u8>)>,
}

/// A fully reassembled MBIM container: its message type, transaction id,
/// and concatenated payload past the fixed + fragment header.
struct MbimContainer {
    message_type: u32,
    transaction_id: u32,
    payload: Vec<u8>,
}

fn parse_one(buffer: &[u8]) -> CoreResult<Option<(MbimContainer, usize)>> {
    if buffer.len() < MBIM_HEADER_LEN {
        return Ok(None);
    }
    let message_type = LittleEndian::read_u32(&buffer[0..4]);
    let message_length = LittleEndian::read_u32(&buffer[4..8]) as usize;
    let transaction_id = LittleEndian::read_u32(&buffer[8..12]);
    if buffer.len() < message_length {
        return Ok(None);
    }
    if message_length < MBIM_HEADER_LEN {
        return Err(CoreError::invalid_message("MBIM message shorter than its fixed header"));
    }

    let has_fragment_header = matches!(
        message_type,
        MBIM_COMMAND_MSG | MBIM_COMMAND_DONE | MBIM_INDICATE_STATUS_MSG
    );
    let payload_start = if has_fragment_header {
        if message_length < MBIM_HEADER_LEN + MBIM_FRAGMENT_HEADER_LEN {
            return Err(CoreError::invalid_message("MBIM message too short for a fragment header"));
        }
        MBIM_HEADER_LEN + MBIM_FRAGMENT_HEADER_LEN
    } else {
        MBIM_HEADER_LEN
    };

    let payload = buffer[payload_start..message_length].to_vec();
    Ok(Some((MbimContainer { message_type, transaction_id, payload }, message_length)))
}

fn fragment_counts(message_type: u32, buffer: &[u8]) -> (u32, u32) {
    if matches!(message_type, MBIM_COMMAND_MSG | MBIM_COMMAND_DONE | MBIM_INDICATE_STATUS_MSG)
        && buffer.len() >= MBIM_HEADER_LEN + MBIM_FRAGMENT_HEADER_LEN
    {
        let total = LittleEndian::read_u32(&buffer[12..16]);
        let current = LittleEndian::read_u32(&buffer[16..20]);
        (total, current)
    } else {
        (1, 0)
    }
}

impl FragmentBuffer {
    /// Feeds one raw, already-length-delimited MBIM message. Returns the
    /// reassembled container once its last fragment arrives.
    fn feed(&mut self, message_type: u32, transaction_id: u32, raw: &[u8]) -> Option<MbimContainer> {
        let (total, current) = fragment_counts(message_type, raw);
        let payload = match parse_one(raw) {
            Ok(Some((container, _))) => container.payload,
            _ => return None,
        };

        if total <= 1 {
            return Some(MbimContainer { message_type, transaction_id, payload });
        }

        if current == 0 {
            self.pending.push_back((message_type, transaction_id, total, payload));
        } else if let Some(slot) = self
            .pending
            .iter_mut()
            .find(|(mt, tid, _, _)| *mt == message_type && *tid == transaction_id)
        {
            slot.3.extend_from_slice(&payload);
        }

        if current + 1 == total {
            if let Some(pos) = self
                .pending
                .iter()
                .position(|(mt, tid, _, _)| *mt == message_type && *tid == transaction_id)
            {
                let (message_type, transaction_id, _, payload) = self.pending.remove(pos).unwrap();
                return Some(MbimContainer { message_type, transaction_id, payload });
            }
        }
        None
    }
}

pub struct MbimEndpoint {
    log: slog::Logger,
    path: String,
    #[allow(dead_code)]
    config: DeviceConfig,
    transport: Option<std::sync::Arc<Mutex<Transport>>>,
    rx_task: Option<tokio::task::JoinHandle<()>>,
    events_tx: Option<std::sync::Arc<EndpointEventsTx>>,
    next_mbim_tid: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl MbimEndpoint {
    pub fn new(log: slog::Logger, path: impl Into<String>, config: DeviceConfig) -> MbimEndpoint {
        MbimEndpoint {
            log: log.new(o!("endpoint" => "mbim")),
            path: path.into(),
            config,
            transport: None,
            rx_task: None,
            events_tx: None,
            next_mbim_tid: std::sync::Arc::new(std::sync::atomic::AtomicU32::new(1)),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_test(log: slog::Logger, stream: tokio::io::DuplexStream) -> (MbimEndpoint, EndpointEvents) {
        let mut ep = MbimEndpoint::new(log, "/test/mbim-device", DeviceConfig::default());
        let (events_tx, events) = EndpointEventsTx::new();
        let events_tx = std::sync::Arc::new(events_tx);
        ep.transport = Some(std::sync::Arc::new(Mutex::new(Transport::Test(stream))));
        ep.events_tx = Some(events_tx.clone());
        ep.spawn_rx_task(events_tx);
        (ep, events)
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    fn next_tid(&self) -> u32 {
        self.next_mbim_tid.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    fn header(message_type: u32, transaction_id: u32, total_len: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MBIM_HEADER_LEN);
        buf.extend_from_slice(&message_type.to_le_bytes());
        buf.extend_from_slice(&total_len.to_le_bytes());
        buf.extend_from_slice(&transaction_id.to_le_bytes());
        buf
    }

    /// `open(timeout)`: MBIM's own OPEN_MSG/OPEN_DONE handshake, unrelated to
    /// the transaction manager above it (spec.md 4.2.2, 6.2).
    pub async fn open(&mut self, timeout: Duration) -> CoreResult<EndpointEvents> {
        if self.is_open() {
            return Err(CoreError::wrong_state("endpoint already open"));
        }
        let mut transport = self.open_device_node()?;

        let tid = self.next_tid();
        let mut open_msg = Self::header(MBIM_OPEN_MSG, tid, (MBIM_HEADER_LEN + 4) as u32);
        open_msg.extend_from_slice(&4096u32.to_le_bytes()); // MaxControlTransfer
        tokio::time::timeout(timeout, transport.write_all(&open_msg))
            .await
            .map_err(|_| CoreError::Timeout)?
            .map_err(CoreError::Io)?;

        let mut buf = vec![0u8; 512];
        loop {
            let n = tokio::time::timeout(timeout, transport.read(&mut buf))
                .await
                .map_err(|_| CoreError::Timeout)?
                .map_err(CoreError::Io)?;
            if n == 0 {
                return Err(CoreError::failed("MBIM device closed during OPEN handshake"));
            }
            if let Some((container, _)) = parse_one(&buf[..n])? {
                if container.message_type == MBIM_OPEN_DONE {
                    let status = if container.payload.len() >= 4 {
                        LittleEndian::read_u32(&container.payload[..4])
                    } else {
                        1
                    };
                    if status != 0 {
                        return Err(CoreError::failed("MBIM OPEN_DONE reported an error status"));
                    }
                    break;
                }
            }
        }

        let (events_tx, events) = EndpointEventsTx::new();
        let events_tx = std::sync::Arc::new(events_tx);
        self.transport = Some(std::sync::Arc::new(Mutex::new(transport)));
        self.events_tx = Some(events_tx.clone());
        self.spawn_rx_task(events_tx);
        Ok(events)
    }

    fn open_device_node(&self) -> CoreResult<Transport> {
        use nix::fcntl::{open, OFlag};
        use nix::sys::stat::Mode;
        let fd = open(
            self.path.as_str(),
            OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_NOCTTY,
            Mode::empty(),
        )
        .map_err(|e| CoreError::Io(io::Error::from_raw_os_error(e as i32)))?;
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Transport::Device(DeviceFile::new(owned)?))
    }

    fn spawn_rx_task(&mut self, events_tx: std::sync::Arc<EndpointEventsTx>) {
        let transport = self.transport.clone().expect("transport set before spawning rx task");
        let log = self.log.clone();
        let handle = tokio::spawn(async move {
            let mut fragments = FragmentBuffer::default();
            let mut carry = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = {
                    let mut guard = transport.lock().await;
                    guard.read(&mut buf).await
                };
                let n = match n {
                    Ok(0) => {
                        debug!(log, "MBIM transport reached EOF");
                        events_tx.signal_hangup();
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(log, "MBIM transport read error"; "error" => %e);
                        events_tx.signal_hangup();
                        return;
                    }
                };
                carry.extend_from_slice(&buf[..n]);

                loop {
                    match parse_one(&carry) {
                        Ok(Some((container, consumed))) => {
                            let raw = carry[..consumed].to_vec();
                            carry.drain(..consumed);
                            if let Some(done) =
                                fragments.feed(container.message_type, container.transaction_id, &raw)
                            {
                                if done.message_type == MBIM_COMMAND_DONE
                                    || done.message_type == MBIM_INDICATE_STATUS_MSG
                                {
                                    if let Some(message) = decode_qmi_payload(&done) {
                                        let _ = events_tx.messages.send(message);
                                    }
                                } else if done.message_type == MBIM_HOST_ERROR_MSG {
                                    warn!(log, "MBIM host error message received, treating as hangup");
                                    events_tx.signal_hangup();
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(log, "MBIM framing error, treating as hangup"; "error" => %e);
                            events_tx.signal_hangup();
                            return;
                        }
                    }
                }
            }
        });
        self.rx_task = Some(handle);
    }

    pub async fn setup_indications(&mut self, _timeout: Duration) -> CoreResult<()> {
        ensure_open(self.is_open())
    }

    /// Wraps the QMUX-framed `message` in an MBIM COMMAND_MSG addressed to
    /// the QMI service UUID/CID (spec.md 4.2.2, 6.2). Fragmentation of
    /// oversized requests is left unimplemented here: every request this
    /// library builds fits in one MaxControlTransfer-sized fragment.
    pub async fn send(&mut self, message: &Message, timeout: Duration) -> CoreResult<()> {
        ensure_open(self.is_open())?;
        let tid = self.next_tid();

        let information_buffer = message.get_raw();
        let fixed_len = MBIM_COMMAND_FIXED_LEN + information_buffer.len();
        let total_len = MBIM_HEADER_LEN + MBIM_FRAGMENT_HEADER_LEN + fixed_len;

        let mut buf = Self::header(MBIM_COMMAND_MSG, tid, total_len as u32);
        buf.extend_from_slice(&1u32.to_le_bytes()); // TotalFragments
        buf.extend_from_slice(&0u32.to_le_bytes()); // CurrentFragment
        buf.extend_from_slice(&QMI_SERVICE_UUID);
        buf.extend_from_slice(&QMI_MSG_CID.to_le_bytes());
        let command_type = if message.is_request() { MBIM_COMMAND_TYPE_SET } else { MBIM_COMMAND_TYPE_QUERY };
        buf.extend_from_slice(&command_type.to_le_bytes());
        buf.extend_from_slice(&(information_buffer.len() as u32).to_le_bytes());
        buf.extend_from_slice(information_buffer);

        let transport = self.transport.clone().unwrap();
        let mut guard = transport.lock().await;
        tokio::time::timeout(timeout, guard.write_all(&buf))
            .await
            .map_err(|_| CoreError::Timeout)?
            .map_err(CoreError::Io)
    }

    pub async fn close(&mut self, timeout: Duration) -> CoreResult<()> {
        if let Some(transport) = self.transport.clone() {
            let tid = self.next_tid();
            let close_msg = Self::header(MBIM_CLOSE_MSG, tid, MBIM_HEADER_LEN as u32);
            let mut guard = transport.lock().await;
            let _ = tokio::time::timeout(timeout, guard.write_all(&close_msg)).await;
        }
        if let Some(task) = self.rx_task.take() {
            task.abort();
        }
        self.transport = None;
        self.events_tx = None;
        Ok(())
    }
}

/// A `COMMAND_DONE`/`INDICATE_STATUS` container's payload, past its own
/// DeviceServiceId/CID/Status/InformationBufferLength, is the raw QMUX
/// frame this endpoint re-wraps (spec.md 4.2.2: "the information buffer of
/// a COMMAND_DONE targeting the QMI service UUID is itself a complete QMUX
/// message").
fn decode_qmi_payload(container: &MbimContainer) -> Option<Message> {
    const STATUS_DONE_FIXED_LEN: usize = 16 + 4 + 4 + 4; // uuid + cid + status + info_len
    if container.message_type == MBIM_COMMAND_DONE {
        if container.payload.len() < STATUS_DONE_FIXED_LEN {
            return None;
        }
        if container.payload[..16] != QMI_SERVICE_UUID {
            return None;
        }
        let info_len = LittleEndian::read_u32(&container.payload[24..28]) as usize;
        let info = container.payload.get(STATUS_DONE_FIXED_LEN..STATUS_DONE_FIXED_LEN + info_len)?;
        reframe(info)
    } else if container.message_type == MBIM_INDICATE_STATUS_MSG {
        const INDICATE_FIXED_LEN: usize = 16 + 4 + 4;
        if container.payload.len() < INDICATE_FIXED_LEN {
            return None;
        }
        if container.payload[..16] != QMI_SERVICE_UUID {
            return None;
        }
        let info_len = LittleEndian::read_u32(&container.payload[20..24]) as usize;
        let info = container.payload.get(INDICATE_FIXED_LEN..INDICATE_FIXED_LEN + info_len)?;
        reframe(info)
    } else {
        None
    }
}

fn reframe(info: &[u8]) -> Option<Message> {
    match Message::new_from_raw(info) {
        Ok(crate::codec::ScanOutcome::Message(message)) => Some(message),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header(message_type: u32, tid: u32, len: u32) -> Vec<u8> {
        MbimEndpoint::header(message_type, tid, len)
    }

    #[test]
    fn single_fragment_passes_straight_through() {
        let mut fragments = FragmentBuffer::default();
        let mut raw = test_header(MBIM_COMMAND_DONE, 1, MBIM_HEADER_LEN as u32 + MBIM_FRAGMENT_HEADER_LEN as u32);
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes());
        let done = fragments.feed(MBIM_COMMAND_DONE, 1, &raw);
        assert!(done.is_some());
    }

    #[test]
    fn two_fragment_message_reassembles_in_order() {
        let mut fragments = FragmentBuffer::default();

        let payload_a = vec![0xAAu8; 4];
        let payload_b = vec![0xBBu8; 4];
        let total_len_a = (MBIM_HEADER_LEN + MBIM_FRAGMENT_HEADER_LEN + payload_a.len()) as u32;
        let total_len_b = (MBIM_HEADER_LEN + MBIM_FRAGMENT_HEADER_LEN + payload_b.len()) as u32;

        let mut frag0 = test_header(MBIM_COMMAND_DONE, 7, total_len_a);
        frag0.extend_from_slice(&2u32.to_le_bytes());
        frag0.extend_from_slice(&0u32.to_le_bytes());
        frag0.extend_from_slice(&payload_a);

        let mut frag1 = test_header(MBIM_COMMAND_DONE, 7, total_len_b);
        frag1.extend_from_slice(&2u32.to_le_bytes());
        frag1.extend_from_slice(&1u32.to_le_bytes());
        frag1.extend_from_slice(&payload_b);

        assert!(fragments.feed(MBIM_COMMAND_DONE, 7, &frag0).is_none());
        let done = fragments.feed(MBIM_COMMAND_DONE, 7, &frag1).unwrap();
        assert_eq!(done.payload, [payload_a, payload_b].concat());
    }

    #[test]
    fn decode_rejects_non_qmi_uuid() {
        let mut payload = vec![0u8; STATUS_DONE_FIXED_LEN_FOR_TEST];
        payload[16..20].copy_from_slice(&0u32.to_le_bytes());
        let container = MbimContainer { message_type: MBIM_COMMAND_DONE, transaction_id: 1, payload };
        assert!(decode_qmi_payload(&container).is_none());
    }

    const STATUS_DONE_FIXED_LEN_FOR_TEST: usize = 16 + 4 + 4 + 4;
}
