//! The QMUX endpoint: a `qmi_wwan` character device, or an abstract UNIX
//! socket to a multiplexing proxy (spec.md 4.2.1, 6.1, 6.3).

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::{SocketAddr as StdUnixSocketAddr, UnixStream as StdUnixStream};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

use slog::{debug, o, warn};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::timeout as tokio_timeout;

use crate::codec::{Message, MessageBuilder, SERVICE_CTL};
use crate::config::DeviceConfig;
use crate::error::{CoreError, CoreResult};

use super::{ensure_open, EndpointEvents, EndpointEventsTx, ScanBuffer};

/// Internal-only message id for the proxy protocol's `internal-proxy-open`
/// request (spec.md 6.3). Not a real libqmi service message id — the
/// proxy wire protocol is private to this endpoint and the proxy binary.
const PROXY_OPEN_MESSAGE_ID: u16 = 0xFF00;
const PROXY_OPEN_PATH_TLV: u8 = 0x01;
const RESULT_TLV: u8 = 0x02;

/// A raw, non-blocking character-device file descriptor wrapped for async
/// readiness (spec.md 4.2.1: "opens the node exclusively in non-blocking
/// mode"). Tokio has no built-in async type for special files, so the
/// device is driven directly off its raw fd via `AsyncFd`, the same
/// pattern tokio itself documents for custom I/O sources.
pub struct DeviceFile {
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
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
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
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
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
    Proxy(UnixStream),
    #[cfg(test)]
    Test(tokio::io::DuplexStream),
}

impl Transport {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Device(d) => d.read(buf).await,
            Transport::Proxy(s) => s.read(buf).await,
            #[cfg(test)]
            Transport::Test(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Transport::Device(d) => d.write_all(buf).await,
            Transport::Proxy(s) => s.write_all(buf).await,
            #[cfg(test)]
            Transport::Test(s) => s.write_all(buf).await,
        }
    }
}

pub struct QmuxEndpoint {
    log: slog::Logger,
    config: DeviceConfig,
    path: String,
    transport: Option<std::sync::Arc<Mutex<Transport>>>,
    rx_task: Option<tokio::task::JoinHandle<()>>,
    events_tx: Option<std::sync::Arc<EndpointEventsTx>>,
}

impl QmuxEndpoint {
    pub fn new(log: slog::Logger, path: impl Into<String>, config: DeviceConfig) -> QmuxEndpoint {
        QmuxEndpoint {
            log: log.new(o!("endpoint" => "qmux")),
            config,
            path: path.into(),
            transport: None,
            rx_task: None,
            events_tx: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_test(log: slog::Logger, stream: tokio::io::DuplexStream) -> (QmuxEndpoint, EndpointEvents) {
        let mut ep = QmuxEndpoint::new(log, "/test/device", DeviceConfig::default());
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

    /// `open(use_proxy, timeout)` (spec.md 4.2, 4.2.1, 6.3).
    pub async fn open(&mut self, use_proxy: bool, timeout: Duration) -> CoreResult<EndpointEvents> {
        if self.is_open() {
            return Err(CoreError::wrong_state("endpoint already open"));
        }

        let transport = if use_proxy {
            tokio_timeout(timeout, self.open_proxy()).await.map_err(|_| CoreError::Timeout)??
        } else {
            self.open_device_node()?
        };

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

    async fn open_proxy(&self) -> CoreResult<Transport> {
        let addr = StdUnixSocketAddr::from_abstract_name(self.config.proxy_socket_path.as_bytes())
            .map_err(CoreError::Io)?;

        let mut last_err = None;
        for attempt in 0..=self.config.proxy_retry_count {
            match StdUnixStream::connect_addr(&addr) {
                Ok(std_stream) => {
                    std_stream.set_nonblocking(true).map_err(CoreError::Io)?;
                    let stream = UnixStream::from_std(std_stream).map_err(CoreError::Io)?;
                    let mut transport = Transport::Proxy(stream);
                    self.proxy_handshake(&mut transport).await?;
                    return Ok(transport);
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt == 0 {
                        self.spawn_proxy_process();
                    }
                    tokio::time::sleep(self.config.proxy_retry_interval).await;
                }
            }
        }
        Err(CoreError::failed(format!(
            "could not connect to proxy after {} retries: {}",
            self.config.proxy_retry_count,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn spawn_proxy_process(&self) {
        debug!(self.log, "spawning proxy process"; "binary" => &self.config.proxy_binary_path);
        let result = Command::new(&self.config.proxy_binary_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn();
        if let Err(e) = result {
            warn!(self.log, "failed to spawn proxy binary"; "error" => %e);
        }
    }

    /// Sends the `internal-proxy-open` request naming this endpoint's
    /// device path and waits for its success, before the background
    /// receive task takes over the transport (spec.md 4.2.1, 6.3).
    async fn proxy_handshake(&self, transport: &mut Transport) -> CoreResult<()> {
        let mut builder = MessageBuilder::new(SERVICE_CTL, 0, 0, PROXY_OPEN_MESSAGE_ID)?;
        let token = builder.tlv_write_init(PROXY_OPEN_PATH_TLV);
        builder.append_string(&self.path, 2)?;
        builder.tlv_write_complete(token)?;
        let request = builder.finish();

        transport.write_all(request.get_raw()).await.map_err(CoreError::Io)?;

        let mut scan = ScanBuffer::new();
        let mut buf = [0u8; 512];
        loop {
            let n = transport.read(&mut buf).await.map_err(CoreError::Io)?;
            if n == 0 {
                return Err(CoreError::failed("proxy closed the connection during handshake"));
            }
            scan.append(&buf[..n]);
            let mut response = None;
            scan.parse_buffer(|m| {
                if response.is_none() {
                    response = Some(m);
                }
            })?;
            if let Some(response) = response {
                use crate::codec::{Endianness, TlvReader};
                let reader = TlvReader::find(&response, RESULT_TLV)?;
                let mut cursor = 0;
                let status = reader.read_u16(&mut cursor, Endianness::Little)?;
                if status != 0 {
                    return Err(CoreError::failed("proxy rejected internal-proxy-open"));
                }
                return Ok(());
            }
        }
    }

    fn spawn_rx_task(&mut self, events_tx: std::sync::Arc<EndpointEventsTx>) {
        let transport = self.transport.clone().expect("transport set before spawning rx task");
        let log = self.log.clone();
        let handle = tokio::spawn(async move {
            let mut scan = ScanBuffer::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = {
                    let mut guard = transport.lock().await;
                    guard.read(&mut buf).await
                };
                match n {
                    Ok(0) => {
                        debug!(log, "transport reached EOF");
                        events_tx.signal_hangup();
                        return;
                    }
                    Ok(n) => {
                        scan.append(&buf[..n]);
                        let mut framing_error = None;
                        let _ = scan.parse_buffer(|m| {
                            let _ = events_tx.messages.send(m);
                        }).map_err(|e| framing_error = Some(e));
                        if let Some(e) = framing_error {
                            warn!(log, "framing error, treating as hangup"; "error" => %e);
                            events_tx.signal_hangup();
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(log, "transport read error"; "error" => %e);
                        events_tx.signal_hangup();
                        return;
                    }
                }
            }
        });
        self.rx_task = Some(handle);
    }

    pub async fn setup_indications(&mut self, _timeout: Duration) -> CoreResult<()> {
        ensure_open(self.is_open())
    }

    pub async fn send(&mut self, message: &Message, _timeout: Duration) -> CoreResult<()> {
        ensure_open(self.is_open())?;
        let transport = self.transport.clone().unwrap();
        let mut guard = transport.lock().await;
        guard.write_all(message.get_raw()).await.map_err(CoreError::Io)
    }

    pub async fn close(&mut self, _timeout: Duration) -> CoreResult<()> {
        if let Some(task) = self.rx_task.take() {
            task.abort();
        }
        self.transport = None;
        self.events_tx = None;
        Ok(())
    }
}
