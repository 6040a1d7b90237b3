//! Transport-specific carriers of [`Message`](crate::codec::Message)s
//! (spec.md 4.2).
//!
//! The source's endpoint hierarchy is a GObject base class with three
//! subclasses (`qmi-endpoint.c` + `qmi-endpoint-{qmux,mbim,qrtr}.c`); per
//! spec.md 9 (Design Notes) that becomes a tagged-variant `Endpoint` here,
//! with per-variant state and one shared dispatch surface, rather than
//! dynamic dispatch through a trait object — the three variants' `open`
//! signatures already differ enough (QRTR takes no proxy flag, MBIM opens a
//! nested device) that a single trait would mostly be downcasts anyway.

pub mod mbim;
pub mod qmux;
pub mod qrtr;

use tokio::sync::{mpsc, watch};

use crate::codec::{Message, ScanOutcome};
use crate::error::{CoreError, CoreResult};

pub use mbim::MbimEndpoint;
pub use qmux::QmuxEndpoint;
pub use qrtr::QrtrEndpoint;

/// Accumulates raw transport bytes and extracts complete QMUX frames from
/// them, the role `t51core::net::buffer::Buffer` plays for a `TcpStream`
/// (spec.md 4.2 "accumulate received bytes into a scan buffer").
#[derive(Default)]
pub struct ScanBuffer {
    data: Vec<u8>,
}

impl ScanBuffer {
    pub fn new() -> ScanBuffer {
        ScanBuffer { data: Vec::new() }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// `parse_buffer(handler)`: repeatedly extract complete messages and
    /// invoke `handler` for each, in receive order (spec.md 5 Ordering).
    /// Stops cleanly when the buffer no longer holds a full message;
    /// returns the framing error verbatim (the caller treats it as
    /// hangup, spec.md 4.2 "Framing error policy").
    pub fn parse_buffer(&mut self, mut handler: impl FnMut(Message)) -> CoreResult<()> {
        loop {
            match Message::new_from_raw(&self.data) {
                Ok(ScanOutcome::Message(message)) => {
                    let consumed = message.get_length();
                    self.data.drain(..consumed);
                    handler(message);
                }
                Ok(ScanOutcome::NeedMore) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Channel pair handed to the transaction manager when an endpoint opens:
/// every decoded `Message` arrives on `messages`, and `hangup` flips to
/// `true` exactly once, when the transport dies or a framing error is
/// observed (spec.md 4.2 "emits ... hangup").
pub struct EndpointEvents {
    pub messages: mpsc::UnboundedReceiver<Message>,
    pub hangup: watch::Receiver<bool>,
}

pub(crate) struct EndpointEventsTx {
    pub messages: mpsc::UnboundedSender<Message>,
    pub hangup: watch::Sender<bool>,
}

impl EndpointEventsTx {
    pub(crate) fn new() -> (EndpointEventsTx, EndpointEvents) {
        let (mtx, mrx) = mpsc::unbounded_channel();
        let (htx, hrx) = watch::channel(false);
        (
            EndpointEventsTx { messages: mtx, hangup: htx },
            EndpointEvents { messages: mrx, hangup: hrx },
        )
    }

    pub(crate) fn signal_hangup(&self) {
        let _ = self.hangup.send(true);
    }
}

/// Which driver/transport kind a `Path` resolves to (spec.md 4.4.1 Driver
/// detection). `Auto` is resolved by `Device::open` before an `Endpoint`
/// is constructed, so the `Endpoint` itself is never `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Qmux,
    Mbim,
    Qrtr,
}

/// The tagged-variant endpoint (spec.md 9: replaces the base-class +
/// subclasses hierarchy of the source).
pub enum Endpoint {
    Qmux(QmuxEndpoint),
    Mbim(MbimEndpoint),
    Qrtr(QrtrEndpoint),
}

impl Endpoint {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::Qmux(_) => EndpointKind::Qmux,
            Endpoint::Mbim(_) => EndpointKind::Mbim,
            Endpoint::Qrtr(_) => EndpointKind::Qrtr,
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Endpoint::Qmux(e) => e.is_open(),
            Endpoint::Mbim(e) => e.is_open(),
            Endpoint::Qrtr(e) => e.is_open(),
        }
    }

    pub async fn setup_indications(&mut self, timeout: std::time::Duration) -> CoreResult<()> {
        match self {
            Endpoint::Qmux(e) => e.setup_indications(timeout).await,
            Endpoint::Mbim(e) => e.setup_indications(timeout).await,
            Endpoint::Qrtr(e) => e.setup_indications(timeout).await,
        }
    }

    pub async fn send(&mut self, message: &Message, timeout: std::time::Duration) -> CoreResult<()> {
        match self {
            Endpoint::Qmux(e) => e.send(message, timeout).await,
            Endpoint::Mbim(e) => e.send(message, timeout).await,
            Endpoint::Qrtr(e) => e.send(message, timeout).await,
        }
    }

    pub async fn close(&mut self, timeout: std::time::Duration) -> CoreResult<()> {
        match self {
            Endpoint::Qmux(e) => e.close(timeout).await,
            Endpoint::Mbim(e) => e.close(timeout).await,
            Endpoint::Qrtr(e) => e.close(timeout).await,
        }
    }
}

/// Helper shared by all three variants' `close`: turn "already closed" into
/// success rather than an error, matching `Device::close`'s idempotency
/// (spec.md 4.4.3) one level down.
pub(crate) fn ensure_open(is_open: bool) -> CoreResult<()> {
    if is_open {
        Ok(())
    } else {
        Err(CoreError::wrong_state("endpoint is not open"))
    }
}
