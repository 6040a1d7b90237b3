//! The QMUX frame codec (spec.md 4.1): message construction/scanning and
//! the TLV reader/writer built on top of it.

pub mod message;
pub mod tlv;

pub use message::{Message, MessageContext, ScanOutcome, CLIENT_BROADCAST, QMUX_MARKER, SERVICE_CTL};
pub use tlv::{Endianness, MessageBuilder, TlvReader, TlvWriteToken};
