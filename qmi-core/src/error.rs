//! Core error kinds shared by every layer of the stack (codec, endpoint,
//! transaction manager, device, net port manager).
//!
//! One flat enum rather than per-layer error types: callers match on the
//! kind table regardless of which layer raised it, a single currency
//! passed up through codec, endpoint, transaction and device alike.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("operation failed: {0}")]
    Failed(String),

    #[error("device or endpoint used in the wrong state: {0}")]
    WrongState(String),

    #[error("operation timed out")]
    Timeout,

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("TLV 0x{tlv_type:02x} not found")]
    TlvNotFound { tlv_type: u8 },

    #[error("TLV 0x{tlv_type:02x} would exceed the 16-bit length limit")]
    TlvTooLong { tlv_type: u8 },

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("service not supported by this device: {service}")]
    Unsupported { service: String },

    #[error("unexpected message id: expected 0x{expected:04x}, got 0x{got:04x}")]
    UnexpectedMessage { expected: u16, got: u16 },

    /// A transaction id already in the pending table was reused before its
    /// original response arrived (spec.md 7: distinguished from a generic
    /// protocol error so callers can tell tid exhaustion/wraparound apart
    /// from a malformed response).
    #[error("transaction ({service:#04x}, {client:#04x}, {tid}) overwritten before its response arrived")]
    TransactionOverwritten { service: u8, client: u8, tid: u16 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn failed(msg: impl Into<String>) -> Self {
        CoreError::Failed(msg.into())
    }

    pub fn wrong_state(msg: impl Into<String>) -> Self {
        CoreError::WrongState(msg.into())
    }

    pub fn invalid_args(msg: impl Into<String>) -> Self {
        CoreError::InvalidArgs(msg.into())
    }

    pub fn invalid_message(msg: impl Into<String>) -> Self {
        CoreError::InvalidMessage(msg.into())
    }

    pub fn aborted(msg: impl Into<String>) -> Self {
        CoreError::Aborted(msg.into())
    }

    /// Whether this transaction's failure is the "endpoint hangup" shared error
    /// described in spec.md 4.3.6 / 7 (Fatal vs non-fatal).
    pub fn is_hangup(&self) -> bool {
        matches!(self, CoreError::Failed(msg) if msg == HANGUP_MESSAGE)
    }

    pub fn hangup() -> Self {
        CoreError::Failed(HANGUP_MESSAGE.to_string())
    }
}

const HANGUP_MESSAGE: &str = "endpoint hangup";

impl Clone for CoreError {
    fn clone(&self) -> Self {
        match self {
            CoreError::Failed(s) => CoreError::Failed(s.clone()),
            CoreError::WrongState(s) => CoreError::WrongState(s.clone()),
            CoreError::Timeout => CoreError::Timeout,
            CoreError::InvalidArgs(s) => CoreError::InvalidArgs(s.clone()),
            CoreError::InvalidMessage(s) => CoreError::InvalidMessage(s.clone()),
            CoreError::TlvNotFound { tlv_type } => CoreError::TlvNotFound { tlv_type: *tlv_type },
            CoreError::TlvTooLong { tlv_type } => CoreError::TlvTooLong { tlv_type: *tlv_type },
            CoreError::Aborted(s) => CoreError::Aborted(s.clone()),
            CoreError::Unsupported { service } => CoreError::Unsupported { service: service.clone() },
            CoreError::UnexpectedMessage { expected, got } => {
                CoreError::UnexpectedMessage { expected: *expected, got: *got }
            }
            CoreError::TransactionOverwritten { service, client, tid } => {
                CoreError::TransactionOverwritten { service: *service, client: *client, tid: *tid }
            }
            CoreError::Io(e) => CoreError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}
