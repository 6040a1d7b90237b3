//! The QMUX frame: construction, non-destructive scanning, and the cheap
//! accessors every other layer relies on (spec.md 4.1).
//!
//! `Message` is reference-counted (`Arc<[u8]>`) so a decoded frame's
//! validated byte slice is shared between every reader — the sender, the
//! transaction table entry, the trace facility and the endpoint's outbound
//! copy — rather than copied again per-referrer (spec.md 3.3).

use std::sync::Arc;

use crate::error::{CoreError, CoreResult};

/// First byte of every QMUX frame on the wire (spec.md 4.1 / 6.1).
pub const QMUX_MARKER: u8 = 0x01;

/// The control service. Transaction ids are one byte for this service only.
pub const SERVICE_CTL: u8 = 0x00;

/// Client id meaning "broadcast this indication to every client of the service".
pub const CLIENT_BROADCAST: u8 = 0xFF;

const DIRECTION_TO_SERVICE: u8 = 0x00;
const DIRECTION_FROM_SERVICE: u8 = 0x80;

pub(crate) const CTRL_FLAG_RESPONSE: u8 = 0x01;
const CTRL_FLAG_INDICATION: u8 = 0x02;

/// Minimum length of a syntactically possible frame: marker + length(2) +
/// flags + service + client + ctrl_flags + tid(1, CTL) + message_id(2) + tlv_len(2).
const MIN_FRAME_LEN: usize = 1 + 2 + 1 + 1 + 1 + 1 + 1 + 2 + 2;

/// Optional per-call decoration (spec.md 3.1 MessageContext).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageContext {
    pub vendor_id: u16,
}

impl MessageContext {
    pub const GENERIC: MessageContext = MessageContext { vendor_id: 0 };
}

/// Outcome of scanning a receive buffer for one frame (spec.md 4.1 `new_from_raw`).
pub enum ScanOutcome {
    Message(Message),
    NeedMore,
}

/// An immutable, reference-counted QMUX frame.
#[derive(Debug, Clone)]
pub struct Message {
    raw: Arc<[u8]>,
}

impl Message {
    /// `new(service, client, tid, message_id) -> Message`: a zero-TLV request.
    pub fn new(service: u8, client: u8, tid: u16, message_id: u16) -> CoreResult<Message> {
        if service == SERVICE_CTL && tid > 0xFF {
            return Err(CoreError::invalid_args(
                "control-service transaction id must fit in one byte",
            ));
        }
        let mut buf = Vec::with_capacity(MIN_FRAME_LEN);
        buf.push(QMUX_MARKER);
        buf.extend_from_slice(&[0u8; 2]); // length placeholder
        buf.push(DIRECTION_TO_SERVICE);
        buf.push(service);
        buf.push(client);
        buf.push(0); // control flags: request
        Self::push_tid(&mut buf, service, tid);
        buf.extend_from_slice(&message_id.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // tlv length
        Self::finalize_length(&mut buf);
        Ok(Message { raw: buf.into() })
    }

    /// `response_new(request, error_kind) -> Message`: mirror the request's
    /// identifiers, with a 2-TLV result payload `(status, error-code)`.
    /// Used by the QRTR endpoint to synthesize CTL responses (spec.md 4.1, 4.2.3).
    pub fn response_new(request: &Message, status: u16, error_code: u16) -> Message {
        let mut buf = Vec::with_capacity(MIN_FRAME_LEN + 7);
        buf.push(QMUX_MARKER);
        buf.extend_from_slice(&[0u8; 2]);
        buf.push(DIRECTION_FROM_SERVICE);
        buf.push(request.get_service());
        buf.push(request.get_client_id());
        buf.push(CTRL_FLAG_RESPONSE);
        Self::push_tid(&mut buf, request.get_service(), request.get_transaction_id());
        buf.extend_from_slice(&request.get_message_id().to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());

        let tlv_start = buf.len();
        buf.push(0x02); // TLV type 0x02: result code, conventional for QMI
        buf.extend_from_slice(&4u16.to_le_bytes());
        buf.extend_from_slice(&status.to_le_bytes());
        buf.extend_from_slice(&error_code.to_le_bytes());
        let tlv_len = (buf.len() - tlv_start) as u16;

        let tlv_len_offset = Self::tlv_len_offset(request.get_service());
        buf[tlv_len_offset..tlv_len_offset + 2].copy_from_slice(&tlv_len.to_le_bytes());
        Self::finalize_length(&mut buf);
        Message { raw: buf.into() }
    }

    /// Build a frame from raw, already-assembled header fields and a TLV
    /// payload that arrived without a QMUX wrapper (spec.md 4.2.3: the QRTR
    /// endpoint reconstructs a frame per received datagram).
    pub fn new_from_data(service: u8, client: u8, tid: u16, message_id: u16, tlvs: &[u8]) -> CoreResult<Message> {
        if tlvs.len() > u16::MAX as usize {
            return Err(CoreError::TlvTooLong { tlv_type: 0 });
        }
        let mut buf = Vec::with_capacity(MIN_FRAME_LEN + tlvs.len());
        buf.push(QMUX_MARKER);
        buf.extend_from_slice(&[0u8; 2]);
        buf.push(DIRECTION_FROM_SERVICE);
        buf.push(service);
        buf.push(client);
        buf.push(0);
        Self::push_tid(&mut buf, service, tid);
        buf.extend_from_slice(&message_id.to_le_bytes());
        buf.extend_from_slice(&(tlvs.len() as u16).to_le_bytes());
        buf.extend_from_slice(tlvs);
        Self::finalize_length(&mut buf);
        Ok(Message { raw: buf.into() })
    }

    /// Wrap an already-complete raw frame (used by endpoints re-injecting
    /// MBIM/QRTR-derived bytes into the common parser).
    pub(crate) fn from_owned_raw(raw: Vec<u8>) -> Message {
        Message { raw: raw.into() }
    }

    /// Returns a copy of this request with its transaction id replaced.
    /// Callers build requests through [`MessageBuilder`](super::tlv::MessageBuilder)
    /// before a transaction id has been allocated; the transaction manager
    /// retags the finished message right before dispatch (spec.md 4.3 step 2).
    pub(crate) fn retagged(&self, tid: u16) -> CoreResult<Message> {
        if self.get_service() == SERVICE_CTL && tid > 0xFF {
            return Err(CoreError::invalid_args(
                "control-service transaction id must fit in one byte",
            ));
        }
        let mut buf = self.raw.to_vec();
        let tid_width = Self::tid_width_for(self.get_service());
        let tid_bytes = tid.to_le_bytes();
        buf[7..7 + tid_width].copy_from_slice(&tid_bytes[..tid_width]);
        Ok(Message { raw: buf.into() })
    }

    /// `new_from_raw(buffer) -> Message | need-more | error`: scan
    /// non-destructively; the caller is responsible for advancing its
    /// buffer past `message.get_length()` bytes on `Message`.
    pub fn new_from_raw(buffer: &[u8]) -> CoreResult<ScanOutcome> {
        if buffer.is_empty() {
            return Ok(ScanOutcome::NeedMore);
        }
        if buffer[0] != QMUX_MARKER {
            return Err(CoreError::invalid_message(format!(
                "expected marker 0x{:02x}, got 0x{:02x}",
                QMUX_MARKER, buffer[0]
            )));
        }
        if buffer.len() < 3 {
            return Ok(ScanOutcome::NeedMore);
        }
        let len_minus_one = u16::from_le_bytes([buffer[1], buffer[2]]) as usize;
        let total_len = len_minus_one + 1;
        if total_len < MIN_FRAME_LEN {
            return Err(CoreError::invalid_message(format!(
                "frame length {} is shorter than the minimum header",
                total_len
            )));
        }
        if buffer.len() < total_len {
            return Ok(ScanOutcome::NeedMore);
        }

        let service = buffer[4];
        let tid_width = if service == SERVICE_CTL { 1 } else { 2 };
        let message_id_offset = 7 + tid_width;
        let tlv_len_offset = message_id_offset + 2;
        let tlv_start = tlv_len_offset + 2;
        if tlv_start > total_len {
            return Err(CoreError::invalid_message("frame too short for its own header"));
        }
        let tlv_len = u16::from_le_bytes([buffer[tlv_len_offset], buffer[tlv_len_offset + 1]]) as usize;
        if tlv_start + tlv_len != total_len {
            return Err(CoreError::invalid_message("TLV length does not match frame length"));
        }

        Ok(ScanOutcome::Message(Message {
            raw: buffer[..total_len].to_vec().into(),
        }))
    }

    fn push_tid(buf: &mut Vec<u8>, service: u8, tid: u16) {
        if service == SERVICE_CTL {
            buf.push(tid as u8);
        } else {
            buf.extend_from_slice(&tid.to_le_bytes());
        }
    }

    fn tid_width_for(service: u8) -> usize {
        if service == SERVICE_CTL {
            1
        } else {
            2
        }
    }

    fn tlv_len_offset(service: u8) -> usize {
        7 + Self::tid_width_for(service) + 2
    }

    fn finalize_length(buf: &mut Vec<u8>) {
        let total_len = buf.len() as u16;
        let len_minus_one = total_len - 1;
        buf[1..3].copy_from_slice(&len_minus_one.to_le_bytes());
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        let flags = self.raw[6];
        flags & (CTRL_FLAG_RESPONSE | CTRL_FLAG_INDICATION) == 0
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.raw[6] & CTRL_FLAG_RESPONSE != 0
    }

    #[inline]
    pub fn is_indication(&self) -> bool {
        self.raw[6] & CTRL_FLAG_INDICATION != 0
    }

    #[inline]
    pub fn get_service(&self) -> u8 {
        self.raw[4]
    }

    #[inline]
    pub fn get_client_id(&self) -> u8 {
        self.raw[5]
    }

    #[inline]
    pub fn get_transaction_id(&self) -> u16 {
        if self.get_service() == SERVICE_CTL {
            self.raw[7] as u16
        } else {
            u16::from_le_bytes([self.raw[7], self.raw[8]])
        }
    }

    #[inline]
    pub fn get_message_id(&self) -> u16 {
        let off = 7 + Self::tid_width_for(self.get_service());
        u16::from_le_bytes([self.raw[off], self.raw[off + 1]])
    }

    #[inline]
    pub fn get_length(&self) -> usize {
        self.raw.len()
    }

    #[inline]
    pub fn get_raw(&self) -> &[u8] {
        &self.raw
    }

    /// The TLV area, for the codec's reader to scan (spec.md 4.1 TLV reader).
    pub fn tlv_bytes(&self) -> &[u8] {
        let tlv_len_offset = Self::tlv_len_offset(self.get_service());
        &self.raw[tlv_len_offset + 2..]
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.raw.as_ref() == other.raw.as_ref()
    }
}
impl Eq for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_request() {
        let msg = Message::new(0x02, 7, 42, 0x0022).unwrap();
        match Message::new_from_raw(msg.get_raw()).unwrap() {
            ScanOutcome::Message(parsed) => assert_eq!(parsed, msg),
            ScanOutcome::NeedMore => panic!("expected a complete message"),
        }
        assert!(msg.is_request());
        assert_eq!(msg.get_service(), 0x02);
        assert_eq!(msg.get_client_id(), 7);
        assert_eq!(msg.get_transaction_id(), 42);
        assert_eq!(msg.get_message_id(), 0x0022);
    }

    #[test]
    fn ctl_tid_is_one_byte() {
        let msg = Message::new(SERVICE_CTL, 0, 200, 0x0022).unwrap();
        assert_eq!(msg.get_transaction_id(), 200);
        assert!(Message::new(SERVICE_CTL, 0, 300, 0x0022).is_err());
    }

    #[test]
    fn need_more_on_partial_buffer() {
        let msg = Message::new(0x02, 1, 1, 1).unwrap();
        let partial = &msg.get_raw()[..msg.get_length() - 1];
        match Message::new_from_raw(partial).unwrap() {
            ScanOutcome::NeedMore => {}
            ScanOutcome::Message(_) => panic!("should not have parsed a partial frame"),
        }
    }

    #[test]
    fn bad_marker_is_error() {
        let bytes = [0xFFu8, 0, 0, 0, 0];
        assert!(Message::new_from_raw(&bytes).is_err());
    }

    #[test]
    fn response_new_mirrors_request() {
        let request = Message::new(0x02, 3, 5, 0x0020).unwrap();
        let response = Message::response_new(&request, 1, 0x001A);
        assert!(response.is_response());
        assert_eq!(response.get_service(), request.get_service());
        assert_eq!(response.get_client_id(), request.get_client_id());
        assert_eq!(response.get_transaction_id(), request.get_transaction_id());
        assert_eq!(response.get_message_id(), request.get_message_id());
    }
}
