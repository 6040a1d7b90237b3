//! TLV reader/writer and the request builder that assembles TLVs into a
//! finished [`Message`](super::message::Message) (spec.md 4.1).
//!
//! `Message` itself stays immutable and shared (as a service publisher to
//! multiple referrers, spec.md 3.3); `MessageBuilder` is the single mutable
//! owner while a request's TLV area is under construction, handed off to
//! become an immutable `Message` once the frame is complete.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{CoreError, CoreResult};

use super::message::{Message, CTRL_FLAG_RESPONSE, SERVICE_CTL};

/// Endianness of a TLV value's bytes on the wire. The frame header itself
/// is unconditionally little-endian (spec.md 4.1); individual TLV values
/// may specify either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// A request under construction. Call [`MessageBuilder::new`], append TLVs
/// with [`tlv_write_init`](Self::tlv_write_init) /
/// [`tlv_write_complete`](Self::tlv_write_complete), then [`finish`](Self::finish).
pub struct MessageBuilder {
    buf: Vec<u8>,
    service: u8,
    tlv_area_start: usize,
}

/// A handle to a TLV currently being written. Must be completed or reset
/// before the next `tlv_write_init` call.
pub struct TlvWriteToken {
    /// Offset of the TLV's `type` byte in the builder's buffer.
    start: usize,
}

impl MessageBuilder {
    pub fn new(service: u8, client: u8, tid: u16, message_id: u16) -> CoreResult<MessageBuilder> {
        // Reuse Message::new to get a correctly laid out zero-TLV header,
        // then treat its bytes as the seed buffer for TLV appends.
        let seed = Message::new(service, client, tid, message_id)?;
        Ok(MessageBuilder {
            tlv_area_start: seed.get_raw().len(),
            buf: seed.get_raw().to_vec(),
            service,
        })
    }

    fn tlv_len_offset(&self) -> usize {
        let tid_width = if self.service == SERVICE_CTL { 1 } else { 2 };
        7 + tid_width + 2
    }

    /// Flips the control-flags byte from request to response, for callers
    /// synthesizing a reply with a builder rather than with
    /// [`Message::response_new`] (spec.md 4.2.3 QRTR CID synthesis).
    pub fn mark_as_response(&mut self) {
        self.buf[6] |= CTRL_FLAG_RESPONSE;
    }

    /// `tlv_write_init(type) -> token`: open a new TLV.
    pub fn tlv_write_init(&mut self, tlv_type: u8) -> TlvWriteToken {
        let start = self.buf.len();
        self.buf.push(tlv_type);
        self.buf.extend_from_slice(&[0u8; 2]); // length placeholder
        TlvWriteToken { start }
    }

    /// `tlv_write_reset(token)`: discard the in-progress TLV.
    pub fn tlv_write_reset(&mut self, token: TlvWriteToken) {
        self.buf.truncate(token.start);
    }

    /// `tlv_write_complete(token)`: backfill the TLV length and the frame length.
    pub fn tlv_write_complete(&mut self, token: TlvWriteToken) -> CoreResult<()> {
        let value_len = self.buf.len() - token.start - 3;
        if value_len > u16::MAX as usize {
            return Err(CoreError::TlvTooLong { tlv_type: self.buf[token.start] });
        }
        self.buf[token.start + 1..token.start + 3].copy_from_slice(&(value_len as u16).to_le_bytes());

        let total_tlv_len = self.buf.len() - self.tlv_area_start;
        if total_tlv_len > u16::MAX as usize {
            return Err(CoreError::TlvTooLong { tlv_type: self.buf[token.start] });
        }
        let tlv_len_offset = self.tlv_len_offset();
        self.buf[tlv_len_offset..tlv_len_offset + 2]
            .copy_from_slice(&(total_tlv_len as u16).to_le_bytes());
        Ok(())
    }

    fn write_uint(&mut self, value: u64, width: usize, endianness: Endianness) {
        let mut bytes = [0u8; 8];
        match endianness {
            Endianness::Little => LittleEndian::write_u64(&mut bytes, value),
            Endianness::Big => BigEndian::write_u64(&mut bytes, value << (8 * (8 - width))),
        }
        match endianness {
            Endianness::Little => self.buf.extend_from_slice(&bytes[..width]),
            Endianness::Big => self.buf.extend_from_slice(&bytes[..width]),
        }
    }

    pub fn append_u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    pub fn append_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }
    pub fn append_u16(&mut self, v: u16, e: Endianness) {
        self.write_uint(v as u64, 2, e);
    }
    pub fn append_i16(&mut self, v: i16, e: Endianness) {
        self.write_uint(v as u16 as u64, 2, e);
    }
    pub fn append_u32(&mut self, v: u32, e: Endianness) {
        self.write_uint(v as u64, 4, e);
    }
    pub fn append_i32(&mut self, v: i32, e: Endianness) {
        self.write_uint(v as u32 as u64, 4, e);
    }
    pub fn append_u64(&mut self, v: u64, e: Endianness) {
        self.write_uint(v, 8, e);
    }
    pub fn append_i64(&mut self, v: i64, e: Endianness) {
        self.write_uint(v as u64, 8, e);
    }

    /// Appends a sized unsigned integer (`width` in `1..=8` bytes) — used for
    /// the odd-width fields several QMI services define.
    pub fn append_sized_uint(&mut self, value: u64, width: usize, e: Endianness) {
        self.write_uint(value, width, e);
    }

    /// Length-prefixed string; `prefix_len` is 0, 1 or 2 bytes (spec.md 4.1).
    pub fn append_string(&mut self, s: &str, prefix_len: u8) -> CoreResult<()> {
        match prefix_len {
            0 => {}
            1 => {
                if s.len() > u8::MAX as usize {
                    return Err(CoreError::invalid_args("string too long for a 1-byte length prefix"));
                }
                self.buf.push(s.len() as u8);
            }
            2 => {
                if s.len() > u16::MAX as usize {
                    return Err(CoreError::TlvTooLong { tlv_type: 0 });
                }
                self.buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
            }
            other => return Err(CoreError::invalid_args(format!("invalid string length prefix width {other}"))),
        }
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    /// Append raw bytes, e.g. a nested/pre-encoded sub-structure.
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn finish(self) -> Message {
        let mut buf = self.buf;
        let total_len = (buf.len() - 1) as u16;
        buf[1..3].copy_from_slice(&total_len.to_le_bytes());
        Message::from_owned_raw(buf)
    }
}

/// A read-only cursor over one TLV's value bytes.
pub struct TlvReader<'a> {
    data: &'a [u8],
}

impl<'a> TlvReader<'a> {
    /// `tlv_read_init(type) -> (offset, length) | not-found`: scan the
    /// message's TLV area for `tlv_type` and return a cursor over its value.
    pub fn find(message: &'a Message, tlv_type: u8) -> CoreResult<TlvReader<'a>> {
        let area = message.tlv_bytes();
        let mut pos = 0usize;
        while pos + 3 <= area.len() {
            let this_type = area[pos];
            let len = u16::from_le_bytes([area[pos + 1], area[pos + 2]]) as usize;
            let value_start = pos + 3;
            if value_start + len > area.len() {
                return Err(CoreError::invalid_message("TLV value runs past the frame"));
            }
            if this_type == tlv_type {
                return Ok(TlvReader { data: &area[value_start..value_start + len] });
            }
            pos = value_start + len;
        }
        Err(CoreError::TlvNotFound { tlv_type })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn read_uint(&self, cursor: &mut usize, width: usize, e: Endianness) -> CoreResult<u64> {
        if *cursor + width > self.data.len() {
            return Err(CoreError::invalid_message("TLV read past end of value"));
        }
        let slice = &self.data[*cursor..*cursor + width];
        let value = match e {
            Endianness::Little => {
                let mut bytes = [0u8; 8];
                bytes[..width].copy_from_slice(slice);
                LittleEndian::read_uint(&bytes, 8) & mask(width)
            }
            Endianness::Big => BigEndian::read_uint(slice, width),
        };
        *cursor += width;
        Ok(value)
    }

    pub fn read_u8(&self, cursor: &mut usize) -> CoreResult<u8> {
        Ok(self.read_uint(cursor, 1, Endianness::Little)? as u8)
    }
    pub fn read_i8(&self, cursor: &mut usize) -> CoreResult<i8> {
        Ok(self.read_u8(cursor)? as i8)
    }
    pub fn read_u16(&self, cursor: &mut usize, e: Endianness) -> CoreResult<u16> {
        Ok(self.read_uint(cursor, 2, e)? as u16)
    }
    pub fn read_i16(&self, cursor: &mut usize, e: Endianness) -> CoreResult<i16> {
        Ok(self.read_u16(cursor, e)? as i16)
    }
    pub fn read_u32(&self, cursor: &mut usize, e: Endianness) -> CoreResult<u32> {
        Ok(self.read_uint(cursor, 4, e)? as u32)
    }
    pub fn read_i32(&self, cursor: &mut usize, e: Endianness) -> CoreResult<i32> {
        Ok(self.read_u32(cursor, e)? as i32)
    }
    pub fn read_u64(&self, cursor: &mut usize, e: Endianness) -> CoreResult<u64> {
        self.read_uint(cursor, 8, e)
    }
    pub fn read_i64(&self, cursor: &mut usize, e: Endianness) -> CoreResult<i64> {
        Ok(self.read_u64(cursor, e)? as i64)
    }

    pub fn read_sized_uint(&self, cursor: &mut usize, width: usize, e: Endianness) -> CoreResult<u64> {
        self.read_uint(cursor, width, e)
    }

    /// Length-prefixed string; `prefix_len` is 0 (consumes the rest of the
    /// TLV), 1 or 2 bytes.
    pub fn read_string(&self, cursor: &mut usize, prefix_len: u8) -> CoreResult<String> {
        let len = match prefix_len {
            0 => self.data.len() - *cursor,
            1 => self.read_uint(cursor, 1, Endianness::Little)? as usize,
            2 => self.read_uint(cursor, 2, Endianness::Little)? as usize,
            other => return Err(CoreError::invalid_args(format!("invalid string length prefix width {other}"))),
        };
        if *cursor + len > self.data.len() {
            return Err(CoreError::invalid_message("string TLV runs past end of value"));
        }
        let bytes = &self.data[*cursor..*cursor + len];
        *cursor += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| CoreError::invalid_message("TLV string is not valid UTF-8"))
    }

    /// Raw access to a nested sub-structure of `len` bytes.
    pub fn read_bytes(&self, cursor: &mut usize, len: usize) -> CoreResult<&'a [u8]> {
        if *cursor + len > self.data.len() {
            return Err(CoreError::invalid_message("nested TLV read past end of value"));
        }
        let slice = &self.data[*cursor..*cursor + len];
        *cursor += len;
        Ok(slice)
    }
}

fn mask(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::message::SERVICE_CTL;

    #[test]
    fn write_then_read_scalar_tlvs() {
        let mut builder = MessageBuilder::new(0x02, 4, 9, 0x0020).unwrap();
        let token = builder.tlv_write_init(0x01);
        builder.append_u32(0xdead_beef, Endianness::Little);
        builder.append_string("hello", 1);
        builder.tlv_write_complete(token).unwrap();
        let message = builder.finish();

        let reader = TlvReader::find(&message, 0x01).unwrap();
        let mut cursor = 0;
        assert_eq!(reader.read_u32(&mut cursor, Endianness::Little).unwrap(), 0xdead_beef);
        assert_eq!(reader.read_string(&mut cursor, 1).unwrap(), "hello");
    }

    #[test]
    fn missing_tlv_is_not_found() {
        let builder = MessageBuilder::new(0x02, 4, 9, 0x0020).unwrap();
        let message = builder.finish();
        assert!(matches!(
            TlvReader::find(&message, 0x01),
            Err(CoreError::TlvNotFound { tlv_type: 0x01 })
        ));
    }

    #[test]
    fn reset_discards_in_progress_tlv() {
        let mut builder = MessageBuilder::new(SERVICE_CTL, 0, 1, 0x0022).unwrap();
        let token = builder.tlv_write_init(0x01);
        builder.append_u8(5);
        builder.tlv_write_reset(token);
        let message = builder.finish();
        assert!(TlvReader::find(&message, 0x01).is_err());
        assert_eq!(message.tlv_bytes().len(), 0);
    }

    #[test]
    fn big_endian_roundtrip() {
        let mut builder = MessageBuilder::new(0x02, 1, 1, 1).unwrap();
        let token = builder.tlv_write_init(0x10);
        builder.append_u16(0x1234, Endianness::Big);
        builder.tlv_write_complete(token).unwrap();
        let message = builder.finish();
        let reader = TlvReader::find(&message, 0x10).unwrap();
        let mut cursor = 0;
        assert_eq!(reader.read_u16(&mut cursor, Endianness::Big).unwrap(), 0x1234);
    }
}
