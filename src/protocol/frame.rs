//! Binary frame codec
//!
//! Frame layout (24-byte header + optional extras, key and value):
//!
//! ```text
//! +-------+--------+---------+-----------+-----------+----------------+
//! | magic | opcode | key_len | extra_len | data_type | vbucket/status |
//! | 1 byte| 1 byte | 2 bytes |  1 byte   |  1 byte   |    2 bytes     |
//! +-------+--------+---------+-----------+-----------+----------------+
//! | total_len | opaque  | cas     | extras || key || value            |
//! | 4 bytes   | 4 bytes | 8 bytes | total_len bytes                   |
//! +-----------+---------+---------+-----------------------------------+
//! ```
//!
//! All multi-byte integers are big-endian. `total_len` covers extras, key
//! and value together. The codec is a pure function on bytes: no I/O
//! beyond the supplied reader, no state.

use std::io::{self, Read};

use super::opcode::{Opcode, Status};
use crate::utils::error::ProtocolError;

/// Magic byte identifying request packets.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte identifying response packets.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Maximum key length the header can carry.
pub const MAX_KEY_LEN: usize = 65535;

/// Maximum extras length the header can carry.
pub const MAX_EXTRA_LEN: usize = 255;

/// Direction tag decoded from the magic byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    fn to_u8(self) -> u8 {
        match self {
            Magic::Request => REQUEST_MAGIC,
            Magic::Response => RESPONSE_MAGIC,
        }
    }

    fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            REQUEST_MAGIC => Ok(Magic::Request),
            RESPONSE_MAGIC => Ok(Magic::Response),
            other => Err(ProtocolError::InvalidMagic(other)),
        }
    }
}

/// A parsed or to-be-encoded frame.
///
/// Word 6 of the header is the vBucket id on requests and the status on
/// responses; it is stored raw here and interpreted via [`Frame::status`]
/// or [`Frame::set_vbucket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub magic: Magic,
    pub opcode: Opcode,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Frame {
    /// Creates an empty request frame for the given opcode.
    pub fn request(opcode: Opcode) -> Self {
        Self {
            magic: Magic::Request,
            opcode,
            data_type: 0,
            vbucket_or_status: 0,
            opaque: 0,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Vec<u8>>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    /// Stamps the routed vBucket id into a request header.
    pub fn set_vbucket(&mut self, id: u16) {
        self.vbucket_or_status = id;
    }

    /// Response status (meaningful only when `magic` is `Response`).
    pub fn status(&self) -> Status {
        Status(self.vbucket_or_status)
    }

    /// Total body length the header will advertise.
    pub fn body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }

    /// Encodes the frame, recomputing `key_len`, `extra_len` and
    /// `total_len` from the actual payload sections.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.key.len() > MAX_KEY_LEN {
            return Err(ProtocolError::KeyTooLong(self.key.len()));
        }
        if self.extras.len() > MAX_EXTRA_LEN {
            return Err(ProtocolError::ExtrasTooLong(self.extras.len()));
        }

        let total_len = self.body_len();
        let mut buf = Vec::with_capacity(HEADER_SIZE + total_len);

        buf.push(self.magic.to_u8());
        buf.push(self.opcode as u8);
        buf.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        buf.push(self.extras.len() as u8);
        buf.push(self.data_type);
        buf.extend_from_slice(&self.vbucket_or_status.to_be_bytes());
        buf.extend_from_slice(&(total_len as u32).to_be_bytes());
        buf.extend_from_slice(&self.opaque.to_be_bytes());
        buf.extend_from_slice(&self.cas.to_be_bytes());

        buf.extend_from_slice(&self.extras);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);

        Ok(buf)
    }

    /// Decodes one frame from `r`.
    ///
    /// Reads exactly 24 header bytes, then extras, key and
    /// `value_len = total_len - extra_len - key_len` in that order. Any
    /// truncated sub-read fails with `ShortRead`.
    pub fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let mut header = [0u8; HEADER_SIZE];
        read_exact(r, &mut header)?;

        let magic = Magic::from_u8(header[0])?;
        let opcode = Opcode::from_u8(header[1]).ok_or(ProtocolError::UnknownOpcode(header[1]))?;
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extra_len = header[4] as usize;
        let data_type = header[5];
        let vbucket_or_status = u16::from_be_bytes([header[6], header[7]]);
        let total_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
        let cas = u64::from_be_bytes([
            header[16], header[17], header[18], header[19], header[20], header[21], header[22],
            header[23],
        ]);

        let value_len = total_len
            .checked_sub(extra_len + key_len)
            .ok_or(ProtocolError::ShortRead {
                needed: extra_len + key_len,
                got: total_len,
            })?;

        let mut extras = vec![0u8; extra_len];
        read_exact(r, &mut extras)?;
        let mut key = vec![0u8; key_len];
        read_exact(r, &mut key)?;
        let mut value = vec![0u8; value_len];
        read_exact(r, &mut value)?;

        Ok(Self {
            magic,
            opcode,
            data_type,
            vbucket_or_status,
            opaque,
            cas,
            extras,
            key,
            value,
        })
    }
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(ProtocolError::ShortRead {
                    needed: buf.len(),
                    got: filled,
                })
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => {
                return Err(ProtocolError::ShortRead {
                    needed: buf.len(),
                    got: filled,
                })
            }
        }
    }
    Ok(())
}

/// Interpretation of a response value per the flags word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    /// Raw value bytes.
    Bytes(Vec<u8>),
    /// Boolean-flagged value.
    Bool(bool),
    /// Integer-flagged value, big-endian bytes preserved exactly.
    Uint(u128),
}

impl DecodedValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DecodedValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DecodedValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u128> {
        match self {
            DecodedValue::Uint(n) => Some(*n),
            _ => None,
        }
    }
}

/// A response value together with its content-encoding signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub value: DecodedValue,
    /// The flags word marked the value as gzip-compressed; surfacing the
    /// encoding is the caller's responsibility.
    pub gzip: bool,
}

/// Interprets a response value from the first 4 extras bytes.
///
/// `flags == 0x0100` marks a boolean (true iff the first value byte is
/// `0x31`); `0x0100 < flags < 0x0600` marks a big-endian unsigned integer;
/// bit `0x0002` marks gzip content. Everything else is raw bytes.
pub fn decode_value(extras: &[u8], value: Vec<u8>) -> Decoded {
    let flags = if extras.len() >= 4 {
        u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
    } else {
        0
    };

    let gzip = flags & 0x0002 != 0;

    let value = if flags == 0x0100 {
        DecodedValue::Bool(value.first() == Some(&0x31))
    } else if flags > 0x0100 && flags < 0x0600 && !value.is_empty() && value.len() <= 16 {
        let mut n: u128 = 0;
        for b in &value {
            n = (n << 8) | u128::from(*b);
        }
        DecodedValue::Uint(n)
    } else {
        DecodedValue::Bytes(value)
    };

    Decoded { value, gzip }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_frame() -> Frame {
        Frame {
            magic: Magic::Request,
            opcode: Opcode::Set,
            data_type: 0x01,
            vbucket_or_status: 0x0203,
            opaque: 0xDEADBEEF,
            cas: 0x0102030405060708,
            extras: vec![0, 0, 0, 0, 0, 0, 0, 60],
            key: b"user:42".to_vec(),
            value: br#"{"n":1}"#.to_vec(),
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = sample_frame();
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&mut Cursor::new(&encoded)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_header_layout() {
        let frame = sample_frame();
        let encoded = frame.encode().unwrap();

        assert_eq!(encoded[0], REQUEST_MAGIC);
        assert_eq!(encoded[1], Opcode::Set as u8);
        // key_len
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), 7);
        // extra_len
        assert_eq!(encoded[4], 8);
        assert_eq!(encoded[5], 0x01);
        // vbucket
        assert_eq!(u16::from_be_bytes([encoded[6], encoded[7]]), 0x0203);
        // total_len = extras + key + value
        assert_eq!(
            u32::from_be_bytes([encoded[8], encoded[9], encoded[10], encoded[11]]),
            8 + 7 + 7
        );
        assert_eq!(encoded.len(), HEADER_SIZE + 8 + 7 + 7);
    }

    #[test]
    fn test_lengths_recomputed() {
        // Lengths come from the payload sections, not caller bookkeeping.
        let mut frame = Frame::request(Opcode::Get).with_key("abc");
        frame.value = vec![1, 2, 3, 4, 5];
        let encoded = frame.encode().unwrap();
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), 3);
        assert_eq!(
            u32::from_be_bytes([encoded[8], encoded[9], encoded[10], encoded[11]]),
            8
        );
    }

    #[test]
    fn test_key_too_long() {
        let frame = Frame::request(Opcode::Get).with_key(vec![b'k'; MAX_KEY_LEN + 1]);
        assert!(matches!(frame.encode(), Err(ProtocolError::KeyTooLong(_))));
    }

    #[test]
    fn test_extras_too_long() {
        let frame = Frame::request(Opcode::Set).with_extras(vec![0u8; MAX_EXTRA_LEN + 1]);
        assert!(matches!(frame.encode(), Err(ProtocolError::ExtrasTooLong(_))));
    }

    #[test]
    fn test_short_header() {
        let mut cursor = Cursor::new(vec![0x81u8, 0x00, 0x00]);
        let result = Frame::decode(&mut cursor);
        assert!(matches!(
            result,
            Err(ProtocolError::ShortRead { needed: 24, got: 3 })
        ));
    }

    #[test]
    fn test_short_body() {
        let frame = sample_frame();
        let mut encoded = frame.encode().unwrap();
        encoded.truncate(encoded.len() - 3);
        let result = Frame::decode(&mut Cursor::new(&encoded));
        assert!(matches!(result, Err(ProtocolError::ShortRead { .. })));
    }

    #[test]
    fn test_invalid_magic() {
        let mut encoded = sample_frame().encode().unwrap();
        encoded[0] = 0x42;
        let result = Frame::decode(&mut Cursor::new(&encoded));
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(0x42))));
    }

    #[test]
    fn test_response_status() {
        let mut frame = sample_frame();
        frame.magic = Magic::Response;
        frame.vbucket_or_status = 0x0007;
        let decoded = Frame::decode(&mut Cursor::new(&frame.encode().unwrap())).unwrap();
        assert!(decoded.status().is_not_my_vbucket());
    }

    #[test]
    fn test_multiple_frames_in_stream() {
        let f1 = Frame::request(Opcode::Get).with_key("a").with_opaque(1);
        let f2 = Frame::request(Opcode::Get).with_key("b").with_opaque(2);
        let mut buf = f1.encode().unwrap();
        buf.extend_from_slice(&f2.encode().unwrap());

        let mut cursor = Cursor::new(&buf);
        assert_eq!(Frame::decode(&mut cursor).unwrap().opaque, 1);
        assert_eq!(Frame::decode(&mut cursor).unwrap().opaque, 2);
    }

    #[test]
    fn test_decode_value_raw() {
        let decoded = decode_value(&[], b"hello".to_vec());
        assert_eq!(decoded.value, DecodedValue::Bytes(b"hello".to_vec()));
        assert!(!decoded.gzip);
    }

    #[test]
    fn test_decode_value_bool() {
        let extras = 0x0100u32.to_be_bytes();
        let decoded = decode_value(&extras, vec![0x31]);
        assert_eq!(decoded.value, DecodedValue::Bool(true));

        let decoded = decode_value(&extras, vec![0x30]);
        assert_eq!(decoded.value, DecodedValue::Bool(false));
    }

    #[test]
    fn test_decode_value_uint() {
        let extras = 0x0200u32.to_be_bytes();
        let decoded = decode_value(&extras, vec![0x01, 0x02]);
        assert_eq!(decoded.value, DecodedValue::Uint(0x0102));

        // Wider than 32 bits is preserved exactly.
        let decoded = decode_value(&extras, vec![0xFF; 8]);
        assert_eq!(decoded.value, DecodedValue::Uint(u64::MAX as u128));
    }

    #[test]
    fn test_decode_value_gzip_flag() {
        let extras = 0x0002u32.to_be_bytes();
        let decoded = decode_value(&extras, b"compressed".to_vec());
        assert!(decoded.gzip);
        assert_eq!(decoded.value, DecodedValue::Bytes(b"compressed".to_vec()));
    }

    #[test]
    fn test_decode_value_uint_boundaries() {
        // 0x0100 itself is boolean, not integer; 0x0600 is raw again.
        let decoded = decode_value(&0x0600u32.to_be_bytes(), vec![0x01]);
        assert_eq!(decoded.value, DecodedValue::Bytes(vec![0x01]));
    }
}
