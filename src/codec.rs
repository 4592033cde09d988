//! Wire frame encoding and decoding.
//!
//! Every exchange on the serial link is one checksummed, length-delimited
//! frame:
//!
//! ```text
//! +--------+------+--------+--------+---------------+-------+-------+
//! | 0x7E   | kind | seq_lo | seq_hi | len_lo len_hi | data  | crc16 |
//! +--------+------+--------+--------+---------------+-------+-------+
//! ```
//!
//! The CRC-16/CCITT covers everything after the start marker (kind through
//! payload) and is appended big-endian. Command payloads carry
//! `id:u16 argc:u8` followed by tagged argument values; response payloads
//! carry `status:u8 fieldc:u8` followed by tagged fields.
//!
//! Decoding operates on a growing buffer fed by the channel. A corrupted
//! frame (bad CRC, implausible length) never desynchronizes the stream:
//! the decoder discards the bad start marker and scans forward for the
//! next one instead of trusting the corrupted length field.

use bytes::{Buf, BytesMut};
use static_assertions::const_assert;
use thiserror::Error;

use crate::catalog::{TcmdId, TelecommandDefinition};
use crate::command::{validate_args, ArgValue, EncodeError};

/// Start-of-frame marker.
pub const FRAME_MARKER: u8 = 0x7E;

/// Header length: marker, kind, seq (u16), payload length (u16).
pub const HEADER_LEN: usize = 6;

/// CRC trailer length.
pub const CRC_LEN: usize = 2;

/// Hard ceiling on one frame, header and trailer included.
pub const MAX_FRAME_LEN: usize = 1024;

/// Largest payload that fits under [`MAX_FRAME_LEN`].
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN - CRC_LEN;

// The length field is a u16.
const_assert!(MAX_PAYLOAD_LEN <= u16::MAX as usize);

/// Direction discriminator carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Command,
    Response,
}

impl FrameKind {
    const COMMAND: u8 = 0x01;
    const RESPONSE: u8 = 0x81;

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::COMMAND => Some(FrameKind::Command),
            Self::RESPONSE => Some(FrameKind::Response),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            FrameKind::Command => Self::COMMAND,
            FrameKind::Response => Self::RESPONSE,
        }
    }
}

/// One validated wire frame. Only produced by the decoder once the length
/// and CRC both check out; there is no partially decoded state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub seq: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serialize the frame, appending the CRC over kind through payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        out.push(FRAME_MARKER);
        out.push(self.kind.to_byte());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        let crc = crc16_ccitt(&out[1..]);
        out.push((crc >> 8) as u8);
        out.push((crc & 0xFF) as u8);
        out
    }
}

/// Why a frame candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CorruptKind {
    #[error("checksum mismatch")]
    BadCrc,
    #[error("declared payload length {0} exceeds maximum")]
    ImplausibleLength(usize),
    #[error("unknown frame kind byte 0x{0:02X}")]
    UnknownKind(u8),
}

/// Outcome of one decode attempt over the buffered bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStep {
    /// A complete, validated frame.
    Frame(Frame),
    /// Not an error: the buffer holds less than one whole frame.
    NeedMoreData,
    /// A frame candidate failed validation and was discarded; the decoder
    /// has already resynchronized to the next candidate marker.
    Corrupt(CorruptKind),
}

/// Incremental frame decoder over a growing receive buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_LEN),
        }
    }

    /// Append bytes received from the channel.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Try to decode the next frame from the buffer.
    ///
    /// Call repeatedly until [`DecodeStep::NeedMoreData`]: a single feed may
    /// contain several frames, and a [`DecodeStep::Corrupt`] result means
    /// the decoder skipped a bad candidate and later frames may still be
    /// waiting in the buffer.
    pub fn next_frame(&mut self) -> DecodeStep {
        // Scan to the next start marker, discarding garbage between frames.
        while !self.buffer.is_empty() && self.buffer[0] != FRAME_MARKER {
            self.buffer.advance(1);
        }

        if self.buffer.len() < HEADER_LEN {
            return DecodeStep::NeedMoreData;
        }

        let kind_byte = self.buffer[1];
        let seq = u16::from_le_bytes([self.buffer[2], self.buffer[3]]);
        let len = usize::from(u16::from_le_bytes([self.buffer[4], self.buffer[5]]));

        if len > MAX_PAYLOAD_LEN {
            // The length field cannot be trusted; drop only the marker and
            // rescan so a later genuine frame is still found.
            self.buffer.advance(1);
            return DecodeStep::Corrupt(CorruptKind::ImplausibleLength(len));
        }

        let total = HEADER_LEN + len + CRC_LEN;
        if self.buffer.len() < total {
            return DecodeStep::NeedMoreData;
        }

        let crc_offset = HEADER_LEN + len;
        let expected =
            (u16::from(self.buffer[crc_offset]) << 8) | u16::from(self.buffer[crc_offset + 1]);
        let actual = crc16_ccitt(&self.buffer[1..crc_offset]);
        if expected != actual {
            self.buffer.advance(1);
            return DecodeStep::Corrupt(CorruptKind::BadCrc);
        }

        let Some(kind) = FrameKind::from_byte(kind_byte) else {
            self.buffer.advance(1);
            return DecodeStep::Corrupt(CorruptKind::UnknownKind(kind_byte));
        };

        let payload = self.buffer[HEADER_LEN..crc_offset].to_vec();
        self.buffer.advance(total);
        DecodeStep::Frame(Frame { kind, seq, payload })
    }
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF), the usual small-sat
/// frame check sequence.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

// Argument value tags inside payloads.
const TAG_U8: u8 = 0x01;
const TAG_U16: u8 = 0x02;
const TAG_U32: u8 = 0x03;
const TAG_U64: u8 = 0x04;
const TAG_I32: u8 = 0x05;
const TAG_I64: u8 = 0x06;
const TAG_F64: u8 = 0x07;
const TAG_STR: u8 = 0x08;
const TAG_BYTES: u8 = 0x09;

/// Encode a telecommand invocation into a complete wire frame.
///
/// Arguments are validated against the definition (arity, type, bounds)
/// before any byte is produced; a failed validation sends nothing.
pub fn encode_command(
    seq: u16,
    def: &TelecommandDefinition,
    args: &[ArgValue],
) -> Result<Vec<u8>, EncodeError> {
    validate_args(def, args)?;

    let mut payload = Vec::new();
    payload.extend_from_slice(&def.id.0.to_le_bytes());
    payload.push(args.len() as u8);
    for arg in args {
        encode_value(&mut payload, arg);
    }
    check_payload_len(payload.len())?;

    Ok(Frame {
        kind: FrameKind::Command,
        seq,
        payload,
    }
    .to_bytes())
}

/// Encode a response frame. Used by simulators and channel test doubles;
/// the flight side speaks the same layout.
pub fn encode_response(
    seq: u16,
    status: u8,
    fields: &[ArgValue],
) -> Result<Vec<u8>, EncodeError> {
    let mut payload = Vec::new();
    payload.push(status);
    payload.push(fields.len() as u8);
    for field in fields {
        encode_value(&mut payload, field);
    }
    check_payload_len(payload.len())?;

    Ok(Frame {
        kind: FrameKind::Response,
        seq,
        payload,
    }
    .to_bytes())
}

fn check_payload_len(len: usize) -> Result<(), EncodeError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(EncodeError::PayloadTooLarge {
            len,
            limit: MAX_PAYLOAD_LEN,
        });
    }
    Ok(())
}

fn encode_value(out: &mut Vec<u8>, value: &ArgValue) {
    match value {
        ArgValue::U8(v) => {
            out.push(TAG_U8);
            out.push(*v);
        }
        ArgValue::U16(v) => {
            out.push(TAG_U16);
            out.extend_from_slice(&v.to_le_bytes());
        }
        ArgValue::U32(v) => {
            out.push(TAG_U32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        ArgValue::U64(v) => {
            out.push(TAG_U64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        ArgValue::I32(v) => {
            out.push(TAG_I32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        ArgValue::I64(v) => {
            out.push(TAG_I64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        ArgValue::F64(v) => {
            out.push(TAG_F64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        ArgValue::Str(s) => {
            out.push(TAG_STR);
            out.extend_from_slice(&(s.len() as u16).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        ArgValue::Bytes(b) => {
            out.push(TAG_BYTES);
            out.extend_from_slice(&(b.len() as u16).to_le_bytes());
            out.extend_from_slice(b);
        }
    }
}

/// Malformed payload inside a frame whose CRC checked out. Treated by the
/// session like corruption: logged and skipped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload truncated")]
    Truncated,
    #[error("unknown value tag 0x{0:02X}")]
    UnknownTag(u8),
    #[error("string field is not valid UTF-8")]
    BadUtf8,
    #[error("{0} trailing bytes after last field")]
    TrailingBytes(usize),
}

/// Decode a command payload back into identifier and argument values.
pub fn decode_command_payload(payload: &[u8]) -> Result<(TcmdId, Vec<ArgValue>), PayloadError> {
    let mut cursor = Cursor::new(payload);
    let id = TcmdId(cursor.read_u16()?);
    let argc = cursor.read_u8()?;
    let args = cursor.read_values(argc)?;
    cursor.finish()?;
    Ok((id, args))
}

/// Decode a response payload into status code and decoded fields.
pub fn decode_response_payload(payload: &[u8]) -> Result<(u8, Vec<ArgValue>), PayloadError> {
    let mut cursor = Cursor::new(payload);
    let status = cursor.read_u8()?;
    let fieldc = cursor.read_u8()?;
    let fields = cursor.read_values(fieldc)?;
    cursor.finish()?;
    Ok((status, fields))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PayloadError> {
        let end = self.pos.checked_add(n).ok_or(PayloadError::Truncated)?;
        if end > self.data.len() {
            return Err(PayloadError::Truncated);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, PayloadError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, PayloadError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_values(&mut self, count: u8) -> Result<Vec<ArgValue>, PayloadError> {
        let mut values = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            values.push(self.read_value()?);
        }
        Ok(values)
    }

    fn read_value(&mut self) -> Result<ArgValue, PayloadError> {
        let tag = self.read_u8()?;
        let value = match tag {
            TAG_U8 => ArgValue::U8(self.read_u8()?),
            TAG_U16 => ArgValue::U16(self.read_u16()?),
            TAG_U32 => {
                let b = self.take(4)?;
                ArgValue::U32(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            TAG_U64 => {
                let b = self.take(8)?;
                ArgValue::U64(u64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            TAG_I32 => {
                let b = self.take(4)?;
                ArgValue::I32(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            TAG_I64 => {
                let b = self.take(8)?;
                ArgValue::I64(i64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            TAG_F64 => {
                let b = self.take(8)?;
                ArgValue::F64(f64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            TAG_STR => {
                let len = usize::from(self.read_u16()?);
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| PayloadError::BadUtf8)?;
                ArgValue::Str(s.to_string())
            }
            TAG_BYTES => {
                let len = usize::from(self.read_u16()?);
                ArgValue::Bytes(self.take(len)?.to_vec())
            }
            other => return Err(PayloadError::UnknownTag(other)),
        };
        Ok(value)
    }

    fn finish(&self) -> Result<(), PayloadError> {
        let remaining = self.data.len() - self.pos;
        if remaining != 0 {
            return Err(PayloadError::TrailingBytes(remaining));
        }
        Ok(())
    }
}
