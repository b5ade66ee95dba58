//! Frame builder and field readers for little-endian wire data.

use core::fmt::Write as _;

use crate::error::DecodeError;
use crate::protocol::{MsgType, QID_SIZE, Qid, QidType};

/// Message encoder with size prefix.
pub(crate) struct Message {
    buf: Vec<u8>,
}

impl Message {
    pub(crate) fn new(msg_type: MsgType, tag: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.push(msg_type as u8);
        buf.extend_from_slice(&tag.to_le_bytes());
        Self { buf }
    }

    /// A headerless buffer, used for stat records.
    pub(crate) fn raw() -> Self {
        Self {
            buf: Vec::with_capacity(64),
        }
    }

    pub(crate) fn push_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn push_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn push_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn push_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Length-prefixed string. Callers check the length beforehand.
    pub(crate) fn push_str(&mut self, value: &str) {
        let bytes = value.as_bytes();
        self.push_u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn push_qid(&mut self, qid: &Qid) {
        self.push_u8(qid.type_.bits());
        self.push_u32(qid.version);
        self.push_u64(qid.path);
    }

    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Patch the leading size field and hand out the frame.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&size.to_le_bytes());
        self.buf
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

fn take<'a>(buf: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], DecodeError> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or(DecodeError::Malformed("field overruns message"))?;
    let bytes = &buf[*offset..end];
    *offset = end;
    Ok(bytes)
}

pub(crate) fn read_u8(buf: &[u8], offset: &mut usize) -> Result<u8, DecodeError> {
    Ok(take(buf, offset, 1)?[0])
}

pub(crate) fn read_u16(buf: &[u8], offset: &mut usize) -> Result<u16, DecodeError> {
    let bytes = take(buf, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32(buf: &[u8], offset: &mut usize) -> Result<u32, DecodeError> {
    let bytes = take(buf, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_u64(buf: &[u8], offset: &mut usize) -> Result<u64, DecodeError> {
    let bytes = take(buf, offset, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

pub(crate) fn read_bytes<'a>(
    buf: &'a [u8],
    offset: &mut usize,
    len: usize,
) -> Result<&'a [u8], DecodeError> {
    take(buf, offset, len)
}

pub(crate) fn read_str(buf: &[u8], offset: &mut usize) -> Result<String, DecodeError> {
    let len = read_u16(buf, offset)? as usize;
    let bytes = take(buf, offset, len)?;
    let value =
        core::str::from_utf8(bytes).map_err(|_| DecodeError::Malformed("invalid utf8"))?;
    Ok(value.to_string())
}

pub(crate) fn read_qid(buf: &[u8], offset: &mut usize) -> Result<Qid, DecodeError> {
    if buf.len().saturating_sub(*offset) < QID_SIZE {
        return Err(DecodeError::Malformed("field overruns message"));
    }
    let type_ = read_u8(buf, offset)?;
    let version = read_u32(buf, offset)?;
    let path = read_u64(buf, offset)?;
    Ok(Qid {
        type_: QidType::from_bits_retain(type_),
        version,
        path,
    })
}

pub(crate) fn dump_hex(buf: &[u8]) -> String {
    let mut out = String::new();
    for (idx, byte) in buf.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Short printable rendering of a data payload for log lines.
pub(crate) fn dump_some(buf: &[u8]) -> String {
    const LIMIT: usize = 64;
    let head = &buf[..buf.len().min(LIMIT)];
    let mut out = match core::str::from_utf8(head) {
        Ok(text) if !text.chars().any(|c| c.is_control() && c != '\n' && c != '\t') => {
            text.escape_default().to_string()
        }
        _ => dump_hex(head),
    };
    if buf.len() > LIMIT {
        out.push_str("...");
    }
    out
}
