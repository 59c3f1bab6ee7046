//! Minimal BER element reader and writer.
//!
//! Covers what routing needs: definite-length elements with single-byte
//! tags, integers and octet strings. Anything else is reported as a
//! `ProtoError` and treated by callers as a malformed PDU.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors produced while walking or framing BER data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("unexpected tag {found:#04x}, expected {expected:#04x}")]
    UnexpectedTag { expected: u8, found: u8 },

    #[error("multi-byte tag numbers are not supported")]
    LongTag,

    #[error("unsupported length encoding")]
    BadLength,

    #[error("element truncated")]
    Truncated,

    #[error("PDU of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("integer out of range")]
    BadInteger,

    #[error("invalid message id {0}")]
    BadMsgid(i64),
}

/// Decoded element header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u8,
    pub header_len: usize,
    pub content_len: usize,
}

impl Header {
    pub fn total_len(&self) -> usize {
        self.header_len + self.content_len
    }
}

/// Parse the tag and length at the start of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete header.
pub fn peek_header(buf: &[u8]) -> Result<Option<Header>, ProtoError> {
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };
    if tag & 0x1f == 0x1f {
        return Err(ProtoError::LongTag);
    }
    let Some(&first) = buf.get(1) else {
        return Ok(None);
    };
    if first < 0x80 {
        return Ok(Some(Header {
            tag,
            header_len: 2,
            content_len: first as usize,
        }));
    }

    let octets = (first & 0x7f) as usize;
    if octets == 0 || octets > 4 {
        return Err(ProtoError::BadLength);
    }
    if buf.len() < 2 + octets {
        return Ok(None);
    }
    let content_len = buf[2..2 + octets]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize);

    Ok(Some(Header {
        tag,
        header_len: 2 + octets,
        content_len,
    }))
}

/// Decode the content octets of an INTEGER or ENUMERATED.
pub fn decode_int(content: &[u8]) -> Result<i64, ProtoError> {
    if content.is_empty() || content.len() > 8 {
        return Err(ProtoError::BadInteger);
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for b in content {
        value = (value << 8) | *b as i64;
    }
    Ok(value)
}

/// Minimal two's complement content octets for `value`.
pub fn encode_int(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let cur = bytes[start];
        let next = bytes[start + 1];
        let redundant = (cur == 0x00 && next & 0x80 == 0) || (cur == 0xff && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

pub fn put_header(out: &mut BytesMut, tag: u8, len: usize) {
    out.put_u8(tag);
    if len < 0x80 {
        out.put_u8(len as u8);
        return;
    }
    let raw = (len as u64).to_be_bytes();
    let skip = raw.iter().take_while(|b| **b == 0).count();
    out.put_u8(0x80 | (raw.len() - skip) as u8);
    out.put_slice(&raw[skip..]);
}

pub fn put_element(out: &mut BytesMut, tag: u8, content: &[u8]) {
    put_header(out, tag, content.len());
    out.put_slice(content);
}

pub fn put_int(out: &mut BytesMut, tag: u8, value: i64) {
    put_element(out, tag, &encode_int(value));
}

/// Sequential reader over the elements packed in a buffer.
#[derive(Debug, Clone)]
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    fn next_header(&self) -> Result<Header, ProtoError> {
        let header = peek_header(&self.buf)?.ok_or(ProtoError::Truncated)?;
        if self.buf.len() < header.total_len() {
            return Err(ProtoError::Truncated);
        }
        Ok(header)
    }

    /// Read the next element of any tag, returning tag and content.
    pub fn read_any(&mut self) -> Result<(u8, Bytes), ProtoError> {
        let header = self.next_header()?;
        let mut element = self.buf.split_to(header.total_len());
        Ok((header.tag, element.split_off(header.header_len)))
    }

    /// Read the next element including its header octets.
    pub fn read_raw(&mut self) -> Result<(u8, Bytes), ProtoError> {
        let header = self.next_header()?;
        Ok((header.tag, self.buf.split_to(header.total_len())))
    }

    pub fn read_tagged(&mut self, expected: u8) -> Result<Bytes, ProtoError> {
        match self.peek_tag() {
            Some(found) if found != expected => Err(ProtoError::UnexpectedTag { expected, found }),
            None => Err(ProtoError::Truncated),
            Some(_) => self.read_any().map(|(_, content)| content),
        }
    }

    /// Read the next element only if it carries `tag`.
    pub fn read_optional(&mut self, tag: u8) -> Result<Option<Bytes>, ProtoError> {
        if self.peek_tag() == Some(tag) {
            self.read_any().map(|(_, content)| Some(content))
        } else {
            Ok(None)
        }
    }

    pub fn read_int(&mut self, tag: u8) -> Result<i64, ProtoError> {
        let content = self.read_tagged(tag)?;
        decode_int(&content)
    }

    /// Whatever has not been consumed yet.
    pub fn into_remaining(self) -> Bytes {
        self.buf
    }
}
