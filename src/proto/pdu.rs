//! LDAPMessage framing.
//!
//! # Responsibilities
//! - Split one complete LDAPMessage off a connection's read buffer
//! - Expose message id, operation tag, body and controls
//! - Re-encode a message under a different message id, body untouched
//! - Build and parse the LDAPResult bodies the proxy emits or inspects

use bytes::{Bytes, BytesMut};

use super::ber::{self, ProtoError, Reader};
use super::tag;

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub msgid: i32,
    pub op_tag: u8,
    /// Content octets of the protocol operation.
    pub body: Bytes,
    /// Content octets of the `[0]` controls element, if present.
    pub controls: Option<Bytes>,
}

impl Pdu {
    pub fn new(msgid: i32, op_tag: u8, body: impl Into<Bytes>) -> Self {
        Self {
            msgid,
            op_tag,
            body: body.into(),
            controls: None,
        }
    }

    pub fn with_controls(mut self, controls: Option<Bytes>) -> Self {
        self.controls = controls;
        self
    }

    /// Same operation under another message id.
    pub fn retag(&self, msgid: i32) -> Self {
        Self {
            msgid,
            ..self.clone()
        }
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        let mut inner = BytesMut::with_capacity(self.body.len() + 16);
        ber::put_int(&mut inner, tag::MSGID, self.msgid as i64);
        ber::put_element(&mut inner, self.op_tag, &self.body);
        if let Some(controls) = &self.controls {
            ber::put_element(&mut inner, tag::CONTROLS, controls);
        }
        ber::put_element(out, tag::MESSAGE, &inner);
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode_into(&mut out);
        out.freeze()
    }
}

/// Frame one message off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed. Any error leaves the stream
/// unrecoverable.
pub fn decode(buf: &mut BytesMut, max_len: usize) -> Result<Option<Pdu>, ProtoError> {
    let Some(header) = ber::peek_header(buf)? else {
        return Ok(None);
    };
    if header.tag != tag::MESSAGE {
        return Err(ProtoError::UnexpectedTag {
            expected: tag::MESSAGE,
            found: header.tag,
        });
    }
    if header.content_len > max_len {
        return Err(ProtoError::TooLarge {
            len: header.content_len,
            max: max_len,
        });
    }
    if buf.len() < header.total_len() {
        buf.reserve(header.total_len() - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(header.total_len()).freeze();
    let content = frame.split_off(header.header_len);
    let mut reader = Reader::new(content);

    let msgid = reader.read_int(tag::MSGID)?;
    if !(0..=i32::MAX as i64).contains(&msgid) {
        return Err(ProtoError::BadMsgid(msgid));
    }
    let (op_tag, body) = reader.read_any()?;
    let controls = reader.read_optional(tag::CONTROLS)?;

    Ok(Some(Pdu {
        msgid: msgid as i32,
        op_tag,
        body,
        controls,
    }))
}

/// The leading LDAPResult fields of a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: i32,
    pub matched: Bytes,
    pub message: Bytes,
    /// Optional trailing elements (referral, SASL credentials, exop fields).
    pub rest: Bytes,
}

impl LdapResult {
    pub fn new(code: i32, matched: &str, message: &str) -> Self {
        Self {
            code,
            matched: Bytes::copy_from_slice(matched.as_bytes()),
            message: Bytes::copy_from_slice(message.as_bytes()),
            rest: Bytes::new(),
        }
    }

    pub fn parse(body: &Bytes) -> Result<Self, ProtoError> {
        let mut reader = Reader::new(body.clone());
        let code = reader.read_int(tag::ENUMERATED)?;
        let matched = reader.read_tagged(tag::OCTET_STRING)?;
        let message = reader.read_tagged(tag::OCTET_STRING)?;
        Ok(Self {
            code: i32::try_from(code).map_err(|_| ProtoError::BadInteger)?,
            matched,
            message,
            rest: reader.into_remaining(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        ber::put_int(&mut out, tag::ENUMERATED, self.code as i64);
        ber::put_element(&mut out, tag::OCTET_STRING, &self.matched);
        ber::put_element(&mut out, tag::OCTET_STRING, &self.message);
        out.extend_from_slice(&self.rest);
        out.freeze()
    }
}

/// A result message the proxy generates on its own behalf.
pub fn result_pdu(msgid: i32, res_tag: u8, code: i32, message: &str) -> Pdu {
    Pdu::new(msgid, res_tag, LdapResult::new(code, "", message).encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::result_code;

    fn search_request(msgid: i32) -> Pdu {
        let mut body = BytesMut::new();
        ber::put_element(&mut body, tag::OCTET_STRING, b"dc=example,dc=com");
        Pdu::new(msgid, tag::REQ_SEARCH, body.freeze())
    }

    #[test]
    fn test_decode_complete_frame() {
        let pdu = search_request(7).with_controls(Some(Bytes::from_static(&[0x30, 0x00])));
        let mut buf = BytesMut::from(&pdu.encode()[..]);
        let decoded = decode(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(decoded, pdu);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frame_waits() {
        let encoded = search_request(2).encode();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 3]);
        assert_eq!(decode(&mut buf, 1024).unwrap(), None);
        buf.extend_from_slice(&encoded[encoded.len() - 3..]);
        assert_eq!(decode(&mut buf, 1024).unwrap().unwrap().msgid, 2);
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        search_request(1).encode_into(&mut buf);
        search_request(2).encode_into(&mut buf);
        assert_eq!(decode(&mut buf, 1024).unwrap().unwrap().msgid, 1);
        assert_eq!(decode(&mut buf, 1024).unwrap().unwrap().msgid, 2);
        assert_eq!(decode(&mut buf, 1024).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_oversized() {
        let mut buf = BytesMut::from(&search_request(1).encode()[..]);
        assert!(matches!(decode(&mut buf, 4), Err(ProtoError::TooLarge { .. })));
    }

    #[test]
    fn test_decode_rejects_non_message() {
        let mut buf = BytesMut::from(&[0x04u8, 0x00][..]);
        assert!(matches!(decode(&mut buf, 1024), Err(ProtoError::UnexpectedTag { .. })));
    }

    #[test]
    fn test_retag_keeps_body() {
        let pdu = search_request(5);
        let moved = pdu.retag(900);
        assert_eq!(moved.msgid, 900);
        assert_eq!(moved.body, pdu.body);
        assert_eq!(moved.op_tag, pdu.op_tag);
    }

    #[test]
    fn test_result_pdu_parses() {
        let pdu = result_pdu(3, tag::RES_SEARCH_RESULT, result_code::UNAVAILABLE, "no connections available");
        let result = LdapResult::parse(&pdu.body).unwrap();
        assert_eq!(result.code, result_code::UNAVAILABLE);
        assert!(result.matched.is_empty());
        assert_eq!(&result.message[..], b"no connections available");
        assert!(result.rest.is_empty());
    }
}
