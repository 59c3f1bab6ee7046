//! LDAP wire framing subsystem.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → pdu.rs (frame one LDAPMessage out of the read buffer)
//!     → ber.rs (tag/length walking of the envelope)
//!     → Pdu { msgid, op_tag, body, controls }
//!     → session layer (routing only, bodies stay opaque)
//! ```
//!
//! # Design Decisions
//! - Only the envelope is decoded; operation bodies are carried as `Bytes`
//!   so a response is re-emitted byte-identical under a new message id
//! - Definite lengths only, single-byte tags only (all LDAP tags fit)
//! - A partial frame is not an error: the decoder returns `None`

pub mod ber;
pub mod pdu;

pub use ber::ProtoError;
pub use pdu::{decode, LdapResult, Pdu};

/// Default ceiling for a single incoming PDU.
pub const DEFAULT_MAX_PDU: usize = (1 << 24) - 1;

/// LDAP protocol tags used by the router.
pub mod tag {
    pub const MESSAGE: u8 = 0x30;
    pub const MSGID: u8 = 0x02;
    pub const INTEGER: u8 = 0x02;
    pub const OCTET_STRING: u8 = 0x04;
    pub const ENUMERATED: u8 = 0x0a;
    pub const SEQUENCE: u8 = 0x30;
    pub const CONTROLS: u8 = 0xa0;

    pub const REQ_BIND: u8 = 0x60;
    pub const REQ_UNBIND: u8 = 0x42;
    pub const REQ_SEARCH: u8 = 0x63;
    pub const REQ_MODIFY: u8 = 0x66;
    pub const REQ_ADD: u8 = 0x68;
    pub const REQ_DELETE: u8 = 0x4a;
    pub const REQ_MODRDN: u8 = 0x6c;
    pub const REQ_COMPARE: u8 = 0x6e;
    pub const REQ_ABANDON: u8 = 0x50;
    pub const REQ_EXTENDED: u8 = 0x77;

    pub const RES_BIND: u8 = 0x61;
    pub const RES_SEARCH_ENTRY: u8 = 0x64;
    pub const RES_SEARCH_RESULT: u8 = 0x65;
    pub const RES_MODIFY: u8 = 0x67;
    pub const RES_ADD: u8 = 0x69;
    pub const RES_DELETE: u8 = 0x6b;
    pub const RES_MODRDN: u8 = 0x6d;
    pub const RES_COMPARE: u8 = 0x6f;
    pub const RES_SEARCH_REFERENCE: u8 = 0x73;
    pub const RES_EXTENDED: u8 = 0x78;
    pub const RES_INTERMEDIATE: u8 = 0x79;

    pub const AUTH_SIMPLE: u8 = 0x80;
    pub const AUTH_SASL: u8 = 0xa3;
    pub const SASL_RES_CREDS: u8 = 0x87;

    pub const EXOP_REQ_OID: u8 = 0x80;
    pub const EXOP_REQ_VALUE: u8 = 0x81;

    pub const VC_COOKIE: u8 = 0x80;
    pub const VC_SCREDS: u8 = 0x81;
    pub const VC_CONTROLS: u8 = 0xa2;
}

/// LDAP result codes surfaced by the proxy itself.
pub mod result_code {
    pub const SUCCESS: i32 = 0;
    pub const PROTOCOL_ERROR: i32 = 2;
    pub const TIMELIMIT_EXCEEDED: i32 = 3;
    pub const ADMINLIMIT_EXCEEDED: i32 = 11;
    pub const SASL_BIND_IN_PROGRESS: i32 = 14;
    pub const BUSY: i32 = 51;
    pub const UNAVAILABLE: i32 = 52;
    pub const OTHER: i32 = 80;
}

/// OID of the verify-credentials extended operation.
pub const VC_OID: &str = "1.3.6.1.4.1.4203.666.6.5";

/// Response tag carrying the final result of a request, if it has one.
pub fn request_to_response(req: u8) -> Option<u8> {
    match req {
        tag::REQ_ADD
        | tag::REQ_BIND
        | tag::REQ_COMPARE
        | tag::REQ_EXTENDED
        | tag::REQ_MODIFY
        | tag::REQ_MODRDN => Some(req + 1),
        tag::REQ_DELETE => Some(tag::RES_DELETE),
        tag::REQ_SEARCH => Some(tag::RES_SEARCH_RESULT),
        _ => None,
    }
}

/// Whether a response tag terminates its operation.
pub fn is_final_response(res: u8) -> bool {
    !matches!(
        res,
        tag::RES_SEARCH_ENTRY | tag::RES_SEARCH_REFERENCE | tag::RES_INTERMEDIATE
    )
}

/// Short name of a protocol tag for log fields and metric labels.
pub fn msgtype_name(t: u8) -> &'static str {
    match t {
        tag::REQ_BIND => "bind request",
        tag::REQ_UNBIND => "unbind request",
        tag::REQ_SEARCH => "search request",
        tag::REQ_MODIFY => "modify request",
        tag::REQ_ADD => "add request",
        tag::REQ_DELETE => "delete request",
        tag::REQ_MODRDN => "modrdn request",
        tag::REQ_COMPARE => "compare request",
        tag::REQ_ABANDON => "abandon request",
        tag::REQ_EXTENDED => "extended request",
        tag::RES_BIND => "bind response",
        tag::RES_SEARCH_ENTRY => "search entry response",
        tag::RES_SEARCH_RESULT => "search result response",
        tag::RES_MODIFY => "modify response",
        tag::RES_ADD => "add response",
        tag::RES_DELETE => "delete response",
        tag::RES_MODRDN => "modrdn response",
        tag::RES_COMPARE => "compare response",
        tag::RES_SEARCH_REFERENCE => "search reference response",
        tag::RES_EXTENDED => "extended response",
        tag::RES_INTERMEDIATE => "intermediate response",
        _ => "unknown message",
    }
}
