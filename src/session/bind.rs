//! Bind coordination.
//!
//! # Responsibilities
//! - Parse the parts of a BindRequest routing depends on
//! - Forward a bind directly on a bind-pool upstream, or wrapped in a
//!   verify-credentials extended operation on a regular upstream
//! - Track the client's bound identity and SASL progress
//! - Turn bind responses (and verify-credentials responses) into the
//!   BindResponse the client expects
//!
//! # Design Decisions
//! - A direct bind owns its upstream (state Binding) until the response
//!   arrives; the upstream then returns to Ready
//! - A SASL continuation is selected afresh like any other bind
//! - The verify-credentials cookie lives on the client between SASL steps

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::fleet::Fleet;
use crate::load_balancer::pool;
use crate::net::connection::{ConnState, Connection, PoolKind};
use crate::proto::ber::{self, Reader};
use crate::proto::{result_code, tag, LdapResult, Pdu, ProtoError, VC_OID};
use crate::session::client::client_reset;
use crate::session::operation::Operation;
use crate::session::SessionError;

/// The routing-relevant fields of a BindRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i64,
    pub dn: Bytes,
    /// Tag of the authentication choice.
    pub auth_tag: u8,
    /// The authentication element, header included.
    pub auth: Bytes,
    /// SASL mechanism when `auth_tag` is SASL.
    pub mechanism: Option<String>,
}

impl BindRequest {
    pub fn parse(body: &Bytes) -> Result<Self, ProtoError> {
        let mut reader = Reader::new(body.clone());
        let version = reader.read_int(tag::INTEGER)?;
        let dn = reader.read_tagged(tag::OCTET_STRING)?;
        let (auth_tag, auth) = reader.read_raw()?;

        let mechanism = if auth_tag == tag::AUTH_SASL {
            let mut sasl = Reader::new(auth.clone());
            let (_, content) = sasl.read_any()?;
            let mut fields = Reader::new(content);
            let mech = fields.read_tagged(tag::OCTET_STRING)?;
            Some(String::from_utf8_lossy(&mech).into_owned())
        } else {
            None
        };

        Ok(Self {
            version,
            dn,
            auth_tag,
            auth,
            mechanism,
        })
    }

    pub fn is_sasl(&self) -> bool {
        self.auth_tag == tag::AUTH_SASL
    }

    /// Identity recorded on the client once the bind is forwarded.
    pub fn identity(&self) -> Option<String> {
        if self.dn.is_empty() {
            None
        } else {
            Some(format!("dn:{}", String::from_utf8_lossy(&self.dn)))
        }
    }
}

/// Body of a version 3 simple BindRequest.
pub fn encode_simple_bind(dn: &str, password: &str) -> Bytes {
    let mut out = BytesMut::new();
    ber::put_int(&mut out, tag::INTEGER, 3);
    ber::put_element(&mut out, tag::OCTET_STRING, dn.as_bytes());
    ber::put_element(&mut out, tag::AUTH_SIMPLE, password.as_bytes());
    out.freeze()
}

/// Body of the verify-credentials ExtendedRequest wrapping `req`.
pub fn encode_vc_request(req: &BindRequest, cookie: Option<&Bytes>, controls: Option<&Bytes>) -> Bytes {
    let mut fields = BytesMut::new();
    if let Some(cookie) = cookie {
        ber::put_element(&mut fields, tag::VC_COOKIE, cookie);
    }
    ber::put_element(&mut fields, tag::OCTET_STRING, &req.dn);
    fields.extend_from_slice(&req.auth);
    if let Some(controls) = controls {
        ber::put_element(&mut fields, tag::VC_CONTROLS, controls);
    }

    let mut value = BytesMut::new();
    ber::put_element(&mut value, tag::SEQUENCE, &fields);

    let mut out = BytesMut::new();
    ber::put_element(&mut out, tag::EXOP_REQ_OID, VC_OID.as_bytes());
    ber::put_element(&mut out, tag::EXOP_REQ_VALUE, &value);
    out.freeze()
}

/// Fields of a verify-credentials ExtendedResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcResponse {
    pub result: LdapResult,
    pub cookie: Option<Bytes>,
    pub server_creds: Option<Bytes>,
    pub controls: Option<Bytes>,
}

impl VcResponse {
    pub fn parse(body: &Bytes) -> Result<Self, ProtoError> {
        let mut result = LdapResult::parse(body)?;
        let mut reader = Reader::new(std::mem::take(&mut result.rest));
        let mut response = Self {
            result,
            cookie: None,
            server_creds: None,
            controls: None,
        };
        while !reader.is_empty() {
            let (t, content) = reader.read_any()?;
            match t {
                tag::VC_COOKIE => response.cookie = Some(content),
                tag::VC_SCREDS => response.server_creds = Some(content),
                tag::VC_CONTROLS => response.controls = Some(content),
                _ => {}
            }
        }
        Ok(response)
    }

    /// The BindResponse the client sees.
    pub fn to_bind_response(&self, msgid: i32) -> Pdu {
        let mut body = BytesMut::new();
        body.extend_from_slice(&self.result.encode());
        if let Some(creds) = &self.server_creds {
            ber::put_element(&mut body, tag::SASL_RES_CREDS, creds);
        }
        Pdu::new(msgid, tag::RES_BIND, body.freeze()).with_controls(self.controls.clone())
    }
}

/// Start a bind for `client`.
///
/// The client's previous operations are abandoned and it stays Binding
/// until a final result is delivered.
pub fn request_bind(fleet: &Fleet, client: &Arc<Connection>, op: Arc<Operation>) -> Result<(), SessionError> {
    let req = BindRequest::parse(&op.request().body)?;
    client_reset(client, ConnState::Binding);

    let cookie = {
        let mut inner = client.lock();
        inner.auth = req.identity();
        match &req.mechanism {
            Some(mech) if inner.sasl_mech.as_deref() == Some(mech.as_str()) => {}
            Some(mech) => {
                inner.sasl_mech = Some(mech.clone());
                inner.vc_cookie = None;
            }
            None => {
                inner.sasl_mech = None;
                inner.vc_cookie = None;
            }
        }
        inner.ops.insert(op.client_msgid(), op.clone());
        inner.vc_cookie.clone()
    };

    if req.version != 3 {
        finish_locally(client, &op, result_code::PROTOCOL_ERROR, "LDAP version unsupported");
        return Ok(());
    }

    let virtual_bind = fleet.settings().virtual_bind;
    let kind = if virtual_bind {
        PoolKind::Regular
    } else {
        PoolKind::Bind
    };
    let (upstream, msgid) = match pool::select(fleet, &op, kind) {
        Ok(chosen) => chosen,
        Err(e) => {
            finish_locally(client, &op, e.result_code(), &e.to_string());
            return Ok(());
        }
    };

    let pdu = if virtual_bind {
        let body = encode_vc_request(&req, cookie.as_ref(), op.request().controls.as_ref());
        Pdu::new(msgid, tag::REQ_EXTENDED, body)
    } else {
        op.request().retag(msgid)
    };

    tracing::debug!(
        connection_id = %client.id(),
        upstream = %upstream.id(),
        msgid = op.client_msgid(),
        upstream_msgid = msgid,
        sasl = req.is_sasl(),
        virtual_bind,
        "Forwarding bind"
    );
    upstream.send(&pdu);
    Ok(())
}

/// Complete a bind without a backend answer.
fn finish_locally(client: &Connection, op: &Arc<Operation>, code: i32, message: &str) {
    op.remove_from_client();
    {
        let mut inner = client.lock();
        if inner.state == ConnState::Binding {
            inner.state = ConnState::Ready;
        }
        inner.auth = None;
        inner.sasl_mech = None;
        inner.vc_cookie = None;
    }
    op.send_reject(code, message);
}

/// Apply a bind outcome to the client before the result is written.
fn settle_client(client: &Connection, code: i32, cookie: Option<Bytes>) {
    let mut inner = client.lock();
    if code == result_code::SASL_BIND_IN_PROGRESS {
        inner.vc_cookie = cookie;
        return;
    }
    if inner.state == ConnState::Binding {
        inner.state = ConnState::Ready;
    }
    if code != result_code::SUCCESS {
        inner.auth = None;
    }
    inner.sasl_mech = None;
    inner.vc_cookie = None;
}

/// Handle the BindResponse to a directly forwarded bind. `op` has already
/// been unlinked from `upstream`.
pub fn handle_bind_response(upstream: &Connection, op: &Arc<Operation>, pdu: Pdu) {
    {
        let mut inner = upstream.lock();
        if inner.state == ConnState::Binding {
            inner.state = ConnState::Ready;
        }
    }
    let Some(client) = op.client() else {
        return;
    };
    if !op.remove_from_client() {
        return;
    }

    let code = LdapResult::parse(&pdu.body)
        .map(|r| r.code)
        .unwrap_or(result_code::OTHER);
    settle_client(&client, code, None);

    tracing::debug!(
        connection_id = %client.id(),
        msgid = op.client_msgid(),
        result = code,
        "Bind response"
    );
    client.send(&pdu.retag(op.client_msgid()));
}

/// Handle the verify-credentials response to a wrapped bind. `op` has
/// already been unlinked from its upstream.
pub fn handle_vc_response(op: &Arc<Operation>, pdu: Pdu) -> Result<(), SessionError> {
    let response = VcResponse::parse(&pdu.body)?;
    let Some(client) = op.client() else {
        return Ok(());
    };
    if !op.remove_from_client() {
        return Ok(());
    }

    let code = response.result.code;
    settle_client(&client, code, response.cookie.clone());

    tracing::debug!(
        connection_id = %client.id(),
        msgid = op.client_msgid(),
        result = code,
        "Verify credentials response"
    );
    client.send(&response.to_bind_response(op.client_msgid()));
    Ok(())
}
