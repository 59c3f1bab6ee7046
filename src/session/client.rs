//! Client-facing sessions.
//!
//! # Responsibilities
//! - Accept a client socket into a Connection and register it
//! - Dispatch each request by tag
//! - Reject requests while a bind is outstanding
//! - Forward everything else to a selected upstream
//! - Tear down: abandon every pending operation, wherever it runs

use std::sync::Arc;

use crate::fleet::Fleet;
use crate::load_balancer::pool;
use crate::net::connection::{ConnState, Connection, PoolKind, Role};
use crate::net::listener::ConnectionPermit;
use crate::net::Stream;
use crate::observability::metrics;
use crate::proto::pdu::result_pdu;
use crate::proto::{ber, msgtype_name, request_to_response, result_code, tag, Pdu, ProtoError};
use crate::session::operation::Operation;
use crate::session::{bind, SessionError};

/// Wrap an accepted socket in a client Connection and start its I/O.
pub fn client_init<S: Stream>(
    fleet: &Arc<Fleet>,
    stream: S,
    peer: String,
    permit: Option<ConnectionPermit>,
) -> Arc<Connection> {
    let conn = Connection::init(
        fleet.next_connection_id(),
        peer,
        Role::Client,
        Arc::downgrade(fleet),
    );
    if let Some(permit) = permit {
        conn.set_permit(permit);
    }
    fleet.register_client(&conn);
    conn.start(stream, fleet.settings().client_limits);

    tracing::info!(
        connection_id = %conn.id(),
        peer = %conn.peer(),
        "New client connection"
    );
    conn
}

/// Dispatch one request PDU from a client.
pub fn handle_request(client: &Arc<Connection>, pdu: Pdu) -> Result<(), SessionError> {
    let fleet = client.fleet().ok_or(SessionError::ShuttingDown)?;
    metrics::record_operation(msgtype_name(pdu.op_tag));
    tracing::trace!(
        connection_id = %client.id(),
        msgid = pdu.msgid,
        op = msgtype_name(pdu.op_tag),
        "Request received"
    );

    match pdu.op_tag {
        tag::REQ_UNBIND => Err(SessionError::Unbind),
        tag::REQ_ABANDON => request_abandon(client, &pdu),
        tag::REQ_BIND => {
            if client.lock().ops.contains_key(&pdu.msgid) {
                return Err(SessionError::DuplicateMsgid(pdu.msgid));
            }
            let op = Operation::new(client, pdu);
            bind::request_bind(&fleet, client, op)
        }
        _ => {
            let op = {
                let mut inner = client.lock();
                if inner.state == ConnState::Binding {
                    drop(inner);
                    reject_unregistered(client, &pdu, result_code::PROTOCOL_ERROR, "bind in progress");
                    return Ok(());
                }
                if inner.ops.contains_key(&pdu.msgid) {
                    return Err(SessionError::DuplicateMsgid(pdu.msgid));
                }
                let op = Operation::new(client, pdu);
                inner.ops.insert(op.client_msgid(), op.clone());
                op
            };
            request_process(&fleet, &op);
            Ok(())
        }
    }
}

/// Forward a registered operation to a regular-pool upstream.
pub fn request_process(fleet: &Fleet, op: &Arc<Operation>) {
    match pool::select(fleet, op, PoolKind::Regular) {
        Ok((upstream, msgid)) => {
            if !upstream.send(&op.request().retag(msgid)) {
                // the upstream's teardown has already failed this operation
                tracing::debug!(upstream = %upstream.id(), "Upstream closed while forwarding");
            }
        }
        Err(e) => {
            // only binds distinguish a backend at its ceiling
            tracing::debug!(client_msgid = op.client_msgid(), reason = %e, "No upstream for operation");
            op.remove_from_client();
            op.send_reject(result_code::UNAVAILABLE, "no connections available");
        }
    }
}

/// Answer a request that never became an Operation.
fn reject_unregistered(client: &Connection, pdu: &Pdu, code: i32, message: &str) {
    metrics::record_rejected(code);
    if let Some(res_tag) = request_to_response(pdu.op_tag) {
        client.send(&result_pdu(pdu.msgid, res_tag, code, message));
    }
}

fn request_abandon(client: &Arc<Connection>, pdu: &Pdu) -> Result<(), SessionError> {
    let target = ber::decode_int(&pdu.body)?;
    let target = i32::try_from(target).map_err(|_| ProtoError::BadInteger)?;

    let op = {
        let mut inner = client.lock();
        let Some(op) = inner.ops.get(&target).cloned() else {
            tracing::debug!(
                connection_id = %client.id(),
                target,
                "Abandon of unknown operation ignored"
            );
            return Ok(());
        };
        if op.tag() == tag::REQ_BIND {
            tracing::debug!(connection_id = %client.id(), target, "Bind cannot be abandoned");
            return Ok(());
        }
        inner.ops.remove(&target);
        op
    };

    tracing::debug!(connection_id = %client.id(), target, "Abandoning operation");
    op.abandon();
    Ok(())
}

/// Detach the client's operation tree, move to `next` and abandon every
/// formerly pending operation.
pub fn client_reset(client: &Arc<Connection>, next: ConnState) {
    let ops = {
        let mut inner = client.lock();
        inner.state = next;
        std::mem::take(&mut inner.ops)
    };
    for op in ops.into_values() {
        op.abandon();
    }
}

/// Tear a client connection down.
pub fn destroy(client: &Arc<Connection>) {
    let ops = {
        let mut inner = client.lock();
        if matches!(inner.state, ConnState::Invalid | ConnState::Closing) {
            return;
        }
        inner.state = ConnState::Closing;
        std::mem::take(&mut inner.ops)
    };
    let pending = ops.len();
    for op in ops.into_values() {
        op.abandon();
    }

    if let Some(fleet) = client.fleet() {
        fleet.unregister_client(client.id());
    }
    client.finish_close();

    tracing::info!(
        connection_id = %client.id(),
        peer = %client.peer(),
        abandoned = pending,
        "Client connection closed"
    );
}
