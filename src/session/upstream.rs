//! Backend-facing sessions.
//!
//! # Responsibilities
//! - Bring a freshly connected upstream into the right pool, authenticating
//!   it first when a `bindconf` identity is configured
//! - Demultiplex responses by upstream message id back to client operations
//! - Tear down: release every operation it carried and ask for a replacement

use std::sync::Arc;

use crate::config::BindConfig;
use crate::fleet::Fleet;
use crate::load_balancer::backend::{Backend, BackendState};
use crate::net::connection::{ConnState, Connection, PoolKind, Role};
use crate::net::Stream;
use crate::observability::metrics;
use crate::proto::{is_final_response, msgtype_name, result_code, tag, LdapResult, Pdu};
use crate::session::{bind, SessionError};
use crate::supervisor;

/// Wrap a connected backend socket, start its I/O and place it in a pool.
pub fn upstream_init<S: Stream>(
    fleet: &Arc<Fleet>,
    backend: &Arc<Backend>,
    stream: S,
    peer: String,
) -> Arc<Connection> {
    let conn = Connection::init(
        fleet.next_connection_id(),
        peer,
        Role::Upstream {
            backend: Arc::downgrade(backend),
        },
        Arc::downgrade(fleet),
    );
    backend.lock().preparing.push(conn.clone());
    conn.start(stream, fleet.settings().upstream_limits);

    tracing::debug!(
        backend = %backend.name,
        upstream = %conn.id(),
        peer = %conn.peer(),
        "Upstream connected"
    );
    upstream_finish(fleet, backend, &conn);
    conn
}

/// Decide which pool a preparing upstream serves.
pub fn upstream_finish(fleet: &Arc<Fleet>, backend: &Arc<Backend>, conn: &Arc<Connection>) {
    let settings = fleet.settings();
    {
        let mut state = backend.lock();
        let active = state.active();
        let bindavail = state.bindavail();
        let wants_bind = !settings.virtual_bind
            && active > 0
            && backend.numbindconns > 0
            && (bindavail == 0 || (active >= backend.numconns && bindavail < backend.numbindconns));

        if wants_bind {
            if !promote(&mut state, conn, PoolKind::Bind) {
                return;
            }
        } else if let Some(bindconf) = &settings.bindconf {
            drop(state);
            upstream_bind(conn, bindconf);
            return;
        } else if !promote(&mut state, conn, PoolKind::Regular) {
            return;
        }
    }
    supervisor::backend_retry(fleet, backend);
}

/// Move a preparing upstream into `kind`. Fails if it was torn down first.
fn promote(state: &mut BackendState, conn: &Arc<Connection>, kind: PoolKind) -> bool {
    let Some(pos) = state.preparing.iter().position(|c| Arc::ptr_eq(c, conn)) else {
        return false;
    };
    {
        let mut inner = conn.lock();
        if matches!(inner.state, ConnState::Closing | ConnState::Invalid) {
            return false;
        }
        inner.state = ConnState::Ready;
        inner.pool = kind;
        inner.setup_msgid = None;
    }
    state.preparing.swap_remove(pos);
    match kind {
        PoolKind::Bind => state.bindconns.push_back(conn.clone()),
        PoolKind::Regular | PoolKind::Preparing => state.conns.push_back(conn.clone()),
    }
    state.opening = state.opening.saturating_sub(1);
    state.failed = 0;

    tracing::info!(
        upstream = %conn.id(),
        pool = ?kind,
        active = state.active(),
        bindavail = state.bindavail(),
        "Upstream ready"
    );
    true
}

/// Authenticate a preparing upstream with the configured identity.
fn upstream_bind(conn: &Connection, bindconf: &BindConfig) {
    let pdu = {
        let mut inner = conn.lock();
        if inner.state != ConnState::Ready {
            return;
        }
        inner.state = ConnState::Active;
        let msgid = inner.take_msgid();
        inner.setup_msgid = Some(msgid);
        Pdu::new(
            msgid,
            tag::REQ_BIND,
            bind::encode_simple_bind(&bindconf.bind_dn, &bindconf.credentials),
        )
    };
    tracing::debug!(upstream = %conn.id(), bind_dn = %bindconf.bind_dn, "Authenticating upstream");
    conn.send(&pdu);
}

fn finish_setup_bind(upstream: &Arc<Connection>, pdu: Pdu) -> Result<(), SessionError> {
    let expected = upstream.lock().setup_msgid;
    if pdu.op_tag != tag::RES_BIND || Some(pdu.msgid) != expected {
        return Err(SessionError::UnexpectedSetup(msgtype_name(pdu.op_tag)));
    }
    let result = LdapResult::parse(&pdu.body)?;
    if result.code != result_code::SUCCESS {
        tracing::warn!(
            upstream = %upstream.id(),
            result = result.code,
            message = %String::from_utf8_lossy(&result.message),
            "Upstream bind rejected"
        );
        return Err(SessionError::SetupBindFailed(result.code));
    }

    let (Some(fleet), Some(backend)) = (upstream.fleet(), upstream.backend()) else {
        return Err(SessionError::ShuttingDown);
    };
    let promoted = promote(&mut backend.lock(), upstream, PoolKind::Regular);
    if promoted {
        supervisor::backend_retry(&fleet, &backend);
    }
    Ok(())
}

/// Route one response PDU from a backend to the client operation it
/// answers.
pub fn handle_response(upstream: &Arc<Connection>, pdu: Pdu) -> Result<(), SessionError> {
    if pdu.msgid == 0 {
        let message = LdapResult::parse(&pdu.body)
            .map(|r| String::from_utf8_lossy(&r.message).into_owned())
            .unwrap_or_default();
        tracing::warn!(upstream = %upstream.id(), message = %message, "Unsolicited notification");
        return Err(SessionError::Unsolicited);
    }
    if upstream.state() == ConnState::Active {
        return finish_setup_bind(upstream, pdu);
    }

    let Some(op) = upstream.lock().ops.get(&pdu.msgid).cloned() else {
        tracing::trace!(
            upstream = %upstream.id(),
            upstream_msgid = pdu.msgid,
            op = msgtype_name(pdu.op_tag),
            "Response to abandoned operation dropped"
        );
        return Ok(());
    };

    let done = is_final_response(pdu.op_tag);
    if done && op.unlink_upstream().is_none() {
        return Ok(());
    }

    if done && op.tag() == tag::REQ_BIND {
        if pdu.op_tag == tag::RES_EXTENDED {
            return bind::handle_vc_response(&op, pdu);
        }
        bind::handle_bind_response(upstream, &op, pdu);
        return Ok(());
    }

    let Some(client) = op.client() else {
        return Ok(());
    };
    if done {
        if !op.remove_from_client() {
            return Ok(());
        }
    } else {
        let pending = client
            .lock()
            .ops
            .get(&op.client_msgid())
            .is_some_and(|o| Arc::ptr_eq(o, &op));
        if !pending {
            return Ok(());
        }
    }

    tracing::trace!(
        connection_id = %client.id(),
        msgid = op.client_msgid(),
        upstream_msgid = pdu.msgid,
        op = msgtype_name(pdu.op_tag),
        "Forwarding response"
    );
    client.send(&pdu.retag(op.client_msgid()));
    Ok(())
}

/// Tear an upstream down, fail its operations and ask for a replacement.
pub fn destroy(upstream: &Arc<Connection>) {
    let backend = upstream.backend();
    let (ops, pool) = {
        let mut backend_state = backend.as_ref().map(|b| b.lock());
        let mut inner = upstream.lock();
        if matches!(inner.state, ConnState::Closing | ConnState::Invalid) {
            return;
        }
        inner.state = ConnState::Closing;
        let ops = std::mem::take(&mut inner.ops);
        let executing = std::mem::take(&mut inner.n_ops_executing);
        drop(inner);

        let mut pool = None;
        if let Some(state) = backend_state.as_mut() {
            state.n_ops_executing = state.n_ops_executing.saturating_sub(executing);
            pool = state.remove_connection(upstream);
            if pool == Some(PoolKind::Preparing) {
                state.opening = state.opening.saturating_sub(1);
                state.failed += 1;
            }
        }
        (ops, pool)
    };

    let pending = ops.len();
    for op in ops.into_values() {
        op.lost_upstream();
    }
    upstream.finish_close();

    let Some(backend) = backend else {
        return;
    };
    if pool == Some(PoolKind::Preparing) {
        metrics::record_connect_failure(&backend.name);
    }
    tracing::info!(
        backend = %backend.name,
        upstream = %upstream.id(),
        failed_operations = pending,
        "Upstream connection closed"
    );
    if let Some(fleet) = upstream.fleet() {
        supervisor::backend_retry(&fleet, &backend);
    }
}
