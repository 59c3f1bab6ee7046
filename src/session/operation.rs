//! In-flight operations.
//!
//! An `Operation` is created when a client request is parsed. It lives in
//! the client's tree under the client message id and, once forwarded, in
//! one upstream's tree under the upstream message id. Both links back to
//! connections are weak.
//!
//! The backend and connection pending counters are released only by
//! `unlink_upstream` (or by upstream teardown, which detaches the whole
//! tree at once), so each operation releases them exactly once.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::net::connection::{ConnState, Connection, ConnectionId};
use crate::observability::metrics;
use crate::proto::pdu::result_pdu;
use crate::proto::{ber, request_to_response, result_code, tag, Pdu};
use crate::session;

#[derive(Debug, Default)]
struct UpstreamLink {
    upstream: Option<Weak<Connection>>,
    msgid: i32,
}

/// One client request and its mapping onto a backend request.
pub struct Operation {
    client_msgid: i32,
    client_id: ConnectionId,
    request: Pdu,
    client: Weak<Connection>,
    link: Mutex<UpstreamLink>,
    started: Instant,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.link.lock();
        f.debug_struct("Operation")
            .field("client", &self.client_id)
            .field("client_msgid", &self.client_msgid)
            .field("tag", &self.request.op_tag)
            .field("upstream_msgid", &link.msgid)
            .finish()
    }
}

impl Operation {
    pub fn new(client: &Arc<Connection>, request: Pdu) -> Arc<Self> {
        Arc::new(Self {
            client_msgid: request.msgid,
            client_id: client.id(),
            request,
            client: Arc::downgrade(client),
            link: Mutex::new(UpstreamLink::default()),
            started: Instant::now(),
        })
    }

    pub fn client_msgid(&self) -> i32 {
        self.client_msgid
    }

    pub fn client_id(&self) -> ConnectionId {
        self.client_id
    }

    /// Request tag.
    pub fn tag(&self) -> u8 {
        self.request.op_tag
    }

    pub fn request(&self) -> &Pdu {
        &self.request
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn client(&self) -> Option<Arc<Connection>> {
        self.client.upgrade()
    }

    /// Record the upstream side. Called with the upstream's state lock held.
    pub(crate) fn link_upstream(&self, upstream: &Arc<Connection>, msgid: i32) {
        let mut link = self.link.lock();
        link.upstream = Some(Arc::downgrade(upstream));
        link.msgid = msgid;
    }

    pub(crate) fn clear_upstream(&self) {
        let mut link = self.link.lock();
        link.upstream = None;
        link.msgid = 0;
    }

    pub fn upstream(&self) -> Option<(Arc<Connection>, i32)> {
        let link = self.link.lock();
        let upstream = link.upstream.as_ref()?.upgrade()?;
        Some((upstream, link.msgid))
    }

    pub fn upstream_msgid(&self) -> Option<i32> {
        let link = self.link.lock();
        link.upstream.as_ref().map(|_| link.msgid)
    }

    /// Remove the operation from its upstream's tree and release both
    /// pending counters. Returns the upstream only if this call did the
    /// removal.
    pub fn unlink_upstream(self: &Arc<Self>) -> Option<(Arc<Connection>, i32)> {
        let (upstream, msgid) = self.upstream()?;
        let backend = upstream.backend();

        let mut backend_state = backend.as_ref().map(|b| b.lock());
        let mut inner = upstream.lock();
        match inner.ops.get(&msgid) {
            Some(found) if Arc::ptr_eq(found, self) => {}
            _ => return None,
        }
        inner.ops.remove(&msgid);
        inner.n_ops_executing = inner.n_ops_executing.saturating_sub(1);
        if let Some(state) = backend_state.as_mut() {
            state.n_ops_executing = state.n_ops_executing.saturating_sub(1);
        }
        drop(inner);
        drop(backend_state);

        self.clear_upstream();
        Some((upstream, msgid))
    }

    /// Remove the operation from its client's tree if it is still there.
    pub fn remove_from_client(self: &Arc<Self>) -> bool {
        let Some(client) = self.client() else {
            return false;
        };
        let mut inner = client.lock();
        match inner.ops.get(&self.client_msgid) {
            Some(found) if Arc::ptr_eq(found, self) => {
                inner.ops.remove(&self.client_msgid);
                true
            }
            _ => false,
        }
    }

    /// Send the client a result for this request generated by the proxy.
    pub fn send_reject(&self, code: i32, message: &str) {
        metrics::record_rejected(code);
        let Some(client) = self.client() else {
            return;
        };
        let Some(res_tag) = request_to_response(self.tag()) else {
            return;
        };
        tracing::debug!(
            connection_id = %self.client_id,
            msgid = self.client_msgid,
            result = code,
            message,
            "Rejecting operation"
        );
        client.send(&result_pdu(self.client_msgid, res_tag, code, message));
    }

    /// Stop the backend from working on this operation, if it still is.
    pub fn abandon(self: &Arc<Self>) {
        if let Some((upstream, msgid)) = self.unlink_upstream() {
            self.cancel_upstream(&upstream, msgid);
        }
    }

    /// Tell an upstream this operation is no longer wanted. A direct bind
    /// cannot be abandoned, so its upstream is closed instead.
    pub(crate) fn cancel_upstream(&self, upstream: &Arc<Connection>, msgid: i32) {
        if self.tag() == tag::REQ_BIND && upstream.state() == ConnState::Binding {
            tracing::debug!(
                upstream = %upstream.id(),
                "Closing upstream with an abandoned bind"
            );
            session::upstream::destroy(upstream);
        } else {
            send_abandon(upstream, msgid);
        }
    }

    /// The upstream carrying this operation went away.
    pub(crate) fn lost_upstream(self: &Arc<Self>) {
        self.clear_upstream();
        if !self.remove_from_client() {
            return;
        }
        if self.tag() == tag::REQ_BIND {
            if let Some(client) = self.client() {
                let mut inner = client.lock();
                if inner.state == ConnState::Binding {
                    inner.state = ConnState::Ready;
                    inner.auth = None;
                }
            }
        }
        self.send_reject(
            result_code::UNAVAILABLE,
            "connection to the remote server has been severed",
        );
    }
}

/// Send an AbandonRequest for `target` on an upstream.
pub fn send_abandon(upstream: &Connection, target: i32) {
    let msgid = upstream.lock().take_msgid();
    let body = Bytes::from(ber::encode_int(target as i64));
    tracing::trace!(upstream = %upstream.id(), target, "Forwarding abandon");
    upstream.send(&Pdu::new(msgid, tag::REQ_ABANDON, body));
}
