//! Upstream selection across backend pools.
//!
//! # Responsibilities
//! - Walk backends in balancer order, skipping any at its pending ceiling
//! - Pick the first Ready upstream not stalled on a write and with room for more
//! - Register the operation on the chosen upstream in the same critical
//!   section that bumps the backend and connection counters

use std::sync::Arc;

use thiserror::Error;

use crate::fleet::Fleet;
use crate::net::connection::{ConnState, Connection, PoolKind};
use crate::proto::result_code;
use crate::session::operation::Operation;

/// Why no upstream could take an operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    #[error("too many pending operations")]
    Busy,

    #[error("no connections available")]
    Unavailable,
}

impl SelectError {
    pub fn result_code(&self) -> i32 {
        match self {
            SelectError::Busy => result_code::BUSY,
            SelectError::Unavailable => result_code::UNAVAILABLE,
        }
    }
}

/// Choose an upstream for `op` and register it there.
///
/// On success the operation sits in the upstream's tree under the returned
/// message id and both pending counters include it. Selecting from the
/// bind pool also marks the upstream Binding so no other bind can share it.
pub fn select(
    fleet: &Fleet,
    op: &Arc<Operation>,
    pool: PoolKind,
) -> Result<(Arc<Connection>, i32), SelectError> {
    let backends = fleet.backends();
    let balancer = fleet.balancer();
    let mut busy = false;

    for index in balancer.candidates(backends.len()) {
        let backend = &backends[index];
        let mut state = backend.lock();

        if backend.at_capacity(&state) {
            tracing::debug!(
                backend = %backend.name,
                pending = state.n_ops_executing,
                "Backend at max pending, skipping"
            );
            busy = true;
            continue;
        }

        let list = match pool {
            PoolKind::Bind => &mut state.bindconns,
            PoolKind::Regular | PoolKind::Preparing => &mut state.conns,
        };

        let mut chosen = None;
        for (pos, conn) in list.iter().enumerate() {
            let mut inner = conn.lock();
            if inner.state != ConnState::Ready || conn.has_pending_write() {
                continue;
            }
            if backend.conn_max_pending > 0 && inner.n_ops_executing >= backend.conn_max_pending {
                continue;
            }

            let msgid = inner.take_msgid();
            inner.ops.insert(msgid, op.clone());
            inner.n_ops_executing += 1;
            if pool == PoolKind::Bind {
                inner.state = ConnState::Binding;
            }
            op.link_upstream(conn, msgid);
            chosen = Some((pos, msgid));
            break;
        }

        if let Some((pos, msgid)) = chosen {
            let Some(conn) = list.remove(pos) else {
                continue;
            };
            list.push_back(conn.clone());
            state.n_ops_executing += 1;
            balancer.chosen(index, backends.len());

            tracing::trace!(
                backend = %backend.name,
                upstream = %conn.id(),
                upstream_msgid = msgid,
                client_msgid = op.client_msgid(),
                "Operation assigned"
            );
            return Ok((conn, msgid));
        }
    }

    Err(if busy {
        SelectError::Busy
    } else {
        SelectError::Unavailable
    })
}
