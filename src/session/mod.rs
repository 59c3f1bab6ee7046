//! Session layer: client and upstream semantics on top of `Connection`.
//!
//! # Data Flow
//! ```text
//! client PDU → client.rs
//!     UNBIND   → teardown
//!     BIND     → bind.rs (direct or verify-credentials forwarding)
//!     ABANDON  → operation.rs (unlink + abandon upstream)
//!     other    → load_balancer::pool::select → upstream write
//!
//! upstream PDU → upstream.rs
//!     lookup by upstream msgid → re-tag with client msgid → client write
//!     bind responses → bind.rs (state transitions, VC rewriting)
//! ```
//!
//! # Design Decisions
//! - Errors returned from PDU handlers are fatal to that connection only
//! - Client-visible failures are always LDAP result PDUs
//! - A final response leaves the client tree before it is written, so a
//!   client may reuse the message id as soon as it sees the result

pub mod bind;
pub mod client;
pub mod operation;
pub mod upstream;

use std::sync::Arc;

use thiserror::Error;

use crate::net::connection::{Connection, Role};
use crate::proto::{Pdu, ProtoError};

/// Conditions that end a connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unbind requested")]
    Unbind,

    #[error("message id {0} already in use")]
    DuplicateMsgid(i32),

    #[error("malformed request: {0}")]
    Protocol(#[from] ProtoError),

    #[error("unsolicited notification from backend")]
    Unsolicited,

    #[error("unexpected {0} during upstream setup")]
    UnexpectedSetup(&'static str),

    #[error("upstream bind failed with result {0}")]
    SetupBindFailed(i32),

    #[error("shutting down")]
    ShuttingDown,
}

/// Route one PDU read from `conn`.
pub fn handle_pdu(conn: &Arc<Connection>, pdu: Pdu) -> Result<(), SessionError> {
    match conn.role() {
        Role::Client => client::handle_request(conn, pdu),
        Role::Upstream { .. } => upstream::handle_response(conn, pdu),
    }
}

/// Tear `conn` down the way its role requires.
pub fn teardown(conn: &Arc<Connection>) {
    match conn.role() {
        Role::Client => client::destroy(conn),
        Role::Upstream { .. } => upstream::destroy(conn),
    }
}
