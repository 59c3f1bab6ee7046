//! Operation timeout enforcement.
//!
//! # Responsibilities
//! - Periodically find forwarded operations older than the timeout
//! - Stop the backend working on them
//! - Answer the client with a limit-exceeded result
//!
//! # Design Decisions
//! - Searches get TIMELIMIT_EXCEEDED, everything else ADMINLIMIT_EXCEEDED
//! - A timed-out direct bind closes its upstream, since binds cannot be
//!   abandoned

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::time;

use crate::fleet::Fleet;
use crate::net::connection::ConnState;
use crate::observability::metrics;
use crate::proto::{result_code, tag};
use crate::session::operation::Operation;

const TIMEOUT_MESSAGE: &str = "upstream did not respond in time";

pub struct OperationSweeper {
    fleet: Arc<Fleet>,
    timeout: Duration,
    interval: Duration,
}

impl OperationSweeper {
    pub fn new(fleet: Arc<Fleet>, timeout: Duration) -> Self {
        let interval = (timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(5));
        Self {
            fleet,
            timeout,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            timeout_ms = self.timeout.as_millis() as u64,
            interval_ms = self.interval.as_millis() as u64,
            "Operation timeout sweep starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.sweep(Instant::now());
                    if expired > 0 {
                        tracing::debug!(expired, "Timed out operations");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Operation timeout sweep received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Expire every operation started before `now - timeout`. Returns the
    /// number expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut stale: Vec<Arc<Operation>> = Vec::new();
        for backend in self.fleet.backends() {
            let upstreams = backend.lock().all_connections();
            for upstream in upstreams {
                let inner = upstream.lock();
                stale.extend(
                    inner
                        .ops
                        .values()
                        .filter(|op| now.saturating_duration_since(op.started()) >= self.timeout)
                        .cloned(),
                );
            }
        }

        stale.into_iter().filter(|op| expire(op)).count()
    }
}

fn expire(op: &Arc<Operation>) -> bool {
    let Some((upstream, msgid)) = op.unlink_upstream() else {
        return false;
    };
    tracing::debug!(
        connection_id = %op.client_id(),
        msgid = op.client_msgid(),
        upstream = %upstream.id(),
        upstream_msgid = msgid,
        "Operation timed out"
    );
    op.cancel_upstream(&upstream, msgid);
    metrics::record_timed_out();

    if !op.remove_from_client() {
        return true;
    }
    if op.tag() == tag::REQ_BIND {
        if let Some(client) = op.client() {
            let mut inner = client.lock();
            if inner.state == ConnState::Binding {
                inner.state = ConnState::Ready;
            }
            inner.auth = None;
            inner.sasl_mech = None;
            inner.vc_cookie = None;
        }
    }

    let code = if op.tag() == tag::REQ_SEARCH {
        result_code::TIMELIMIT_EXCEEDED
    } else {
        result_code::ADMINLIMIT_EXCEEDED
    };
    op.send_reject(code, TIMEOUT_MESSAGE);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::fleet::{testing, FleetSettings};
    use crate::net::connection::PoolKind;
    use crate::proto::{LdapResult, Pdu};
    use crate::session::client::handle_request;
    use bytes::Bytes;

    #[test]
    fn test_sweep_expires_old_operations() {
        let fleet = testing::fleet(FleetSettings::default(), &[BackendConfig::new("b1", "ldap://h1")]);
        let backend = fleet.backends()[0].clone();
        let upstream = testing::upstream(&fleet, &backend, PoolKind::Regular);
        let client = testing::client(&fleet);

        handle_request(&client, Pdu::new(1, tag::REQ_SEARCH, Bytes::from_static(b"\x04\x00"))).unwrap();
        handle_request(&client, Pdu::new(2, tag::REQ_DELETE, Bytes::from_static(b"cn=x"))).unwrap();
        upstream.take_sent();

        let sweeper = OperationSweeper::new(fleet.clone(), Duration::from_secs(10));
        assert_eq!(sweeper.sweep(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(sweeper.sweep(later), 2);
        assert_eq!(sweeper.sweep(later), 0);

        let replies = client.take_sent();
        assert_eq!(replies.len(), 2);
        let search = replies.iter().find(|p| p.msgid == 1).unwrap();
        let delete = replies.iter().find(|p| p.msgid == 2).unwrap();
        let search_result = LdapResult::parse(&search.body).unwrap();
        assert_eq!(search_result.code, result_code::TIMELIMIT_EXCEEDED);
        assert_eq!(&search_result.message[..], TIMEOUT_MESSAGE.as_bytes());
        assert_eq!(
            LdapResult::parse(&delete.body).unwrap().code,
            result_code::ADMINLIMIT_EXCEEDED
        );

        assert_eq!(backend.n_ops_executing(), 0);
        assert!(client.lock().ops.is_empty());
        let abandons = upstream.take_sent();
        assert_eq!(abandons.len(), 2);
        assert!(abandons.iter().all(|p| p.op_tag == tag::REQ_ABANDON));
    }

    #[test]
    fn test_timed_out_bind_resets_client() {
        let fleet = testing::fleet(FleetSettings::default(), &[BackendConfig::new("b1", "ldap://h1")]);
        let backend = fleet.backends()[0].clone();
        let bind_conn = testing::upstream(&fleet, &backend, PoolKind::Bind);
        let client = testing::client(&fleet);

        let body = crate::session::bind::encode_simple_bind("cn=a", "pw");
        handle_request(&client, Pdu::new(1, tag::REQ_BIND, body)).unwrap();
        assert_eq!(client.state(), ConnState::Binding);

        let sweeper = OperationSweeper::new(fleet.clone(), Duration::from_secs(1));
        assert_eq!(sweeper.sweep(Instant::now() + Duration::from_secs(2)), 1);
        assert_eq!(client.state(), ConnState::Ready);
        assert!(client.lock().auth.is_none());
        assert_eq!(bind_conn.state(), ConnState::Invalid);

        let reply = client.take_sent();
        assert_eq!(reply[0].op_tag, tag::RES_BIND);
        assert_eq!(
            LdapResult::parse(&reply[0].body).unwrap().code,
            result_code::ADMINLIMIT_EXCEEDED
        );
    }
}
