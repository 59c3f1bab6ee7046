//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend directory server and its target URI
//! - Own the backend's upstream pools (preparing, regular, bind-only)
//! - Track pending-operation and connection-health counters
//! - Hold the single outstanding reconnect timer/attempt

use std::collections::VecDeque;
use std::fmt;
#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::task::AbortHandle;

use crate::config::BackendConfig;
use crate::net::address::{LdapUri, UriError};
use crate::net::connection::{Connection, PoolKind};
use crate::observability::metrics;

/// Mutable backend state, guarded by the backend mutex.
#[derive(Debug, Default)]
pub struct BackendState {
    /// Regular pool, tried front to back.
    pub conns: VecDeque<Arc<Connection>>,
    /// Bind-only pool used when virtual-bind is off.
    pub bindconns: VecDeque<Arc<Connection>>,
    /// Connected but not yet allocated to a pool.
    pub preparing: Vec<Arc<Connection>>,
    /// Connect attempts in flight, including preparing connections.
    pub opening: usize,
    /// Consecutive failed attempts.
    pub failed: usize,
    pub n_ops_executing: usize,
    pub retry_timer: Option<AbortHandle>,
    pub connect_task: Option<AbortHandle>,
}

impl BackendState {
    pub fn active(&self) -> usize {
        self.conns.len()
    }

    pub fn bindavail(&self) -> usize {
        self.bindconns.len()
    }

    /// Remove `conn` from whichever list holds it (compare-and-clear).
    pub fn remove_connection(&mut self, conn: &Arc<Connection>) -> Option<PoolKind> {
        if let Some(pos) = self.conns.iter().position(|c| Arc::ptr_eq(c, conn)) {
            self.conns.remove(pos);
            return Some(PoolKind::Regular);
        }
        if let Some(pos) = self.bindconns.iter().position(|c| Arc::ptr_eq(c, conn)) {
            self.bindconns.remove(pos);
            return Some(PoolKind::Bind);
        }
        if let Some(pos) = self.preparing.iter().position(|c| Arc::ptr_eq(c, conn)) {
            self.preparing.swap_remove(pos);
            return Some(PoolKind::Preparing);
        }
        None
    }

    /// Every upstream of this backend.
    pub fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.conns
            .iter()
            .chain(self.bindconns.iter())
            .chain(self.preparing.iter())
            .cloned()
            .collect()
    }
}

/// A single backend server.
pub struct Backend {
    pub name: String,
    pub uri: LdapUri,
    /// Regular pool target.
    pub numconns: usize,
    /// Bind pool target.
    pub numbindconns: usize,
    /// Per-backend pending-operation ceiling (0 = none).
    pub max_pending: usize,
    /// Per-connection pending-operation ceiling (0 = none).
    pub conn_max_pending: usize,
    pub retry_interval: Duration,
    state: Mutex<BackendState>,
    #[cfg(test)]
    connect_attempts: AtomicU64,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("uri", &self.uri)
            .finish()
    }
}

impl Backend {
    pub fn from_config(config: &BackendConfig) -> Result<Self, UriError> {
        let uri = LdapUri::parse(&config.uri)?.with_starttls(config.starttls);
        Ok(Self {
            name: config.name.clone(),
            uri,
            numconns: config.numconns,
            numbindconns: config.bindconns,
            max_pending: config.max_pending,
            conn_max_pending: config.conn_max_pending,
            retry_interval: Duration::from_millis(config.retry_ms),
            state: Mutex::new(BackendState::default()),
            #[cfg(test)]
            connect_attempts: AtomicU64::new(0),
        })
    }

    /// Lock the backend mutex. Always taken before any connection mutex.
    pub fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock()
    }

    /// Connections the supervisor keeps open.
    pub fn requested_conns(&self, virtual_bind: bool) -> usize {
        if virtual_bind {
            self.numconns
        } else {
            self.numconns + self.numbindconns
        }
    }

    /// Whether the backend-wide ceiling is reached.
    pub fn at_capacity(&self, state: &BackendState) -> bool {
        self.max_pending > 0 && state.n_ops_executing >= self.max_pending
    }

    pub fn record_connect_attempt(&self) {
        metrics::record_connect_attempt(&self.name);
        #[cfg(test)]
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Connect attempts started since creation.
    #[cfg(test)]
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn n_ops_executing(&self) -> usize {
        self.state.lock().n_ops_executing
    }

    pub fn opening(&self) -> usize {
        self.state.lock().opening
    }

    pub fn failed(&self) -> usize {
        self.state.lock().failed
    }

    pub fn active(&self) -> usize {
        self.state.lock().active()
    }

    pub fn bindavail(&self) -> usize {
        self.state.lock().bindavail()
    }

    /// Cancel pending reconnects and hand back every upstream for closing.
    pub fn shutdown(&self) -> Vec<Arc<Connection>> {
        let mut state = self.state.lock();
        if let Some(timer) = state.retry_timer.take() {
            timer.abort();
        }
        if let Some(task) = state.connect_task.take() {
            task.abort();
        }
        state.all_connections()
    }
}
