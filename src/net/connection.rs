//! Connection state machine, reference counting and socket I/O.
//!
//! # Responsibilities
//! - Track connection state (Invalid → Ready → Active/Binding → Closing → Invalid)
//! - Own the per-connection operation tree keyed by message id
//! - Count holders (`refcnt`) and running I/O tasks (`live`)
//! - Drive the socket: one reader task, one writer task
//!
//! # Data Flow
//! ```text
//! reader task: socket → BytesMut → proto::decode → session::handle_pdu
//! writers:     session code → Connection::send → pending buffer (I/O mutex)
//!                 → Notify → writer task → socket
//! ```
//!
//! A connection counts as having a write pending only while the writer is
//! stuck on a socket that cannot take more bytes. Queued bytes the writer
//! has not reached yet do not count, so pipelined requests can share one
//! upstream. A flush that stays stuck past the write timeout tears the
//! connection down.
//!
//! # Design Decisions
//! - Two independent `parking_lot` mutexes: `inner` (state, op tree,
//!   refcnt) and `io` (outbound bytes). A slow flush never blocks a
//!   routing decision. Neither is held across an `.await`.
//! - Lock order: backend → `inner` → `io`
//! - `destroy` runs exactly once, from whichever release observes
//!   `refcnt == 0 && live == 0 && state == Invalid`

use std::collections::BTreeMap;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::fleet::Fleet;
use crate::load_balancer::backend::Backend;
use crate::net::listener::ConnectionPermit;
use crate::net::Stream;
use crate::observability::metrics;
use crate::proto::{self, Pdu};
use crate::session::{self, operation::Operation};

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Not usable: never started or fully torn down.
    Invalid,
    Ready,
    /// Exclusive setup in progress (upstream authentication).
    Active,
    /// A bind is outstanding; other requests are refused.
    Binding,
    /// Teardown in progress.
    Closing,
}

/// Which pool of its backend an upstream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Preparing,
    Regular,
    Bind,
}

/// Which side of the proxy a connection faces.
#[derive(Debug, Clone)]
pub enum Role {
    Client,
    Upstream { backend: Weak<Backend> },
}

/// State guarded by the connection's state mutex.
#[derive(Debug)]
pub struct ConnInner {
    pub state: ConnState,
    /// Running I/O tasks.
    pub live: usize,
    pub refcnt: usize,
    /// In-flight operations keyed by this side's message id.
    pub ops: BTreeMap<i32, Arc<Operation>>,
    /// Operations forwarded here and not yet answered (upstreams).
    pub n_ops_executing: usize,
    /// Next message id to hand out (upstreams).
    pub next_msgid: i32,
    /// Bound identity, `dn:` prefixed.
    pub auth: Option<String>,
    pub sasl_mech: Option<String>,
    /// Verify-credentials cookie between SASL steps.
    pub vc_cookie: Option<Bytes>,
    pub pool: PoolKind,
    /// Message id of the upstream's own setup bind.
    pub setup_msgid: Option<i32>,
    pub last_activity: Instant,
    tasks: Vec<AbortHandle>,
    permit: Option<ConnectionPermit>,
    destroyed: bool,
}

impl ConnInner {
    /// Hand out the next upstream message id, never 0.
    pub fn take_msgid(&mut self) -> i32 {
        let msgid = self.next_msgid;
        self.next_msgid = if self.next_msgid == i32::MAX {
            1
        } else {
            self.next_msgid + 1
        };
        msgid
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

#[derive(Debug, Default)]
struct IoState {
    pending: BytesMut,
    /// The writer found the socket full and is waiting on it.
    blocked: bool,
    closed: bool,
}

/// Per-connection I/O limits.
#[derive(Debug, Clone, Copy)]
pub struct IoLimits {
    pub max_pdu: usize,
    pub pdus_per_cycle: usize,
    /// How long one flush may wait on the peer (None = forever).
    pub write_timeout: Option<Duration>,
}

/// A client or upstream LDAP connection.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    role: Role,
    fleet: Weak<Fleet>,
    inner: Mutex<ConnInner>,
    io: Mutex<IoState>,
    writable: Notify,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .finish()
    }
}

impl Connection {
    /// Create a connection in the Ready state, not yet attached to a socket.
    pub fn init(id: ConnectionId, peer: impl Into<String>, role: Role, fleet: Weak<Fleet>) -> Arc<Self> {
        let pool = match role {
            Role::Client => PoolKind::Regular,
            Role::Upstream { .. } => PoolKind::Preparing,
        };
        let conn = Arc::new(Self {
            id,
            peer: peer.into(),
            role,
            fleet,
            inner: Mutex::new(ConnInner {
                state: ConnState::Ready,
                live: 0,
                refcnt: 0,
                ops: BTreeMap::new(),
                n_ops_executing: 0,
                next_msgid: 1,
                auth: None,
                sasl_mech: None,
                vc_cookie: None,
                pool,
                setup_msgid: None,
                last_activity: Instant::now(),
                tasks: Vec::new(),
                permit: None,
                destroyed: false,
            }),
            io: Mutex::new(IoState::default()),
            writable: Notify::new(),
        });
        metrics::record_connection_opened(conn.role_label());
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client)
    }

    pub fn role_label(&self) -> &'static str {
        match self.role {
            Role::Client => "client",
            Role::Upstream { .. } => "upstream",
        }
    }

    pub fn backend(&self) -> Option<Arc<Backend>> {
        match &self.role {
            Role::Upstream { backend } => backend.upgrade(),
            Role::Client => None,
        }
    }

    pub fn fleet(&self) -> Option<Arc<Fleet>> {
        self.fleet.upgrade()
    }

    /// Lock the state mutex.
    pub fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    pub fn set_permit(&self, permit: ConnectionPermit) {
        self.inner.lock().permit = Some(permit);
    }

    /// Take a counted reference that keeps the connection from being
    /// destroyed. Fails once the connection is Invalid.
    pub fn acquire(self: &Arc<Self>) -> Option<ConnRef> {
        let mut inner = self.inner.lock();
        if inner.state == ConnState::Invalid {
            return None;
        }
        inner.refcnt += 1;
        Some(ConnRef { conn: self.clone() })
    }

    fn release_ref(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.refcnt > 0, "refcnt underflow on {}", self.id);
        inner.refcnt = inner.refcnt.saturating_sub(1);
        self.maybe_destroy(&mut inner);
    }

    fn enter_live(self: &Arc<Self>) -> LiveGuard {
        self.inner.lock().live += 1;
        LiveGuard { conn: self.clone() }
    }

    fn leave_live(&self) {
        let mut inner = self.inner.lock();
        inner.live = inner.live.saturating_sub(1);
        self.maybe_destroy(&mut inner);
    }

    fn maybe_destroy(&self, inner: &mut ConnInner) {
        if inner.refcnt == 0
            && inner.live == 0
            && inner.state == ConnState::Invalid
            && !inner.destroyed
        {
            self.destroy(inner);
        }
    }

    /// Release everything the connection still holds.
    fn destroy(&self, inner: &mut ConnInner) {
        debug_assert!(inner.refcnt == 0 && inner.live == 0 && inner.state == ConnState::Invalid);
        inner.destroyed = true;
        inner.ops.clear();
        inner.auth = None;
        inner.sasl_mech = None;
        inner.vc_cookie = None;
        inner.tasks.clear();
        inner.permit = None;
        {
            let mut io = self.io.lock();
            io.pending = BytesMut::new();
        }
        metrics::record_connection_closed(self.role_label());
        tracing::debug!(connection_id = %self.id, peer = %self.peer, "Connection destroyed");
    }

    /// Final teardown step shared by both roles: drop identity, stop the
    /// I/O tasks, free buffers and mark the connection Invalid.
    pub fn finish_close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnState::Invalid {
            return;
        }
        inner.auth = None;
        inner.sasl_mech = None;
        inner.vc_cookie = None;
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        {
            let mut io = self.io.lock();
            io.closed = true;
            io.pending.clear();
        }
        self.writable.notify_one();
        inner.state = ConnState::Invalid;
        self.maybe_destroy(&mut inner);
    }

    /// Queue a PDU for the writer task. Returns false once I/O is closed.
    pub fn send(&self, pdu: &Pdu) -> bool {
        {
            let mut io = self.io.lock();
            if io.closed {
                return false;
            }
            pdu.encode_into(&mut io.pending);
        }
        self.writable.notify_one();
        true
    }

    /// Whether the writer is blocked on a socket that cannot take more.
    pub fn has_pending_write(&self) -> bool {
        self.io.lock().blocked
    }

    #[cfg(test)]
    pub(crate) fn set_write_blocked(&self, blocked: bool) {
        self.io.lock().blocked = blocked;
    }

    /// Drain and decode everything queued for the writer.
    #[cfg(test)]
    pub(crate) fn take_sent(&self) -> Vec<Pdu> {
        let mut io = self.io.lock();
        let mut sent = Vec::new();
        while let Ok(Some(pdu)) = proto::decode(&mut io.pending, proto::DEFAULT_MAX_PDU) {
            sent.push(pdu);
        }
        sent
    }

    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    /// Attach a socket and spawn the reader and writer tasks.
    pub fn start<S: Stream>(self: &Arc<Self>, stream: S, limits: IoLimits) {
        let (reader, writer) = tokio::io::split(stream);

        let write_guard = self.enter_live();
        let writer_task = tokio::spawn(write_loop(write_guard, writer, limits.write_timeout));
        let read_guard = self.enter_live();
        let reader_task = tokio::spawn(read_loop(read_guard, reader, limits));

        let mut inner = self.inner.lock();
        if inner.state == ConnState::Invalid {
            writer_task.abort();
            reader_task.abort();
            return;
        }
        inner.tasks.push(writer_task.abort_handle());
        inner.tasks.push(reader_task.abort_handle());
    }
}

/// A counted reference held across an await point.
#[derive(Debug)]
pub struct ConnRef {
    conn: Arc<Connection>,
}

impl std::ops::Deref for ConnRef {
    type Target = Arc<Connection>;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for ConnRef {
    fn drop(&mut self) {
        self.conn.release_ref();
    }
}

/// Held by each I/O task for as long as it runs, including when aborted.
struct LiveGuard {
    conn: Arc<Connection>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.conn.leave_live();
    }
}

async fn read_loop<R>(guard: LiveGuard, mut reader: R, limits: IoLimits)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let conn = &guard.conn;
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut handled = 0usize;

    loop {
        loop {
            match proto::decode(&mut buf, limits.max_pdu) {
                Ok(Some(pdu)) => {
                    conn.touch();
                    if let Err(e) = session::handle_pdu(conn, pdu) {
                        tracing::debug!(connection_id = %conn.id(), error = %e, "Closing connection");
                        session::teardown(conn);
                        return;
                    }
                    handled += 1;
                    if handled >= limits.pdus_per_cycle {
                        handled = 0;
                        tokio::task::yield_now().await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %conn.id(), peer = %conn.peer(), error = %e, "Malformed PDU");
                    session::teardown(conn);
                    return;
                }
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::debug!(connection_id = %conn.id(), "Connection closed by peer");
                session::teardown(conn);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "Read failed");
                session::teardown(conn);
                return;
            }
        }
    }
}

enum WriteStep {
    Close,
    Wait,
    Flush(Bytes),
}

async fn write_loop<W>(guard: LiveGuard, mut writer: W, write_timeout: Option<Duration>)
where
    W: AsyncWrite + Unpin,
{
    let conn = &guard.conn;
    loop {
        let step = {
            let mut io = conn.io.lock();
            if io.closed {
                WriteStep::Close
            } else if io.pending.is_empty() {
                WriteStep::Wait
            } else {
                WriteStep::Flush(io.pending.split().freeze())
            }
        };

        match step {
            WriteStep::Close => {
                let _ = writer.shutdown().await;
                return;
            }
            WriteStep::Wait => conn.writable.notified().await,
            WriteStep::Flush(bytes) => {
                let written = match write_timeout {
                    Some(limit) => tokio::time::timeout(limit, flush(conn, &mut writer, &bytes))
                        .await
                        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))),
                    None => flush(conn, &mut writer, &bytes).await,
                };
                conn.io.lock().blocked = false;
                if let Err(e) = written {
                    tracing::debug!(connection_id = %conn.id(), peer = %conn.peer(), error = %e, "Write failed");
                    session::teardown(conn);
                    return;
                }
            }
        }
    }
}

/// Write `bytes` out, flagging the connection blocked whenever the socket
/// is full.
async fn flush<W>(conn: &Connection, writer: &mut W, mut bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while !bytes.is_empty() {
        let n = poll_fn(|cx| {
            let polled = Pin::new(&mut *writer).poll_write(cx, bytes);
            if polled.is_pending() {
                conn.io.lock().blocked = true;
            }
            polled
        })
        .await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        bytes = &bytes[n..];
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::tag;

    fn client() -> Arc<Connection> {
        Connection::init(ConnectionId::new(1), "test", Role::Client, Weak::new())
    }

    #[test]
    fn connection_id_display() {
        assert_eq!(ConnectionId::new(42).to_string(), "conn-42");
    }

    #[test]
    fn test_msgid_skips_zero_on_wrap() {
        let conn = client();
        let mut inner = conn.lock();
        inner.next_msgid = i32::MAX;
        assert_eq!(inner.take_msgid(), i32::MAX);
        assert_eq!(inner.take_msgid(), 1);
    }

    #[test]
    fn test_refcount_defers_destroy() {
        let conn = client();
        let held = conn.acquire().unwrap();
        conn.finish_close();
        {
            let inner = conn.lock();
            assert_eq!(inner.state, ConnState::Invalid);
            assert_eq!(inner.refcnt, 1);
            assert!(!inner.is_destroyed());
        }
        drop(held);
        let inner = conn.lock();
        assert_eq!(inner.refcnt, 0);
        assert!(inner.is_destroyed());
    }

    #[test]
    fn test_acquire_fails_once_invalid() {
        let conn = client();
        conn.finish_close();
        assert!(conn.acquire().is_none());
        assert!(conn.lock().is_destroyed());
    }

    fn limits(write_timeout: Option<Duration>) -> IoLimits {
        IoLimits {
            max_pdu: 1024,
            pdus_per_cycle: 10,
            write_timeout,
        }
    }

    fn large_pdu() -> Pdu {
        Pdu::new(3, tag::RES_SEARCH_ENTRY, Bytes::from(vec![0x04; 4096]))
    }

    async fn wait_for(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_send_after_close_is_refused() {
        let conn = client();
        assert!(conn.send(&Pdu::new(1, tag::REQ_UNBIND, Bytes::new())));
        assert!(!conn.has_pending_write());
        conn.finish_close();
        assert!(!conn.send(&Pdu::new(2, tag::REQ_UNBIND, Bytes::new())));
        assert!(conn.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_pending_write_only_when_peer_stalls() {
        let conn = client();
        let (local, mut remote) = tokio::io::duplex(64);
        conn.start(local, limits(None));

        assert!(conn.send(&large_pdu()));
        assert!(conn.send(&large_pdu()));
        assert!(wait_for(|| conn.has_pending_write()).await);

        let mut buf = BytesMut::new();
        let mut seen = 0;
        while seen < 2 {
            remote.read_buf(&mut buf).await.unwrap();
            while proto::decode(&mut buf, 8192).unwrap().is_some() {
                seen += 1;
            }
        }
        assert!(wait_for(|| !conn.has_pending_write()).await);
        conn.finish_close();
    }

    #[tokio::test]
    async fn test_write_timeout_tears_down() {
        let conn = client();
        let (local, _remote) = tokio::io::duplex(64);
        conn.start(local, limits(Some(Duration::from_millis(50))));

        assert!(conn.send(&large_pdu()));
        assert!(wait_for(|| conn.lock().is_destroyed()).await);
        assert_eq!(conn.state(), ConnState::Invalid);
        assert!(!conn.send(&large_pdu()));
    }

    #[tokio::test]
    async fn test_writer_flushes_pending() {
        let conn = client();
        let (local, mut remote) = tokio::io::duplex(1024);
        conn.start(local, limits(None));

        let pdu = Pdu::new(9, tag::RES_DELETE, Bytes::from_static(&[0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00]));
        assert!(conn.send(&pdu));

        let mut buf = BytesMut::new();
        let decoded = loop {
            remote.read_buf(&mut buf).await.unwrap();
            if let Some(decoded) = proto::decode(&mut buf, 1024).unwrap() {
                break decoded;
            }
        };
        assert_eq!(decoded, pdu);
        conn.finish_close();
    }

    #[tokio::test]
    async fn test_live_tasks_hold_connection() {
        let conn = client();
        let (local, _remote) = tokio::io::duplex(1024);
        conn.start(local, limits(None));
        assert_eq!(conn.lock().live, 2);

        conn.finish_close();
        for _ in 0..50 {
            if conn.lock().is_destroyed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let inner = conn.lock();
        assert_eq!(inner.live, 0);
        assert!(inner.is_destroyed());
    }
}
