//! Shared utilities for integration testing: a scriptable mock directory
//! server, a raw-PDU LDAP client and proxy startup helpers.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use lload_proxy::config::{BackendConfig, LloadConfig};
use lload_proxy::proto::ber::{self, Reader};
use lload_proxy::proto::{decode, request_to_response, result_code, tag, LdapResult, Pdu, VC_OID};
use lload_proxy::session::bind::{encode_simple_bind, BindRequest};
use lload_proxy::{Daemon, Fleet, Shutdown};

pub const PASSWORD: &str = "secret";
pub const SASL_MECH: &str = "MOCK";

#[derive(Default)]
struct MockState {
    received: Mutex<Vec<Pdu>>,
    connections: AtomicUsize,
    hold: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A mock directory server answering just enough LDAP to exercise the
/// proxy. Searches return two entries then a result; binds accept
/// `PASSWORD`; SASL `MOCK` needs two steps.
pub struct MockDirectory {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockDirectory {
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap()).await
    }

    pub async fn start_on(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let conn_state = accept_state.clone();
                let task = tokio::spawn(serve(conn_state, socket));
                accept_state.tasks.lock().unwrap().push(task);
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn uri(&self) -> String {
        format!("ldap://{}", self.addr)
    }

    /// Stop answering binds and searches (searches still send one entry).
    pub fn set_hold(&self, hold: bool) {
        self.state.hold.store(hold, Ordering::SeqCst);
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Every PDU received so far.
    pub fn received(&self) -> Vec<Pdu> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn received_with_tag(&self, op_tag: u8) -> Vec<Pdu> {
        self.received().into_iter().filter(|p| p.op_tag == op_tag).collect()
    }

    /// Close every open connection, leaving the listener up.
    pub fn drop_connections(&self) {
        for task in self.state.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    pub fn stop(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

impl Drop for MockDirectory {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(state: Arc<MockState>, mut socket: TcpStream) {
    let mut buf = BytesMut::new();
    loop {
        while let Ok(Some(pdu)) = decode(&mut buf, lload_proxy::proto::DEFAULT_MAX_PDU) {
            state.received.lock().unwrap().push(pdu.clone());
            let hold = state.hold.load(Ordering::SeqCst);
            for reply in respond(&pdu, hold) {
                if socket.write_all(&reply.encode()).await.is_err() {
                    return;
                }
            }
        }
        match socket.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn result_body(code: i32, message: &str, extra: &[(u8, &[u8])]) -> Bytes {
    let mut body = BytesMut::new();
    body.extend_from_slice(&LdapResult::new(code, "", message).encode());
    for (t, content) in extra {
        ber::put_element(&mut body, *t, content);
    }
    body.freeze()
}

pub fn entry_body(dn: &str) -> Bytes {
    let mut body = BytesMut::new();
    ber::put_element(&mut body, tag::OCTET_STRING, dn.as_bytes());
    ber::put_element(&mut body, tag::SEQUENCE, b"");
    body.freeze()
}

/// Outcome of checking credentials: result code and server credentials.
fn check_auth(auth: &Bytes) -> (i32, Option<&'static [u8]>) {
    let mut reader = Reader::new(auth.clone());
    let (auth_tag, content) = reader.read_any().unwrap();
    if auth_tag == tag::AUTH_SIMPLE {
        return if &content[..] == PASSWORD.as_bytes() {
            (result_code::SUCCESS, None)
        } else {
            (49, None)
        };
    }
    let mut sasl = Reader::new(content);
    let mech = sasl.read_tagged(tag::OCTET_STRING).unwrap();
    let creds = sasl.read_optional(tag::OCTET_STRING).unwrap();
    if &mech[..] != SASL_MECH.as_bytes() {
        return (7, None);
    }
    match creds.as_deref() {
        Some(b"step2") => (result_code::SUCCESS, None),
        _ => (result_code::SASL_BIND_IN_PROGRESS, Some(&b"challenge"[..])),
    }
}

fn respond(pdu: &Pdu, hold: bool) -> Vec<Pdu> {
    match pdu.op_tag {
        tag::REQ_UNBIND | tag::REQ_ABANDON => Vec::new(),
        tag::REQ_BIND => {
            if hold {
                return Vec::new();
            }
            let req = BindRequest::parse(&pdu.body).unwrap();
            let (code, creds) = check_auth(&req.auth);
            let extra: Vec<(u8, &[u8])> = creds.map(|c| (tag::SASL_RES_CREDS, c)).into_iter().collect();
            vec![Pdu::new(pdu.msgid, tag::RES_BIND, result_body(code, "", &extra))]
        }
        tag::REQ_SEARCH => {
            let first = Pdu::new(pdu.msgid, tag::RES_SEARCH_ENTRY, entry_body("cn=one,dc=example"));
            if hold {
                return vec![first];
            }
            vec![
                first,
                Pdu::new(pdu.msgid, tag::RES_SEARCH_ENTRY, entry_body("cn=two,dc=example")),
                Pdu::new(pdu.msgid, tag::RES_SEARCH_RESULT, result_body(0, "", &[]))
                    .with_controls(Some(Bytes::from_static(&[0x30, 0x03, 0x04, 0x01, b'z']))),
            ]
        }
        tag::REQ_EXTENDED => {
            let mut exop = Reader::new(pdu.body.clone());
            let oid = exop.read_tagged(tag::EXOP_REQ_OID).unwrap();
            if &oid[..] != VC_OID.as_bytes() {
                return vec![Pdu::new(pdu.msgid, tag::RES_EXTENDED, result_body(2, "unsupported", &[]))];
            }
            if hold {
                return Vec::new();
            }
            let mut value = Reader::new(exop.read_tagged(tag::EXOP_REQ_VALUE).unwrap());
            let mut fields = Reader::new(value.read_tagged(tag::SEQUENCE).unwrap());
            let _cookie = fields.read_optional(tag::VC_COOKIE).unwrap();
            let _dn = fields.read_tagged(tag::OCTET_STRING).unwrap();
            let (_, auth) = fields.read_raw().unwrap();

            let (code, creds) = check_auth(&auth);
            let mut extra: Vec<(u8, &[u8])> = Vec::new();
            if code == result_code::SASL_BIND_IN_PROGRESS {
                extra.push((tag::VC_COOKIE, &b"vc-cookie"[..]));
            }
            if let Some(creds) = creds {
                extra.push((tag::VC_SCREDS, creds));
            }
            vec![Pdu::new(pdu.msgid, tag::RES_EXTENDED, result_body(code, "", &extra))]
        }
        other => match request_to_response(other) {
            Some(res) => vec![Pdu::new(pdu.msgid, res, result_body(0, "", &[]))],
            None => Vec::new(),
        },
    }
}

/// A raw LDAP client speaking PDUs.
pub struct LdapClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl LdapClient {
    pub async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, pdu: &Pdu) {
        self.stream.write_all(&pdu.encode()).await.unwrap();
    }

    /// Write several PDUs with a single socket write.
    pub async fn send_pipelined(&mut self, pdus: &[Pdu]) {
        let mut out = BytesMut::new();
        for pdu in pdus {
            pdu.encode_into(&mut out);
        }
        self.stream.write_all(&out).await.unwrap();
    }

    /// Next PDU, or None on EOF or after `limit` without one.
    pub async fn recv_within(&mut self, limit: Duration) -> Option<Pdu> {
        tokio::time::timeout(limit, async {
            loop {
                if let Some(pdu) = decode(&mut self.buf, lload_proxy::proto::DEFAULT_MAX_PDU).unwrap() {
                    return Some(pdu);
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn recv(&mut self) -> Pdu {
        self.recv_within(Duration::from_secs(5))
            .await
            .expect("no PDU from proxy")
    }

    /// Send a search and collect everything up to its final result.
    pub async fn search(&mut self, msgid: i32) -> Vec<Pdu> {
        self.send(&search_request(msgid)).await;
        let mut replies = Vec::new();
        loop {
            let pdu = self.recv().await;
            let done = pdu.op_tag == tag::RES_SEARCH_RESULT;
            replies.push(pdu);
            if done {
                return replies;
            }
        }
    }

    pub async fn simple_bind(&mut self, msgid: i32, dn: &str, password: &str) -> Pdu {
        self.send(&Pdu::new(msgid, tag::REQ_BIND, encode_simple_bind(dn, password)))
            .await;
        self.recv().await
    }
}

pub fn search_request(msgid: i32) -> Pdu {
    let mut body = BytesMut::new();
    ber::put_element(&mut body, tag::OCTET_STRING, b"dc=example");
    ber::put_int(&mut body, tag::ENUMERATED, 2);
    Pdu::new(msgid, tag::REQ_SEARCH, body.freeze())
}

pub fn sasl_bind(msgid: i32, creds: &[u8]) -> Pdu {
    let mut sasl = BytesMut::new();
    ber::put_element(&mut sasl, tag::OCTET_STRING, SASL_MECH.as_bytes());
    ber::put_element(&mut sasl, tag::OCTET_STRING, creds);
    let mut body = BytesMut::new();
    ber::put_int(&mut body, tag::INTEGER, 3);
    ber::put_element(&mut body, tag::OCTET_STRING, b"");
    ber::put_element(&mut body, tag::AUTH_SASL, &sasl);
    Pdu::new(msgid, tag::REQ_BIND, body.freeze())
}

pub fn abandon_request(msgid: i32, target: i32) -> Pdu {
    Pdu::new(msgid, tag::REQ_ABANDON, ber::encode_int(target as i64))
}

pub fn result_of(pdu: &Pdu) -> LdapResult {
    LdapResult::parse(&pdu.body).unwrap()
}

/// Configuration listening on an ephemeral port with one backend per mock.
pub fn proxy_config(mocks: &[&MockDirectory]) -> LloadConfig {
    let mut config = LloadConfig::default();
    config.listener.listen = vec!["ldap://127.0.0.1:0".to_string()];
    for (i, mock) in mocks.iter().enumerate() {
        let mut backend = BackendConfig::new(format!("dir{}", i + 1), mock.uri());
        backend.retry_ms = 100;
        config.backends.push(backend);
    }
    config
}

pub struct ProxyHandle {
    pub addr: String,
    pub fleet: Arc<Fleet>,
    pub shutdown: Shutdown,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn client(&self) -> LdapClient {
        LdapClient::connect(&self.addr).await
    }

    /// Wait until every backend has filled both pools.
    pub async fn wait_ready(&self) {
        let fleet = self.fleet.clone();
        let virtual_bind = fleet.settings().virtual_bind;
        wait_until(Duration::from_secs(5), move || {
            let fleet = fleet.clone();
            async move {
                fleet.backends().iter().all(|b| {
                    b.active() >= b.numconns && (virtual_bind || b.bindavail() >= b.numbindconns)
                })
            }
        })
        .await;
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

pub async fn start_proxy(config: LloadConfig) -> ProxyHandle {
    let daemon = Daemon::bind(&config).await.unwrap();
    let addr = daemon.local_names()[0].clone();
    let fleet = daemon.fleet().clone();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(daemon.run(shutdown.clone()));
    ProxyHandle {
        addr,
        fleet,
        shutdown,
        task,
    }
}

/// Poll `check` until it holds; panics after `limit`.
pub async fn wait_until<F, Fut>(limit: Duration, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", limit);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
