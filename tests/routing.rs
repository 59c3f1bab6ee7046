//! Operation routing through a running proxy.

use std::time::Duration;

use lload_proxy::proto::{result_code, tag};

mod common;
use common::{abandon_request, entry_body, proxy_config, result_of, search_request, start_proxy, wait_until, MockDirectory};

#[tokio::test]
async fn test_search_round_trip_retags_responses() {
    let mock = MockDirectory::start().await;
    let proxy = start_proxy(proxy_config(&[&mock])).await;
    proxy.wait_ready().await;

    let mut client = proxy.client().await;
    let replies = client.search(7).await;

    assert_eq!(replies.len(), 3);
    assert!(replies.iter().all(|p| p.msgid == 7));
    assert_eq!(replies[0].op_tag, tag::RES_SEARCH_ENTRY);
    assert_eq!(replies[0].body, entry_body("cn=one,dc=example"));
    assert_eq!(replies[1].body, entry_body("cn=two,dc=example"));
    assert_eq!(result_of(&replies[2]).code, result_code::SUCCESS);
    assert_eq!(replies[2].controls.as_deref(), Some(&[0x30, 0x03, 0x04, 0x01, b'z'][..]));

    let forwarded = mock.received_with_tag(tag::REQ_SEARCH);
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].body, search_request(7).body);

    let backend = &proxy.fleet.backends()[0];
    assert_eq!(backend.n_ops_executing(), 0);
    proxy.stop().await;
}

#[tokio::test]
async fn test_pipelined_requests_share_single_upstream() {
    let mock = MockDirectory::start().await;
    let mut config = proxy_config(&[&mock]);
    config.backends[0].numconns = 1;
    config.backends[0].bindconns = 0;
    let proxy = start_proxy(config).await;
    proxy.wait_ready().await;

    let mut client = proxy.client().await;
    client
        .send_pipelined(&[search_request(1), search_request(2), search_request(3)])
        .await;

    let mut finals = Vec::new();
    while finals.len() < 3 {
        let pdu = client.recv().await;
        if pdu.op_tag == tag::RES_SEARCH_RESULT {
            finals.push((pdu.msgid, result_of(&pdu).code));
        }
    }
    finals.sort();
    assert_eq!(
        finals,
        vec![
            (1, result_code::SUCCESS),
            (2, result_code::SUCCESS),
            (3, result_code::SUCCESS),
        ]
    );
    assert_eq!(mock.received_with_tag(tag::REQ_SEARCH).len(), 3);
    assert_eq!(mock.connections(), 1);
    proxy.stop().await;
}

#[tokio::test]
async fn test_concurrent_clients_share_upstream() {
    let mock = MockDirectory::start().await;
    let proxy = start_proxy(proxy_config(&[&mock])).await;
    proxy.wait_ready().await;

    let mut a = proxy.client().await;
    let mut b = proxy.client().await;
    let (ra, rb) = tokio::join!(a.search(1), b.search(1));
    assert_eq!(ra.len(), 3);
    assert_eq!(rb.len(), 3);
    assert_eq!(mock.connections(), 2);
    proxy.stop().await;
}

#[tokio::test]
async fn test_no_backend_is_unavailable_and_connection_survives() {
    let proxy = start_proxy(proxy_config(&[])).await;
    let mut client = proxy.client().await;

    let reply = client.simple_bind(1, "cn=alice", common::PASSWORD).await;
    assert_eq!(reply.op_tag, tag::RES_BIND);
    assert_eq!(result_of(&reply).code, result_code::UNAVAILABLE);

    client.send(&search_request(2)).await;
    let reply = client.recv().await;
    assert_eq!(reply.msgid, 2);
    let result = result_of(&reply);
    assert_eq!(result.code, result_code::UNAVAILABLE);
    assert_eq!(&result.message[..], b"no connections available");
    proxy.stop().await;
}

#[tokio::test]
async fn test_full_backend_fails_over() {
    let first = MockDirectory::start().await;
    let second = MockDirectory::start().await;
    first.set_hold(true);
    second.set_hold(true);

    let mut config = proxy_config(&[&first, &second]);
    for backend in &mut config.backends {
        backend.bindconns = 0;
    }
    config.backends[0].conn_max_pending = 1;
    let proxy = start_proxy(config).await;
    proxy.wait_ready().await;

    let mut client = proxy.client().await;
    for msgid in 1..=3 {
        client.send(&search_request(msgid)).await;
        let entry = client.recv().await;
        assert_eq!(entry.msgid, msgid);
        assert_eq!(entry.op_tag, tag::RES_SEARCH_ENTRY);
    }

    assert_eq!(first.received_with_tag(tag::REQ_SEARCH).len(), 1);
    assert_eq!(second.received_with_tag(tag::REQ_SEARCH).len(), 2);
    proxy.stop().await;
}

#[tokio::test]
async fn test_all_backends_full_is_unavailable() {
    let first = MockDirectory::start().await;
    let second = MockDirectory::start().await;
    first.set_hold(true);
    second.set_hold(true);

    let mut config = proxy_config(&[&first, &second]);
    for backend in &mut config.backends {
        backend.bindconns = 0;
        backend.conn_max_pending = 1;
    }
    let proxy = start_proxy(config).await;
    proxy.wait_ready().await;

    let mut client = proxy.client().await;
    for msgid in 1..=2 {
        client.send(&search_request(msgid)).await;
        client.recv().await;
    }
    client.send(&search_request(3)).await;
    let reply = client.recv().await;
    assert_eq!(reply.msgid, 3);
    assert_eq!(reply.op_tag, tag::RES_SEARCH_RESULT);
    assert_eq!(result_of(&reply).code, result_code::UNAVAILABLE);
    proxy.stop().await;
}

#[tokio::test]
async fn test_backend_ceiling_is_unavailable() {
    let mock = MockDirectory::start().await;
    mock.set_hold(true);

    let mut config = proxy_config(&[&mock]);
    config.backends[0].bindconns = 0;
    config.backends[0].numconns = 2;
    config.backends[0].max_pending = 1;
    let proxy = start_proxy(config).await;
    proxy.wait_ready().await;

    let mut client = proxy.client().await;
    client.send(&search_request(1)).await;
    client.recv().await;
    client.send(&search_request(2)).await;
    let reply = client.recv().await;
    let result = result_of(&reply);
    assert_eq!(result.code, result_code::UNAVAILABLE);
    assert_eq!(&result.message[..], b"no connections available");
    proxy.stop().await;
}

#[tokio::test]
async fn test_abandon_completed_twice_is_noop() {
    let mock = MockDirectory::start().await;
    let proxy = start_proxy(proxy_config(&[&mock])).await;
    proxy.wait_ready().await;

    let mut client = proxy.client().await;
    client.search(1).await;
    client.send(&abandon_request(2, 1)).await;
    client.send(&abandon_request(3, 1)).await;
    assert!(client.recv_within(Duration::from_millis(200)).await.is_none());

    let replies = client.search(4).await;
    assert_eq!(replies.len(), 3);
    assert!(mock.received_with_tag(tag::REQ_ABANDON).is_empty());
    proxy.stop().await;
}

#[tokio::test]
async fn test_abandon_in_flight_reaches_backend() {
    let mock = MockDirectory::start().await;
    mock.set_hold(true);
    let proxy = start_proxy(proxy_config(&[&mock])).await;
    proxy.wait_ready().await;

    let mut client = proxy.client().await;
    client.send(&search_request(5)).await;
    client.recv().await;
    let upstream_msgid = mock.received_with_tag(tag::REQ_SEARCH)[0].msgid;

    client.send(&abandon_request(6, 5)).await;
    wait_until(Duration::from_secs(2), || async { !mock.received_with_tag(tag::REQ_ABANDON).is_empty() }).await;

    let abandon = &mock.received_with_tag(tag::REQ_ABANDON)[0];
    assert_eq!(
        lload_proxy::proto::ber::decode_int(&abandon.body).unwrap(),
        upstream_msgid as i64
    );
    let backend = &proxy.fleet.backends()[0];
    assert_eq!(backend.n_ops_executing(), 0);
    proxy.stop().await;
}
