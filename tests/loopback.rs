//! End-to-end tests over real loopback sockets: two endpoints, real acks,
//!  real timers.

use bytes::Bytes;
use rudp::{EndpointConfig, UdpEndpoint};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn endpoint() -> Arc<UdpEndpoint> {
    UdpEndpoint::bind(EndpointConfig::new("127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap()
}

async fn recv_with_timeout(conn: &rudp::UdpConnection) -> Option<Bytes> {
    timeout(Duration::from_secs(5), conn.recv())
        .await
        .expect("timed out waiting for a message")
}

#[tokio::test(flavor = "multi_thread")]
async fn transfers_messages_in_order() {
    let server = endpoint().await;
    let client = endpoint().await;

    let conn = client.dial(server.local_addr()).await.unwrap();
    conn.send(Bytes::from(vec![1u8; 100])).await.unwrap();
    conn.send(Bytes::from(vec![2u8; 200])).await.unwrap();
    conn.send(Bytes::from(vec![3u8; 300])).await.unwrap();

    let accepted = timeout(Duration::from_secs(5), server.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recv_with_timeout(&accepted).await.unwrap(), vec![1u8; 100]);
    assert_eq!(recv_with_timeout(&accepted).await.unwrap(), vec![2u8; 200]);
    assert_eq!(recv_with_timeout(&accepted).await.unwrap(), vec![3u8; 300]);

    // every message gets acked on loopback within a few round trips
    timeout(Duration::from_secs(5), async {
        while conn.stats().last_ack_at.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_is_bidirectional() {
    let server = endpoint().await;
    let client = endpoint().await;

    let conn = client.dial(server.local_addr()).await.unwrap();
    conn.send(Bytes::from_static(b"ping?")).await.unwrap();

    let accepted = timeout(Duration::from_secs(5), server.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recv_with_timeout(&accepted).await.unwrap().as_ref(), b"ping?");

    accepted.send(Bytes::from_static(b"pong!")).await.unwrap();
    assert_eq!(recv_with_timeout(&conn).await.unwrap().as_ref(), b"pong!");

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sustained_transfer_recycles_the_window() {
    let server = endpoint().await;
    let client = endpoint().await;

    let conn = client.dial(server.local_addr()).await.unwrap();

    let sender = tokio::spawn(async move {
        for i in 0..50u32 {
            let body = i.to_be_bytes().to_vec();
            conn.send(Bytes::from(body)).await.unwrap();
        }
        conn
    });

    let accepted = timeout(Duration::from_secs(5), server.accept())
        .await
        .unwrap()
        .unwrap();
    for i in 0..50u32 {
        let body = recv_with_timeout(&accepted).await.unwrap();
        assert_eq!(body.as_ref(), i.to_be_bytes());
    }

    let conn = sender.await.unwrap();
    let stats = conn.stats();
    assert!(stats.sent_bytes > 0);
    assert!(stats.cwnd >= 6000);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn oversize_message_is_rejected_at_submit() {
    let server = endpoint().await;
    let client = endpoint().await;

    let conn = client.dial(server.local_addr()).await.unwrap();
    assert!(conn
        .send(Bytes::from(vec![0u8; rudp::MAX_MESSAGE_SIZE + 1]))
        .await
        .is_err());
    assert!(conn
        .send(Bytes::from(vec![0u8; rudp::MAX_MESSAGE_SIZE]))
        .await
        .is_ok());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn close_propagates_to_the_peer() {
    let server = endpoint().await;
    let client = endpoint().await;

    let conn = client.dial(server.local_addr()).await.unwrap();
    conn.send(Bytes::from_static(b"goodbye")).await.unwrap();

    let accepted = timeout(Duration::from_secs(5), server.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recv_with_timeout(&accepted).await.unwrap().as_ref(), b"goodbye");

    conn.close().await;
    assert!(conn.is_closed());

    // the FIN terminates the peer's inbound stream
    assert_eq!(recv_with_timeout(&accepted).await, None);
    assert!(accepted.is_closed());
    assert_eq!(accepted.stats().close_reason, Some(rudp::CloseReason::Peer));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_reflect_traffic() {
    let server = endpoint().await;
    let client = endpoint().await;

    let conn = client.dial(server.local_addr()).await.unwrap();
    let before = conn.stats();
    assert_eq!(before.sent_bytes, 0);
    assert_eq!(before.mode, rudp::BbrMode::Startup);
    assert!(before.close_reason.is_none());

    conn.send(Bytes::from_static(b"some payload")).await.unwrap();

    let accepted = timeout(Duration::from_secs(5), server.accept())
        .await
        .unwrap()
        .unwrap();
    recv_with_timeout(&accepted).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while conn.stats().last_ack_at.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let after = conn.stats();
    assert!(after.sent_bytes > 0);
    assert!(after.received_bytes > 0); // the ack came back
    assert!(after.cwnd >= 6000);

    let peer_stats = accepted.stats();
    assert!(peer_stats.received_bytes > 0);
    assert!(peer_stats.sent_bytes > 0); // it sent the ack

    client.shutdown().await;
    server.shutdown().await;
}
